//! Labeled multi-search federation.
//!
//! Collects `(label, Relation)` pairs, compiles each to its per-search
//! params, shallow-merges them with a set of common params (per-search
//! wins on conflict), and issues one `/multi_search` call. `ResultSet`
//! keeps the label->result association while preserving insertion order,
//! the same ordering guarantee `Relation::to_params` gives within one
//! search.

use std::collections::HashMap;

use serde_json::Value as Json;

use crate::error::Error;
use crate::relation::Relation;
use crate::transport::Transport;

const URL_ONLY_KEYS: &[&str] = &["use_cache", "cache_ttl"];

fn is_blank(v: &Json) -> bool {
    match v {
        Json::Null => true,
        Json::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

pub struct MultiSearchCollector {
    common: HashMap<String, Json>,
    entries: Vec<(String, Relation)>,
}

impl MultiSearchCollector {
    pub fn new() -> Self {
        Self { common: HashMap::new(), entries: Vec::new() }
    }

    pub fn with_common(mut self, common: HashMap<String, Json>) -> Self {
        self.common = common;
        self
    }

    /// Adds a labeled search. Labels are canonicalized (trim + lowercase)
    /// and must be unique.
    pub fn add(&mut self, label: &str, relation: Relation) -> Result<(), Error> {
        let canonical = label.trim().to_lowercase();
        if canonical.is_empty() {
            return Err(Error::InvalidParams("multi-search label must not be blank".into()));
        }
        if self.entries.iter().any(|(l, _)| l == &canonical) {
            return Err(Error::InvalidParams(format!("multi-search label `{}` is already in use", canonical)));
        }
        self.entries.push((canonical, relation));
        Ok(())
    }

    fn strip_url_only(map: &mut HashMap<String, Json>) {
        for key in URL_ONLY_KEYS {
            map.remove(*key);
        }
    }

    /// Compiles to an ordered list of per-search payloads
    /// `{collection, ...params}`, common params shallow-merged under
    /// each relation's own (wins-on-conflict).
    pub fn compile(&self) -> Result<Vec<Json>, Error> {
        let mut common = self.common.clone();
        Self::strip_url_only(&mut common);
        common.retain(|_, v| !is_blank(v));

        let mut out = Vec::with_capacity(self.entries.len());
        for (_, relation) in &self.entries {
            let mut per_search: HashMap<String, Json> = relation.to_params()?.into_iter().collect();
            Self::strip_url_only(&mut per_search);
            per_search.retain(|_, v| !is_blank(v));

            let mut merged = common.clone();
            for (k, v) in per_search {
                merged.insert(k, v);
            }
            merged.insert("collection".to_string(), Json::String(relation.collection_name().to_string()));
            out.push(Json::Object(merged.into_iter().collect()));
        }
        Ok(out)
    }

    /// Executes the collected searches via `/multi_search` and returns a
    /// `ResultSet` mapping label -> result JSON, preserving insertion order.
    pub fn execute(&self, transport: &dyn Transport) -> Result<ResultSet, Error> {
        let searches = self.compile()?;
        let response = transport.multi_search(&searches, &self.common)?;
        let results = response.get("results").and_then(|r| r.as_array()).cloned().unwrap_or_default();
        let labels: Vec<String> = self.entries.iter().map(|(l, _)| l.clone()).collect();
        Ok(ResultSet { labels, results })
    }
}

impl Default for MultiSearchCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Label -> result mapping that preserves insertion order.
pub struct ResultSet {
    labels: Vec<String>,
    results: Vec<Json>,
}

impl ResultSet {
    pub fn get(&self, label: &str) -> Option<&Json> {
        let canonical = label.trim().to_lowercase();
        let idx = self.labels.iter().position(|l| l == &canonical)?;
        self.results.get(idx)
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn into_ordered(self) -> Vec<(String, Json)> {
        self.labels.into_iter().zip(self.results).collect()
    }
}
