//! Immutable, chainable query builder.
//!
//! Every chainer takes `&self` and returns a new `Relation`; the receiver is
//! never mutated. Internally this is cheap because `PredicateNode`/`Order`
//! are small values and the whole state is cloned, not shared — a
//! "snapshot, don't share" tradeoff rather than reaching for persistent
//! data structures.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value as Json;

use crate::ast::{FieldRef, PredicateNode, Value};
use crate::compiler;
use crate::config::Config;
use crate::error::Error;
use crate::registry::ModelDef;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Asc => "asc",
            Direction::Desc => "desc",
        }
    }

    fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "asc" => Ok(Direction::Asc),
            "desc" => Ok(Direction::Desc),
            other => Err(Error::InvalidParams(format!("invalid sort direction `{}`", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub field: String,
    pub direction: Direction,
}

impl Order {
    pub fn new(field: impl Into<String>, direction: Direction) -> Self {
        Self { field: field.into(), direction }
    }

    /// Parses `"field:asc"` / `"field:desc"`.
    pub fn parse(s: &str) -> Result<Self, Error> {
        let (field, dir) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidParams(format!("invalid order fragment `{}`", s)))?;
        Ok(Order::new(field.trim(), Direction::parse(dir.trim())?))
    }

    pub fn to_canonical(&self) -> String {
        format!("{}:{}", self.field, self.direction.as_str())
    }
}

/// Parses a comma-joined order string (`"name:asc, price:desc"`) into
/// individual `Order`s, in the order given.
pub fn parse_order_list(s: &str) -> Result<Vec<Order>, Error> {
    s.split(',')
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .map(Order::parse)
        .collect()
}

const UNSCOPE_PARTS: &[&str] = &["where", "order", "select", "limit", "offset", "page", "per"];

#[derive(Clone, Default)]
struct RelationState {
    ast: Vec<PredicateNode>,
    orders: Vec<Order>,
    select: Vec<String>,
    limit: Option<u32>,
    offset: Option<u32>,
    page: Option<u32>,
    per_page: Option<u32>,
    options: BTreeMap<String, Json>,
    pinned: Vec<String>,
    hidden: Vec<String>,
}

/// `q`/URL-only knobs that must never reach the compiled request body.
const URL_ONLY_OPTION_KEYS: &[&str] = &["use_cache", "cache_ttl"];
/// Rendered explicitly at a fixed position in `to_params`, not via the
/// generic options pass-through.
const POSITIONED_OPTION_KEYS: &[&str] = &["infix"];

fn is_valid_curated_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// A frozen, chainable query over one model's collection. Cloning is cheap
/// relative to re-issuing a backend request; materialization is memoized.
#[derive(Clone)]
pub struct Relation {
    model: Arc<ModelDef>,
    config: Arc<Config>,
    transport: Arc<dyn Transport>,
    state: RelationState,
    result: Arc<Mutex<Option<Arc<Json>>>>,
}

impl Relation {
    pub fn all(model: Arc<ModelDef>, config: Arc<Config>, transport: Arc<dyn Transport>) -> Self {
        Self {
            model,
            config,
            transport,
            state: RelationState::default(),
            result: Arc::new(Mutex::new(None)),
        }
    }

    /// The backend collection (logical name) this relation searches.
    pub fn collection_name(&self) -> &str {
        &self.model.collection_name
    }

    fn fork(&self, state: RelationState) -> Self {
        Self {
            model: self.model.clone(),
            config: self.config.clone(),
            transport: self.transport.clone(),
            state,
            result: Arc::new(Mutex::new(None)),
        }
    }

    fn known_field_names(&self) -> Vec<String> {
        self.model.attributes.iter().map(|a| a.name.clone()).collect()
    }

    fn validate_field(&self, name: &str) -> Result<(), Error> {
        if self.model.attributes.is_empty() {
            return Ok(());
        }
        if self.model.find_attribute(name).is_some() {
            return Ok(());
        }
        let known = self.known_field_names();
        Err(Error::unknown_field(name, &known))
    }

    /// Appends predicates built from a single `(field, PredicateNode)`
    /// already-validated AST fragment. The public DSL surface
    /// (hash/string/templated forms) is expected to funnel through here
    /// once parsed; this method is also the seam integration tests target
    /// directly when exercising AST shapes without the parsing layer.
    pub fn where_node(&self, node: PredicateNode) -> Result<Self, Error> {
        self.where_nodes(vec![node])
    }

    pub fn where_nodes(&self, nodes: Vec<PredicateNode>) -> Result<Self, Error> {
        for node in &nodes {
            self.validate_node_fields(node)?;
        }
        let mut state = self.state.clone();
        state.ast.extend(nodes);
        Ok(self.fork(state))
    }

    /// `where(field => value)` sugar: builds an `Eq` predicate.
    pub fn where_eq(&self, field: &str, value: impl Into<Value>) -> Result<Self, Error> {
        self.where_node(PredicateNode::eq_(FieldRef::parse(field), value))
    }

    /// Raw filter fragment, preserved verbatim (legacy string-fragment
    /// migration path).
    pub fn where_raw(&self, fragment: impl Into<String>) -> Result<Self, Error> {
        self.where_node(PredicateNode::Raw(fragment.into()))
    }

    /// Templated fragment: `where("price > ?", [Value::Int(10)])`.
    pub fn where_template(&self, template: &str, args: &[Value]) -> Result<Self, Error> {
        let rendered = crate::sanitizer::apply_placeholders(template, args)?;
        self.where_raw(rendered)
    }

    fn validate_node_fields(&self, node: &PredicateNode) -> Result<(), Error> {
        if self.model.attributes.is_empty() {
            return Ok(());
        }
        match node {
            PredicateNode::Compare(_, field, _) | PredicateNode::In(field, _) | PredicateNode::NotIn(field, _)
            | PredicateNode::Matches(field, _) | PredicateNode::Prefix(field, _) => {
                if let Some(assoc) = &field.assoc {
                    if self.model.find_join(assoc).is_none() {
                        let known: Vec<String> = self.model.joins.iter().map(|j| j.name.clone()).collect();
                        return Err(Error::unknown_join(assoc.clone(), &known));
                    }
                } else {
                    self.validate_field(&field.name)?;
                }
                Ok(())
            }
            PredicateNode::And(children) | PredicateNode::Or(children) => {
                children.iter().try_for_each(|c| self.validate_node_fields(c))
            }
            PredicateNode::Group(inner) => self.validate_node_fields(inner),
            PredicateNode::Raw(_) => Ok(()),
        }
    }

    /// Replaces all accumulated predicates (`rewhere`).
    pub fn rewhere_node(&self, node: PredicateNode) -> Result<Self, Error> {
        self.validate_node_fields(&node)?;
        let mut state = self.state.clone();
        state.ast = vec![node];
        Ok(self.fork(state))
    }

    /// Appends one or more orders; last occurrence of a given field wins and
    /// keeps that later position.
    pub fn order(&self, new_orders: Vec<Order>) -> Self {
        let mut state = self.state.clone();
        for o in new_orders {
            state.orders.retain(|existing| existing.field != o.field);
            state.orders.push(o);
        }
        self.fork(state)
    }

    pub fn order_str(&self, s: &str) -> Result<Self, Error> {
        Ok(self.order(parse_order_list(s)?))
    }

    /// Appends fields to the selection, de-duping by first appearance.
    pub fn select(&self, fields: &[&str]) -> Result<Self, Error> {
        for f in fields {
            self.validate_field(f)?;
        }
        let mut state = self.state.clone();
        for f in fields {
            if !state.select.iter().any(|s| s == f) {
                state.select.push((*f).to_string());
            }
        }
        Ok(self.fork(state))
    }

    /// Replaces the selection entirely.
    pub fn reselect(&self, fields: &[&str]) -> Result<Self, Error> {
        for f in fields {
            self.validate_field(f)?;
        }
        let mut state = self.state.clone();
        state.select = fields.iter().map(|s| (*s).to_string()).collect();
        Ok(self.fork(state))
    }

    pub fn limit(&self, n: u32) -> Result<Self, Error> {
        if n == 0 {
            return Err(Error::InvalidParams("limit(0) is not allowed".into()));
        }
        let mut state = self.state.clone();
        state.limit = Some(n);
        Ok(self.fork(state))
    }

    pub fn offset(&self, n: u32) -> Self {
        let mut state = self.state.clone();
        state.offset = Some(n);
        self.fork(state)
    }

    pub fn page(&self, n: u32) -> Result<Self, Error> {
        if n == 0 {
            return Err(Error::InvalidParams("page(0) is not allowed".into()));
        }
        let mut state = self.state.clone();
        state.page = Some(n);
        Ok(self.fork(state))
    }

    pub fn per_page(&self, n: u32) -> Result<Self, Error> {
        if n == 0 {
            return Err(Error::InvalidParams("per_page(0) is not allowed".into()));
        }
        let mut state = self.state.clone();
        state.per_page = Some(n);
        Ok(self.fork(state))
    }

    pub fn options(&self, extra: BTreeMap<String, Json>) -> Self {
        let mut state = self.state.clone();
        state.options.extend(extra);
        self.fork(state)
    }

    pub fn unscope(&self, parts: &[&str]) -> Result<Self, Error> {
        for p in parts {
            if !UNSCOPE_PARTS.contains(p) {
                return Err(Error::InvalidParams(format!("unknown unscope part `{}`", p)));
            }
        }
        let mut state = self.state.clone();
        for p in parts {
            match *p {
                "where" => state.ast.clear(),
                "order" => state.orders.clear(),
                "select" => state.select.clear(),
                "limit" => state.limit = None,
                "offset" => state.offset = None,
                "page" => state.page = None,
                "per" => state.per_page = None,
                _ => unreachable!(),
            }
        }
        Ok(self.fork(state))
    }

    /// Declares pinned hit ids (Curation), validated eagerly against
    /// `curation_limit` and id shape.
    pub fn pinned(&self, ids: &[&str]) -> Result<Self, Error> {
        self.with_curated(ids, true)
    }

    /// Declares hidden hit ids (Curation).
    pub fn hidden(&self, ids: &[&str]) -> Result<Self, Error> {
        self.with_curated(ids, false)
    }

    fn with_curated(&self, ids: &[&str], pin: bool) -> Result<Self, Error> {
        for id in ids {
            if !is_valid_curated_id(id) {
                return Err(Error::InvalidCuratedId((*id).to_string()));
            }
        }
        let mut state = self.state.clone();
        let target = if pin { &mut state.pinned } else { &mut state.hidden };
        for id in ids {
            let id = (*id).to_string();
            if !target.contains(&id) {
                target.push(id);
            }
        }
        let total = state.pinned.len() + state.hidden.len();
        if total > self.model.curation_limit {
            return Err(Error::CurationLimitExceeded { have: total, limit: self.model.curation_limit });
        }
        Ok(self.fork(state))
    }

    /// Compiles the canonical, insertion-ordered backend request map.
    pub fn to_params(&self) -> Result<Vec<(String, Json)>, Error> {
        let mut params = Vec::with_capacity(8);
        params.push(("q".to_string(), Json::String("*".to_string())));

        let query_by = if self.model.default_query_by.is_empty() {
            self.config.default_query_by.clone()
        } else {
            self.model.default_query_by_joined()
        };
        if !query_by.is_empty() {
            params.push(("query_by".to_string(), Json::String(query_by)));
        }

        let filter_by = compiler::compile(&self.state.ast)?;
        if !filter_by.is_empty() {
            params.push(("filter_by".to_string(), Json::String(filter_by)));
        }

        if !self.state.orders.is_empty() {
            let sort_by = self.state.orders.iter().map(Order::to_canonical).collect::<Vec<_>>().join(",");
            params.push(("sort_by".to_string(), Json::String(sort_by)));
        }

        if !self.state.select.is_empty() {
            params.push(("include_fields".to_string(), Json::String(self.state.select.join(","))));
        }

        match (self.state.page, self.state.per_page, self.state.limit) {
            (Some(p), per, _) => {
                params.push(("page".to_string(), Json::from(p)));
                if let Some(per) = per {
                    params.push(("per_page".to_string(), Json::from(per)));
                }
            }
            (None, Some(per), _) => {
                params.push(("per_page".to_string(), Json::from(per)));
            }
            (None, None, Some(limit)) => {
                let offset = self.state.offset.unwrap_or(0);
                let page = offset / limit + 1;
                params.push(("page".to_string(), Json::from(page)));
                params.push(("per_page".to_string(), Json::from(limit)));
            }
            (None, None, None) => {}
        }

        for (k, v) in &self.state.options {
            if URL_ONLY_OPTION_KEYS.contains(&k.as_str()) || POSITIONED_OPTION_KEYS.contains(&k.as_str()) {
                continue;
            }
            params.push((k.clone(), v.clone()));
        }

        if let Some(infix) = self.state.options.get("infix") {
            params.push(("infix".to_string(), infix.clone()));
        }

        if !self.state.pinned.is_empty() {
            params.push(("pinned_hits".to_string(), Json::String(self.state.pinned.join(","))));
        }
        if !self.state.hidden.is_empty() {
            params.push(("hidden_hits".to_string(), Json::String(self.state.hidden.join(","))));
        }

        Ok(params)
    }

    fn params_map(&self) -> Result<std::collections::HashMap<String, Json>, Error> {
        Ok(self.to_params()?.into_iter().collect())
    }

    /// Issues (or returns the memoized) search result. Exactly one backend
    /// request per relation instance.
    pub fn load(&self) -> Result<Arc<Json>, Error> {
        {
            let guard = self.result.lock();
            if let Some(cached) = guard.as_ref() {
                return Ok(cached.clone());
            }
        }
        let params = self.params_map()?;
        let json = self.transport.search(&self.model.collection_name, &params)?;
        let arc = Arc::new(json);
        *self.result.lock() = Some(arc.clone());
        Ok(arc)
    }

    /// Minimal-request count: `per_page=1, include_fields=id` when not yet
    /// loaded, else derived from the memoized result.
    pub fn count(&self) -> Result<u64, Error> {
        if let Some(cached) = self.result.lock().as_ref() {
            return Ok(cached.get("found").and_then(|v| v.as_u64()).unwrap_or(0));
        }
        let minimal = self.reselect(&["id"])?.per_page(1)?;
        let json = minimal.load()?;
        Ok(json.get("found").and_then(|v| v.as_u64()).unwrap_or(0))
    }

    pub fn exists(&self) -> Result<bool, Error> {
        Ok(self.count()? > 0)
    }

    /// Projects a field out of every hit document. Fails fast if `field`
    /// was excluded by an effective selection.
    pub fn pluck(&self, field: &str) -> Result<Vec<Json>, Error> {
        if !self.state.select.is_empty() && !self.state.select.iter().any(|s| s == field) {
            return Err(Error::InvalidSelection(format!(
                "`{}` was excluded by the effective selection",
                field
            )));
        }
        let json = self.load()?;
        let hits = json.get("hits").and_then(|h| h.as_array()).cloned().unwrap_or_default();
        Ok(hits
            .into_iter()
            .filter_map(|hit| hit.get("document").and_then(|d| d.get(field)).cloned())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::registry::ModelDef;
    use crate::transport::mock::MockTransport;

    fn relation() -> Relation {
        let model = Arc::new(ModelDef::new("Book", "books"));
        let config = Arc::new(Config::default());
        let transport: Arc<dyn Transport> = Arc::new(MockTransport::new());
        Relation::all(model, config, transport)
    }

    #[test]
    fn immutability_chainer_does_not_mutate_receiver() {
        let r = relation();
        let r2 = r.where_eq("active", true).unwrap();
        assert_eq!(r.to_params().unwrap(), vec![("q".to_string(), Json::String("*".to_string()))]);
        assert_ne!(r.to_params().unwrap(), r2.to_params().unwrap());
    }

    #[test]
    fn simple_filter_scenario() {
        let r = relation()
            .where_node(PredicateNode::in_(FieldRef::new("brand_id"), vec![Value::Int(1), Value::Int(2), Value::Int(3)]).unwrap())
            .unwrap()
            .where_eq("active", true)
            .unwrap();
        let params = r.to_params().unwrap();
        let filter = params.iter().find(|(k, _)| k == "filter_by").unwrap();
        assert_eq!(filter.1, Json::String("brand_id:=[1,2,3] && active:=true".into()));
    }

    #[test]
    fn canonical_key_order() {
        let r = relation()
            .where_eq("active", true)
            .unwrap()
            .order(vec![Order::new("name", Direction::Asc)])
            .select(&["id", "name"])
            .unwrap()
            .limit(10)
            .unwrap();
        let keys: Vec<String> = r.to_params().unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["q", "filter_by", "sort_by", "include_fields", "page", "per_page"]);
    }

    #[test]
    fn order_dedupe_last_wins() {
        let r = relation()
            .order(vec![Order::new("name", Direction::Asc)])
            .order_str("name:desc, price:asc")
            .unwrap();
        let params = r.to_params().unwrap();
        let sort = params.iter().find(|(k, _)| k == "sort_by").unwrap();
        assert_eq!(sort.1, Json::String("name:desc,price:asc".into()));
    }

    #[test]
    fn pagination_derived_from_limit_offset() {
        let r = relation().limit(20).unwrap().offset(40);
        let params = r.to_params().unwrap();
        let map: std::collections::HashMap<_, _> = params.into_iter().collect();
        assert_eq!(map.get("page"), Some(&Json::from(3u32)));
        assert_eq!(map.get("per_page"), Some(&Json::from(20u32)));
    }

    #[test]
    fn explicit_page_wins_over_limit() {
        let r = relation().limit(20).unwrap().page(5).unwrap();
        let params = r.to_params().unwrap();
        let map: std::collections::HashMap<_, _> = params.into_iter().collect();
        assert_eq!(map.get("page"), Some(&Json::from(5u32)));
    }

    #[test]
    fn limit_zero_rejected() {
        assert!(relation().limit(0).is_err());
        assert!(relation().per_page(0).is_err());
    }

    #[test]
    fn url_only_options_never_in_body() {
        let mut extra = BTreeMap::new();
        extra.insert("use_cache".to_string(), Json::Bool(true));
        let r = relation().options(extra);
        let params = r.to_params().unwrap();
        assert!(!params.iter().any(|(k, _)| k == "use_cache"));
    }

    #[test]
    fn pinned_and_hidden_are_trailing_keys() {
        let r = relation().pinned(&["a1", "a2"]).unwrap().hidden(&["h1"]).unwrap();
        let params = r.to_params().unwrap();
        let keys: Vec<String> = params.into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["q", "pinned_hits", "hidden_hits"]);
    }

    #[test]
    fn curation_limit_exceeded() {
        let mut model = ModelDef::new("Book", "books");
        model.curation_limit(2);
        let config = Arc::new(Config::default());
        let transport: Arc<dyn Transport> = Arc::new(MockTransport::new());
        let r = Relation::all(Arc::new(model), config, transport);
        assert!(r.pinned(&["a1", "a2", "a3"]).is_err());
    }

    #[test]
    fn invalid_curated_id_rejected() {
        assert!(relation().pinned(&["bad id!"]).is_err());
    }

    #[test]
    fn unscope_clears_requested_parts() {
        let r = relation().where_eq("active", true).unwrap().limit(10).unwrap();
        let r2 = r.unscope(&["where", "limit"]).unwrap();
        let params = r2.to_params().unwrap();
        assert!(!params.iter().any(|(k, _)| k == "filter_by" || k == "page"));
    }

    #[test]
    fn count_uses_minimal_request_when_unloaded() {
        let r = relation();
        assert_eq!(r.count().unwrap(), 0);
    }
}
