//! Blue/green schema lifecycle.
//!
//! `apply()` is the only place that performs a collection swap; everything
//! before the alias upsert is safely replayable, which is why the sequence
//! below creates the physical collection and runs the reindex callback
//! before ever touching the alias (the single linearization point, per
//! the design notes).

use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::{json, Value as Json};
use tracing::{info, warn};

use crate::error::Error;
use crate::registry::{ModelDef, TypeDesc};
use crate::transport::Transport;

/// A field in a compiled schema, as sent to `POST /collections`.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub field_type: String,
    pub optional: bool,
    pub facet: bool,
    pub sort: bool,
    pub infix: bool,
    pub locale: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledSchema {
    pub name: String,
    pub fields: Vec<FieldSpec>,
    pub enable_nested_fields: bool,
}

impl CompiledSchema {
    pub fn to_json(&self, physical_name: &str) -> Json {
        let fields: Vec<Json> = self
            .fields
            .iter()
            .map(|f| {
                let mut obj = serde_json::Map::new();
                obj.insert("name".into(), Json::String(f.name.clone()));
                obj.insert("type".into(), Json::String(f.field_type.clone()));
                obj.insert("optional".into(), Json::Bool(f.optional));
                obj.insert("facet".into(), Json::Bool(f.facet));
                if f.sort {
                    obj.insert("sort".into(), Json::Bool(true));
                }
                if f.infix {
                    obj.insert("infix".into(), Json::Bool(true));
                }
                if let Some(locale) = &f.locale {
                    obj.insert("locale".into(), Json::String(locale.clone()));
                }
                Json::Object(obj)
            })
            .collect();
        json!({
            "name": physical_name,
            "fields": fields,
            "enable_nested_fields": self.enable_nested_fields,
        })
    }
}

fn backend_type(type_desc: &TypeDesc) -> String {
    match type_desc {
        TypeDesc::String => "string".to_string(),
        TypeDesc::Int => "int64".to_string(),
        TypeDesc::Float => "float".to_string(),
        TypeDesc::Bool => "bool".to_string(),
        TypeDesc::Time => "int64".to_string(),
        TypeDesc::Object => "object".to_string(),
        TypeDesc::Array(inner) => format!("{}[]", backend_type(inner)),
    }
}

/// Deterministically maps a `ModelDef` to its `CompiledSchema`: attribute
/// types through a fixed table, reference fields derived from joins,
/// hidden `<name>_empty`/`<name>_blank` companions, `doc_updated_at`
/// always enforced.
pub fn compile(model: &ModelDef) -> CompiledSchema {
    let mut fields = Vec::new();
    let mut enable_nested = false;

    for attr in &model.attributes {
        if matches!(attr.type_desc, TypeDesc::Object) {
            enable_nested = true;
        }
        if let TypeDesc::Array(inner) = &attr.type_desc {
            if matches!(**inner, TypeDesc::Object) {
                enable_nested = true;
            }
        }
        fields.push(FieldSpec {
            name: attr.name.clone(),
            field_type: backend_type(&attr.type_desc),
            optional: attr.opts.optional,
            facet: false,
            sort: attr.opts.sort,
            infix: attr.opts.infix,
            locale: attr.opts.locale.clone(),
        });
        if attr.opts.empty_filtering {
            fields.push(FieldSpec {
                name: format!("{}_empty", attr.name),
                field_type: "bool".into(),
                optional: false,
                facet: true,
                sort: false,
                infix: false,
                locale: None,
            });
        }
        if attr.opts.optional {
            fields.push(FieldSpec {
                name: format!("{}_blank", attr.name),
                field_type: "bool".into(),
                optional: false,
                facet: true,
                sort: false,
                infix: false,
                locale: None,
            });
        }
    }

    for join in &model.joins {
        fields.push(FieldSpec {
            name: format!("{}.{}", join.collection, join.foreign_key),
            field_type: "string".into(),
            optional: true,
            facet: false,
            sort: false,
            infix: false,
            locale: None,
        });
    }

    fields.push(FieldSpec {
        name: "doc_updated_at".into(),
        field_type: "int64".into(),
        optional: false,
        facet: false,
        sort: false,
        infix: false,
        locale: None,
    });

    CompiledSchema { name: model.collection_name.clone(), fields, enable_nested_fields: enable_nested }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
    pub collection_options: BTreeMap<String, Json>,
}

/// Fetches the live schema (resolving the alias if present) and diffs it
/// against `compile(model)`, comparing only the attribute-level flags the
/// DSL declares (type, optional, facet, sort, infix) to avoid noisy diffs
/// from backend-only defaults.
pub fn diff(model: &ModelDef, transport: &dyn Transport) -> Result<SchemaDiff, Error> {
    let compiled = compile(model);
    let physical = match transport.get_alias(&model.collection_name)? {
        Some(p) => p,
        None => model.collection_name.clone(),
    };
    let live = match transport.get_collection(&physical)? {
        Some(v) => v,
        None => {
            let mut d = SchemaDiff::default();
            d.collection_options.insert("live".into(), Json::String("missing".into()));
            return Ok(d);
        }
    };
    let live_fields: BTreeMap<String, Json> = live
        .get("fields")
        .and_then(|f| f.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|f| f.get("name").and_then(|n| n.as_str()).map(|n| (n.to_string(), f.clone())))
                .collect()
        })
        .unwrap_or_default();

    let mut d = SchemaDiff::default();
    for field in &compiled.fields {
        match live_fields.get(&field.name) {
            None => d.added.push(field.name.clone()),
            Some(live_field) => {
                let live_type = live_field.get("type").and_then(|t| t.as_str()).unwrap_or("");
                let live_optional = live_field.get("optional").and_then(|o| o.as_bool()).unwrap_or(false);
                if live_type != field.field_type || live_optional != field.optional {
                    d.changed.push(field.name.clone());
                }
            }
        }
    }
    for name in live_fields.keys() {
        if !compiled.fields.iter().any(|f| &f.name == name) {
            d.removed.push(name.clone());
        }
    }
    Ok(d)
}

/// `"<logical>_YYYYMMDD_HHMMSS_NNN"`, strictly ordered by (timestamp desc,
/// seq desc).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalName {
    pub logical: String,
    pub timestamp: String,
    pub seq: u16,
}

impl PhysicalName {
    pub fn to_string_name(&self) -> String {
        format!("{}_{}_{:03}", self.logical, self.timestamp, self.seq)
    }

    /// Parses a physical name back into its parts. Returns `None` when `s`
    /// does not match `<logical>_YYYYMMDD_HHMMSS_NNN`.
    pub fn parse(s: &str) -> Option<Self> {
        // Fixed-width suffix "YYYYMMDD_HHMMSS_NNN" is 19 bytes, preceded by
        // the separator between <logical> and the timestamp.
        let suffix_start = s.len().checked_sub(19)?;
        if suffix_start == 0 || s.as_bytes().get(suffix_start - 1) != Some(&b'_') {
            return None;
        }
        let suffix = &s[suffix_start..];
        let date = suffix.get(0..8)?;
        if suffix.as_bytes().get(8) != Some(&b'_') {
            return None;
        }
        let time = suffix.get(9..15)?;
        if suffix.as_bytes().get(15) != Some(&b'_') {
            return None;
        }
        let seq_str = suffix.get(16..19)?;
        if !date.bytes().all(|b| b.is_ascii_digit()) || !time.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let seq: u16 = seq_str.parse().ok()?;
        let logical = s[..suffix_start - 1].to_string();
        if logical.is_empty() {
            return None;
        }
        Some(PhysicalName { logical, timestamp: format!("{}_{}", date, time), seq })
    }
}

impl Ord for PhysicalName {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (&self.timestamp, self.seq).cmp(&(&other.timestamp, other.seq)).reverse()
    }
}
impl PartialOrd for PhysicalName {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

fn next_physical_name(logical: &str, existing: &[String]) -> PhysicalName {
    let now = Utc::now();
    let timestamp = now.format("%Y%m%d_%H%M%S").to_string();
    let mut seq = 1u16;
    loop {
        let candidate = PhysicalName { logical: logical.to_string(), timestamp: timestamp.clone(), seq };
        if !existing.contains(&candidate.to_string_name()) {
            return candidate;
        }
        seq += 1;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApplyReport {
    pub logical: String,
    pub new_physical: String,
    pub dropped_physicals: Vec<String>,
}

/// Executes the blue/green apply sequence. `reindex_callback` is
/// invoked with the new physical's name; its failure leaves the new
/// physical in place without swapping the alias.
pub fn apply(
    model: &ModelDef,
    transport: &dyn Transport,
    reindex_callback: impl FnOnce(&str) -> Result<(), Error>,
) -> Result<ApplyReport, Error> {
    if !transport.health()? {
        return Err(Error::Connection("backend health check failed before apply".into()));
    }

    let logical = &model.collection_name;
    let existing_physicals = list_physicals(transport, logical)?;
    let new_physical = next_physical_name(logical, &existing_physicals);
    let new_name = new_physical.to_string_name();

    let compiled = compile(model);
    transport.create_collection(&compiled.to_json(&new_name))?;

    reindex_callback(&new_name)?;

    let current_alias = transport.get_alias(logical)?;
    if current_alias.as_deref() != Some(new_name.as_str()) {
        transport.put_alias(logical, &new_name)?;
    }

    let mut all_physicals = existing_physicals;
    all_physicals.push(new_name.clone());
    let dropped = enforce_retention(transport, logical, &new_name, &all_physicals, model.retention_keep_last)?;

    info!(
        logical = logical.as_str(),
        new_physical = new_name.as_str(),
        dropped = dropped.len(),
        "schema apply complete"
    );

    Ok(ApplyReport { logical: logical.clone(), new_physical: new_name, dropped_physicals: dropped })
}

/// Finds the most recent retained physical that is not the current alias
/// target and swaps to it.
pub fn rollback(model: &ModelDef, transport: &dyn Transport) -> Result<String, Error> {
    let logical = &model.collection_name;
    let current = transport.get_alias(logical)?;
    let mut physicals: Vec<PhysicalName> = list_physicals(transport, logical)?
        .iter()
        .filter_map(|s| PhysicalName::parse(s))
        .collect();
    physicals.sort();
    let target = physicals
        .into_iter()
        .map(|p| p.to_string_name())
        .find(|name| Some(name.as_str()) != current.as_deref())
        .ok_or_else(|| Error::InvalidParams(format!("no retained physical to roll back to for `{}`", logical)))?;
    transport.put_alias(logical, &target)?;
    Ok(target)
}

/// Discovers every physical collection belonging to `logical` by listing
/// all collections and matching names against `<logical>_YYYYMMDD_HHMMSS_NNN`.
fn list_physicals(transport: &dyn Transport, logical: &str) -> Result<Vec<String>, Error> {
    let all = transport.list_collections()?;
    Ok(all
        .iter()
        .filter_map(|c| c.get("name").and_then(|n| n.as_str()))
        .filter(|name| PhysicalName::parse(name).map(|p| p.logical == logical).unwrap_or(false))
        .map(String::from)
        .collect())
}

fn enforce_retention(
    transport: &dyn Transport,
    logical: &str,
    new_target: &str,
    all_physicals: &[String],
    keep_last: usize,
) -> Result<Vec<String>, Error> {
    let mut parsed: Vec<PhysicalName> = all_physicals.iter().filter_map(|s| PhysicalName::parse(s)).collect();
    parsed.sort();
    let retained_excluding_target: Vec<&PhysicalName> = parsed.iter().filter(|p| p.to_string_name() != new_target).collect();
    let to_drop: Vec<String> = retained_excluding_target
        .into_iter()
        .skip(keep_last)
        .map(|p| p.to_string_name())
        .collect();
    for name in &to_drop {
        if let Err(e) = transport.delete_collection(name) {
            warn!(physical = name.as_str(), error = %e, "retention delete failed, treating as already-gone");
        }
    }
    let _ = logical;
    Ok(to_drop)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{AttributeOpts, ModelDef, TypeDesc};
    use crate::transport::mock::MockTransport;

    fn book_model() -> ModelDef {
        let mut m = ModelDef::new("Book", "books");
        m.attribute("title", TypeDesc::String, AttributeOpts::default()).unwrap();
        m.attribute(
            "tags",
            TypeDesc::Array(Box::new(TypeDesc::String)),
            AttributeOpts { empty_filtering: true, ..Default::default() },
        )
        .unwrap();
        m.attribute("subtitle", TypeDesc::String, AttributeOpts { optional: true, ..Default::default() }).unwrap();
        m
    }

    #[test]
    fn compile_always_includes_doc_updated_at() {
        let schema = compile(&book_model());
        assert!(schema.fields.iter().any(|f| f.name == "doc_updated_at" && f.field_type == "int64"));
    }

    #[test]
    fn compile_hidden_fields_follow_opts() {
        let schema = compile(&book_model());
        assert!(schema.fields.iter().any(|f| f.name == "tags_empty"));
        assert!(schema.fields.iter().any(|f| f.name == "subtitle_blank"));
        assert!(!schema.fields.iter().any(|f| f.name == "title_empty"));
    }

    #[test]
    fn physical_name_round_trip() {
        let name = "items_20250615_093000_002";
        let parsed = PhysicalName::parse(name).unwrap();
        assert_eq!(parsed.logical, "items");
        assert_eq!(parsed.seq, 2);
        assert_eq!(parsed.to_string_name(), name);
    }

    #[test]
    fn physical_name_ordering_desc() {
        let newer = PhysicalName { logical: "items".into(), timestamp: "20250615_093000".into(), seq: 2 };
        let older = PhysicalName { logical: "items".into(), timestamp: "20250101_000000".into(), seq: 1 };
        let mut v = vec![older.clone(), newer.clone()];
        v.sort();
        assert_eq!(v[0], newer);
        assert_eq!(v[1], older);
    }

    #[test]
    fn apply_creates_physical_and_swaps_alias() {
        let transport = MockTransport::new();
        let mut model = book_model();
        model.schema_retention(1);
        let report = apply(&model, &transport, |_physical| Ok(())).unwrap();
        assert_eq!(transport.get_alias("books").unwrap(), Some(report.new_physical.clone()));
    }

    #[test]
    fn apply_fails_fast_when_unhealthy() {
        let transport = MockTransport::new();
        *transport.healthy.lock() = false;
        let model = book_model();
        assert!(apply(&model, &transport, |_| Ok(())).is_err());
    }

    #[test]
    fn apply_leaves_physical_when_reindex_fails() {
        let transport = MockTransport::new();
        let model = book_model();
        let err = apply(&model, &transport, |_| Err(Error::InvalidParams("boom".into())));
        assert!(err.is_err());
        assert!(transport.get_alias("books").unwrap().is_none());
    }
}
