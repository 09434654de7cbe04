//! Row → document mapping for indexing.
//!
//! A `Mapper` is a compiled, reusable record: built once from a model's
//! schema and a row-mapping closure, then driven batch-by-batch by the
//! Indexer. Keeping it a plain struct (not a trait object) mirrors the
//! Compiler's preference for closed, inspectable types over dynamic
//! dispatch.

use std::collections::{HashMap, HashSet};

use serde_json::{Map as JsonMap, Value as Json};
use tracing::warn;

use crate::error::Error;
use crate::schema::FieldSpec;

pub type MapFn = Box<dyn Fn(&Json) -> Result<Json, Error> + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MapperOptions {
    pub strict_unknown_keys: bool,
    pub coercions_enabled: bool,
    pub max_error_samples: usize,
}

pub struct Mapper {
    pub model_name: String,
    pub map_fn: MapFn,
    pub schema_fields: Vec<String>,
    pub types_by_field: HashMap<String, String>,
    pub options: MapperOptions,
}

impl Mapper {
    pub fn new(model_name: impl Into<String>, fields: &[FieldSpec], map_fn: MapFn, options: MapperOptions) -> Self {
        let schema_fields: Vec<String> = fields.iter().map(|f| f.name.clone()).collect();
        let types_by_field = fields.iter().map(|f| (f.name.clone(), f.field_type.clone())).collect();
        Self { model_name: model_name.into(), map_fn, schema_fields, types_by_field, options }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub docs_mapped: usize,
    pub docs_failed: usize,
    pub coercions: usize,
    pub unknown_key_samples: Vec<String>,
    pub error_samples: Vec<String>,
}

impl BatchReport {
    fn push_sample(samples: &mut Vec<String>, msg: String, cap: usize) {
        if samples.len() < cap {
            samples.push(msg);
        }
    }
}

fn coerce(field_type: &str, value: &Json) -> Option<Json> {
    match field_type {
        "int64" => match value {
            Json::Number(_) => Some(value.clone()),
            Json::String(s) => s.parse::<i64>().ok().map(|n| Json::from(n)),
            _ => None,
        },
        "float" => match value {
            Json::Number(_) => Some(value.clone()),
            Json::String(s) => s.parse::<f64>().ok().map(Json::from),
            _ => None,
        },
        "bool" => match value {
            Json::Bool(_) => Some(value.clone()),
            Json::String(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Some(Json::Bool(true)),
                "false" | "0" | "no" | "off" => Some(Json::Bool(false)),
                _ => None,
            },
            Json::Number(n) if n.as_i64() == Some(0) || n.as_i64() == Some(1) => {
                Some(Json::Bool(n.as_i64() == Some(1)))
            }
            _ => None,
        },
        _ => None,
    }
}

fn value_matches_type(field_type: &str, value: &Json) -> bool {
    match field_type {
        "string" => value.is_string(),
        "int64" => value.is_i64() || value.is_u64(),
        "float" => value.is_number(),
        "bool" => value.is_boolean(),
        "object" => value.is_object(),
        t if t.ends_with("[]") => value.is_array(),
        _ => true,
    }
}

impl Mapper {
    /// Maps one batch of rows into documents ready for bulk import, plus a
    /// report of anomalies encountered along the way.
    pub fn map_batch(&self, rows: &[Json], batch_index: usize) -> Result<(Vec<Json>, BatchReport), Error> {
        let required: HashSet<&str> = self.schema_fields.iter().map(|s| s.as_str()).filter(|s| *s != "doc_updated_at").collect();
        let mut docs = Vec::with_capacity(rows.len());
        let mut report = BatchReport::default();

        for row in rows {
            let mapped = (self.map_fn)(row)?;
            let obj = match mapped {
                Json::Object(obj) => obj,
                _ => {
                    return Err(Error::InvalidParams(format!(
                        "batch {}: map_fn must return a document-like object",
                        batch_index
                    )))
                }
            };

            let present: HashSet<&str> = obj.keys().map(|k| k.as_str()).collect();
            let missing: Vec<&str> = required.difference(&present).copied().collect();
            if !missing.is_empty() {
                return Err(Error::MissingField(missing.join(", ")));
            }

            let mut doc = JsonMap::new();
            let mut row_failed = false;
            for (key, value) in obj {
                if key == "id" {
                    doc.insert(key, value);
                    continue;
                }
                let Some(field_type) = self.types_by_field.get(&key) else {
                    if self.options.strict_unknown_keys {
                        return Err(Error::InvalidParams(format!("unknown document key `{}`", key)));
                    }
                    BatchReport::push_sample(&mut report.unknown_key_samples, key.clone(), self.options.max_error_samples);
                    continue;
                };
                if value_matches_type(field_type, &value) {
                    doc.insert(key, value);
                } else if self.options.coercions_enabled {
                    match coerce(field_type, &value) {
                        Some(coerced) => {
                            report.coercions += 1;
                            doc.insert(key, coerced);
                        }
                        None => {
                            row_failed = true;
                            BatchReport::push_sample(
                                &mut report.error_samples,
                                format!("field `{}`: value does not match type `{}`", key, field_type),
                                self.options.max_error_samples,
                            );
                        }
                    }
                } else {
                    row_failed = true;
                    BatchReport::push_sample(
                        &mut report.error_samples,
                        format!("field `{}`: value does not match type `{}`", key, field_type),
                        self.options.max_error_samples,
                    );
                }
            }

            if row_failed {
                report.docs_failed += 1;
                continue;
            }
            report.docs_mapped += 1;
            docs.push(Json::Object(doc));
        }

        if !report.unknown_key_samples.is_empty() || !report.error_samples.is_empty() {
            warn!(
                model = self.model_name.as_str(),
                batch_index,
                unknown_keys = report.unknown_key_samples.len(),
                errors = report.error_samples.len(),
                "mapper anomalies in batch"
            );
        }

        Ok((docs, report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields() -> Vec<FieldSpec> {
        vec![
            FieldSpec { name: "title".into(), field_type: "string".into(), optional: false, facet: false, sort: false, infix: false, locale: None },
            FieldSpec { name: "price".into(), field_type: "float".into(), optional: false, facet: false, sort: false, infix: false, locale: None },
            FieldSpec { name: "active".into(), field_type: "bool".into(), optional: false, facet: false, sort: false, infix: false, locale: None },
        ]
    }

    fn identity_mapper(options: MapperOptions) -> Mapper {
        Mapper::new("Book", &fields(), Box::new(|row| Ok(row.clone())), options)
    }

    #[test]
    fn maps_valid_rows() {
        let mapper = identity_mapper(MapperOptions { max_error_samples: 10, ..Default::default() });
        let rows = vec![json!({"id": "1", "title": "Harry Potter", "price": 9.99, "active": true})];
        let (docs, report) = mapper.map_batch(&rows, 0).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(report.docs_mapped, 1);
    }

    #[test]
    fn missing_required_key_raises() {
        let mapper = identity_mapper(MapperOptions { max_error_samples: 10, ..Default::default() });
        let rows = vec![json!({"id": "1", "title": "X"})];
        assert!(mapper.map_batch(&rows, 0).is_err());
    }

    #[test]
    fn strict_unknown_keys_raises() {
        let mapper = identity_mapper(MapperOptions { strict_unknown_keys: true, max_error_samples: 10, ..Default::default() });
        let rows = vec![json!({"id": "1", "title": "X", "price": 1.0, "active": true, "extra": "nope"})];
        assert!(mapper.map_batch(&rows, 0).is_err());
    }

    #[test]
    fn lenient_unknown_keys_sampled() {
        let mapper = identity_mapper(MapperOptions { max_error_samples: 10, ..Default::default() });
        let rows = vec![json!({"id": "1", "title": "X", "price": 1.0, "active": true, "extra": "nope"})];
        let (docs, report) = mapper.map_batch(&rows, 0).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(report.unknown_key_samples, vec!["extra".to_string()]);
    }

    #[test]
    fn coercion_applies_when_enabled() {
        let mapper = identity_mapper(MapperOptions { coercions_enabled: true, max_error_samples: 10, ..Default::default() });
        let rows = vec![json!({"id": "1", "title": "X", "price": "9.99", "active": "yes"})];
        let (docs, report) = mapper.map_batch(&rows, 0).unwrap();
        assert_eq!(report.coercions, 2);
        assert_eq!(docs[0]["price"], json!(9.99));
        assert_eq!(docs[0]["active"], json!(true));
    }

    #[test]
    fn type_mismatch_without_coercion_fails_row() {
        let mapper = identity_mapper(MapperOptions { max_error_samples: 10, ..Default::default() });
        let rows = vec![json!({"id": "1", "title": "X", "price": "not-a-number", "active": true})];
        let (docs, report) = mapper.map_batch(&rows, 0).unwrap();
        assert_eq!(docs.len(), 0);
        assert_eq!(report.docs_failed, 1);
    }

    #[test]
    fn error_samples_capped_at_max() {
        let mapper = identity_mapper(MapperOptions { max_error_samples: 1, ..Default::default() });
        let rows = vec![
            json!({"id": "1", "title": "X", "price": "bad", "active": true}),
            json!({"id": "2", "title": "X", "price": "bad", "active": true}),
        ];
        let (_, report) = mapper.map_batch(&rows, 0).unwrap();
        assert_eq!(report.error_samples.len(), 1);
    }
}
