//! Model registry & schema DSL.
//!
//! The registry is a process-wide, copy-on-write map `collection_name ->
//! ModelDef`: writers take a single lock and publish a new `Arc<HashMap>`;
//! readers clone the `Arc` without locking — a `parking_lot::RwLock`
//! guarding an `Arc`-swap rather than locking per read.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{did_you_mean, Error};

/// Scalar/structural type a declared attribute maps to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeDesc {
    String,
    Int,
    Float,
    Bool,
    Time,
    Object,
    Array(Box<TypeDesc>),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeOpts {
    pub locale: Option<String>,
    pub optional: bool,
    pub sort: bool,
    pub infix: bool,
    pub empty_filtering: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub type_desc: TypeDesc,
    pub opts: AttributeOpts,
}

impl Attribute {
    pub fn validate(&self) -> Result<(), Error> {
        if self.name == "id" {
            return Err(Error::InvalidParams(
                "`id` is a reserved field name; use identify_by() to control document identity".into(),
            ));
        }
        if !crate::ast::is_valid_ident(&self.name) {
            return Err(Error::InvalidField { field: self.name.clone(), suggestion: String::new() });
        }
        let is_string_like = matches!(
            (&self.type_desc, self.opts.locale.is_some()),
            (TypeDesc::String, _) | (TypeDesc::Array(_), _)
        );
        if self.opts.locale.is_some() && !is_string_like {
            return Err(Error::InvalidParams(format!(
                "attribute `{}`: locale is only valid on string/string[] attributes",
                self.name
            )));
        }
        if self.opts.empty_filtering && !matches!(self.type_desc, TypeDesc::Array(_)) {
            return Err(Error::InvalidParams(format!(
                "attribute `{}`: empty_filtering is only valid on array attributes",
                self.name
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinDecl {
    pub name: String,
    pub collection: String,
    pub local_key: String,
    pub foreign_key: String,
}

/// Document-identity strategy: either the record's native `id`, or a
/// caller-declared field to read the id from.
#[derive(Debug, Clone, PartialEq)]
pub enum IdentityStrategy {
    NativeId,
    Field(String),
}

impl Default for IdentityStrategy {
    fn default() -> Self {
        IdentityStrategy::NativeId
    }
}

/// A registered model's full declarative state. Subclasses snapshot-inherit
/// all of this from their parent at registration time (copy-on-write: the
/// child gets a clone, not a reference, so later edits to either do not
/// cross-contaminate).
#[derive(Debug, Clone, PartialEq)]
pub struct ModelDef {
    pub class_name: String,
    pub collection_name: String,
    pub default_query_by: Vec<String>,
    pub attributes: Vec<Attribute>,
    pub joins: Vec<JoinDecl>,
    pub default_preset: Option<String>,
    pub identity: IdentityStrategy,
    pub retention_keep_last: usize,
    pub stale_filter_by: Option<String>,
    pub curation_limit: usize,
    pub synonym_ids: Vec<String>,
    pub stopword_ids: Vec<String>,
}

impl ModelDef {
    pub fn new(class_name: impl Into<String>, collection_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            collection_name: collection_name.into(),
            default_query_by: Vec::new(),
            attributes: Vec::new(),
            joins: Vec::new(),
            default_preset: None,
            identity: IdentityStrategy::default(),
            retention_keep_last: 2,
            stale_filter_by: None,
            curation_limit: 100,
            synonym_ids: Vec::new(),
            stopword_ids: Vec::new(),
        }
    }

    pub fn set_default_query_by(&mut self, fields: &str) {
        self.default_query_by = fields
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }

    pub fn default_query_by_joined(&self) -> String {
        self.default_query_by.join(",")
    }

    pub fn attribute(&mut self, name: impl Into<String>, type_desc: TypeDesc, opts: AttributeOpts) -> Result<(), Error> {
        let attr = Attribute { name: name.into(), type_desc, opts };
        attr.validate()?;
        if let Some(existing) = self.attributes.iter_mut().find(|a| a.name == attr.name) {
            *existing = attr;
        } else {
            self.attributes.push(attr);
        }
        Ok(())
    }

    /// Declares an object/object[] attribute together with its nested
    /// field types. Nested fields are recorded as dotted attribute names
    /// (`"base.field"`) so `Schema::compile` can flatten them.
    pub fn nested(&mut self, base: &str, fields: &[(&str, TypeDesc)]) -> Result<(), Error> {
        self.attribute(base, TypeDesc::Object, AttributeOpts::default())?;
        for (field, ty) in fields {
            self.attribute(format!("{}.{}", base, field), ty.clone(), AttributeOpts::default())?;
        }
        Ok(())
    }

    pub fn join(
        &mut self,
        name: impl Into<String>,
        collection: impl Into<String>,
        local_key: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Result<(), Error> {
        let name = name.into();
        let local_key = local_key.into();
        if self.joins.iter().any(|j| j.name == name) {
            return Err(Error::InvalidJoin(format!("join `{}` is already declared", name)));
        }
        if !self.attributes.iter().any(|a| a.name == local_key) {
            let known: Vec<String> = self.attributes.iter().map(|a| a.name.clone()).collect();
            return Err(Error::InvalidParams(format!(
                "join `{}`: local_key `{}` is not a declared attribute{}",
                name,
                local_key,
                did_you_mean(&local_key, &known)
            )));
        }
        self.joins.push(JoinDecl {
            name,
            collection: collection.into(),
            local_key,
            foreign_key: foreign_key.into(),
        });
        Ok(())
    }

    pub fn default_preset(&mut self, token: impl Into<String>) {
        self.default_preset = Some(token.into());
    }

    /// Resolves the effective preset name given the global presets config
    /// (namespace prefix applied when presets are enabled).
    pub fn effective_preset(&self, presets: &crate::config::PresetsConfig) -> Option<String> {
        let token = self.default_preset.as_ref()?;
        if presets.enabled {
            match &presets.namespace {
                Some(ns) => Some(format!("{}_{}", ns, token)),
                None => Some(token.clone()),
            }
        } else {
            Some(token.clone())
        }
    }

    pub fn identify_by(&mut self, strategy: IdentityStrategy) {
        self.identity = strategy;
    }

    pub fn schema_retention(&mut self, keep_last: usize) {
        self.retention_keep_last = keep_last;
    }

    pub fn stale_filter_by(&mut self, filter_by: impl Into<String>) {
        self.stale_filter_by = Some(filter_by.into());
    }

    /// Caps total pinned+hidden curated ids per relation.
    pub fn curation_limit(&mut self, n: usize) {
        self.curation_limit = n;
    }

    pub fn declare_synonym(&mut self, id: impl Into<String>) {
        let id = id.into();
        if !self.synonym_ids.contains(&id) {
            self.synonym_ids.push(id);
        }
    }

    pub fn declare_stopwords(&mut self, id: impl Into<String>) {
        let id = id.into();
        if !self.stopword_ids.contains(&id) {
            self.stopword_ids.push(id);
        }
    }

    pub fn find_attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn find_join(&self, name: &str) -> Option<&JoinDecl> {
        self.joins.iter().find(|j| j.name == name)
    }
}

/// Process-wide model registry. Construct one with `Registry::new()` (tests
/// typically keep a fresh instance per test rather than relying on a global
/// singleton, which keeps them hermetic).
pub struct Registry {
    inner: RwLock<Arc<HashMap<String, ModelDef>>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self { inner: RwLock::new(Arc::new(HashMap::new())) }
    }

    /// Registers `model`, keyed by its collection name. Re-registration
    /// with an equal `ModelDef` (same class name and content) is
    /// idempotent; re-registration under the same collection name with a
    /// different class is rejected.
    pub fn register(&self, model: ModelDef) -> Result<(), Error> {
        let mut guard = self.inner.write();
        if let Some(existing) = guard.get(&model.collection_name) {
            if existing.class_name != model.class_name {
                return Err(Error::InvalidParams(format!(
                    "collection `{}` is already registered to class `{}`, cannot register `{}`",
                    model.collection_name, existing.class_name, model.class_name
                )));
            }
            if *existing == model {
                return Ok(());
            }
        }
        let mut next = (**guard).clone();
        next.insert(model.collection_name.clone(), model);
        *guard = Arc::new(next);
        Ok(())
    }

    pub fn get(&self, collection_name: &str) -> Option<ModelDef> {
        self.inner.read().get(collection_name).cloned()
    }

    pub fn snapshot(&self) -> Arc<HashMap<String, ModelDef>> {
        self.inner.read().clone()
    }

    /// Clears all registrations. Exists for test hermeticity, per the
    /// "explicit reset for tests" design note.
    pub fn reset(&self) {
        *self.inner.write() = Arc::new(HashMap::new());
    }
}
