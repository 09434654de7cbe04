//! Synonyms & stopwords admin, and the Curation entity.
//!
//! Pinned/hidden-hit *validation* lives on `Relation::pinned`/`hidden`
//! since that's where the curation limit and id shape are known; this
//! module is the thin Transport wrapper for the admin-side synonym and
//! stopword lifecycle, idempotent on delete per the local-recovery policy.

use serde_json::json;

use crate::error::Error;
use crate::transport::Transport;

/// The pinned/hidden hit ids accumulated on a relation. Exists as a value
/// type mainly so callers can inspect what a relation would curate
/// without re-deriving it from compiled params.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Curation {
    pub pinned: Vec<String>,
    pub hidden: Vec<String>,
}

impl Curation {
    pub fn total(&self) -> usize {
        self.pinned.len() + self.hidden.len()
    }
}

pub fn upsert_synonym(transport: &dyn Transport, collection: &str, id: &str, synonyms: &[String]) -> Result<(), Error> {
    let payload = json!({ "synonyms": synonyms });
    transport.upsert_synonym(collection, id, &payload)
}

pub fn delete_synonym(transport: &dyn Transport, collection: &str, id: &str) -> Result<(), Error> {
    transport.delete_synonym(collection, id)
}

pub fn upsert_stopwords(transport: &dyn Transport, collection: &str, id: &str, stopwords: &[String]) -> Result<(), Error> {
    let payload = json!({ "stopwords": stopwords });
    transport.upsert_stopwords(collection, id, &payload)
}

pub fn delete_stopwords(transport: &dyn Transport, collection: &str, id: &str) -> Result<(), Error> {
    transport.delete_stopwords(collection, id)
}

/// A declared synonym set wrapper bound to one collection and id, mirroring
/// the registry's `declare_synonym` bookkeeping.
pub struct SynonymSet<'t> {
    transport: &'t dyn Transport,
    collection: String,
    id: String,
}

impl<'t> SynonymSet<'t> {
    pub fn new(transport: &'t dyn Transport, collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self { transport, collection: collection.into(), id: id.into() }
    }

    pub fn upsert(&self, synonyms: &[String]) -> Result<(), Error> {
        upsert_synonym(self.transport, &self.collection, &self.id, synonyms)
    }

    pub fn delete(&self) -> Result<(), Error> {
        delete_synonym(self.transport, &self.collection, &self.id)
    }
}

pub struct StopwordSet<'t> {
    transport: &'t dyn Transport,
    collection: String,
    id: String,
}

impl<'t> StopwordSet<'t> {
    pub fn new(transport: &'t dyn Transport, collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self { transport, collection: collection.into(), id: id.into() }
    }

    pub fn upsert(&self, stopwords: &[String]) -> Result<(), Error> {
        upsert_stopwords(self.transport, &self.collection, &self.id, stopwords)
    }

    pub fn delete(&self) -> Result<(), Error> {
        delete_stopwords(self.transport, &self.collection, &self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    #[test]
    fn synonym_set_upsert_and_delete_round_trip() {
        let transport = MockTransport::new();
        let set = SynonymSet::new(&transport, "books", "harry-potter-syn");
        assert!(set.upsert(&["hp".to_string(), "harry potter".to_string()]).is_ok());
        assert!(set.delete().is_ok());
    }

    #[test]
    fn stopword_delete_is_idempotent_on_missing() {
        let transport = MockTransport::new();
        let set = StopwordSet::new(&transport, "books", "en-common");
        assert!(set.delete().is_ok());
        assert!(set.delete().is_ok());
    }

    #[test]
    fn curation_total_counts_both() {
        let c = Curation { pinned: vec!["a".into(), "b".into()], hidden: vec!["c".into()] };
        assert_eq!(c.total(), 3);
    }
}
