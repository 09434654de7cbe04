//! Full chain: `schema::apply` (blue/green) -> `Indexer::rebuild_partition`
//! -> `cascade::cascade_reindex`, all driven off one shared `MockTransport`,
//! so a change indexed into a physical collection created by `apply` is
//! later visible to the reverse-graph builder that inspects
//! `list_collections()`.

use std::sync::{Arc, Mutex};

use serde_json::json;

use typesense_index_engine::cascade::{
    build_reverse_graph, cascade_reindex, ReferrerHandle, ReferrerResolver, ReindexContext,
};
use typesense_index_engine::config::{IndexerConfig, RetryPolicy};
use typesense_index_engine::error::Error;
use typesense_index_engine::indexer::{Indexer, Partition, RowFetcher};
use typesense_index_engine::mapper::{Mapper, MapperOptions};
use typesense_index_engine::registry::{AttributeOpts, ModelDef, Registry, TypeDesc};
use typesense_index_engine::schema;
use typesense_index_engine::transport::mock::MockTransport;
use typesense_index_engine::transport::Transport;

fn book_model() -> ModelDef {
    let mut m = ModelDef::new("Book", "books");
    m.attribute("title", TypeDesc::String, AttributeOpts::default()).unwrap();
    m.attribute("author_id", TypeDesc::String, AttributeOpts::default()).unwrap();
    m.join("authors", "authors", "author_id", "id").unwrap();
    m.schema_retention(1);
    m
}

fn author_model() -> ModelDef {
    let mut m = ModelDef::new("Author", "authors");
    m.attribute("name", TypeDesc::String, AttributeOpts::default()).unwrap();
    m
}

fn book_mapper() -> Arc<Mapper> {
    let schema = schema::compile(&book_model());
    Arc::new(Mapper::new(
        "Book",
        &schema.fields,
        Box::new(|row| Ok(row.clone())),
        MapperOptions { max_error_samples: 10, ..Default::default() },
    ))
}

#[test]
fn blue_green_apply_indexes_and_drives_cascade() {
    let transport: Arc<dyn Transport> = Arc::new(MockTransport::new());
    let book = book_model();

    // 1. apply(): create physical -> reindex callback -> alias swap.
    let indexed_into: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let indexed_into_cb = indexed_into.clone();
    let mapper = book_mapper();
    let transport_for_callback = transport.clone();
    let report = schema::apply(&book, transport.as_ref(), move |physical| {
        *indexed_into_cb.lock().unwrap() = Some(physical.to_string());
        let indexer = Indexer::new(transport_for_callback.clone(), mapper.clone(), IndexerConfig::default(), RetryPolicy::default());
        // `schema::compile` derives a reference field `authors.id` from the
        // join; the mapper's required-key set is every compiled schema
        // field except `doc_updated_at`, so rows must carry it too.
        let fetch: RowFetcher = Box::new(|_p| {
            Ok(vec![
                json!({"id": "1", "title": "Harry Potter", "author_id": "a1", "authors.id": "a1", "doc_updated_at": 0}),
                json!({"id": "2", "title": "Chamber of Secrets", "author_id": "a1", "authors.id": "a1", "doc_updated_at": 0}),
            ])
        });
        let summary = indexer.rebuild_partition(physical, &Partition::whole(), &fetch)?;
        if summary.failed_total > 0 {
            return Err(Error::InvalidParams("reindex reported failures".into()));
        }
        Ok(())
    })
    .expect("apply should succeed");

    assert_eq!(indexed_into.lock().unwrap().as_deref(), Some(report.new_physical.as_str()));
    assert_eq!(transport.get_alias("books").unwrap(), Some(report.new_physical.clone()));

    // Documents landed in the new physical collection, stamped with
    // doc_updated_at overwritten by the indexer (never the caller's `0`).
    let docs = transport.documents.lock();
    let stored = docs.get(&report.new_physical).expect("docs should be indexed into the new physical");
    assert_eq!(stored.len(), 2);
    for doc in stored {
        assert_ne!(doc.get("doc_updated_at").and_then(|v| v.as_i64()), Some(0));
    }
    drop(docs);

    // 2. Diff against the now-live schema should be empty: nothing changed.
    let diff = schema::diff(&book, transport.as_ref()).unwrap();
    assert!(diff.added.is_empty() && diff.removed.is_empty() && diff.changed.is_empty());

    // 3. build_reverse_graph discovers books -> authors from the live
    // physical collection's field specs (schema::compile's own
    // "<coll>.<fk>" naming, parsed back by cascade).
    let registry = Registry::new();
    registry.register(book).unwrap();
    registry.register(author_model()).unwrap();
    let graph = build_reverse_graph(transport.as_ref(), &registry);
    let referrers = graph.referrers_of("authors");
    assert_eq!(referrers.len(), 1);
    assert_eq!(referrers[0].referrer, "books");

    // 4. cascade_reindex drives a partial reindex of `books` off a change to
    // `authors`.
    struct BooksResolver(Arc<dyn Transport>);
    impl ReferrerResolver for BooksResolver {
        fn resolve(&self, referrer_collection: &str) -> Option<ReferrerHandle> {
            if referrer_collection != "books" {
                return None;
            }
            let schema = schema::compile(&book_model());
            let mapper = Arc::new(Mapper::new(
                "Book",
                &schema.fields,
                Box::new(|row| Ok(row.clone())),
                MapperOptions { max_error_samples: 10, ..Default::default() },
            ));
            let indexer = Arc::new(Indexer::new(self.0.clone(), mapper, IndexerConfig::default(), RetryPolicy::default()));
            Some(ReferrerHandle {
                indexer,
                fetch: Box::new(|_p| Ok(vec![json!({"id": "1", "title": "Harry Potter", "author_id": "a1", "authors.id": "a1", "doc_updated_at": 0})])),
                supports_partial: true,
                max_parallel: 2,
            })
        }
    }

    let resolver = BooksResolver(transport.clone());
    let cascade_report = cascade_reindex(&graph, &registry, &resolver, "authors", &["a1".to_string()], ReindexContext::Update);
    assert_eq!(cascade_report.partial, vec!["books".to_string()]);
    assert!(cascade_report.skipped_cycle.is_empty());

    // The partial reindex imported into the *logical* name "books" (no
    // alias resolution inside cascade's partial path), independent of the
    // physical collection created by apply() above.
    let docs = transport.documents.lock();
    assert!(docs.get("books").is_some());
}

#[test]
fn rollback_after_second_apply_restores_previous_physical() {
    let transport: Arc<dyn Transport> = Arc::new(MockTransport::new());
    let mut book = book_model();
    book.schema_retention(2);

    let first = schema::apply(&book, transport.as_ref(), |_| Ok(())).unwrap();
    // Force a distinct timestamp-independent physical name for the second
    // apply by keeping retention high enough that both survive.
    let second = schema::apply(&book, transport.as_ref(), |_| Ok(())).unwrap();
    assert_ne!(first.new_physical, second.new_physical);
    assert_eq!(transport.get_alias("books").unwrap(), Some(second.new_physical.clone()));

    let rolled_back_to = schema::rollback(&book, transport.as_ref()).unwrap();
    assert_eq!(rolled_back_to, first.new_physical);
    assert_eq!(transport.get_alias("books").unwrap(), Some(first.new_physical));
}
