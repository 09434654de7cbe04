//! Reverse-reference cascade reindexing.
//!
//! `build_reverse_graph` inspects every collection's field specs for
//! `"<coll>.<fk>"`-shaped reference fields (the same naming `schema::compile`
//! produces for joins) and inverts them into `referrer -> source` edges.
//! `cascade_reindex!` walks that graph one hop from a changed source,
//! skipping immediate A↔B cycles and anything the local registry doesn't
//! know about.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::info;

use crate::error::Error;
use crate::indexer::{Indexer, Partition, RowFetcher};
use crate::registry::{ModelDef, Registry};
use crate::schema::PhysicalName;
use crate::transport::Transport;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReferenceEdge {
    pub referrer: String,
    pub source: String,
    pub local_key: String,
    pub foreign_key: String,
}

/// `referrer -> [edges into referrers' various sources]`, keyed by the
/// source collection so lookups for "who references X" are O(1).
#[derive(Debug, Clone, Default)]
pub struct ReverseGraph {
    edges_by_source: HashMap<String, Vec<ReferenceEdge>>,
}

impl ReverseGraph {
    pub fn referrers_of(&self, source: &str) -> &[ReferenceEdge] {
        self.edges_by_source.get(source).map(|v| v.as_slice()).unwrap_or(&[])
    }
}

fn normalize_logical(name: &str) -> String {
    PhysicalName::parse(name).map(|p| p.logical).unwrap_or_else(|| name.to_string())
}

/// Discovers reference edges from every collection's field specs. Falls
/// back to the local registry's compiled schemas when transport
/// enumeration fails or yields nothing.
pub fn build_reverse_graph(transport: &dyn Transport, registry: &Registry) -> ReverseGraph {
    match transport.list_collections() {
        Ok(collections) if !collections.is_empty() => build_from_live(&collections),
        _ => build_from_registry(registry),
    }
}

fn build_from_live(collections: &[serde_json::Value]) -> ReverseGraph {
    let mut graph = ReverseGraph::default();
    for coll in collections {
        let Some(name) = coll.get("name").and_then(|n| n.as_str()) else { continue };
        let referrer = normalize_logical(name);
        let Some(fields) = coll.get("fields").and_then(|f| f.as_array()) else { continue };
        for field in fields {
            let Some(field_name) = field.get("name").and_then(|n| n.as_str()) else { continue };
            let Some((source, foreign_key)) = field_name.split_once('.') else { continue };
            graph.edges_by_source.entry(source.to_string()).or_default().push(ReferenceEdge {
                referrer: referrer.clone(),
                source: source.to_string(),
                local_key: field_name.to_string(),
                foreign_key: foreign_key.to_string(),
            });
        }
    }
    graph
}

fn build_from_registry(registry: &Registry) -> ReverseGraph {
    let mut graph = ReverseGraph::default();
    for model in registry.snapshot().values() {
        for join in &model.joins {
            graph.edges_by_source.entry(join.collection.clone()).or_default().push(ReferenceEdge {
                referrer: model.collection_name.clone(),
                source: join.collection.clone(),
                local_key: join.local_key.clone(),
                foreign_key: join.foreign_key.clone(),
            });
        }
    }
    graph
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReindexContext {
    Update,
    Full,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CascadeReport {
    pub partial: Vec<String>,
    pub full: Vec<String>,
    pub skipped_cycle: Vec<String>,
    pub skipped_unregistered: Vec<String>,
    pub skipped_duplicate: Vec<String>,
    pub partial_failed_full_fallback: Vec<String>,
}

/// Supplies the indexing ingredients for one referrer: its `Indexer`, a
/// `RowFetcher` adapter, and whether it supports partitioned partial
/// reindexing (has a source adapter accepting `{field => values}` and no
/// custom partitioner).
pub struct ReferrerHandle {
    pub indexer: Arc<Indexer>,
    pub fetch: RowFetcher,
    pub supports_partial: bool,
    pub max_parallel: usize,
}

pub trait ReferrerResolver {
    fn resolve(&self, referrer_collection: &str) -> Option<ReferrerHandle>;
}

/// Walks one hop from `source`, reindexing every distinct referrer found
/// via the reverse graph.
pub fn cascade_reindex(
    graph: &ReverseGraph,
    registry: &Registry,
    resolver: &dyn ReferrerResolver,
    source: &str,
    ids: &[String],
    context: ReindexContext,
) -> CascadeReport {
    let mut report = CascadeReport::default();
    let edges = graph.referrers_of(source);

    let mut seen_referrers: HashSet<String> = HashSet::new();
    let mut fully_reindexed_this_run: HashSet<String> = HashSet::new();

    for edge in edges {
        if seen_referrers.contains(&edge.referrer) {
            report.skipped_duplicate.push(edge.referrer.clone());
            continue;
        }
        seen_referrers.insert(edge.referrer.clone());

        // Immediate A<->B cycle: source itself is referred to by this
        // referrer, and this referrer is also *a* source that `source`
        // refers back into. We approximate "immediate cycle" as: the
        // referrer is also a known source of edges pointing back at
        // `source`.
        if is_immediate_cycle(graph, source, &edge.referrer) {
            report.skipped_cycle.push(format!("{}<->{}", source, edge.referrer));
            continue;
        }

        let model: Option<ModelDef> = registry.get(&edge.referrer);
        if model.is_none() {
            report.skipped_unregistered.push(edge.referrer.clone());
            continue;
        }

        let Some(handle) = resolver.resolve(&edge.referrer) else {
            report.skipped_unregistered.push(edge.referrer.clone());
            continue;
        };

        if context == ReindexContext::Update && handle.supports_partial {
            let partition = Partition::by_ids(edge.local_key.clone(), ids.to_vec());
            match handle.indexer.rebuild_partition(&edge.referrer, &partition, &handle.fetch) {
                Ok(summary) if summary.failed_total == 0 => {
                    report.partial.push(edge.referrer.clone());
                }
                Ok(_) | Err(_) => {
                    // partial failed: fall back to a full reindex, once.
                    if fully_reindexed_this_run.insert(edge.referrer.clone()) {
                        run_full_reindex(&handle, &edge.referrer);
                        report.partial_failed_full_fallback.push(edge.referrer.clone());
                    }
                }
            }
        } else if fully_reindexed_this_run.insert(edge.referrer.clone()) {
            run_full_reindex(&handle, &edge.referrer);
            report.full.push(edge.referrer.clone());
        }
    }

    info!(
        source,
        partial = report.partial.len(),
        full = report.full.len(),
        skipped_cycle = report.skipped_cycle.len(),
        "cascade reindex complete"
    );
    report
}

fn run_full_reindex(handle: &ReferrerHandle, into: &str) {
    // A full reindex in this design runs as a single whole-collection
    // partition using the referrer's own fetcher; `max_parallel` is where
    // `cascade_reindex` parallelizes across referrers, not within one.
    let _ = handle.indexer.rebuild_partition(into, &Partition::whole(), &handle.fetch);
}

fn is_immediate_cycle(graph: &ReverseGraph, source: &str, referrer: &str) -> bool {
    graph.referrers_of(referrer).iter().any(|e| e.referrer == source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IndexerConfig, RetryPolicy};
    use crate::mapper::{Mapper, MapperOptions};
    use crate::schema::FieldSpec;
    use crate::transport::mock::MockTransport;
    use serde_json::json;

    fn collection_json(name: &str, ref_field: Option<&str>) -> serde_json::Value {
        let mut fields = vec![json!({"name": "id", "type": "string"})];
        if let Some(rf) = ref_field {
            fields.push(json!({"name": rf, "type": "string"}));
        }
        json!({"name": name, "fields": fields})
    }

    #[test]
    fn build_reverse_graph_from_live_collections() {
        let transport = MockTransport::new();
        transport.create_collection(&collection_json("books", Some("authors.id"))).unwrap();
        let registry = Registry::new();
        let graph = build_reverse_graph(&transport, &registry);
        let referrers = graph.referrers_of("authors");
        assert_eq!(referrers.len(), 1);
        assert_eq!(referrers[0].referrer, "books");
    }

    #[test]
    fn falls_back_to_registry_when_transport_empty() {
        let transport = MockTransport::new();
        let registry = Registry::new();
        let mut model = ModelDef::new("Book", "books");
        model.attribute("author_id", crate::registry::TypeDesc::String, Default::default()).unwrap();
        model.join("authors", "authors", "author_id", "id").unwrap();
        registry.register(model).unwrap();
        let graph = build_reverse_graph(&transport, &registry);
        assert_eq!(graph.referrers_of("authors").len(), 1);
    }

    struct NullResolver;
    impl ReferrerResolver for NullResolver {
        fn resolve(&self, _referrer_collection: &str) -> Option<ReferrerHandle> {
            None
        }
    }

    #[test]
    fn immediate_cycle_is_skipped() {
        let transport = MockTransport::new();
        transport.create_collection(&collection_json("a", Some("b.id"))).unwrap();
        transport.create_collection(&collection_json("b", Some("a.id"))).unwrap();
        let registry = Registry::new();
        let graph = build_reverse_graph(&transport, &registry);
        let report = cascade_reindex(&graph, &registry, &NullResolver, "b", &["1".into(), "2".into()], ReindexContext::Update);
        assert_eq!(report.skipped_cycle.len(), 1);
        assert!(report.partial.is_empty());
        assert!(report.full.is_empty());
    }

    #[test]
    fn unregistered_referrer_is_skipped() {
        let transport = MockTransport::new();
        transport.create_collection(&collection_json("books", Some("authors.id"))).unwrap();
        let registry = Registry::new();
        let graph = build_reverse_graph(&transport, &registry);
        let report = cascade_reindex(&graph, &registry, &NullResolver, "authors", &["1".into()], ReindexContext::Update);
        assert_eq!(report.skipped_unregistered, vec!["books".to_string()]);
    }

    struct OkResolver;
    impl ReferrerResolver for OkResolver {
        fn resolve(&self, _referrer_collection: &str) -> Option<ReferrerHandle> {
            let mapper = Arc::new(Mapper::new(
                "Book",
                &[FieldSpec { name: "title".into(), field_type: "string".into(), optional: false, facet: false, sort: false, infix: false, locale: None }],
                Box::new(|row| Ok(row.clone())),
                MapperOptions { max_error_samples: 10, ..Default::default() },
            ));
            let transport: Arc<dyn Transport> = Arc::new(MockTransport::new());
            let indexer = Arc::new(Indexer::new(transport, mapper, IndexerConfig::default(), RetryPolicy::default()));
            Some(ReferrerHandle {
                indexer,
                fetch: Box::new(|_| Ok(vec![json!({"id": "1", "title": "x"})])),
                supports_partial: true,
                max_parallel: 2,
            })
        }
    }

    #[test]
    fn partial_reindex_runs_when_supported() {
        let transport = MockTransport::new();
        transport.create_collection(&collection_json("books", Some("authors.id"))).unwrap();
        let registry = Registry::new();
        registry.register(ModelDef::new("Book", "books")).unwrap();
        let graph = build_reverse_graph(&transport, &registry);
        let report = cascade_reindex(&graph, &registry, &OkResolver, "authors", &["1".into()], ReindexContext::Update);
        assert_eq!(report.partial, vec!["books".to_string()]);
    }

    struct FullResolver {
        backing: Arc<MockTransport>,
    }
    impl ReferrerResolver for FullResolver {
        fn resolve(&self, _referrer_collection: &str) -> Option<ReferrerHandle> {
            let mapper = Arc::new(Mapper::new(
                "Book",
                &[FieldSpec { name: "title".into(), field_type: "string".into(), optional: false, facet: false, sort: false, infix: false, locale: None }],
                Box::new(|row| Ok(row.clone())),
                MapperOptions { max_error_samples: 10, ..Default::default() },
            ));
            let transport: Arc<dyn Transport> = self.backing.clone();
            let indexer = Arc::new(Indexer::new(transport, mapper, IndexerConfig::default(), RetryPolicy::default()));
            Some(ReferrerHandle {
                indexer,
                fetch: Box::new(|_| Ok(vec![json!({"id": "1", "title": "x"}), json!({"id": "2", "title": "y"})])),
                supports_partial: false,
                max_parallel: 2,
            })
        }
    }

    #[test]
    fn full_reindex_actually_indexes_fetched_rows() {
        let graph_transport = MockTransport::new();
        graph_transport.create_collection(&collection_json("books", Some("authors.id"))).unwrap();
        let registry = Registry::new();
        registry.register(ModelDef::new("Book", "books")).unwrap();
        let graph = build_reverse_graph(&graph_transport, &registry);

        let backing = Arc::new(MockTransport::new());
        let resolver = FullResolver { backing: backing.clone() };
        let report = cascade_reindex(&graph, &registry, &resolver, "authors", &["1".into()], ReindexContext::Full);

        assert_eq!(report.full, vec!["books".to_string()]);
        assert_eq!(backing.documents.lock().get("books").map(|d| d.len()), Some(2));
    }
}
