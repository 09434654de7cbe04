//! Partitioned bulk indexing pipeline.
//!
//! One `Indexer` drives the rebuild-a-partition pipeline: enumerate rows,
//! map them to documents, bulk-import with retry/backoff and 413
//! bisection, and optionally sweep stale documents afterward. Partition
//! parallelism uses a small fixed `std::thread` pool; the pool's shared
//! progress state is a `parking_lot::Mutex` rather than reaching for a new
//! concurrency primitive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rand::Rng;
use serde_json::{Map as JsonMap, Value as Json};
use tracing::{error, info, warn};

use crate::config::{IndexerConfig, RetryPolicy};
use crate::error::Error;
use crate::mapper::Mapper;
use crate::transport::Transport;

/// One partition's identifying value(s), e.g. `{field: ids}` for a partial
/// reindex driven by cascade, or an opaque label for a full rebuild shard.
#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    pub label: String,
    pub filter: Option<(String, Vec<String>)>,
}

impl Partition {
    pub fn whole() -> Self {
        Self { label: "*".to_string(), filter: None }
    }

    pub fn by_ids(field: impl Into<String>, ids: Vec<String>) -> Self {
        Self { label: field.into(), filter: None }.with_filter(ids)
    }

    fn with_filter(mut self, ids: Vec<String>) -> Self {
        self.filter = Some((self.label.clone(), ids));
        self
    }
}

pub type RowFetcher = Box<dyn Fn(&Partition) -> Result<Vec<Json>, Error> + Send + Sync>;
pub type PartitionHook = Arc<dyn Fn(&Partition) -> Result<(), Error> + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchSummary {
    pub batch_index: usize,
    pub docs_total: usize,
    pub success_total: usize,
    pub failed_total: usize,
    pub attempts: u32,
    pub duration_ms: u128,
    pub http_status: Option<u16>,
    pub error_samples: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Ok,
    Partial,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub collection: String,
    pub status: RunStatus,
    pub batches_total: usize,
    pub docs_total: usize,
    pub success_total: usize,
    pub failed_total: usize,
    pub duration_ms_total: u128,
    pub batches: Vec<BatchSummary>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StaleDeleteReport {
    pub skipped: bool,
    pub skip_reason: Option<String>,
    pub dry_run: bool,
    pub estimated_count: Option<u64>,
    pub deleted_count: Option<u64>,
    pub duration_ms: u128,
    pub filter_hash: Option<String>,
}

fn now_epoch_secs() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

/// Backoff delay for attempt `k` (1-indexed): `min(base * 2^(k-1), max)`
/// with symmetric jitter `±delay * jitter_fraction`.
fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exp = policy.base_ms.saturating_mul(1u64 << attempt.saturating_sub(1).min(20));
    let capped = exp.min(policy.max_ms) as f64;
    let jitter_span = capped * policy.jitter_fraction;
    let jitter = rand::thread_rng().gen_range(-jitter_span..=jitter_span);
    let delay_ms = (capped + jitter).max(0.0) as u64;
    Duration::from_millis(delay_ms)
}

pub struct Indexer {
    transport: Arc<dyn Transport>,
    mapper: Arc<Mapper>,
    config: IndexerConfig,
    retry: RetryPolicy,
    before_partition: Option<PartitionHook>,
    after_partition: Option<PartitionHook>,
    hook_timeout: Duration,
}

impl Indexer {
    pub fn new(transport: Arc<dyn Transport>, mapper: Arc<Mapper>, config: IndexerConfig, retry: RetryPolicy) -> Self {
        Self {
            transport,
            mapper,
            config,
            retry,
            before_partition: None,
            after_partition: None,
            hook_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_hooks(mut self, before: Option<PartitionHook>, after: Option<PartitionHook>, timeout: Duration) -> Self {
        self.before_partition = before;
        self.after_partition = after;
        self.hook_timeout = timeout;
        self
    }

    fn run_hook_with_timeout(&self, hook: &PartitionHook, partition: &Partition) -> Result<(), Error> {
        // Hooks are user code; bound their wall-clock cost so a stuck hook
        // aborts the partition rather than hanging the pool. `PartitionHook`
        // is `Arc`-backed so it can be cloned into the worker thread without
        // unsafe lifetime extension.
        let (tx, rx) = mpsc::channel();
        let hook = hook.clone();
        let partition = partition.clone();
        thread::spawn(move || {
            let result = hook(&partition);
            let _ = tx.send(result);
        });
        match rx.recv_timeout(self.hook_timeout) {
            Ok(r) => r,
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Runs the full rebuild pipeline for one partition against `into`
    /// (the resolved physical/logical collection name).
    pub fn rebuild_partition(&self, into: &str, partition: &Partition, fetch: &RowFetcher) -> Result<Summary, Error> {
        let started = std::time::Instant::now();

        let target_exists = self.transport.get_collection(into)?.is_some();
        if let Some(before) = &self.before_partition {
            if target_exists && partition.filter.is_some() {
                self.run_hook_with_timeout(before, partition)?;
            }
        }

        let rows = fetch(partition)?;
        let mut batches = Vec::new();
        let mut batch_index = 0usize;
        for chunk in rows.chunks(self.config.batch_size.max(1)) {
            let summary = self.run_batch(into, chunk, batch_index)?;
            batches.push(summary);
            batch_index += 1;
        }

        if let Some(after) = &self.after_partition {
            self.run_hook_with_timeout(after, partition)?;
        }

        let docs_total: usize = batches.iter().map(|b| b.docs_total).sum();
        let success_total: usize = batches.iter().map(|b| b.success_total).sum();
        let failed_total: usize = batches.iter().map(|b| b.failed_total).sum();
        let status = if failed_total == 0 {
            RunStatus::Ok
        } else if success_total > 0 {
            RunStatus::Partial
        } else {
            RunStatus::Failed
        };

        Ok(Summary {
            collection: into.to_string(),
            status,
            batches_total: batches.len(),
            docs_total,
            success_total,
            failed_total,
            duration_ms_total: started.elapsed().as_millis(),
            batches,
        })
    }

    fn run_batch(&self, collection: &str, rows: &[Json], batch_index: usize) -> Result<BatchSummary, Error> {
        let (mut docs, _report) = self.mapper.map_batch(rows, batch_index)?;
        let now = now_epoch_secs();
        for doc in &mut docs {
            if let Json::Object(obj) = doc {
                obj.insert("doc_updated_at".to_string(), Json::from(now));
            }
        }
        let started = std::time::Instant::now();
        let outcome = self.import_with_retry(collection, &docs);
        let mut summary = BatchSummary { batch_index, docs_total: docs.len(), ..Default::default() };
        summary.duration_ms = started.elapsed().as_millis();
        match outcome {
            Ok((success, failed, samples)) => {
                summary.success_total = success;
                summary.failed_total = failed;
                summary.error_samples = samples;
            }
            Err(e) => {
                summary.failed_total = docs.len();
                summary.http_status = e.http_status();
                summary.error_samples = vec![e.to_string()];
            }
        }
        Ok(summary)
    }

    /// Imports `docs` with the retry policy applied, bisecting on 413.
    /// Returns `(success_count, failed_count, error_samples)`.
    fn import_with_retry(&self, collection: &str, docs: &[Json]) -> Result<(usize, usize, Vec<String>), Error> {
        if docs.is_empty() {
            return Ok((0, 0, Vec::new()));
        }
        let ndjson = docs_to_ndjson(docs);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.transport.import(collection, "upsert", &ndjson) {
                Ok(results) => {
                    let success = results.iter().filter(|r| r.success).count();
                    let failed = results.len() - success;
                    let samples: Vec<String> = results
                        .iter()
                        .filter_map(|r| r.error.clone())
                        .take(self.config.max_error_samples)
                        .collect();
                    return Ok((success, failed, samples));
                }
                Err(e) if e.is_payload_too_large() => {
                    if docs.len() <= 1 {
                        return Ok((0, 1, vec![e.to_string()]));
                    }
                    let mid = docs.len() / 2;
                    let (left, right) = docs.split_at(mid);
                    let (ls, lf, mut lerr) = self.import_with_retry(collection, left)?;
                    let (rs, rf, rerr) = self.import_with_retry(collection, right)?;
                    lerr.extend(rerr);
                    lerr.truncate(self.config.max_error_samples);
                    return Ok((ls + rs, lf + rf, lerr));
                }
                Err(e) if e.is_retryable() && attempt < self.retry.attempts => {
                    let delay = backoff_delay(&self.retry, attempt);
                    warn!(collection, attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying import batch");
                    thread::sleep(delay);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// `delete_stale!`. Skips per the documented preconditions;
    /// otherwise deletes via `filter_by` and reports a digest of the
    /// filter actually used.
    pub fn delete_stale(
        &self,
        stale_filter_by: Option<&str>,
        into: &str,
        dry_run: bool,
        timeout: Option<Duration>,
    ) -> Result<StaleDeleteReport, Error> {
        if !self.config.stale_deletes_enabled {
            return Ok(StaleDeleteReport { skipped: true, skip_reason: Some("stale deletes disabled".into()), ..Default::default() });
        }
        let Some(filter) = stale_filter_by else {
            return Ok(StaleDeleteReport { skipped: true, skip_reason: Some("no stale filter defined".into()), ..Default::default() });
        };
        let filter = filter.trim();
        if filter.is_empty() {
            return Ok(StaleDeleteReport { skipped: true, skip_reason: Some("resolved filter is empty".into()), ..Default::default() });
        }
        if is_suspicious_filter(filter) {
            return Ok(StaleDeleteReport { skipped: true, skip_reason: Some("filter looks unsafe (no comparator)".into()), ..Default::default() });
        }

        let started = std::time::Instant::now();
        let filter_hash = format!("{:016x}", xxhash_rust::xxh3::xxh3_64(filter.as_bytes()));

        if dry_run {
            let mut params = std::collections::HashMap::new();
            params.insert("q".to_string(), Json::String("*".into()));
            params.insert("filter_by".to_string(), Json::String(filter.to_string()));
            params.insert("per_page".to_string(), Json::from(0));
            let estimated = self
                .transport
                .search(into, &params)
                .ok()
                .and_then(|j| j.get("found").and_then(|v| v.as_u64()));
            return Ok(StaleDeleteReport {
                skipped: false,
                dry_run: true,
                estimated_count: estimated,
                duration_ms: started.elapsed().as_millis(),
                filter_hash: Some(filter_hash),
                ..Default::default()
            });
        }

        let result = self.transport.delete_by_filter(into, filter, timeout)?;
        Ok(StaleDeleteReport {
            skipped: false,
            dry_run: false,
            deleted_count: Some(result.num_deleted),
            duration_ms: started.elapsed().as_millis(),
            filter_hash: Some(filter_hash),
            ..Default::default()
        })
    }
}

fn is_suspicious_filter(filter: &str) -> bool {
    let has_comparator = [":=", ":!=", ":>", ":>=", ":<", ":<="].iter().any(|op| filter.contains(op));
    !has_comparator
}

fn docs_to_ndjson(docs: &[Json]) -> String {
    let mut out = String::new();
    for doc in docs {
        out.push_str(&doc.to_string());
        out.push('\n');
    }
    out
}

/// A bounded, fixed-size worker pool driving multiple partitions in
/// parallel: a fixed thread pool, sized `max_parallel`. Progress
/// lines are serialized under `progress_lock` so interleaved partition
/// output stays readable.
pub struct WorkerPool {
    size: usize,
    progress_lock: Arc<Mutex<()>>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self { size: size.max(1), progress_lock: Arc::new(Mutex::new(())), shutdown: Arc::new(AtomicBool::new(false)) }
    }

    /// Runs `job(item)` for every item in `items`, using up to `size`
    /// concurrent worker threads, and returns results in input order.
    pub fn run<T, R, F>(&self, items: Vec<T>, job: F) -> Vec<R>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> R + Send + Sync + 'static,
    {
        let job = Arc::new(job);
        let (result_tx, result_rx) = mpsc::channel::<(usize, R)>();
        let work: Arc<Mutex<std::collections::VecDeque<(usize, T)>>> =
            Arc::new(Mutex::new(items.into_iter().enumerate().collect()));

        let mut handles = Vec::new();
        for _ in 0..self.size {
            let work = work.clone();
            let tx = result_tx.clone();
            let job = job.clone();
            let shutdown = self.shutdown.clone();
            handles.push(thread::spawn(move || loop {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let next = work.lock().pop_front();
                match next {
                    Some((idx, item)) => {
                        let result = job(item);
                        let _ = tx.send((idx, result));
                    }
                    None => break,
                }
            }));
        }
        drop(result_tx);

        let mut collected: Vec<(usize, R)> = result_rx.iter().collect();
        for h in handles {
            // Pool shutdown waits with a generous timeout at the call
            // site in practice; plain join is sufficient here since all
            // work items are already drained via the channel above.
            let _ = h.join();
        }
        collected.sort_by_key(|(idx, _)| *idx);
        collected.into_iter().map(|(_, r)| r).collect()
    }

    pub fn progress_lock(&self) -> Arc<Mutex<()>> {
        self.progress_lock.clone()
    }
}
