//! Engine configuration.
//!
//! Global-then-override config layering: a `Default` baseline overlaid by
//! environment variables, all under one `TSI_*` prefix.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Wraps the backend API key so it never round-trips through `Debug` in
/// plaintext — logs and panics redact it.
#[derive(Clone, Serialize, Deserialize)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn reveal(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(<redacted>)")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DispatchMode {
    Inline,
    Queue,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_ms: u64,
    pub max_ms: u64,
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_ms: 200,
            max_ms: 5_000,
            jitter_fraction: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresetsConfig {
    pub enabled: bool,
    pub namespace: Option<String>,
    pub locked_domains: Vec<String>,
}

impl Default for PresetsConfig {
    fn default() -> Self {
        Self { enabled: false, namespace: None, locked_domains: Vec::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexerConfig {
    pub batch_size: usize,
    pub gzip: bool,
    pub dispatch_mode: DispatchMode,
    pub queue_name: Option<String>,
    pub max_parallel: usize,
    pub stale_deletes_enabled: bool,
    pub max_error_samples: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            batch_size: 200,
            gzip: false,
            dispatch_mode: DispatchMode::Inline,
            queue_name: None,
            max_parallel: 4,
            stale_deletes_enabled: true,
            max_error_samples: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetentionConfig {
    pub keep_last: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { keep_last: 2 }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub protocol: String,
    pub api_key: ApiKey,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub import_read_timeout_ms: u64,
    pub default_query_by: String,
    pub retry: RetryPolicy,
    pub presets: PresetsConfig,
    pub strict_selection: bool,
    pub curation_limit: usize,
    pub indexer: IndexerConfig,
    pub retention: RetentionConfig,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("protocol", &self.protocol)
            .field("api_key", &self.api_key)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("read_timeout_ms", &self.read_timeout_ms)
            .field("import_read_timeout_ms", &self.import_read_timeout_ms)
            .field("default_query_by", &self.default_query_by)
            .field("retry", &self.retry)
            .field("presets", &self.presets)
            .field("strict_selection", &self.strict_selection)
            .field("curation_limit", &self.curation_limit)
            .field("indexer", &self.indexer)
            .field("retention", &self.retention)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 8108,
            protocol: "http".into(),
            api_key: ApiKey::new(""),
            connect_timeout_ms: 2_000,
            read_timeout_ms: 10_000,
            import_read_timeout_ms: 120_000,
            default_query_by: String::new(),
            retry: RetryPolicy::default(),
            presets: PresetsConfig::default(),
            strict_selection: true,
            curation_limit: 100,
            indexer: IndexerConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

impl Config {
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }

    /// Overlays `Default` with `TSI_*` environment variables. Unset
    /// variables leave the default untouched; malformed values are ignored,
    /// silently no-oping on a bad value rather than panicking.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("TSI_HOST") {
            cfg.host = v;
        }
        if let Ok(v) = std::env::var("TSI_PORT") {
            if let Ok(n) = v.parse() {
                cfg.port = n;
            }
        }
        if let Ok(v) = std::env::var("TSI_PROTOCOL") {
            cfg.protocol = v;
        }
        if let Ok(v) = std::env::var("TSI_API_KEY") {
            cfg.api_key = ApiKey::new(v);
        }
        if let Ok(v) = std::env::var("TSI_DEFAULT_QUERY_BY") {
            cfg.default_query_by = v;
        }
        if let Ok(v) = std::env::var("TSI_CONNECT_TIMEOUT_MS") {
            if let Ok(n) = v.parse() {
                cfg.connect_timeout_ms = n;
            }
        }
        if let Ok(v) = std::env::var("TSI_READ_TIMEOUT_MS") {
            if let Ok(n) = v.parse() {
                cfg.read_timeout_ms = n;
            }
        }
        if let Ok(v) = std::env::var("TSI_RETENTION_KEEP_LAST") {
            if let Ok(n) = v.parse() {
                cfg.retention.keep_last = n;
            }
        }
        if let Ok(v) = std::env::var("TSI_INDEXER_BATCH_SIZE") {
            if let Ok(n) = v.parse() {
                cfg.indexer.batch_size = n;
            }
        }
        if let Ok(v) = std::env::var("TSI_INDEXER_MAX_PARALLEL") {
            if let Ok(n) = v.parse() {
                cfg.indexer.max_parallel = n.max(1);
            }
        }
        cfg
    }
}
