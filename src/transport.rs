//! Synchronous HTTP wrapper over the backend's surface.
//!
//! `Transport` is the sole I/O seam: every other component is handed an
//! `Arc<dyn Transport>` and never touches `reqwest` directly, which is what
//! makes the Schema/Indexer/Cascade tests runnable against `MockTransport`
//! with no network. `HttpTransport` is the production implementation:
//! build one `reqwest::Client`, carry config-derived headers on every
//! call, blocking rather than async — a synchronous public API with no
//! green-thread runtime.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as Json;

use crate::config::Config;
use crate::error::Error;

/// Result of one line of a bulk import response.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ImportLineResult {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub document: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DeleteByFilterResult {
    pub num_deleted: u64,
}

pub trait Transport: Send + Sync {
    fn search(&self, collection: &str, params: &HashMap<String, Json>) -> Result<Json, Error>;

    fn multi_search(&self, searches: &[Json], common: &HashMap<String, Json>) -> Result<Json, Error>;

    /// `action` is one of `upsert|create|update`. `ndjson` is newline
    /// delimited JSON, one document per line. Returns one result per input
    /// line, in order.
    fn import(&self, collection: &str, action: &str, ndjson: &str) -> Result<Vec<ImportLineResult>, Error>;

    fn delete_by_filter(
        &self,
        collection: &str,
        filter_by: &str,
        timeout: Option<Duration>,
    ) -> Result<DeleteByFilterResult, Error>;

    fn create_collection(&self, schema: &Json) -> Result<(), Error>;

    /// Lists every collection's raw schema JSON. Used by retention (to
    /// discover a logical's physicals by name prefix) and by cascade's
    /// reverse-reference graph builder (to inspect every field spec for
    /// join references).
    fn list_collections(&self) -> Result<Vec<Json>, Error>;

    /// `Ok(None)` on 404 (local recovery policy).
    fn get_collection(&self, name: &str) -> Result<Option<Json>, Error>;

    /// 404 is treated as already-deleted success (idempotent delete).
    fn delete_collection(&self, name: &str) -> Result<(), Error>;

    /// `Ok(None)` on 404 — alias does not exist.
    fn get_alias(&self, name: &str) -> Result<Option<String>, Error>;

    fn put_alias(&self, name: &str, collection_name: &str) -> Result<(), Error>;

    fn upsert_synonym(&self, collection: &str, id: &str, payload: &Json) -> Result<(), Error>;
    fn delete_synonym(&self, collection: &str, id: &str) -> Result<(), Error>;
    fn upsert_stopwords(&self, collection: &str, id: &str, payload: &Json) -> Result<(), Error>;
    fn delete_stopwords(&self, collection: &str, id: &str) -> Result<(), Error>;

    fn health(&self) -> Result<bool, Error>;
}

pub struct HttpTransport {
    base: String,
    api_key: String,
    client: reqwest::blocking::Client,
    import_client: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new(config: &Config) -> Result<Self, Error> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_millis(config.read_timeout_ms))
            .build()
            .map_err(|e| Error::Connection(e.to_string()))?;
        // Import can run long; a derived client with an elevated read
        // timeout keeps the default client's timeout tight for search.
        let import_client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_millis(config.import_read_timeout_ms))
            .build()
            .map_err(|e| Error::Connection(e.to_string()))?;
        Ok(Self {
            base: config.base_url(),
            api_key: config.api_key.reveal().to_string(),
            client,
            import_client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn send(&self, req: reqwest::blocking::RequestBuilder) -> Result<reqwest::blocking::Response, Error> {
        let req = req.header("x-typesense-api-key", &self.api_key);
        req.send().map_err(map_reqwest_err)
    }

    fn body_json(resp: reqwest::blocking::Response) -> Result<Json, Error> {
        let status = resp.status();
        let text = resp.text().unwrap_or_default();
        if !status.is_success() {
            return Err(Error::Api { status: status.as_u16(), body: text });
        }
        serde_json::from_str(&text).map_err(|e| Error::InvalidParams(format!("invalid JSON from backend: {e}")))
    }
}

fn map_reqwest_err(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout
    } else {
        Error::Connection(e.to_string())
    }
}

impl Transport for HttpTransport {
    fn search(&self, collection: &str, params: &HashMap<String, Json>) -> Result<Json, Error> {
        let url = self.url(&format!("/collections/{}/documents/search", collection));
        let resp = self.send(self.client.post(url).json(params))?;
        Self::body_json(resp)
    }

    fn multi_search(&self, searches: &[Json], common: &HashMap<String, Json>) -> Result<Json, Error> {
        let mut query: Vec<(String, String)> = Vec::new();
        for (k, v) in common {
            if let Some(s) = v.as_str() {
                query.push((k.clone(), s.to_string()));
            } else {
                query.push((k.clone(), v.to_string()));
            }
        }
        let url = self.url("/multi_search");
        let body = serde_json::json!({ "searches": searches });
        let resp = self.send(self.client.post(url).query(&query).json(&body))?;
        Self::body_json(resp)
    }

    fn import(&self, collection: &str, action: &str, ndjson: &str) -> Result<Vec<ImportLineResult>, Error> {
        let url = self.url(&format!(
            "/collections/{}/documents/import?action={}",
            collection, action
        ));
        let req = self
            .import_client
            .post(url)
            .header("content-type", "text/plain")
            .header("x-typesense-api-key", &self.api_key)
            .body(ndjson.to_string());
        let resp = req.send().map_err(map_reqwest_err)?;
        let status = resp.status();
        let text = resp.text().unwrap_or_default();
        if status.as_u16() == 413 {
            return Err(Error::Api { status: 413, body: text });
        }
        if !status.is_success() {
            return Err(Error::Api { status: status.as_u16(), body: text });
        }
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| {
                serde_json::from_str::<ImportLineResult>(l)
                    .map_err(|e| Error::InvalidParams(format!("invalid import result line: {e}")))
            })
            .collect()
    }

    fn delete_by_filter(
        &self,
        collection: &str,
        filter_by: &str,
        timeout: Option<Duration>,
    ) -> Result<DeleteByFilterResult, Error> {
        let url = self.url(&format!("/collections/{}/documents", collection));
        let mut req = self.client.delete(url).query(&[("filter_by", filter_by)]);
        if let Some(t) = timeout {
            req = req.timeout(t);
        }
        let resp = self.send(req)?;
        let json = Self::body_json(resp)?;
        let num_deleted = json.get("num_deleted").and_then(|v| v.as_u64()).unwrap_or(0);
        Ok(DeleteByFilterResult { num_deleted })
    }

    fn create_collection(&self, schema: &Json) -> Result<(), Error> {
        let url = self.url("/collections");
        let resp = self.send(self.client.post(url).json(schema))?;
        Self::body_json(resp).map(|_| ())
    }

    fn list_collections(&self) -> Result<Vec<Json>, Error> {
        let url = self.url("/collections");
        let resp = self.send(self.client.get(url))?;
        let json = Self::body_json(resp)?;
        Ok(json.as_array().cloned().unwrap_or_default())
    }

    fn get_collection(&self, name: &str) -> Result<Option<Json>, Error> {
        let url = self.url(&format!("/collections/{}", name));
        let resp = self.send(self.client.get(url))?;
        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        Self::body_json(resp).map(Some)
    }

    fn delete_collection(&self, name: &str) -> Result<(), Error> {
        let url = self.url(&format!("/collections/{}", name));
        let resp = self.send(self.client.delete(url))?;
        if resp.status().as_u16() == 404 {
            return Ok(());
        }
        Self::body_json(resp).map(|_| ())
    }

    fn get_alias(&self, name: &str) -> Result<Option<String>, Error> {
        let url = self.url(&format!("/aliases/{}", name));
        let resp = self.send(self.client.get(url))?;
        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        let json = Self::body_json(resp)?;
        Ok(json.get("collection_name").and_then(|v| v.as_str()).map(String::from))
    }

    fn put_alias(&self, name: &str, collection_name: &str) -> Result<(), Error> {
        let url = self.url(&format!("/aliases/{}", name));
        let body = serde_json::json!({ "collection_name": collection_name });
        let resp = self.send(self.client.put(url).json(&body))?;
        Self::body_json(resp).map(|_| ())
    }

    fn upsert_synonym(&self, collection: &str, id: &str, payload: &Json) -> Result<(), Error> {
        let url = self.url(&format!("/collections/{}/synonyms/{}", collection, id));
        let resp = self.send(self.client.put(url).json(payload))?;
        Self::body_json(resp).map(|_| ())
    }

    fn delete_synonym(&self, collection: &str, id: &str) -> Result<(), Error> {
        let url = self.url(&format!("/collections/{}/synonyms/{}", collection, id));
        let resp = self.send(self.client.delete(url))?;
        if resp.status().as_u16() == 404 {
            return Ok(());
        }
        Self::body_json(resp).map(|_| ())
    }

    fn upsert_stopwords(&self, collection: &str, id: &str, payload: &Json) -> Result<(), Error> {
        let url = self.url(&format!("/collections/{}/stopwords/{}", collection, id));
        let resp = self.send(self.client.put(url).json(payload))?;
        Self::body_json(resp).map(|_| ())
    }

    fn delete_stopwords(&self, collection: &str, id: &str) -> Result<(), Error> {
        let url = self.url(&format!("/collections/{}/stopwords/{}", collection, id));
        let resp = self.send(self.client.delete(url))?;
        if resp.status().as_u16() == 404 {
            return Ok(());
        }
        Self::body_json(resp).map(|_| ())
    }

    fn health(&self) -> Result<bool, Error> {
        let url = self.url("/health");
        let resp = self.send(self.client.get(url))?;
        Ok(resp.status().is_success())
    }
}

pub type SharedTransport = Arc<dyn Transport>;

/// In-memory `Transport`, also reused by `tests/` integration tests via the
/// `test-support` feature (see `Cargo.toml`) since `#[cfg(test)]` items are
/// not visible outside this crate's own unit test binary.
#[cfg(any(test, feature = "test-support"))]
pub mod mock {
    use super::*;
    use parking_lot::Mutex;

    /// In-memory `Transport` used by Schema/Indexer/Cascade unit tests.
    /// Not thread-pool-safe beyond what `Mutex` provides, which is fine —
    /// tests don't need more.
    #[derive(Default)]
    pub struct MockTransport {
        pub collections: Mutex<HashMap<String, Json>>,
        pub aliases: Mutex<HashMap<String, String>>,
        pub documents: Mutex<HashMap<String, Vec<Json>>>,
        pub fail_import_413_once: Mutex<HashMap<String, bool>>,
        pub healthy: Mutex<bool>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self { healthy: Mutex::new(true), ..Default::default() }
        }
    }

    impl Transport for MockTransport {
        fn search(&self, _collection: &str, _params: &HashMap<String, Json>) -> Result<Json, Error> {
            Ok(serde_json::json!({ "found": 0, "hits": [] }))
        }

        fn multi_search(&self, searches: &[Json], _common: &HashMap<String, Json>) -> Result<Json, Error> {
            let results: Vec<Json> = searches.iter().map(|_| serde_json::json!({ "found": 0, "hits": [] })).collect();
            Ok(serde_json::json!({ "results": results }))
        }

        fn import(&self, collection: &str, _action: &str, ndjson: &str) -> Result<Vec<ImportLineResult>, Error> {
            let lines: Vec<&str> = ndjson.lines().filter(|l| !l.trim().is_empty()).collect();
            let mut guard = self.fail_import_413_once.lock();
            if let Some(should_fail) = guard.get_mut(collection) {
                if *should_fail && lines.len() > 1 {
                    *should_fail = false;
                    return Err(Error::Api { status: 413, body: "payload too large".into() });
                }
            }
            drop(guard);
            let mut docs = self.documents.lock();
            let entry = docs.entry(collection.to_string()).or_default();
            let mut results = Vec::with_capacity(lines.len());
            for line in &lines {
                let v: Json = serde_json::from_str(line)
                    .map_err(|e| Error::InvalidParams(format!("bad ndjson line: {e}")))?;
                entry.push(v);
                results.push(ImportLineResult { success: true, error: None, document: None });
            }
            Ok(results)
        }

        fn delete_by_filter(
            &self,
            collection: &str,
            _filter_by: &str,
            _timeout: Option<Duration>,
        ) -> Result<DeleteByFilterResult, Error> {
            let mut docs = self.documents.lock();
            let n = docs.get(collection).map(|v| v.len() as u64).unwrap_or(0);
            docs.remove(collection);
            Ok(DeleteByFilterResult { num_deleted: n })
        }

        fn create_collection(&self, schema: &Json) -> Result<(), Error> {
            let name = schema
                .get("name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::InvalidParams("schema missing name".into()))?;
            self.collections.lock().insert(name.to_string(), schema.clone());
            Ok(())
        }

        fn list_collections(&self) -> Result<Vec<Json>, Error> {
            Ok(self.collections.lock().values().cloned().collect())
        }

        fn get_collection(&self, name: &str) -> Result<Option<Json>, Error> {
            Ok(self.collections.lock().get(name).cloned())
        }

        fn delete_collection(&self, name: &str) -> Result<(), Error> {
            self.collections.lock().remove(name);
            self.documents.lock().remove(name);
            Ok(())
        }

        fn get_alias(&self, name: &str) -> Result<Option<String>, Error> {
            Ok(self.aliases.lock().get(name).cloned())
        }

        fn put_alias(&self, name: &str, collection_name: &str) -> Result<(), Error> {
            self.aliases.lock().insert(name.to_string(), collection_name.to_string());
            Ok(())
        }

        fn upsert_synonym(&self, _collection: &str, _id: &str, _payload: &Json) -> Result<(), Error> {
            Ok(())
        }
        fn delete_synonym(&self, _collection: &str, _id: &str) -> Result<(), Error> {
            Ok(())
        }
        fn upsert_stopwords(&self, _collection: &str, _id: &str, _payload: &Json) -> Result<(), Error> {
            Ok(())
        }
        fn delete_stopwords(&self, _collection: &str, _id: &str) -> Result<(), Error> {
            Ok(())
        }

        fn health(&self) -> Result<bool, Error> {
            Ok(*self.healthy.lock())
        }
    }
}
