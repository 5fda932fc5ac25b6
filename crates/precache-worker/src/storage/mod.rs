//! Cache storage: named buckets of request URL -> stored response.
//!
//! ## Architecture
//!
//! ```text
//! CacheStorage (caches)
//!     └── bucket "sw-precache-v2--https://host/"
//!             └── cache key → CacheEntry
//! ```
//!
//! Two backends are provided: [`MemoryCacheStorage`] for tests and hosts that
//! manage persistence themselves, and [`SqliteCacheStorage`] which keeps
//! buckets on disk across worker restarts.

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use precache_net::Response;
use serde::{Deserialize, Serialize};

use crate::error::PrecacheResult;

mod memory;
mod sqlite;

pub use memory::MemoryCacheStorage;
pub use sqlite::SqliteCacheStorage;

/// A cached request/response pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL (the cache key).
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response headers.
    pub headers: HashMap<String, String>,

    /// Response body.
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: i64,
}

impl CacheEntry {
    /// Capture a network response under `key`.
    ///
    /// Headers whose value is not visible ASCII are dropped.
    pub fn from_response(key: &str, response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Self {
            url: key.to_string(),
            method: "GET".to_string(),
            status: response.status.as_u16(),
            headers,
            body: response.body.to_vec(),
            cached_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Rebuild an `http` header map.
    pub fn header_map(&self) -> HeaderMap {
        self.headers
            .iter()
            .filter_map(|(name, value)| {
                let name = HeaderName::try_from(name.as_str()).ok()?;
                let value = HeaderValue::try_from(value.as_str()).ok()?;
                Some((name, value))
            })
            .collect()
    }

    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK)
    }

    pub fn body_bytes(&self) -> Bytes {
        Bytes::from(self.body.clone())
    }
}

/// The `caches` global: a set of named buckets.
///
/// Implementations must make [`CacheStorage::put_all`] all-or-nothing.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Create the bucket if it does not exist.
    async fn open(&self, cache: &str) -> PrecacheResult<()>;

    async fn has(&self, cache: &str) -> PrecacheResult<bool>;

    /// Delete a whole bucket.
    async fn delete(&self, cache: &str) -> PrecacheResult<bool>;

    /// All bucket names.
    async fn cache_names(&self) -> PrecacheResult<Vec<String>>;

    /// Every key physically present in a bucket.
    async fn keys(&self, cache: &str) -> PrecacheResult<Vec<String>>;

    async fn match_request(&self, cache: &str, url: &str) -> PrecacheResult<Option<CacheEntry>>;

    /// Store a batch of entries atomically, replacing existing keys.
    async fn put_all(&self, cache: &str, entries: Vec<CacheEntry>) -> PrecacheResult<()>;

    async fn delete_entry(&self, cache: &str, url: &str) -> PrecacheResult<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use precache_net::{RequestId, Url};

    #[test]
    fn test_entry_from_response() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/html"));
        let response = Response {
            request_id: RequestId::new(),
            url: Url::parse("https://home.example/?_sw-precache=abc").unwrap(),
            status: StatusCode::OK,
            headers,
            body: Bytes::from_static(b"<html>"),
        };

        let entry = CacheEntry::from_response("https://home.example/?_sw-precache=abc", &response);
        assert_eq!(entry.status, 200);
        assert_eq!(entry.headers.get("content-type").map(String::as_str), Some("text/html"));
        assert_eq!(entry.header_map().get("content-type").unwrap(), "text/html");
        assert_eq!(entry.body_bytes(), Bytes::from_static(b"<html>"));
    }
}
