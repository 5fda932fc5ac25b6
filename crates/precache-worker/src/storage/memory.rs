//! In-memory cache storage.

use async_trait::async_trait;
use hashbrown::HashMap;
use tokio::sync::RwLock;

use super::{CacheEntry, CacheStorage};
use crate::error::PrecacheResult;

/// A single bucket.
#[derive(Debug, Default)]
struct Cache {
    entries: HashMap<String, CacheEntry>,
}

/// Buckets held in process memory; gone when the process exits.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    caches: RwLock<HashMap<String, Cache>>,
}

impl MemoryCacheStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, cache: &str) -> PrecacheResult<()> {
        self.caches
            .write()
            .await
            .entry(cache.to_string())
            .or_default();
        Ok(())
    }

    async fn has(&self, cache: &str) -> PrecacheResult<bool> {
        Ok(self.caches.read().await.contains_key(cache))
    }

    async fn delete(&self, cache: &str) -> PrecacheResult<bool> {
        Ok(self.caches.write().await.remove(cache).is_some())
    }

    async fn cache_names(&self) -> PrecacheResult<Vec<String>> {
        Ok(self.caches.read().await.keys().cloned().collect())
    }

    async fn keys(&self, cache: &str) -> PrecacheResult<Vec<String>> {
        Ok(self
            .caches
            .read()
            .await
            .get(cache)
            .map(|c| c.entries.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn match_request(&self, cache: &str, url: &str) -> PrecacheResult<Option<CacheEntry>> {
        Ok(self
            .caches
            .read()
            .await
            .get(cache)
            .and_then(|c| c.entries.get(url).cloned()))
    }

    async fn put_all(&self, cache: &str, entries: Vec<CacheEntry>) -> PrecacheResult<()> {
        let mut caches = self.caches.write().await;
        let bucket = caches.entry(cache.to_string()).or_default();
        for entry in entries {
            bucket.entries.insert(entry.url.clone(), entry);
        }
        Ok(())
    }

    async fn delete_entry(&self, cache: &str, url: &str) -> PrecacheResult<bool> {
        Ok(self
            .caches
            .write()
            .await
            .get_mut(cache)
            .map(|c| c.entries.remove(url).is_some())
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(url: &str) -> CacheEntry {
        CacheEntry {
            url: url.to_string(),
            method: "GET".to_string(),
            status: 200,
            headers: HashMap::new(),
            body: b"body".to_vec(),
            cached_at: 0,
        }
    }

    #[tokio::test]
    async fn test_open_and_delete_bucket() {
        let storage = MemoryCacheStorage::new();
        assert!(!storage.has("v1").await.unwrap());

        storage.open("v1").await.unwrap();
        assert!(storage.has("v1").await.unwrap());
        assert_eq!(storage.cache_names().await.unwrap(), vec!["v1".to_string()]);

        assert!(storage.delete("v1").await.unwrap());
        assert!(!storage.has("v1").await.unwrap());
    }

    #[tokio::test]
    async fn test_put_match_delete() {
        let storage = MemoryCacheStorage::new();
        storage
            .put_all("v1", vec![entry("https://a/x.css"), entry("https://a/y.js")])
            .await
            .unwrap();

        assert!(storage.match_request("v1", "https://a/x.css").await.unwrap().is_some());
        assert!(storage.match_request("v1", "https://a/z.css").await.unwrap().is_none());
        assert!(storage.match_request("v2", "https://a/x.css").await.unwrap().is_none());

        assert!(storage.delete_entry("v1", "https://a/x.css").await.unwrap());
        assert!(!storage.delete_entry("v1", "https://a/x.css").await.unwrap());
        assert_eq!(storage.keys("v1").await.unwrap(), vec!["https://a/y.js".to_string()]);
    }

    #[tokio::test]
    async fn test_keys_of_missing_bucket_is_empty() {
        let storage = MemoryCacheStorage::new();
        assert!(storage.keys("nope").await.unwrap().is_empty());
    }
}
