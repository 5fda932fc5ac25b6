//! Cache store manager: populates, prunes and reads the precache bucket.

use std::sync::Arc;

use futures::future::try_join_all;
use hashbrown::HashSet;
use precache_net::{CredentialsMode, Fetcher, Request};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{PrecacheError, PrecacheResult};
use crate::keys::CacheKeyTable;
use crate::storage::{CacheEntry, CacheStorage};

/// Store lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum StoreState {
    #[default]
    Uninitialized,
    /// Fetching missing entries.
    Populating,
    /// Bucket holds every key of the table.
    Ready,
    /// Deleting keys the table no longer names.
    Pruning,
    /// The last install could not fetch every entry.
    Failed,
}

/// Result of a successful install.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    /// Keys fetched from the network, in manifest order.
    pub fetched: Vec<String>,
    /// Keys that were already resident.
    pub reused: usize,
}

/// Result of a successful activate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivateReport {
    /// Keys evicted because the current table does not name them.
    pub removed: Vec<String>,
    pub retained: usize,
}

/// Owns one bucket and keeps it in line with a [`CacheKeyTable`].
pub struct CacheStoreManager {
    cache_name: String,
    table: Arc<CacheKeyTable>,
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    state: RwLock<StoreState>,
}

impl CacheStoreManager {
    pub fn new(
        cache_name: impl Into<String>,
        table: Arc<CacheKeyTable>,
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        Self {
            cache_name: cache_name.into(),
            table,
            storage,
            fetcher,
            state: RwLock::new(StoreState::Uninitialized),
        }
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    pub async fn state(&self) -> StoreState {
        *self.state.read().await
    }

    async fn set_state(&self, state: StoreState) {
        *self.state.write().await = state;
    }

    /// Fetch every key the bucket is missing and commit them in one batch.
    ///
    /// Nothing is written unless every fetch succeeds.
    pub async fn install(&self) -> PrecacheResult<InstallReport> {
        self.set_state(StoreState::Populating).await;

        match self.populate().await {
            Ok(report) => {
                self.set_state(StoreState::Ready).await;
                info!(
                    cache = %self.cache_name,
                    fetched = report.fetched.len(),
                    reused = report.reused,
                    "Precache populated"
                );
                Ok(report)
            }
            Err(e) => {
                self.set_state(StoreState::Failed).await;
                warn!(cache = %self.cache_name, error = %e, "Precache install failed");
                Err(e)
            }
        }
    }

    async fn populate(&self) -> PrecacheResult<InstallReport> {
        self.storage.open(&self.cache_name).await?;

        let resident: HashSet<String> = self
            .storage
            .keys(&self.cache_name)
            .await?
            .into_iter()
            .collect();

        let missing: Vec<&str> = self
            .table
            .iter()
            .map(|(_, key)| key)
            .filter(|key| !resident.contains(*key))
            .collect();
        let reused = self.table.len() - missing.len();

        debug!(cache = %self.cache_name, missing = missing.len(), reused, "Computed precache delta");

        let entries = try_join_all(missing.iter().map(|key| self.fetch_entry(key))).await?;
        let fetched = entries.iter().map(|e| e.url.clone()).collect();

        if !entries.is_empty() {
            self.storage.put_all(&self.cache_name, entries).await?;
        }

        Ok(InstallReport { fetched, reused })
    }

    async fn fetch_entry(&self, key: &str) -> PrecacheResult<CacheEntry> {
        let failure = |reason: String| PrecacheError::ManifestFetchFailure {
            url: key.to_string(),
            reason,
        };

        let url = Url::parse(key).map_err(|e| failure(e.to_string()))?;
        let request = Request::get(url).credentials(CredentialsMode::SameOrigin);
        let response = self
            .fetcher
            .fetch(request)
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| failure(e.to_string()))?;

        debug!(key, status = %response.status, "Fetched precache entry");
        Ok(CacheEntry::from_response(key, &response))
    }

    /// Delete every bucket key the table does not name.
    pub async fn activate(&self) -> PrecacheResult<ActivateReport> {
        self.set_state(StoreState::Pruning).await;

        let result = self.prune().await;
        // a failed prune leaves extra keys behind, never missing ones
        self.set_state(StoreState::Ready).await;

        let report = result?;
        info!(
            cache = %self.cache_name,
            removed = report.removed.len(),
            retained = report.retained,
            "Precache pruned"
        );
        Ok(report)
    }

    async fn prune(&self) -> PrecacheResult<ActivateReport> {
        self.storage.open(&self.cache_name).await?;

        let desired = self.table.cache_keys();
        let present = self.storage.keys(&self.cache_name).await?;

        let mut report = ActivateReport::default();
        for key in present {
            if desired.contains(key.as_str()) {
                report.retained += 1;
            } else {
                self.storage.delete_entry(&self.cache_name, &key).await?;
                debug!(cache = %self.cache_name, key = %key, "Evicted stale entry");
                report.removed.push(key);
            }
        }
        Ok(report)
    }

    /// Direct bucket read; never touches the network.
    pub async fn get(&self, key: &str) -> PrecacheResult<Option<CacheEntry>> {
        self.storage.match_request(&self.cache_name, key).await
    }

    /// Every key currently in the bucket.
    pub async fn resident_keys(&self) -> PrecacheResult<Vec<String>> {
        self.storage.keys(&self.cache_name).await
    }
}
