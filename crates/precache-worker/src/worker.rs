//! The precache worker: lifecycle state machine and event entry points.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use precache_net::{Fetcher, LoaderConfig, ResourceLoader};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::clients::Clients;
use crate::config::PrecacheConfig;
use crate::error::{PrecacheError, PrecacheResult};
use crate::keys::CacheKeyTable;
use crate::manifest::Manifest;
use crate::notify::{ClickOutcome, NotificationCenter, NotificationId, NotificationRelay};
use crate::router::{FetchEvent, FetchOutcome, RequestRouter, RouteRules};
use crate::storage::{CacheStorage, MemoryCacheStorage};
use crate::store::{ActivateReport, CacheStoreManager, InstallReport};

/// Unique identifier for a worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct WorkerId(u64);

impl WorkerId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Constructed, nothing run yet.
    #[default]
    Parsed,
    /// Install event running.
    Installing,
    /// Installed; skip-waiting has been requested.
    Installed,
    /// Activate event running.
    Activating,
    /// Active and controlling clients.
    Activated,
    /// Install failed or replaced by a newer worker.
    Redundant,
}

/// Worker events.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// State changed.
    StateChange {
        worker_id: WorkerId,
        new_state: ServiceWorkerState,
    },
    /// Install finished and the worker asked to skip the waiting phase.
    SkipWaiting { worker_id: WorkerId },
    /// Activation took control of the clients in scope.
    ClientsClaimed { worker_id: WorkerId, count: usize },
    /// Install could not populate the bucket.
    InstallFailed { worker_id: WorkerId, reason: String },
}

/// Work a lifecycle event keeps alive until it resolves.
#[must_use = "lifecycle work should be awaited"]
#[derive(Debug)]
pub struct PendingWork<T> {
    handle: JoinHandle<PrecacheResult<T>>,
}

impl<T: Send + 'static> PendingWork<T> {
    fn spawn<F>(work: F) -> Self
    where
        F: std::future::Future<Output = PrecacheResult<T>> + Send + 'static,
    {
        Self {
            handle: tokio::spawn(work),
        }
    }

    /// Wait for the event to resolve.
    pub async fn wait(self) -> PrecacheResult<T> {
        self.handle
            .await
            .map_err(|e| PrecacheError::state(format!("lifecycle task failed: {}", e)))?
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Shared state machine, cloned into spawned lifecycle work.
#[derive(Clone)]
struct Lifecycle {
    worker_id: WorkerId,
    state: Arc<RwLock<ServiceWorkerState>>,
    events: Option<mpsc::UnboundedSender<WorkerEvent>>,
}

impl Lifecycle {
    async fn get(&self) -> ServiceWorkerState {
        *self.state.read().await
    }

    /// Move from `from` to `to`, failing if the worker is elsewhere.
    async fn advance(&self, from: ServiceWorkerState, to: ServiceWorkerState) -> PrecacheResult<()> {
        let mut state = self.state.write().await;
        if *state != from {
            return Err(PrecacheError::state(format!(
                "worker {:?} is {:?}, expected {:?}",
                self.worker_id, *state, from
            )));
        }
        *state = to;
        drop(state);
        self.announce(to);
        Ok(())
    }

    async fn set(&self, to: ServiceWorkerState) {
        *self.state.write().await = to;
        self.announce(to);
    }

    fn announce(&self, new_state: ServiceWorkerState) {
        info!(worker = ?self.worker_id, state = ?new_state, "Worker state changed");
        self.emit(WorkerEvent::StateChange {
            worker_id: self.worker_id,
            new_state,
        });
    }

    fn emit(&self, event: WorkerEvent) {
        if let Some(ref tx) = self.events {
            let _ = tx.send(event);
        }
    }
}

/// A precache service worker bound to one manifest version.
pub struct PrecacheWorker {
    id: WorkerId,
    location: Url,
    scope: Url,
    config: PrecacheConfig,
    table: Arc<CacheKeyTable>,
    store: Arc<CacheStoreManager>,
    router: RequestRouter,
    relay: NotificationRelay,
    clients: Arc<RwLock<Clients>>,
    notifications: Arc<RwLock<NotificationCenter>>,
    lifecycle: Lifecycle,
}

impl PrecacheWorker {
    /// Start building a worker served from `location` for `manifest`.
    pub fn builder(location: Url, manifest: Manifest) -> PrecacheWorkerBuilder {
        PrecacheWorkerBuilder::new(location, manifest)
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn location(&self) -> &Url {
        &self.location
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    pub fn config(&self) -> &PrecacheConfig {
        &self.config
    }

    pub fn cache_name(&self) -> &str {
        self.store.cache_name()
    }

    pub fn table(&self) -> &Arc<CacheKeyTable> {
        &self.table
    }

    pub fn store(&self) -> &Arc<CacheStoreManager> {
        &self.store
    }

    pub fn clients(&self) -> &Arc<RwLock<Clients>> {
        &self.clients
    }

    pub fn notifications(&self) -> &Arc<RwLock<NotificationCenter>> {
        &self.notifications
    }

    pub async fn state(&self) -> ServiceWorkerState {
        self.lifecycle.get().await
    }

    /// Install event: populate the bucket, then skip waiting.
    ///
    /// A failed install leaves the worker redundant.
    pub fn install(&self) -> PendingWork<InstallReport> {
        let lifecycle = self.lifecycle.clone();
        let store = self.store.clone();

        PendingWork::spawn(async move {
            lifecycle
                .advance(ServiceWorkerState::Parsed, ServiceWorkerState::Installing)
                .await?;

            match store.install().await {
                Ok(report) => {
                    lifecycle.set(ServiceWorkerState::Installed).await;
                    debug!(worker = ?lifecycle.worker_id, "Skipping waiting phase");
                    lifecycle.emit(WorkerEvent::SkipWaiting {
                        worker_id: lifecycle.worker_id,
                    });
                    Ok(report)
                }
                Err(e) => {
                    lifecycle.set(ServiceWorkerState::Redundant).await;
                    lifecycle.emit(WorkerEvent::InstallFailed {
                        worker_id: lifecycle.worker_id,
                        reason: e.to_string(),
                    });
                    Err(e)
                }
            }
        })
    }

    /// Activate event: prune the bucket, then claim every client in scope.
    ///
    /// A failed prune still activates the worker; the bucket then holds extra
    /// keys, never missing ones.
    pub fn activate(&self) -> PendingWork<ActivateReport> {
        let lifecycle = self.lifecycle.clone();
        let store = self.store.clone();
        let clients = self.clients.clone();

        PendingWork::spawn(async move {
            lifecycle
                .advance(ServiceWorkerState::Installed, ServiceWorkerState::Activating)
                .await?;

            let pruned = store.activate().await;
            lifecycle.set(ServiceWorkerState::Activated).await;

            let count = clients.write().await.claim(lifecycle.worker_id);
            debug!(worker = ?lifecycle.worker_id, count, "Claimed clients");
            lifecycle.emit(WorkerEvent::ClientsClaimed {
                worker_id: lifecycle.worker_id,
                count,
            });

            if let Err(ref e) = pruned {
                warn!(worker = ?lifecycle.worker_id, error = %e, "Activated without pruning");
            }
            pruned
        })
    }

    /// Mark the worker replaced.
    pub async fn make_redundant(&self) {
        self.lifecycle.set(ServiceWorkerState::Redundant).await;
    }

    /// Fetch event. Only an activated worker intercepts.
    pub async fn handle_fetch(&self, event: &FetchEvent) -> FetchOutcome {
        let state = self.lifecycle.get().await;
        if state != ServiceWorkerState::Activated {
            trace!(worker = ?self.id, ?state, url = %event.url, "Worker not active, passing through");
            return FetchOutcome::PassThrough;
        }
        self.router.handle_fetch(event).await
    }

    /// Push event.
    pub async fn handle_push(&self, data: Option<&[u8]>) -> PrecacheResult<Option<NotificationId>> {
        self.relay.handle_push(data).await
    }

    /// Notification click event.
    pub async fn handle_notification_click(
        &self,
        id: NotificationId,
        action: Option<&str>,
    ) -> PrecacheResult<ClickOutcome> {
        self.relay.handle_click(id, action).await
    }

    /// Notification close event.
    pub async fn handle_notification_close(&self, id: NotificationId) -> PrecacheResult<()> {
        self.relay.handle_close(id).await
    }
}

impl std::fmt::Debug for PrecacheWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrecacheWorker")
            .field("id", &self.id)
            .field("location", &self.location.as_str())
            .field("scope", &self.scope.as_str())
            .field("cache_name", &self.cache_name())
            .field("entries", &self.table.len())
            .finish()
    }
}

/// Builder for [`PrecacheWorker`].
pub struct PrecacheWorkerBuilder {
    location: Url,
    manifest: Manifest,
    scope: Option<Url>,
    config: PrecacheConfig,
    storage: Option<Arc<dyn CacheStorage>>,
    fetcher: Option<Arc<dyn Fetcher>>,
    clients: Option<Arc<RwLock<Clients>>>,
    notifications: Option<Arc<RwLock<NotificationCenter>>>,
    events: Option<mpsc::UnboundedSender<WorkerEvent>>,
}

impl PrecacheWorkerBuilder {
    pub fn new(location: Url, manifest: Manifest) -> Self {
        Self {
            location,
            manifest,
            scope: None,
            config: PrecacheConfig::default(),
            storage: None,
            fetcher: None,
            clients: None,
            notifications: None,
            events: None,
        }
    }

    /// Registration scope. Defaults to the directory of the worker location.
    pub fn scope(mut self, scope: Url) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn config(mut self, config: PrecacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Bucket store. Defaults to an in-memory store.
    pub fn storage(mut self, storage: Arc<dyn CacheStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Network access. Defaults to a [`ResourceLoader`].
    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn clients(mut self, clients: Arc<RwLock<Clients>>) -> Self {
        self.clients = Some(clients);
        self
    }

    pub fn notifications(mut self, notifications: Arc<RwLock<NotificationCenter>>) -> Self {
        self.notifications = Some(notifications);
        self
    }

    /// Channel that receives [`WorkerEvent`]s.
    pub fn events(mut self, events: mpsc::UnboundedSender<WorkerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> PrecacheResult<PrecacheWorker> {
        self.config.validate()?;

        let scope = match self.scope {
            Some(scope) => scope,
            None => self.location.join("./")?,
        };
        let fetcher: Arc<dyn Fetcher> = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(ResourceLoader::new(LoaderConfig::default())?),
        };
        let storage: Arc<dyn CacheStorage> = match self.storage {
            Some(storage) => storage,
            None => Arc::new(MemoryCacheStorage::new()),
        };
        let clients = self.clients.unwrap_or_default();
        let notifications = self.notifications.unwrap_or_default();

        let id = WorkerId::new();
        let config = self.config;

        let table = Arc::new(CacheKeyTable::build(
            &self.manifest,
            &self.location,
            &config.hash_param_name,
            config.pre_versioned_pattern.as_ref(),
        )?);
        let cache_name = config.cache_name(&scope);
        let store = Arc::new(CacheStoreManager::new(
            cache_name,
            table.clone(),
            storage,
            fetcher.clone(),
        ));

        let rules = RouteRules::from_config(&config, &self.location)?;
        let router = RequestRouter::new(
            self.location.clone(),
            rules,
            table.clone(),
            store.clone(),
            fetcher.clone(),
        );

        let endpoint = self.location.join(&config.callback_endpoint)?;
        let relay = NotificationRelay::new(
            id,
            self.location.clone(),
            endpoint,
            config.callback_retry.clone(),
            fetcher,
            notifications.clone(),
            clients.clone(),
        );

        info!(
            worker = ?id,
            location = %self.location,
            scope = %scope,
            cache = %store.cache_name(),
            entries = table.len(),
            "Created precache worker"
        );

        Ok(PrecacheWorker {
            id,
            location: self.location,
            scope,
            config,
            table,
            store,
            router,
            relay,
            clients,
            notifications,
            lifecycle: Lifecycle {
                worker_id: id,
                state: Arc::new(RwLock::new(ServiceWorkerState::Parsed)),
                events: self.events,
            },
        })
    }
}
