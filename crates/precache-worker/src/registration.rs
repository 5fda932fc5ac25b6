//! Registration: the installing, waiting and active worker slots of one scope.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::clients::Clients;
use crate::error::{PrecacheError, PrecacheResult};
use crate::manifest::Manifest;
use crate::router::{FetchEvent, FetchOutcome};
use crate::store::{ActivateReport, InstallReport};
use crate::worker::{PrecacheWorker, PrecacheWorkerBuilder};

/// What a successful update did to the bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateReport {
    pub install: InstallReport,
    pub activate: ActivateReport,
}

#[derive(Debug, Default)]
struct Slots {
    installing: Option<Arc<PrecacheWorker>>,
    waiting: Option<Arc<PrecacheWorker>>,
    active: Option<Arc<PrecacheWorker>>,
    last_update_check: Option<Instant>,
}

/// A scope and the workers registered for it.
///
/// The slot lock is only held to read or swap a slot, never across an
/// install, so the active worker keeps answering fetches while its
/// successor installs.
#[derive(Debug)]
pub struct PrecacheRegistration {
    scope: Url,
    clients: Arc<RwLock<Clients>>,
    slots: RwLock<Slots>,
    updating: Mutex<()>,
}

impl PrecacheRegistration {
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            clients: Arc::default(),
            slots: RwLock::default(),
            updating: Mutex::new(()),
        }
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    /// Pages in scope, shared by every worker of this registration.
    pub fn clients(&self) -> &Arc<RwLock<Clients>> {
        &self.clients
    }

    /// Builder for a worker that belongs to this registration.
    pub fn worker_builder(&self, location: Url, manifest: Manifest) -> PrecacheWorkerBuilder {
        PrecacheWorker::builder(location, manifest)
            .scope(self.scope.clone())
            .clients(self.clients.clone())
    }

    pub async fn installing(&self) -> Option<Arc<PrecacheWorker>> {
        self.slots.read().await.installing.clone()
    }

    pub async fn waiting(&self) -> Option<Arc<PrecacheWorker>> {
        self.slots.read().await.waiting.clone()
    }

    /// Get the active worker.
    pub async fn get_active(&self) -> Option<Arc<PrecacheWorker>> {
        self.slots.read().await.active.clone()
    }

    /// Check if update is needed.
    pub async fn needs_update(&self, check_interval: Duration) -> bool {
        match self.slots.read().await.last_update_check {
            Some(last) => last.elapsed() > check_interval,
            None => true,
        }
    }

    /// Install `worker` and, since it skips waiting, activate it right away.
    ///
    /// The previous active worker keeps serving until the new one is installed.
    /// If install fails the new worker is dropped and nothing changes. Updates
    /// run one at a time.
    pub async fn update(&self, worker: PrecacheWorker) -> PrecacheResult<UpdateReport> {
        if worker.scope() != &self.scope {
            return Err(PrecacheError::state(format!(
                "worker scope {} does not match registration scope {}",
                worker.scope(),
                self.scope
            )));
        }
        if !Arc::ptr_eq(worker.clients(), &self.clients) {
            return Err(PrecacheError::state(format!(
                "worker {:?} was not built for registration {}",
                worker.id(),
                self.scope
            )));
        }

        let _updating = self.updating.lock().await;
        let worker = Arc::new(worker);
        {
            let mut slots = self.slots.write().await;
            slots.last_update_check = Some(Instant::now());
            slots.installing = Some(worker.clone());
        }

        let install = worker.install().wait().await;

        let install = {
            let mut slots = self.slots.write().await;
            slots.installing = None;
            match install {
                Ok(report) => {
                    slots.waiting = Some(worker);
                    report
                }
                Err(e) => {
                    warn!(scope = %self.scope, error = %e, "Update failed, keeping current worker");
                    return Err(e);
                }
            }
        };

        let activate = self.promote_waiting().await?;
        Ok(UpdateReport { install, activate })
    }

    /// Promote the waiting worker; the old active worker becomes redundant.
    pub async fn skip_waiting(&self) -> PrecacheResult<ActivateReport> {
        let _updating = self.updating.lock().await;
        self.promote_waiting().await
    }

    async fn promote_waiting(&self) -> PrecacheResult<ActivateReport> {
        let (worker, old) = {
            let mut slots = self.slots.write().await;
            let worker = slots
                .waiting
                .take()
                .ok_or_else(|| PrecacheError::state("no waiting worker"))?;
            let old = slots.active.replace(worker.clone());
            (worker, old)
        };

        if let Some(old) = old {
            debug!(scope = %self.scope, worker = ?old.id(), "Retiring previous worker");
            old.make_redundant().await;
        }

        let report = worker.activate().wait().await;
        info!(scope = %self.scope, worker = ?worker.id(), "Worker activated");
        report
    }

    /// Route a fetch event to the active worker.
    pub async fn handle_fetch(&self, event: &FetchEvent) -> FetchOutcome {
        match self.get_active().await {
            Some(worker) => worker.handle_fetch(event).await,
            None => FetchOutcome::PassThrough,
        }
    }

    /// Unregister (mark every worker redundant).
    pub async fn unregister(&self) {
        let retired = {
            let mut slots = self.slots.write().await;
            [slots.active.take(), slots.waiting.take(), slots.installing.take()]
        };
        for worker in retired.into_iter().flatten() {
            worker.make_redundant().await;
        }
    }
}
