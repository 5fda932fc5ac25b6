//! # Precache Worker
//!
//! Versioned, content-addressed precache for a web application's static
//! assets, driven by the service worker lifecycle.
//!
//! ## Features
//!
//! - **Install**: fetch every manifest entry the bucket lacks, commit atomically
//! - **Activate**: prune keys the current manifest no longer names, claim clients
//! - **Fetch**: exact, directory-index and navigation-fallback matching
//! - **Push**: display notifications and relay received/clicked/closed callbacks
//!
//! ## Architecture
//!
//! ```text
//! PrecacheRegistration (scope)
//!     ├── installing / waiting / active (PrecacheWorker)
//!     ├── Clients (shared by every worker of the scope)
//!     │
//!     └── PrecacheWorker
//!             ├── CacheKeyTable ◄── Manifest
//!             ├── CacheStoreManager ── CacheStorage (memory | sqlite)
//!             ├── RequestRouter ──── FetchEvent → FetchOutcome
//!             └── NotificationRelay ─ Fetcher → callback endpoint
//! ```
//!
//! ## Example
//!
//! ```ignore
//! let manifest = Manifest::load(Path::new("precache-manifest.json"))?;
//! let registration = PrecacheRegistration::new(location.join("./")?);
//! let worker = registration
//!     .worker_builder(location, manifest)
//!     .storage(Arc::new(SqliteCacheStorage::open(&db_path)?))
//!     .build()?;
//!
//! registration.update(worker).await?;
//! let outcome = registration.handle_fetch(&FetchEvent::navigate(url)).await;
//! ```

pub mod clients;
pub mod config;
pub mod error;
pub mod keys;
pub mod manifest;
pub mod notify;
pub mod registration;
pub mod router;
pub mod storage;
pub mod store;
pub mod worker;

pub use clients::{Client, ClientId, ClientMatchOptions, ClientType, Clients};
pub use config::{PrecacheConfig, DEFAULT_NAVIGATE_WHITELIST};
pub use error::{PrecacheError, PrecacheResult};
pub use keys::{
    add_directory_index, derive_cache_key, is_path_whitelisted, strip_ignored_url_parameters,
    CacheKeyTable,
};
pub use manifest::{Manifest, ManifestEntry};
pub use notify::{
    CallbackBody, CallbackType, ClickOutcome, Notification, NotificationCenter, NotificationId,
    NotificationRelay, PushPayload,
};
pub use registration::{PrecacheRegistration, UpdateReport};
pub use router::{FetchEvent, FetchOutcome, FetchResponse, MatchTier, RequestRouter, RouteMatch, RouteRules};
pub use storage::{CacheEntry, CacheStorage, MemoryCacheStorage, SqliteCacheStorage};
pub use store::{ActivateReport, CacheStoreManager, InstallReport, StoreState};
pub use worker::{
    PendingWork, PrecacheWorker, PrecacheWorkerBuilder, ServiceWorkerState, WorkerEvent, WorkerId,
};
