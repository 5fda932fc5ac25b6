//! Fetch interception: decide whether a request is answered from the precache.

use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use precache_net::{Fetcher, Request, RequestMode, Response, UrlPattern};
use tracing::{debug, trace, warn};
use url::Url;

use crate::clients::ClientId;
use crate::config::PrecacheConfig;
use crate::error::{PrecacheError, PrecacheResult};
use crate::keys::{add_directory_index, is_path_whitelisted, strip_ignored_url_parameters, CacheKeyTable};
use crate::storage::CacheEntry;
use crate::store::CacheStoreManager;

/// A fetch event.
#[derive(Debug, Clone)]
pub struct FetchEvent {
    /// Request URL.
    pub url: Url,

    /// Request method.
    pub method: Method,

    /// Request headers.
    pub headers: HeaderMap,

    /// Client that issued the request.
    pub client_id: Option<ClientId>,

    /// Is navigation request.
    pub is_navigation: bool,
}

impl FetchEvent {
    /// A subresource GET.
    pub fn get(url: Url) -> Self {
        Self {
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            client_id: None,
            is_navigation: false,
        }
    }

    /// A top-level page load.
    pub fn navigate(url: Url) -> Self {
        Self {
            is_navigation: true,
            ..Self::get(url)
        }
    }

    /// The request the page would have made without interception.
    pub fn to_request(&self) -> Request {
        let mode = if self.is_navigation {
            RequestMode::Navigate
        } else {
            RequestMode::default()
        };
        let mut request = Request::get(self.url.clone()).mode(mode);
        request.method = self.method.clone();
        request.headers = self.headers.clone();
        request
    }
}

/// Response handed back to the page.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// Status code; 0 for a network error.
    pub status: u16,

    /// Response headers.
    pub headers: HeaderMap,

    /// Response body.
    pub body: Bytes,

    /// Whether from cache.
    pub from_cache: bool,
}

impl FetchResponse {
    /// Create a network error response.
    pub fn network_error() -> Self {
        Self {
            status: 0,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            from_cache: false,
        }
    }

    /// Create a response from cache entry.
    pub fn from_cache(entry: &CacheEntry) -> Self {
        Self {
            status: entry.status,
            headers: entry.header_map(),
            body: entry.body_bytes(),
            from_cache: true,
        }
    }

    /// Create a response from a live network response.
    pub fn from_network(response: Response) -> Self {
        Self {
            status: response.status.as_u16(),
            headers: response.headers,
            body: response.body,
            from_cache: false,
        }
    }

    pub fn is_network_error(&self) -> bool {
        self.status == 0
    }

    pub fn status_code(&self) -> Option<StatusCode> {
        StatusCode::from_u16(self.status).ok()
    }
}

/// What the fetch handler decided.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// Not intercepted; the request goes to the network untouched.
    PassThrough,
    /// Intercepted and answered.
    Respond(FetchResponse),
}

impl FetchOutcome {
    pub fn is_pass_through(&self) -> bool {
        matches!(self, FetchOutcome::PassThrough)
    }

    pub fn response(&self) -> Option<&FetchResponse> {
        match self {
            FetchOutcome::Respond(response) => Some(response),
            FetchOutcome::PassThrough => None,
        }
    }
}

/// Which matching tier produced a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchTier {
    Exact,
    DirectoryIndex,
    NavigateFallback,
}

/// A request resolved to a table row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    pub tier: MatchTier,
    /// Normalized URL that hit the table.
    pub lookup_url: Url,
    /// Key the response is stored under.
    pub cache_key: String,
}

/// Matching rules, compiled from [`PrecacheConfig`].
#[derive(Debug, Clone)]
pub struct RouteRules {
    pub ignore_url_parameters: Vec<UrlPattern>,
    pub directory_index: Option<String>,
    /// Root document, already resolved against the worker location.
    pub navigate_fallback: Option<Url>,
    pub navigate_fallback_whitelist: Vec<UrlPattern>,
}

impl RouteRules {
    pub fn from_config(config: &PrecacheConfig, location: &Url) -> PrecacheResult<Self> {
        let navigate_fallback = config
            .navigate_fallback
            .as_deref()
            .map(|root| location.join(root))
            .transpose()?;

        Ok(Self {
            ignore_url_parameters: config.ignore_url_parameters.clone(),
            directory_index: config.directory_index.clone(),
            navigate_fallback,
            navigate_fallback_whitelist: config.navigate_fallback_whitelist.clone(),
        })
    }
}

/// Resolves intercepted requests against the key table and serves hits.
pub struct RequestRouter {
    location: Url,
    rules: RouteRules,
    table: Arc<CacheKeyTable>,
    store: Arc<CacheStoreManager>,
    fetcher: Arc<dyn Fetcher>,
}

impl RequestRouter {
    pub fn new(
        location: Url,
        rules: RouteRules,
        table: Arc<CacheKeyTable>,
        store: Arc<CacheStoreManager>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        Self {
            location,
            rules,
            table,
            store,
            fetcher,
        }
    }

    /// Only same-origin GETs are candidates for interception.
    pub fn is_candidate(&self, event: &FetchEvent) -> bool {
        event.method == Method::GET && event.url.origin() == self.location.origin()
    }

    /// Run the matching tiers; first hit wins.
    pub fn resolve(&self, event: &FetchEvent) -> Option<RouteMatch> {
        if !self.is_candidate(event) {
            return None;
        }

        let hit = |tier: MatchTier, url: Url| {
            self.table.get(&url).map(|key| RouteMatch {
                tier,
                cache_key: key.to_string(),
                lookup_url: url,
            })
        };

        let url = strip_ignored_url_parameters(&event.url, &self.rules.ignore_url_parameters);
        if let Some(found) = hit(MatchTier::Exact, url.clone()) {
            return Some(found);
        }

        if let Some(ref index) = self.rules.directory_index {
            if let Some(found) = hit(MatchTier::DirectoryIndex, add_directory_index(&url, index)) {
                return Some(found);
            }
        }

        if let Some(ref root) = self.rules.navigate_fallback {
            if event.is_navigation
                && is_path_whitelisted(&self.rules.navigate_fallback_whitelist, &event.url)
            {
                return hit(MatchTier::NavigateFallback, root.clone());
            }
        }

        None
    }

    /// Handle a fetch event.
    ///
    /// A hit whose key is missing from the bucket falls back to the network
    /// instead of failing the page.
    pub async fn handle_fetch(&self, event: &FetchEvent) -> FetchOutcome {
        let Some(found) = self.resolve(event) else {
            trace!(url = %event.url, method = %event.method, "Not intercepted");
            return FetchOutcome::PassThrough;
        };

        debug!(url = %event.url, tier = ?found.tier, key = %found.cache_key, "Precache hit");

        match self.serve(&found.cache_key).await {
            Ok(response) => FetchOutcome::Respond(response),
            Err(e) => {
                warn!(
                    url = %event.url,
                    key = %found.cache_key,
                    category = e.category(),
                    error = %e,
                    "Couldn't serve response from cache, falling back to network"
                );
                FetchOutcome::Respond(self.network_fallback(event).await)
            }
        }
    }

    async fn serve(&self, key: &str) -> PrecacheResult<FetchResponse> {
        match self.store.get(key).await? {
            Some(entry) => Ok(FetchResponse::from_cache(&entry)),
            None => Err(PrecacheError::CacheConsistencyFault {
                key: key.to_string(),
            }),
        }
    }

    async fn network_fallback(&self, event: &FetchEvent) -> FetchResponse {
        match self.fetcher.fetch(event.to_request()).await {
            Ok(response) => FetchResponse::from_network(response),
            Err(e) => {
                warn!(url = %event.url, error = %e, "Network fallback failed");
                FetchResponse::network_error()
            }
        }
    }
}
