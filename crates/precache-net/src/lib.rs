//! # Precache Net
//!
//! Network plumbing for the precache worker.
//!
//! ## Design Goals
//!
//! 1. **One request model**: the same `Request`/`Response` types flow through
//!    install-time population, fetch interception and the notification relay
//! 2. **Swappable network**: everything that touches the wire goes through the
//!    [`Fetcher`] trait; [`ResourceLoader`] is the reqwest-backed implementation
//! 3. **Regex URL patterns**: [`UrlPattern`] for ignore lists and whitelists

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, info, trace};

pub use url::Url;

pub mod pattern;

pub use pattern::{PatternError, UrlPattern};

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Bad response status {status} for {url}")]
    HttpStatus { url: Url, status: StatusCode },

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

impl NetError {
    /// Whether a second attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            NetError::RequestFailed(_) | NetError::Timeout(_) => true,
            NetError::HttpStatus { status, .. } => status.is_server_error(),
            NetError::HttpError(e) => e.is_timeout() || e.is_connect(),
            NetError::InvalidUrl(_) => false,
        }
    }
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// Request mode, as seen by a fetch handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level page load.
    Navigate,
    SameOrigin,
    NoCors,
    #[default]
    Cors,
}

/// Credentials mode for requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CredentialsMode {
    /// Never send cookies.
    Omit,
    /// Send cookies only for same-origin requests.
    #[default]
    SameOrigin,
    /// Always send cookies.
    Include,
}

/// HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub timeout: Option<Duration>,
    pub credentials: CredentialsMode,
    pub mode: RequestMode,
}

impl Request {
    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
            credentials: CredentialsMode::SameOrigin,
            mode: RequestMode::default(),
        }
    }

    /// Create a POST request.
    pub fn post(url: Url, body: Bytes) -> Self {
        Self {
            method: Method::POST,
            body: Some(body),
            ..Self::get(url)
        }
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set timeout.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    pub fn credentials(mut self, credentials: CredentialsMode) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Whether this request loads a top-level page.
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }
}

/// HTTP response with a fully buffered body.
#[derive(Debug, Clone)]
pub struct Response {
    pub request_id: RequestId,
    /// Final URL (after redirects).
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Response {
    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Turn a non-2xx response into [`NetError::HttpStatus`].
    pub fn error_for_status(self) -> Result<Self, NetError> {
        if self.ok() {
            Ok(self)
        } else {
            Err(NetError::HttpStatus {
                url: self.url,
                status: self.status,
            })
        }
    }

    /// Get a header value as a string.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Get the body as text.
    pub fn text(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }
}

/// Anything that can put a request on the wire.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: Request) -> Result<Response, NetError>;
}

/// Resource loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Default timeout.
    pub default_timeout: Duration,
    /// Maximum redirects.
    pub max_redirects: usize,
    /// Keep a cookie jar so same-origin credentials are sent.
    pub cookies_enabled: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("precache/", env!("CARGO_PKG_VERSION")).to_string(),
            default_timeout: Duration::from_secs(30),
            max_redirects: 10,
            cookies_enabled: true,
        }
    }
}

/// reqwest-backed [`Fetcher`].
pub struct ResourceLoader {
    client: Client,
    config: LoaderConfig,
}

impl ResourceLoader {
    /// Create a new resource loader.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.default_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .cookie_store(config.cookies_enabled)
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(user_agent = %config.user_agent, "ResourceLoader initialized");

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }
}

#[async_trait]
impl Fetcher for ResourceLoader {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        debug!(url = %request.url, method = %request.method, mode = ?request.mode, "Fetching resource");

        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());

        if let Some(body) = request.body {
            req_builder = req_builder.body(body);
        }

        if let Some(timeout) = request.timeout {
            req_builder = req_builder.timeout(timeout);
        }

        let response = req_builder.send().await.map_err(|e| {
            if e.is_timeout() {
                NetError::Timeout(request.timeout.unwrap_or(self.config.default_timeout))
            } else {
                NetError::HttpError(e)
            }
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response.bytes().await?;

        trace!(
            url = %url,
            status = %status,
            body_len = body.len(),
            "Response received"
        );

        Ok(Response {
            request_id: request.id,
            url,
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_request_builder() {
        let url = Url::parse("https://example.com").unwrap();
        let request = Request::get(url.clone())
            .header(
                HeaderName::from_static("accept"),
                HeaderValue::from_static("text/html"),
            )
            .mode(RequestMode::Navigate)
            .timeout(Duration::from_secs(10));

        assert_eq!(request.url, url);
        assert_eq!(request.method, Method::GET);
        assert!(request.headers.contains_key("accept"));
        assert!(request.is_navigation());
        assert_eq!(request.credentials, CredentialsMode::SameOrigin);
    }

    #[test]
    fn test_post_keeps_body() {
        let url = Url::parse("https://example.com/cb").unwrap();
        let request = Request::post(url, Bytes::from_static(b"{}"));
        assert_eq!(request.method, Method::POST);
        assert_eq!(request.body.as_deref(), Some(&b"{}"[..]));
    }

    #[test]
    fn test_request_id_uniqueness() {
        assert_ne!(RequestId::new(), RequestId::new());
    }

    #[test]
    fn test_status_errors_are_retryable_only_for_5xx() {
        let url = Url::parse("https://example.com/").unwrap();
        let server = NetError::HttpStatus {
            url: url.clone(),
            status: StatusCode::BAD_GATEWAY,
        };
        let client = NetError::HttpStatus {
            url,
            status: StatusCode::NOT_FOUND,
        };
        assert!(server.is_retryable());
        assert!(!client.is_retryable());
    }

    #[tokio::test]
    async fn test_loader_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/static/app.js"))
            .and(header("x-probe", "1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw("console.log(1)", "application/javascript"),
            )
            .mount(&server)
            .await;

        let loader = ResourceLoader::new(LoaderConfig::default()).unwrap();
        let url = Url::parse(&format!("{}/static/app.js", server.uri())).unwrap();
        let request = Request::get(url).header(
            HeaderName::from_static("x-probe"),
            HeaderValue::from_static("1"),
        );

        let response = loader.fetch(request).await.unwrap();
        assert!(response.ok());
        assert_eq!(response.header("content-type"), Some("application/javascript"));
        assert_eq!(response.text().unwrap(), "console.log(1)");
    }

    #[tokio::test]
    async fn test_loader_error_for_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let loader = ResourceLoader::new(LoaderConfig::default()).unwrap();
        let url = Url::parse(&format!("{}/missing", server.uri())).unwrap();
        let response = loader.fetch(Request::get(url)).await.unwrap();

        let err = response.error_for_status().unwrap_err();
        assert!(matches!(err, NetError::HttpStatus { status, .. } if status == StatusCode::NOT_FOUND));
    }
}
