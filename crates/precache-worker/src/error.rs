//! Error types for the precache worker.

use precache_net::NetError;
use thiserror::Error;

/// Result type alias for precache operations.
pub type PrecacheResult<T> = Result<T, PrecacheError>;

/// Errors that can occur in precache operations.
#[derive(Error, Debug)]
pub enum PrecacheError {
    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// A required asset could not be retrieved during install.
    #[error("Failed to precache {url}: {reason}")]
    ManifestFetchFailure { url: String, reason: String },

    /// The key table promises an entry the bucket does not hold.
    #[error("The cached response that was expected is missing: {key}")]
    CacheConsistencyFault { key: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("State error: {0}")]
    State(String),

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PrecacheError {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    /// Get the error category for logging.
    pub fn category(&self) -> &'static str {
        match self {
            PrecacheError::InvalidManifest(_) => "manifest",
            PrecacheError::InvalidConfig(_) => "config",
            PrecacheError::InvalidUrl(_) => "url",
            PrecacheError::ManifestFetchFailure { .. } => "install",
            PrecacheError::CacheConsistencyFault { .. } => "consistency",
            PrecacheError::Storage(_) => "storage",
            PrecacheError::State(_) => "state",
            PrecacheError::Network(_) => "network",
            PrecacheError::Json(_) => "json",
            PrecacheError::Io(_) => "io",
        }
    }

    /// Whether this error aborts an install attempt.
    ///
    /// Consistency faults only ever surface at fetch time and degrade to the network.
    pub fn is_fatal_to_install(&self) -> bool {
        !matches!(self, PrecacheError::CacheConsistencyFault { .. })
    }
}

impl From<rusqlite::Error> for PrecacheError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        let fault = PrecacheError::CacheConsistencyFault {
            key: "https://example.com/?_sw-precache=abc".into(),
        };
        assert_eq!(fault.category(), "consistency");
        assert_eq!(PrecacheError::storage("disk full").category(), "storage");
        assert!(!fault.is_fatal_to_install());
        assert!(PrecacheError::storage("disk full").is_fatal_to_install());
    }

    #[test]
    fn test_fetch_failure_message() {
        let err = PrecacheError::ManifestFetchFailure {
            url: "https://example.com/app.js".into(),
            reason: "404".into(),
        };
        assert_eq!(err.to_string(), "Failed to precache https://example.com/app.js: 404");
    }
}
