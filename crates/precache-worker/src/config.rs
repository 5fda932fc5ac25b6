//! Worker configuration

use precache_common::RetryConfig;
use precache_net::UrlPattern;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::error;
use url::Url;

use crate::error::{PrecacheError, PrecacheResult};

/// Navigation whitelist used by the Home Assistant frontend build.
pub const DEFAULT_NAVIGATE_WHITELIST: &str =
    "^((?!(static|api|local|service_worker.js|manifest.json)).)*$";

/// Precache worker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrecacheConfig {
    /// First segment of the bucket name; bump it to orphan every old bucket
    pub cache_name_prefix: String,

    /// Optional discriminator between several workers on one scope
    pub cache_id: String,

    /// Query parameter that carries the content hash in cache keys
    pub hash_param_name: String,

    /// Query parameters stripped before matching
    pub ignore_url_parameters: Vec<UrlPattern>,

    /// File appended to directory URLs
    pub directory_index: Option<String>,

    /// Document served for unmatched navigations
    pub navigate_fallback: Option<String>,

    /// Paths eligible for the navigation fallback
    pub navigate_fallback_whitelist: Vec<UrlPattern>,

    /// URLs that already carry a version and need no hash parameter
    pub pre_versioned_pattern: Option<UrlPattern>,

    /// Where notification callbacks are posted
    pub callback_endpoint: String,

    /// Retry policy for notification callbacks
    pub callback_retry: RetryConfig,
}

impl Default for PrecacheConfig {
    fn default() -> Self {
        Self {
            cache_name_prefix: "sw-precache-v2".to_string(),
            cache_id: String::new(),
            hash_param_name: "_sw-precache".to_string(),
            ignore_url_parameters: builtin_patterns(&["^utm_"]),
            directory_index: Some("index.html".to_string()),
            navigate_fallback: Some("/".to_string()),
            navigate_fallback_whitelist: builtin_patterns(&[DEFAULT_NAVIGATE_WHITELIST]),
            pre_versioned_pattern: None,
            callback_endpoint: "/api/notify.html5/callback".to_string(),
            callback_retry: RetryConfig::default(),
        }
    }
}

/// Compile the default patterns, skipping (and logging) any that fail.
fn builtin_patterns(sources: &[&str]) -> Vec<UrlPattern> {
    sources
        .iter()
        .filter_map(|source| match UrlPattern::new(source) {
            Ok(pattern) => Some(pattern),
            Err(e) => {
                error!(pattern = source, error = %e, "Built-in pattern does not compile");
                None
            }
        })
        .collect()
}

impl PrecacheConfig {
    /// Parse a JSON config; missing fields take their defaults.
    pub fn from_json(json: &str) -> PrecacheResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| PrecacheError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file.
    pub fn load(path: &Path) -> PrecacheResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Check the fields patterns cannot check on their own.
    pub fn validate(&self) -> PrecacheResult<()> {
        if self.cache_name_prefix.is_empty() {
            return Err(PrecacheError::InvalidConfig("cache_name_prefix is empty".into()));
        }
        if self.hash_param_name.is_empty() {
            return Err(PrecacheError::InvalidConfig("hash_param_name is empty".into()));
        }
        if matches!(self.directory_index.as_deref(), Some(index) if index.is_empty() || index.contains('/')) {
            return Err(PrecacheError::InvalidConfig(
                "directory_index must be a bare file name".into(),
            ));
        }

        // relative references are checked against a throwaway base
        let base = Url::parse("https://invalid.example/")?;
        base.join(&self.callback_endpoint)
            .map_err(|e| PrecacheError::InvalidConfig(format!("callback_endpoint: {}", e)))?;
        if let Some(ref fallback) = self.navigate_fallback {
            base.join(fallback)
                .map_err(|e| PrecacheError::InvalidConfig(format!("navigate_fallback: {}", e)))?;
        }

        Ok(())
    }

    /// Bucket name for a registration scope.
    pub fn cache_name(&self, scope: &Url) -> String {
        format!("{}-{}-{}", self.cache_name_prefix, self.cache_id, scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PrecacheConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.hash_param_name, "_sw-precache");
        assert_eq!(config.directory_index.as_deref(), Some("index.html"));
        assert!(config.ignore_url_parameters[0].matches("utm_campaign"));
    }

    #[test]
    fn test_default_patterns_all_compile() {
        let config = PrecacheConfig::default();
        assert_eq!(config.ignore_url_parameters.len(), 1);
        assert_eq!(config.navigate_fallback_whitelist.len(), 1);
        assert_eq!(
            config.navigate_fallback_whitelist[0].as_str(),
            DEFAULT_NAVIGATE_WHITELIST
        );
    }

    #[test]
    fn test_cache_name_matches_legacy_layout() {
        let scope = Url::parse("https://home.example/").unwrap();
        assert_eq!(
            PrecacheConfig::default().cache_name(&scope),
            "sw-precache-v2--https://home.example/"
        );
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config = PrecacheConfig::from_json(
            r#"{
                "ignore_url_parameters": ["^utm_", "^fbclid$"],
                "navigate_fallback": null,
                "callback_retry": {"max_attempts": 1}
            }"#,
        )
        .unwrap();

        assert_eq!(config.ignore_url_parameters.len(), 2);
        assert!(config.navigate_fallback.is_none());
        assert_eq!(config.callback_retry.max_attempts, 1);
        assert_eq!(config.cache_name_prefix, "sw-precache-v2");
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let err = PrecacheConfig::from_json(r#"{"ignore_url_parameters": ["("]}"#).unwrap_err();
        assert!(matches!(err, PrecacheError::InvalidConfig(_)));
    }

    #[test]
    fn test_directory_index_must_be_file_name() {
        let config = PrecacheConfig {
            directory_index: Some("a/index.html".into()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
