//! Logging configuration and setup.

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format.
    #[default]
    Pretty,
    /// Compact single-line format.
    Compact,
    /// JSON format for structured logging.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level used when no filter is given.
    pub level: Level,
    /// Output format.
    pub format: LogFormat,
    /// Include source file location.
    pub include_location: bool,
    /// Include thread names.
    pub include_thread_names: bool,
    /// Include span events (enter, close).
    pub include_span_events: bool,
    /// Write to the test capture writer instead of stdout.
    pub test_writer: bool,
    /// Custom filter string (e.g., "precache_worker=debug,reqwest=warn").
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            include_location: false,
            include_thread_names: false,
            include_span_events: false,
            test_writer: false,
            filter: None,
        }
    }
}

impl LogConfig {
    /// Create a debug configuration.
    pub fn debug() -> Self {
        Self {
            level: Level::DEBUG,
            include_location: true,
            include_span_events: true,
            ..Default::default()
        }
    }

    /// Create a production configuration.
    pub fn production() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Json,
            ..Default::default()
        }
    }

    /// Compact output routed through libtest's capture.
    pub fn test() -> Self {
        Self {
            level: Level::DEBUG,
            format: LogFormat::Compact,
            test_writer: true,
            ..Default::default()
        }
    }

    /// Set a custom filter.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    fn env_filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(self.level.to_string());
        match self.filter {
            Some(ref custom) => EnvFilter::try_new(custom).unwrap_or_else(|_| fallback()),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback()),
        }
    }
}

/// Install the global subscriber described by `config`.
///
/// Returns `false` when a global subscriber was already installed, so callers
/// that may run more than once (tests, embedded hosts) can ignore the result.
pub fn init_logging(config: LogConfig) -> bool {
    let filter = config.env_filter();

    let span_events = if config.include_span_events {
        FmtSpan::ENTER | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let registry = tracing_subscriber::registry().with(filter);

    let result = match (config.format, config.test_writer) {
        (LogFormat::Json, _) => registry
            .with(fmt::layer().json().with_span_events(span_events))
            .try_init(),
        (LogFormat::Compact, true) => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_test_writer()
                    .with_span_events(span_events),
            )
            .try_init(),
        (LogFormat::Compact, false) => registry
            .with(fmt::layer().compact().with_span_events(span_events))
            .try_init(),
        (LogFormat::Pretty, test_writer) => {
            let layer = fmt::layer()
                .with_target(true)
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .with_thread_names(config.include_thread_names)
                .with_span_events(span_events);
            if test_writer {
                registry.with(layer.with_test_writer()).try_init()
            } else {
                registry.with(layer).try_init()
            }
        }
    };

    result.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_config_default() {
        let config = LogConfig::default();
        assert_eq!(config.level, Level::INFO);
        assert_eq!(config.format, LogFormat::Pretty);
        assert!(!config.include_location);
    }

    #[test]
    fn test_log_config_production_is_json() {
        let config = LogConfig::production();
        assert_eq!(config.format, LogFormat::Json);
    }

    #[test]
    fn test_log_config_with_filter() {
        let config = LogConfig::default().with_filter("precache_worker=debug");
        assert_eq!(config.filter.as_deref(), Some("precache_worker=debug"));
    }

    #[test]
    fn test_init_logging_twice() {
        init_logging(LogConfig::test());
        assert!(!init_logging(LogConfig::test()));
    }
}
