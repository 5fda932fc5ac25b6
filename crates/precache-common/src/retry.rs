//! Exponential backoff for operations that talk to flaky endpoints.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// How often and how patiently to retry.
///
/// Durations are (de)serialized as whole milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first; 0 is treated as 1.
    pub max_attempts: u32,
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    #[serde(with = "millis")]
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Stretch each delay by up to a quarter.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Single attempt, never retried.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delays to sleep between consecutive attempts.
    pub fn backoff(&self) -> Backoff<'_> {
        Backoff {
            config: self,
            next: self.initial_delay,
            remaining: self.max_attempts.max(1) - 1,
        }
    }
}

/// Iterator over the pauses of a [`RetryConfig`]; yields one fewer item than attempts.
#[derive(Debug)]
pub struct Backoff<'a> {
    config: &'a RetryConfig,
    next: Duration,
    remaining: u32,
}

impl Iterator for Backoff<'_> {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let delay = self.next.min(self.config.max_delay);
        self.next = scale(self.next, self.config.backoff_multiplier.max(1.0))
            .min(self.config.max_delay);

        Some(if self.config.jitter {
            spread(delay)
        } else {
            delay
        })
    }
}

fn spread(delay: Duration) -> Duration {
    let nanos = clock_nanos();
    scale(delay, 1.0 + f64::from(nanos % 1000) / 4000.0)
}

/// `delay * factor`, saturating at `Duration::MAX` instead of panicking.
fn scale(delay: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

fn clock_nanos() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0)
}

/// Run `operation` until it succeeds or the attempts run out.
pub async fn retry_with_backoff<T, E, F, Fut>(config: &RetryConfig, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_backoff_if(config, operation, |_| true).await
}

/// Like [`retry_with_backoff`], but gives up at once on errors `should_retry` rejects.
pub async fn retry_with_backoff_if<T, E, F, Fut, P>(
    config: &RetryConfig,
    mut operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut pauses = config.backoff();
    let mut attempt = 1u32;

    loop {
        let error = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "Succeeded after retrying");
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        let pause = if should_retry(&error) { pauses.next() } else { None };
        let Some(pause) = pause else {
            warn!(attempt, error = %error, "Giving up");
            return Err(error);
        };

        debug!(attempt, error = %error, ?pause, "Attempt failed, backing off");
        sleep(pause).await;
        attempt += 1;
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn steady(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            jitter: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
            jitter: false,
            ..Default::default()
        };

        let pauses: Vec<_> = config.backoff().collect();
        assert_eq!(
            pauses,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(300),
                Duration::from_millis(300),
            ]
        );
    }

    #[test]
    fn test_single_attempt_never_pauses() {
        assert_eq!(RetryConfig::none().backoff().count(), 0);
        assert_eq!(steady(0).backoff().count(), 0);
    }

    #[test]
    fn test_jitter_stays_within_a_quarter() {
        let config = RetryConfig {
            max_attempts: 2,
            initial_delay: Duration::from_millis(400),
            ..Default::default()
        };
        let pause = config.backoff().next().unwrap();
        assert!(pause >= Duration::from_millis(400));
        assert!(pause <= Duration::from_millis(500));
    }

    #[test]
    fn test_huge_multiplier_saturates_at_max_delay() {
        let config: RetryConfig = serde_json::from_str(
            r#"{"max_attempts": 4, "initial_delay": 50, "max_delay": 2000, "backoff_multiplier": 1e300, "jitter": false}"#,
        )
        .unwrap();

        let pauses: Vec<_> = config.backoff().collect();
        assert_eq!(
            pauses,
            vec![
                Duration::from_millis(50),
                Duration::from_millis(2000),
                Duration::from_millis(2000),
            ]
        );
    }

    #[test]
    fn test_config_from_millis_json() {
        let config: RetryConfig =
            serde_json::from_str(r#"{"max_attempts": 5, "initial_delay": 250}"#).unwrap();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.initial_delay, Duration::from_millis(250));
        assert_eq!(config.max_delay, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_third_attempt_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();

        let result: Result<&str, String> = retry_with_backoff(&steady(3), || {
            let call = seen.fetch_add(1, Ordering::SeqCst);
            async move {
                match call {
                    0 | 1 => Err(format!("503 on call {}", call)),
                    _ => Ok("delivered"),
                }
            }
        })
        .await;

        assert_eq!(result, Ok("delivered"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_return_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();

        let result: Result<(), u32> = retry_with_backoff(&steady(4), || {
            let call = seen.fetch_add(1, Ordering::SeqCst);
            async move { Err(call) }
        })
        .await;

        assert_eq!(result, Err(3));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_rejected_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();

        let result: Result<(), u16> = retry_with_backoff_if(
            &steady(3),
            || {
                seen.fetch_add(1, Ordering::SeqCst);
                async { Err(401) }
            },
            |status| *status >= 500,
        )
        .await;

        assert_eq!(result, Err(401));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
