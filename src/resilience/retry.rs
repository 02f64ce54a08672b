// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry and backoff policies.
//!
//! Two layers use this module:
//! - store commands wrap themselves in [`retry`] with a short preset so a
//!   connection blip is absorbed locally;
//! - the worker loop asks a [`BackoffPolicy`] how long to sleep before a
//!   failed job is requeued. The policy is pluggable: exponential via
//!   [`RetryConfig`] or constant via [`FixedBackoff`].
//!
//! # Example
//!
//! ```
//! use dataset_sync::resilience::retry::{BackoffPolicy, FixedBackoff, RetryConfig};
//! use std::time::Duration;
//!
//! // Worker: 1s, 2s, 4s, ... capped at a minute
//! let worker = RetryConfig::worker();
//! assert_eq!(worker.delay(1), Duration::from_secs(1));
//! assert_eq!(worker.delay(3), Duration::from_secs(4));
//! assert_eq!(worker.delay(50), Duration::from_secs(60));
//!
//! let fixed = FixedBackoff(Duration::from_millis(500));
//! assert_eq!(fixed.delay(9), Duration::from_millis(500));
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

/// Delay before requeueing a job that has failed `failures` times (1-based).
pub trait BackoffPolicy: Send + Sync {
    fn delay(&self, failures: u32) -> Duration;
}

/// Same delay after every failure.
#[derive(Debug, Clone, Copy)]
pub struct FixedBackoff(pub Duration);

impl BackoffPolicy for FixedBackoff {
    fn delay(&self, _failures: u32) -> Duration {
        self.0
    }
}

/// Exponential backoff: `initial_delay * factor^(n-1)`, capped at `max_delay`.
///
/// `max_attempts` bounds [`retry`]; `None` retries until the operation
/// succeeds. As a [`BackoffPolicy`] the attempt bound is ignored because the
/// worker's error cap decides when a job stops.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_attempts: Option<usize>,
}

impl RetryConfig {
    /// Initial store connection: 5 attempts within a few seconds, so a bad
    /// URL surfaces at startup instead of hanging the worker.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_attempts: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// One store command. Three quick attempts, then the error goes to the
    /// job, whose own retry takes over.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_attempts: Some(3),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Job-level backoff for the worker loop: 1s doubling up to 60s.
    #[must_use]
    pub fn worker() -> Self {
        Self {
            max_attempts: None,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            factor: 2.0,
        }
    }
}

impl BackoffPolicy for RetryConfig {
    fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.factor.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Run `operation` until it succeeds or `config.max_attempts` attempts fail.
///
/// The last error is returned unchanged.
pub async fn retry<F, Fut, T, E>(name: &str, config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut failures: u32 = 0;
    loop {
        let err = match operation().await {
            Ok(val) => {
                if failures > 0 {
                    debug!(operation = name, failures, "Operation recovered");
                }
                return Ok(val);
            }
            Err(err) => err,
        };
        failures += 1;
        if config.max_attempts.is_some_and(|max| failures as usize >= max) {
            return Err(err);
        }
        let delay = config.delay(failures);
        warn!(operation = name, attempt = failures, error = %err, ?delay, "Operation failed, retrying");
        sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast(max_attempts: usize) -> RetryConfig {
        RetryConfig {
            max_attempts: Some(max_attempts),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            factor: 2.0,
        }
    }

    #[tokio::test]
    async fn test_connection_blip_is_absorbed() {
        let calls = AtomicUsize::new(0);
        let res: Result<&str, StorageError> = retry("redis_get", &fast(3), || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(StorageError::Timeout("reset by peer".into()))
            } else {
                Ok("value")
            }
        })
        .await;

        assert_eq!(res.unwrap(), "value");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_gives_up_with_last_error() {
        let calls = AtomicUsize::new(0);
        let res: Result<(), StorageError> = retry("redis_set", &fast(3), || async {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Err(StorageError::Backend(format!("attempt {n}")))
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(res.unwrap_err().to_string().contains("attempt 3"));
    }

    #[test]
    fn test_store_presets_are_bounded() {
        assert_eq!(RetryConfig::startup().max_attempts, Some(5));
        assert_eq!(RetryConfig::query().max_attempts, Some(3));
        assert!(RetryConfig::worker().max_attempts.is_none());
    }

    #[test]
    fn test_worker_backoff_sequence() {
        let worker = RetryConfig::worker();
        let delays: Vec<u64> = (1..=8).map(|n| worker.delay(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
        // Far past the cap must not overflow
        assert_eq!(worker.delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_aggressive_factor_still_capped() {
        let config = RetryConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            factor: 10.0,
            max_attempts: None,
        };
        assert_eq!(config.delay(1), Duration::from_secs(1));
        assert_eq!(config.delay(2), Duration::from_secs(5));
    }

    #[test]
    fn test_fixed_backoff() {
        let fixed = FixedBackoff(Duration::ZERO);
        assert_eq!(fixed.delay(1), Duration::ZERO);
        assert_eq!(fixed.delay(99), Duration::ZERO);
    }
}
