//! Bounded retry with exponential backoff for store writes.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use crate::error::{FleetError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Adds up to 25% random delay per attempt
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 { 4 }
fn default_initial_delay_ms() -> u64 { 50 }
fn default_max_delay_ms() -> u64 { 1000 }
fn default_multiplier() -> f64 { 2.0 }
fn default_jitter() -> bool { true }

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    /// Delay after the given (1-based) failed attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.initial_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = base.min(self.max_delay_ms as f64).max(0.0);
        let delay = if self.jitter {
            capped * (1.0 + rand::rng().random_range(0.0..0.25))
        } else {
            capped
        };
        Duration::from_micros((delay * 1000.0).round() as u64)
    }

    /// Worst-case time spent sleeping between attempts.
    pub fn total_backoff(&self) -> Duration {
        (1..self.max_attempts)
            .map(|attempt| {
                let base = self.initial_delay_ms as f64 * self.multiplier.powi(attempt as i32 - 1);
                let capped = base.min(self.max_delay_ms as f64);
                let with_jitter = if self.jitter { capped * 1.25 } else { capped };
                Duration::from_micros((with_jitter * 1000.0).round() as u64)
            })
            .sum()
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts run out.
    pub async fn run<F, Fut, T>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    if attempt < attempts {
                        let delay = self.delay_for_attempt(attempt);
                        debug!(
                            what,
                            attempt,
                            max_attempts = attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Retrying after store failure"
                        );
                        sleep(delay).await;
                    }
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| FleetError::internal("retry exhausted without error")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn quick(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn delay_grows_and_caps() {
        let policy = RetryPolicy {
            jitter: false,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(50));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = quick(3)
            .run("test", || {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(FleetError::StoreUnavailable("flaky".into()))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_bound() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<()> = quick(2)
            .run("test", || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(FleetError::StoreUnavailable("down".into()))
                }
            })
            .await;
        assert!(matches!(result, Err(FleetError::StoreUnavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn decisions_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<()> = quick(5)
            .run("test", || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(FleetError::config("bad"))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
