//! Retry policy for outbound tool calls
//!
//! Delays grow exponentially from `initial_interval_ms` by `backoff_factor`,
//! are capped at `max_interval_ms`, and are optionally scaled by a random
//! factor in `0.5..=1.5` so concurrent calls do not retry in lockstep.
//!
//! ```rust
//! use voiceflow_core::retry::RetryPolicy;
//!
//! let policy = RetryPolicy::new(5)
//!     .with_initial_interval_ms(200)
//!     .with_jitter(false);
//! assert_eq!(policy.calculate_delay(1).as_millis(), 400);
//! ```

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,

    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_attempts() -> usize {
    3
}

fn default_initial_interval_ms() -> u64 {
    1000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_max_interval_ms() -> u64 {
    30_000
}

fn default_jitter() -> bool {
    true
}

impl RetryPolicy {
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            initial_interval_ms: default_initial_interval_ms(),
            backoff_factor: default_backoff_factor(),
            max_interval_ms: default_max_interval_ms(),
            jitter: default_jitter(),
        }
    }

    /// Single attempt, no waiting
    pub fn none() -> Self {
        Self::new(1).with_jitter(false)
    }

    pub fn with_initial_interval_ms(mut self, ms: u64) -> Self {
        self.initial_interval_ms = ms;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_max_interval_ms(mut self, ms: u64) -> Self {
        self.max_interval_ms = ms;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retrying after the zero-based `attempt` failed
    pub fn calculate_delay(&self, attempt: usize) -> Duration {
        if attempt >= self.max_attempts {
            return Duration::ZERO;
        }

        let base = self.initial_interval_ms as f64 * self.backoff_factor.powi(attempt as i32);
        let capped = base.min(self.max_interval_ms as f64);

        let delay = if self.jitter {
            capped * rand::thread_rng().gen_range(0.5..=1.5)
        } else {
            capped
        };

        Duration::from_micros((delay.max(0.0) * 1000.0).round() as u64)
    }

    /// Whether another attempt may follow `attempts` completed ones
    pub fn should_retry(&self, attempts: usize) -> bool {
        attempts < self.max_attempts
    }

    /// Run `op` until it succeeds or attempts are exhausted
    ///
    /// `retryable` decides whether a given error is worth another try.
    pub async fn run<T, E, F, Fut>(
        &self,
        mut op: F,
        retryable: impl Fn(&E) -> bool,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if !self.should_retry(attempt) || !retryable(&err) {
                        return Err(err);
                    }
                    let delay = self.calculate_delay(attempt - 1);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "Retrying call");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(default_max_attempts())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_interval_ms, 1000);
        assert_eq!(policy.backoff_factor, 2.0);
        assert_eq!(policy.max_interval_ms, 30_000);
        assert!(policy.jitter);
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy::new(5)
            .with_initial_interval_ms(100)
            .with_jitter(false);

        assert_eq!(policy.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(policy.calculate_delay(1), Duration::from_millis(200));
        assert_eq!(policy.calculate_delay(2), Duration::from_millis(400));
        assert_eq!(policy.calculate_delay(5), Duration::ZERO);
    }

    #[test]
    fn test_max_interval_cap() {
        let policy = RetryPolicy::new(10)
            .with_initial_interval_ms(1000)
            .with_max_interval_ms(3000)
            .with_jitter(false);
        assert_eq!(policy.calculate_delay(4), Duration::from_millis(3000));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = RetryPolicy::new(3).with_initial_interval_ms(1000);
        for _ in 0..50 {
            let ms = policy.calculate_delay(0).as_millis();
            assert!((500..=1500).contains(&ms), "delay {}ms out of range", ms);
        }
    }

    #[test]
    fn test_partial_deserialize() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"max_attempts": 5}"#).unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_interval_ms, 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_retries_until_success() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let policy = RetryPolicy::new(3).with_jitter(false);

        let result: Result<&str, String> = policy
            .run(
                move || async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("flaky".to_string())
                    } else {
                        Ok("ok")
                    }
                },
                |_| true,
            )
            .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_permanent_error() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let policy = RetryPolicy::new(5).with_jitter(false);

        let result: Result<(), String> = policy
            .run(
                move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("bad request".to_string())
                },
                |e| !e.contains("bad request"),
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
