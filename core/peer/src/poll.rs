//! Polling with exponential backoff for readiness endpoints.
//!
//! Central prepares sessions and pull snapshots in the background. The
//! facility polls until the work is done, backing off between attempts and
//! giving up once the total wait exceeds a bound.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};
use tracing::debug;

use edgesync_common::{Error, Result};

/// Configuration for readiness polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Delay before the second attempt.
    pub initial_delay_ms: u64,
    /// Cap for exponential growth.
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub jitter: bool,
    /// Give up once this much time has passed.
    pub max_wait_ms: u64,
}

impl PollConfig {
    /// Create a polling configuration with the given initial delay.
    pub fn new(initial_delay: Duration) -> Self {
        Self {
            initial_delay_ms: initial_delay.as_millis() as u64,
            ..Self::default()
        }
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_max_wait(mut self, wait: Duration) -> Self {
        self.max_wait_ms = wait.as_millis() as u64;
        self
    }

    /// Calculate the delay after a given attempt number.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped_delay = base_delay.min(self.max_delay_ms as f64);

        let final_delay = if self.jitter {
            // +/- 25%
            let jitter_factor = 0.75 + (rand::random::<f64>() * 0.5);
            capped_delay * jitter_factor
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay as u64)
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            backoff_multiplier: 1.5,
            jitter: true,
            max_wait_ms: 10 * 60 * 1000,
        }
    }
}

/// Runs a readiness check until it reports ready.
pub struct Poller {
    config: PollConfig,
}

impl Poller {
    /// Create a new poller.
    pub fn new(config: PollConfig) -> Self {
        Self { config }
    }

    /// Call `check` until it returns `true`.
    ///
    /// Errors from `check` are returned immediately; a peer that answers is
    /// not retried past a failure it reported.
    ///
    /// # Errors
    /// - `check` fails
    /// - The total wait exceeds `max_wait_ms`
    pub async fn until_ready<F, Fut>(&self, what: &str, check: F) -> Result<()>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        let started = Instant::now();
        let max_wait = Duration::from_millis(self.config.max_wait_ms);
        let mut attempt = 0;

        loop {
            if check().await? {
                if attempt > 0 {
                    debug!(what, attempts = attempt + 1, "Peer ready");
                }
                return Ok(());
            }

            let delay = self.config.delay_for_attempt(attempt);
            if started.elapsed() + delay > max_wait {
                return Err(Error::Network(format!(
                    "gave up waiting for {} after {:?}",
                    what,
                    started.elapsed()
                )));
            }

            attempt += 1;
            sleep(delay).await;
        }
    }
}
