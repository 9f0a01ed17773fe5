// src/pipeline/retry.rs
use std::future::Future;
use std::time::Duration;

use metrics::counter;
use tracing::warn;

use crate::error::GeocodeError;

/// Bounded retry with exponential backoff. Only errors for which
/// [`GeocodeError::is_retryable`] holds are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first call.
    pub max_retries: u8,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
        }
    }

    pub fn with_retries(mut self, retries: u8) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sleep before retry number `attempt` (1-based): base, 2x base, 4x base...
    pub fn delay_for(&self, attempt: u8) -> Duration {
        let shift = u32::from(attempt.saturating_sub(1)).min(16);
        self.base_delay.saturating_mul(1u32 << shift)
    }

    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, GeocodeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GeocodeError>>,
    {
        let mut attempt: u8 = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.delay_for(attempt);
                    warn!(
                        target: "geocode",
                        error = %e,
                        attempt,
                        max = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "retryable geocoding error; backing off"
                    );
                    counter!("tract_geocode_retries_total").increment(1);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
