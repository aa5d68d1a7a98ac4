//! Polling for reports that are produced asynchronously by a backend
//!
//! Attempt `n` that is not ready is followed by a wait of
//! `interval * n * (n + 1) / 2`. Polling stops at the overall deadline.

use crate::error::ClientError;
use crate::shutdown::ShutdownSequence;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Polling cadence and overall deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollingConfig {
    pub interval_millis: u64,
    pub polling_timeout_millis: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_millis: 1_000,
            polling_timeout_millis: 60_000,
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_millis)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.polling_timeout_millis)
    }
}

/// Outcome of one polling attempt
#[derive(Debug)]
pub enum PollState<T> {
    Ready(T),
    Pending,
}

/// Wait before the attempt following attempt `n` (1-based)
pub fn triangular_delay(interval: Duration, attempt: u32) -> Duration {
    let n = attempt as u64;
    let factor = n * (n + 1) / 2;
    interval.saturating_mul(factor.min(u32::MAX as u64) as u32)
}

/// Call `attempt` until it reports ready, the deadline passes, or shutdown starts
pub async fn poll_until_ready<T, F, Fut>(
    config: PollingConfig,
    shutdown: &ShutdownSequence,
    mut attempt: F,
) -> Result<T, ClientError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<PollState<T>, ClientError>>,
{
    let start = Instant::now();
    let deadline = start + config.timeout();
    let mut n: u32 = 0;

    loop {
        if shutdown.is_shutting_down() {
            return Err(ClientError::ShuttingDown);
        }

        n += 1;
        if let PollState::Ready(value) = attempt().await? {
            return Ok(value);
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(ClientError::Timeout(config.polling_timeout_millis));
        }

        let delay = triangular_delay(config.interval(), n).min(deadline - now);
        debug!(attempt = n, delay_ms = delay.as_millis() as u64, "Report not ready, polling again");
        tokio::time::sleep(delay).await;
    }
}
