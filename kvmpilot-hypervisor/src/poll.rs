//! Bounded polling of external state.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

use crate::error::Result;

/// Re-evaluates a check until it passes or a deadline expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Poller {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Poller {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    /// Evaluate `check` until it returns `true` or the timeout elapses.
    ///
    /// The check always runs at least once. Returns `Ok(false)` on timeout;
    /// errors from the check are returned immediately.
    pub async fn until<F, Fut>(&self, mut check: F) -> Result<bool>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        let deadline = Instant::now() + self.timeout;
        let mut attempt = 1u32;

        loop {
            if check().await? {
                trace!(attempt, "Poll condition met");
                return Ok(true);
            }
            if Instant::now() + self.interval > deadline {
                trace!(attempt, timeout = ?self.timeout, "Poll timed out");
                return Ok(false);
            }
            tokio::time::sleep(self.interval).await;
            attempt += 1;
        }
    }
}
