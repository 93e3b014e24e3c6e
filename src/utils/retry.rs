use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tokio::time::Instant;

/// Fixed-delay retry policy with a hard overall budget.
#[derive(Debug, Clone, Copy)]
pub struct RetryStrategy {
    /// Total time attempts may take, including the delays between them.
    pub total: Duration,
    /// Pause between consecutive attempts.
    pub delay: Duration,
}

impl RetryStrategy {
    pub fn new(total: Duration, delay: Duration) -> Self {
        Self { total, delay }
    }

    /// Run `attempt` until it succeeds or the budget is spent. The error of
    /// the last attempt is returned when the budget runs out.
    pub async fn run<T, F, Fut>(&self, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let deadline = Instant::now() + self.total;
        loop {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if Instant::now() + self.delay >= deadline {
                        return Err(err);
                    }
                    tracing::debug!("attempt failed, retrying in {:?}: {err:#}", self.delay);
                    tokio::time::sleep(self.delay).await;
                }
            }
        }
    }
}
