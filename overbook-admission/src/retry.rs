use std::future::Future;
use std::time::Duration;
use tracing::warn;

use overbook_core::repository::QueueError;

/// Fixed-delay, fixed-attempts retry for queue connection failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            attempts: 1,
            delay: Duration::ZERO,
        }
    }

    /// Whether a failed `attempt` (1-based) may be followed by another.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.attempts
    }

    /// Runs `op` until it succeeds, fails with a non-connection error, or
    /// the attempts are used up.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, QueueError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, QueueError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Err(QueueError::Connection(e)) if self.allows_retry(attempt) => {
                    warn!(
                        "{} attempt {}/{} failed: {}. Retrying in {:?}",
                        what, attempt, self.attempts, e, self.delay
                    );
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
