//! Retry policy applied uniformly around crawler calls.
//!
//! Attempts are paced by a fixed pause; there is no exponential backoff. Only
//! errors for which [`SyncError::is_retryable`] holds are retried, so an
//! authentication failure surfaces after the first attempt.

use crate::config::Config;
use crate::error::{Result, SyncError};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Default number of attempts, first try included.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub pause: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            pause: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, pause: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            pause,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.sync_max_attempts, config.retry_pause)
    }

    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    warn!(
                        "{} failed (attempt {}/{}): {}",
                        operation, attempt, self.max_attempts, e
                    );
                    attempt += 1;
                    if !self.pause.is_zero() {
                        tokio::time::sleep(self.pause).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Maps a timeout of `fut` to [`SyncError::NavigationTimeout`].
pub async fn with_timeout<T, Fut>(what: &str, timeout: Duration, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::NavigationTimeout {
            what: what.to_string(),
            timeout,
        }),
    }
}
