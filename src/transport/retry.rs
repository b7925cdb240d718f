//! Retry policy for opening hardware links.
//!
//! When several drivers start at once, USB-serial adapters are sometimes not
//! enumerated yet. Opening a link is therefore retried a few times before
//! giving up. Round-trips on an open link are never retried here.

use crate::error::{DeviceError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// The maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// The delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Run `operation` until it succeeds or the attempts are used up. The
    /// last error is returned.
    pub async fn run<T, F, Fut>(&self, what: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            info!("{} attempt {}...", what, attempt);
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    warn!(attempt, error = %err, "{} failed", what);
                    last_error = Some(err);
                    if attempt < attempts {
                        sleep(self.backoff_delay).await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| DeviceError::transport(what, "no attempt made")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[tokio::test]
    async fn test_retry_logic_succeeds() {
        let attempts = Cell::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(10),
        };
        let result = policy
            .run("Connection", || {
                attempts.set(attempts.get() + 1);
                let n = attempts.get();
                async move {
                    if n >= 2 {
                        Ok(n)
                    } else {
                        Err(DeviceError::transport("COM1", "not found"))
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts.get(), 2);
    }

    #[tokio::test]
    async fn test_retry_logic_fails() {
        let attempts = Cell::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(10),
        };
        let result: Result<()> = policy
            .run("Connection", || {
                attempts.set(attempts.get() + 1);
                async { Err(DeviceError::transport("COM1", "not found")) }
            })
            .await;
        assert!(result.unwrap_err().is_transport());
        assert_eq!(attempts.get(), 3);
    }
}
