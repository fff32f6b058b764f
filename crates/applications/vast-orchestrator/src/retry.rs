//! Bounded retry for provider calls
//!
//! Only transient failures ([`crate::error::VastError::is_transient`]) are retried, with a
//! fixed backoff. Non-idempotent calls (instance creation) use
//! [`RetryPolicy::once`] so a lost response can't rent a second machine.

use crate::error::Result;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Default attempts for idempotent calls
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// Default delay between attempts
pub const DEFAULT_BACKOFF_SECS: u64 = 15;

/// Fixed-backoff retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub attempts: u32,
    /// Delay between attempts
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            backoff: Duration::from_secs(DEFAULT_BACKOFF_SECS),
        }
    }
}

impl RetryPolicy {
    /// Create a policy
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }

    /// Single attempt, no retry
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.attempts => {
                    warn!(
                        attempt,
                        max_attempts = self.attempts,
                        "{} failed: {}; retrying in {:?}",
                        what,
                        e,
                        self.backoff
                    );
                    tokio::time::sleep(self.backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VastError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retries_transient_until_exhausted() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::ZERO);

        let result: Result<()> = policy
            .run("show instances", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(VastError::transport("connection reset"))
            })
            .await;

        assert!(matches!(result, Err(VastError::Transport(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::ZERO);

        let result: Result<()> = policy
            .run("show user", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(VastError::Api {
                    status: 401,
                    body: "unauthorized".into(),
                })
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_once_never_retries() {
        let calls = AtomicU32::new(0);

        let result: Result<()> = RetryPolicy::once()
            .run("create instance", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(VastError::transport("timeout"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovers_after_transient() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::ZERO);

        let value = policy
            .run("search offers", || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(VastError::Api {
                        status: 502,
                        body: String::new(),
                    })
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
