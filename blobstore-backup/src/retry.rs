//! Fixed-count retry for flaky remote listing calls.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::utils::{BackupError, Result};

pub const DEFAULT_ATTEMPTS: usize = 3;
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(5);

/// How often and how far apart a wrapped call is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: usize, backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }

    /// Same attempt count, no sleeping between attempts.
    pub fn immediate(attempts: usize) -> Self {
        Self::new(attempts, Duration::ZERO)
    }
}

/// Runs `operation` until it succeeds or `policy.attempts` calls have failed.
///
/// Only the listing path goes through here. Copies are never retried because
/// a half-applied copy has to be re-planned rather than replayed.
pub async fn retry<T, F, Fut>(policy: RetryPolicy, context: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut failures = Vec::with_capacity(attempts);

    for attempt in 1..=attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                warn!("{} (attempt {}/{}): {}", context, attempt, attempts, e);
                failures.push(e.to_string());
            }
        }

        if attempt < attempts && !policy.backoff.is_zero() {
            tokio::time::sleep(policy.backoff).await;
        }
    }

    Err(BackupError::RetriesExhausted {
        context: context.to_string(),
        attempts: failures,
    })
}
