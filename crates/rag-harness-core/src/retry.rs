//! Exponential backoff shared by the embedding client and the ingestion queue.

use std::time::Duration;

use crate::error::{ErrorKind, RagError};

/// Retry budget and backoff curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let delay = self.base.saturating_mul(1u32 << exp);
        delay.min(self.cap)
    }

    /// Whether an item that just failed its `attempt`-th try should run again.
    pub fn should_retry(&self, err: &RagError, attempt: u32) -> bool {
        attempt < self.max_attempts && is_queue_retryable(err)
    }
}

/// Kinds the ingestion queue retries.
pub fn is_queue_retryable(err: &RagError) -> bool {
    matches!(
        err.kind(),
        ErrorKind::Timeout | ErrorKind::Network | ErrorKind::RateLimit | ErrorKind::ModelUnavailable
    ) && err.retryable()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_then_caps() {
        let p = RetryPolicy {
            max_attempts: 10,
            base: Duration::from_millis(100),
            cap: Duration::from_millis(500),
        };
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(400));
        assert_eq!(p.backoff(4), Duration::from_millis(500));
        assert_eq!(p.backoff(60), Duration::from_millis(500));
    }

    #[test]
    fn test_retry_classification() {
        let p = RetryPolicy::default();
        assert!(p.should_retry(&RagError::Timeout("slow".into()), 1));
        assert!(!p.should_retry(&RagError::Timeout("slow".into()), 3));
        assert!(!p.should_retry(&RagError::validation("bad"), 1));
        let permanent = RagError::ModelUnavailable {
            model_id: "x".into(),
            reason: "unknown".into(),
            retryable: false,
        };
        assert!(!p.should_retry(&permanent, 1));
    }
}
