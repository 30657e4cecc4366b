//! Exponential backoff for dialing and reconciling

use std::future::Future;
use std::time::Duration;

use hubsync_core::{RetryConfig, SyncError};
use tracing::warn;

/// Retry policy: delays double from `initial` up to `max`
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    /// Attempts before giving up; 0 retries forever
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    #[must_use]
    pub fn new(initial: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            initial,
            max: max.max(initial),
            max_attempts,
            attempt: 0,
        }
    }

    /// Attempts made so far
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether another attempt is allowed
    #[must_use]
    pub fn should_retry(&self) -> bool {
        self.max_attempts == 0 || self.attempt < self.max_attempts
    }

    /// Record an attempt and return how long to wait before the next one
    pub fn next_delay(&mut self) -> Duration {
        let shift = self.attempt.min(16);
        self.attempt += 1;
        self.initial.saturating_mul(1 << shift).min(self.max)
    }

    /// Start over after a success
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl From<&RetryConfig> for Backoff {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.max_attempts,
        )
    }
}

/// Run `op` until it succeeds or the policy runs out, returning the last error
///
/// The policy is reset on success, so a long-lived caller can keep one
/// across separate outages.
pub async fn retry<T, F, Fut>(policy: &mut Backoff, what: &str, mut op: F) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
{
    loop {
        match op().await {
            Ok(value) => {
                policy.reset();
                return Ok(value);
            }
            Err(e) => {
                let delay = policy.next_delay();
                if !policy.should_retry() {
                    warn!("{what} failed after {} attempts: {e}", policy.attempt());
                    return Err(e);
                }
                warn!(
                    "{what} failed (attempt {}), retrying in {delay:?}: {e}",
                    policy.attempt()
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delays_double_then_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(500), 0);
        let delays: Vec<_> = (0..5).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
        assert!(backoff.should_retry());

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_attempt_limit() {
        let mut backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(1), 2);
        assert!(backoff.should_retry());
        backoff.next_delay();
        assert!(backoff.should_retry());
        backoff.next_delay();
        assert!(!backoff.should_retry());
    }

    #[test]
    fn test_from_config() {
        let backoff = Backoff::from(&RetryConfig::default());
        assert_eq!(backoff.initial, Duration::from_millis(200));
        assert_eq!(backoff.max, Duration::from_secs(10));
        assert_eq!(backoff.max_attempts, 8);
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut policy = Backoff::new(Duration::from_millis(1), Duration::from_millis(2), 5);

        let result = retry(&mut policy, "flaky", || {
            let calls = Arc::clone(&calls);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(SyncError::Disconnected)
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(policy.attempt(), 0, "success starts the policy over");
    }

    #[tokio::test]
    async fn test_retry_gives_up_with_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut policy = Backoff::new(Duration::from_millis(1), Duration::from_millis(1), 3);

        let result: Result<(), _> = retry(&mut policy, "hopeless", || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SyncError::Protocol("nope".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(SyncError::Protocol(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
