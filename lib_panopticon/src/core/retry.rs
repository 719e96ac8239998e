//! # Reconnect Pacing
//!
//! Two pieces shared by the WebSocket client and the store pollers:
//!
//! - [`RetryPolicy`] turns a failure count into the delay to sleep before the
//!   next attempt. With `max_delay <= min_interval` (the default) the delay is
//!   constant; a larger `max_delay` gives capped exponential backoff.
//! - [`RetryPacer`] is the gate in front of every connection attempt. It
//!   guarantees two attempts of the same source are never closer together than
//!   `min_interval`, whatever path led to the second attempt.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub min_interval: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn fixed(interval: Duration) -> Self {
        Self {
            min_interval: interval,
            max_delay: interval,
        }
    }

    pub fn new(min_interval: Duration, max_delay: Duration) -> Self {
        Self { min_interval, max_delay }
    }

    /// Delay before the attempt following the `failures`-th consecutive failure.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let cap = self.max_delay.max(self.min_interval);
        let exponent = failures.saturating_sub(1).min(16);
        self.min_interval
            .checked_mul(1u32 << exponent)
            .unwrap_or(cap)
            .min(cap)
    }
}

#[derive(Debug)]
pub struct RetryPacer {
    policy: RetryPolicy,
    last_attempt: Option<Instant>,
}

impl RetryPacer {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            last_attempt: None,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// When the last allowed attempt started.
    pub fn last_attempt(&self) -> Option<Instant> {
        self.last_attempt
    }

    /// Waits until an attempt is allowed, then records it as started.
    ///
    /// Returns `false` if `shutdown` fired while waiting; no attempt is
    /// recorded in that case.
    pub async fn wait_turn(&mut self, shutdown: &CancellationToken) -> bool {
        if let Some(last) = self.last_attempt {
            let ready_at = last + self.policy.min_interval;
            if Instant::now() < ready_at {
                log::debug!(
                    "Waiting {:.1}s before reconnection attempt",
                    (ready_at - Instant::now()).as_secs_f64()
                );
                tokio::select! {
                    _ = shutdown.cancelled() => return false,
                    _ = tokio::time::sleep_until(ready_at) => {}
                }
            }
        }
        if shutdown.is_cancelled() {
            return false;
        }
        self.last_attempt = Some(Instant::now());
        true
    }
}

/// Sleeps for `delay` unless `shutdown` fires first. Returns `false` on shutdown.
pub async fn sleep_or_shutdown(delay: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_is_fixed_interval() {
        let policy = RetryPolicy::fixed(Duration::from_secs(1));
        for failures in 0..10 {
            assert_eq!(policy.delay_for(failures), Duration::from_secs(1));
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(Duration::from_millis(500), Duration::from_secs(3));
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(4), Duration::from_secs(3));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(3));
    }

    #[test]
    fn test_max_below_min_never_undercuts_min() {
        let policy = RetryPolicy::new(Duration::from_secs(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for(5), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacer_enforces_min_interval() {
        let token = CancellationToken::new();
        let mut pacer = RetryPacer::new(RetryPolicy::fixed(Duration::from_secs(1)));

        let start = Instant::now();
        assert!(pacer.wait_turn(&token).await);
        assert_eq!(Instant::now(), start);

        tokio::time::advance(Duration::from_millis(300)).await;
        assert!(pacer.wait_turn(&token).await);
        assert!(Instant::now() - start >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacer_does_not_wait_when_interval_elapsed() {
        let token = CancellationToken::new();
        let mut pacer = RetryPacer::new(RetryPolicy::fixed(Duration::from_secs(1)));
        assert!(pacer.wait_turn(&token).await);

        tokio::time::advance(Duration::from_secs(5)).await;
        let before = Instant::now();
        assert!(pacer.wait_turn(&token).await);
        assert_eq!(Instant::now(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacer_wait_is_cancellable() {
        let token = CancellationToken::new();
        let mut pacer = RetryPacer::new(RetryPolicy::fixed(Duration::from_secs(60)));
        assert!(pacer.wait_turn(&token).await);

        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        });
        assert!(!pacer.wait_turn(&token).await);
    }
}
