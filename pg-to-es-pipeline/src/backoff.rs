//! Exponential backoff for transient failures.

use std::time::Duration;
use tokio::time::Instant;

/// Exponential backoff settings shared by every retry loop of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound of any single delay.
    pub cap: Duration,
    /// Give up once failures have lasted this long. `None` retries forever.
    pub max_downtime: Option<Duration>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            cap: Duration::from_secs(10),
            max_downtime: None,
        }
    }
}

impl BackoffPolicy {
    /// Create a policy without a downtime limit.
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            max_downtime: None,
        }
    }

    /// Set the downtime limit.
    pub fn with_max_downtime(mut self, max_downtime: Duration) -> Self {
        self.max_downtime = Some(max_downtime);
        self
    }

    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`,
    /// capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.base.saturating_mul(factor).min(self.cap)
    }
}

/// Progress of one run of consecutive failures.
#[derive(Debug)]
pub struct RetryState {
    policy: BackoffPolicy,
    attempt: u32,
    failing_since: Option<Instant>,
}

impl RetryState {
    /// Start with no failures recorded.
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            failing_since: None,
        }
    }

    /// Number of failures recorded since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Downtime limit of the policy.
    pub fn max_downtime(&self) -> Option<Duration> {
        self.policy.max_downtime
    }

    /// Record a failure and return how long to wait before retrying, or `None`
    /// when the failures have outlasted the maximum downtime.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let since = *self.failing_since.get_or_insert_with(Instant::now);
        if let Some(limit) = self.policy.max_downtime {
            if since.elapsed() >= limit {
                return None;
            }
        }

        let delay = self.policy.delay(self.attempt);
        self.attempt += 1;
        Some(delay)
    }

    /// Forget recorded failures after a success.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.failing_since = None;
    }
}
