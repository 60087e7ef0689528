//! Linear reconnect backoff with a cap and a bounded attempt budget.

use std::time::Duration;

/// Delay added per consecutive failed attempt.
pub const DEFAULT_STEP: Duration = Duration::from_secs(2);

/// Longest delay between two attempts.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Consecutive reconnect attempts before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Reconnect schedule: `min(attempt * step, max_delay)` for at most
/// `max_attempts` consecutive attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub step: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            step: DEFAULT_STEP,
            max_delay: DEFAULT_MAX_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    /// A policy that never reconnects.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Sets the per-attempt step.
    pub fn with_step(mut self, step: Duration) -> Self {
        self.step = step;
        self
    }

    /// Sets the delay cap.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Sets the attempt budget.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Delay before reconnect attempt number `attempt` (1-based), or `None`
    /// once the budget is spent or reconnecting is disabled.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if !self.enabled || attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        Some(self.step.saturating_mul(attempt).min(self.max_delay))
    }
}

/// Consecutive-failure counter paired with a policy.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempts: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    /// Records a failure and returns the delay before the next attempt, or
    /// `None` when no attempt should follow.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let attempt = self.attempts.saturating_add(1);
        let delay = self.policy.delay_for(attempt)?;
        self.attempts = attempt;
        Some(delay)
    }

    /// Called after a successful open.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }
}
