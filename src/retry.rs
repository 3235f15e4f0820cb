//! Retry Policy
//!
//! Decides whether a lost stream is reconnected. Fixed delay, no backoff
//! growth. The attempt counter itself lives in the connection and is only
//! reset by a fresh successful connect.

use std::time::Duration;

/// Outcome of consulting the retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule reconnect attempt number `attempt` after `delay`
    Proceed { attempt: u32, delay: Duration },

    /// Stop reconnecting; the connection is broken
    GiveUp,
}

/// Reconnect policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    enabled: bool,
    max_attempts: u32,
    delay: Duration,
}

impl RetryPolicy {
    pub fn new(enabled: bool, max_attempts: u32, delay: Duration) -> Self {
        Self {
            enabled,
            max_attempts,
            delay,
        }
    }

    /// A policy that never reconnects
    pub fn disabled() -> Self {
        Self::new(false, 0, Duration::ZERO)
    }

    /// Decide what to do after `attempts_made` reconnects since the last
    /// successful connect
    pub fn decide(&self, attempts_made: u32) -> RetryDecision {
        if !self.enabled || attempts_made >= self.max_attempts {
            return RetryDecision::GiveUp;
        }

        RetryDecision::Proceed {
            attempt: attempts_made + 1,
            delay: self.delay,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_gives_up_immediately() {
        let policy = RetryPolicy::new(false, 10, Duration::from_millis(200));
        assert_eq!(policy.decide(0), RetryDecision::GiveUp);
        assert_eq!(RetryPolicy::disabled().decide(0), RetryDecision::GiveUp);
    }

    #[test]
    fn test_proceeds_until_budget_spent() {
        let policy = RetryPolicy::new(true, 2, Duration::from_millis(200));

        assert_eq!(
            policy.decide(0),
            RetryDecision::Proceed {
                attempt: 1,
                delay: Duration::from_millis(200)
            }
        );
        assert_eq!(
            policy.decide(1),
            RetryDecision::Proceed {
                attempt: 2,
                delay: Duration::from_millis(200)
            }
        );
        assert_eq!(policy.decide(2), RetryDecision::GiveUp);
        assert_eq!(policy.decide(7), RetryDecision::GiveUp);
    }

    #[test]
    fn test_delay_is_constant() {
        let policy = RetryPolicy::new(true, 100, Duration::from_millis(50));
        for attempts in 0..10 {
            match policy.decide(attempts) {
                RetryDecision::Proceed { delay, .. } => {
                    assert_eq!(delay, Duration::from_millis(50))
                }
                RetryDecision::GiveUp => panic!("Expected Proceed"),
            }
        }
    }

    #[test]
    fn test_zero_attempts_never_retries() {
        let policy = RetryPolicy::new(true, 0, Duration::from_millis(50));
        assert_eq!(policy.decide(0), RetryDecision::GiveUp);
    }
}
