//! Retry timer
//!
//! A single cancellable scheduled task owned by the connection. The owner
//! polls it with the current time; nothing runs in the background.

use std::time::{Duration, Instant};

/// At most one pending reconnect deadline
#[derive(Debug, Default)]
pub struct RetryTimer {
    deadline: Option<Instant>,
}

impl RetryTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer. Returns false if it was already armed (left untouched).
    pub fn schedule(&mut self, now: Instant, delay: Duration) -> bool {
        if self.deadline.is_some() {
            return false;
        }
        self.deadline = Some(now + delay);
        true
    }

    /// Disarm the timer. Returns true if it was armed.
    pub fn cancel(&mut self) -> bool {
        self.deadline.take().is_some()
    }

    pub fn is_active(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Disarm and report true if the deadline has passed at `now`
    pub fn fire_if_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_active_timer() {
        let now = Instant::now();
        let mut timer = RetryTimer::new();

        assert!(timer.schedule(now, Duration::from_millis(200)));
        assert!(!timer.schedule(now, Duration::from_millis(10)));
        assert_eq!(timer.deadline(), Some(now + Duration::from_millis(200)));
    }

    #[test]
    fn test_fire_only_when_due() {
        let now = Instant::now();
        let mut timer = RetryTimer::new();
        timer.schedule(now, Duration::from_millis(200));

        assert!(!timer.fire_if_due(now + Duration::from_millis(199)));
        assert!(timer.is_active());
        assert!(timer.fire_if_due(now + Duration::from_millis(200)));
        assert!(!timer.is_active());
        assert!(!timer.fire_if_due(now + Duration::from_secs(10)));
    }

    #[test]
    fn test_cancel() {
        let now = Instant::now();
        let mut timer = RetryTimer::new();
        assert!(!timer.cancel());

        timer.schedule(now, Duration::ZERO);
        assert!(timer.cancel());
        assert!(!timer.fire_if_due(now));
    }
}
