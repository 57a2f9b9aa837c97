//! Scoped countdown timer used by the transport state machine.
//!
//! All waiting in the core is expressed as repeated non-blocking polls
//! against this service; nothing blocks longer than one bounded poll.

use std::time::{Duration, Instant};

/// Countdown timer with an "expired" query.
pub trait DelayTimer {
    /// Arm the countdown for `ms` milliseconds from now.
    fn start(&mut self, ms: u32);

    /// Whether the armed countdown has elapsed.
    fn expired(&mut self) -> bool;

    /// Yield for roughly `ms` milliseconds (used for settle delays and to
    /// keep poll loops from spinning on a host CPU).
    fn sleep(&mut self, ms: u32);
}

/// Wall-clock countdown backed by [`std::time::Instant`].
#[derive(Debug, Default)]
pub struct SysTimer {
    deadline: Option<Instant>,
}

impl SysTimer {
    /// Create an unarmed timer.
    pub fn new() -> Self {
        Self::default()
    }
}

impl DelayTimer for SysTimer {
    fn start(&mut self, ms: u32) {
        self.deadline = Some(Instant::now() + Duration::from_millis(u64::from(ms)));
    }

    fn expired(&mut self) -> bool {
        self.deadline.is_none_or(|d| Instant::now() >= d)
    }

    fn sleep(&mut self, ms: u32) {
        std::thread::sleep(Duration::from_millis(u64::from(ms)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unarmed_timer_reads_expired() {
        let mut t = SysTimer::new();
        assert!(t.expired());
    }

    #[test]
    fn test_armed_timer_expires() {
        let mut t = SysTimer::new();
        t.start(1);
        t.sleep(5);
        assert!(t.expired());
    }

    #[test]
    fn test_long_countdown_not_expired_immediately() {
        let mut t = SysTimer::new();
        t.start(60_000);
        assert!(!t.expired());
    }
}
