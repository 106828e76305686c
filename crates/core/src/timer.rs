//! Retransmission timer with exponential backoff.
//!
//! The timer is passive: it stores a deadline and the caller polls it with
//! the current time. Each expiry doubles the timeout up to [`MAX_TIMEOUT`]
//! and counts towards the retransmission limit. Stopping the timer (a new
//! flight begins) resets both.

use crate::error::{Error, Result};
use std::time::{Duration, Instant};

/// Ceiling for the doubled timeout.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeouts after which a connection may fall back to a smaller MTU.
pub const MTU_FALLBACK_TIMEOUTS: u32 = 2;

#[derive(Debug, Clone)]
pub struct RetransmitTimer {
    initial: Duration,
    current: Duration,
    deadline: Option<Instant>,
    timeouts: u32,
    max_timeouts: u32,
}

impl RetransmitTimer {
    /// An initial timeout above [`MAX_TIMEOUT`] is clamped to it.
    pub fn new(initial: Duration, max_timeouts: u32) -> Self {
        let initial = initial.min(MAX_TIMEOUT);
        Self {
            initial,
            current: initial,
            deadline: None,
            timeouts: 0,
            max_timeouts,
        }
    }

    /// Arm the timer for the current timeout from `now`.
    pub fn start(&mut self, now: Instant) {
        let deadline = now
            .checked_add(self.current)
            .or_else(|| now.checked_add(MAX_TIMEOUT))
            .unwrap_or(now);
        self.deadline = Some(deadline);
    }

    /// Disarm and reset the backoff and timeout count.
    pub fn stop(&mut self) {
        self.deadline = None;
        self.current = self.initial;
        self.timeouts = 0;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    /// Handle an expiry: double the timeout, count it, and re-arm.
    ///
    /// # Errors
    /// Returns `Error::TimedOut` once more than `max_timeouts` expiries have
    /// been counted; the timer is left disarmed.
    pub fn back_off(&mut self, now: Instant) -> Result<()> {
        self.current = (self.current * 2).min(MAX_TIMEOUT);
        self.record_timeout()?;
        self.start(now);
        Ok(())
    }

    /// Count a retransmission that was not caused by expiry.
    pub fn record_timeout(&mut self) -> Result<()> {
        self.timeouts += 1;
        if self.timeouts > self.max_timeouts {
            self.deadline = None;
            return Err(Error::TimedOut {
                timeouts: self.timeouts,
            });
        }
        Ok(())
    }

    /// Expiries counted since the last stop.
    pub fn timeouts(&self) -> u32 {
        self.timeouts
    }

    /// Timeout the next arm will use.
    pub fn current_timeout(&self) -> Duration {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry() {
        let base = Instant::now();
        let mut timer = RetransmitTimer::new(Duration::from_secs(1), 12);
        assert!(!timer.is_expired(base + Duration::from_secs(100)));

        timer.start(base);
        assert!(!timer.is_expired(base + Duration::from_millis(999)));
        assert!(timer.is_expired(base + Duration::from_secs(1)));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Instant::now();
        let mut timer = RetransmitTimer::new(Duration::from_secs(1), 20);
        timer.start(base);

        let mut expected = Duration::from_secs(1);
        for _ in 0..10 {
            timer.back_off(base).unwrap();
            expected = (expected * 2).min(MAX_TIMEOUT);
            assert_eq!(timer.current_timeout(), expected);
            assert_eq!(timer.deadline(), Some(base + expected));
        }
        assert_eq!(timer.current_timeout(), MAX_TIMEOUT);
    }

    #[test]
    fn test_stop_resets() {
        let base = Instant::now();
        let mut timer = RetransmitTimer::new(Duration::from_secs(1), 12);
        timer.start(base);
        timer.back_off(base).unwrap();
        timer.back_off(base).unwrap();
        assert_eq!(timer.timeouts(), 2);

        timer.stop();
        assert!(timer.deadline().is_none());
        assert_eq!(timer.timeouts(), 0);
        assert_eq!(timer.current_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_limit() {
        let base = Instant::now();
        let mut timer = RetransmitTimer::new(Duration::from_millis(10), 3);
        timer.start(base);
        for _ in 0..3 {
            timer.back_off(base).unwrap();
        }
        assert!(matches!(
            timer.back_off(base),
            Err(Error::TimedOut { timeouts: 4 })
        ));
        assert!(timer.deadline().is_none());
    }

    #[test]
    fn test_oversized_initial_timeout_is_clamped() {
        let base = Instant::now();
        let mut timer = RetransmitTimer::new(Duration::from_secs(u64::MAX), 12);
        assert_eq!(timer.current_timeout(), MAX_TIMEOUT);

        timer.start(base);
        assert_eq!(timer.deadline(), Some(base + MAX_TIMEOUT));

        timer.back_off(base).unwrap();
        assert_eq!(timer.current_timeout(), MAX_TIMEOUT);
    }
}
