//! Single-purpose deadline timers.
//!
//! Every adapter owns one [`Timer`] per purpose (handshake wait, reconnect backoff,
//! retry tick, phase timeout, ...). Timers never fire on their own: the adapter's
//! `poll(now)` asks each one whether it has expired. Starting a running timer
//! replaces its deadline, so a purpose can never have two pending firings.
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default)]
pub struct Timer {
    deadline: Option<Instant>,
}

impl Timer {
    pub fn new() -> Self {
        Self { deadline: None }
    }

    /// Arm (or re-arm) the timer to fire `after` from `now`.
    pub fn start(&mut self, now: Instant, after: Duration) {
        self.deadline = Some(now + after);
    }

    pub fn stop(&mut self) {
        self.deadline = None;
    }

    pub fn is_active(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns true exactly once when the deadline has passed, disarming the timer.
    pub fn fired(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(at) if at <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

/// Earliest of a set of optional deadlines.
pub fn earliest<I: IntoIterator<Item = Option<Instant>>>(deadlines: I) -> Option<Instant> {
    deadlines.into_iter().flatten().min()
}
