//! Redelivery of outbound frames that asked for an acknowledgment.
//!
//! The gateway echoes an acknowledged frame back verbatim, so an entry is
//! matched by exact text. Unacknowledged frames are resent every
//! [`RESEND_AFTER`] up to [`MAX_RESENDS`] times and then dropped with a warning.
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::logutil::escape_log;
use crate::mesh::codec;
use crate::metrics;
use crate::timer::Timer;

pub const MAX_RESENDS: u8 = 5;
pub const RESEND_AFTER: Duration = Duration::from_millis(800);
pub const TICK: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRetry {
    pub raw: String,
    pub attempts_remaining: u8,
    pub last_sent_at: Instant,
}

#[derive(Debug, Default)]
pub struct RetryQueue {
    entries: Vec<PendingRetry>,
    tick: Timer,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// A frame is tracked only when the caller asked for an ack and the frame's
    /// own ack field is `1`.
    pub fn is_eligible(raw: &str, request_ack: bool) -> bool {
        request_ack && codec::ack_requested(raw)
    }

    /// Start tracking a frame that was just written to the port.
    pub fn track(&mut self, raw: &str, now: Instant) {
        self.entries.push(PendingRetry {
            raw: raw.to_string(),
            attempts_remaining: MAX_RESENDS,
            last_sent_at: now,
        });
        if !self.tick.is_active() {
            self.tick.start(now, TICK);
        }
    }

    /// Remove every entry whose text equals `line`; returns the first one removed.
    pub fn acknowledge(&mut self, line: &str) -> Option<PendingRetry> {
        let mut acked = None;
        self.entries.retain(|e| {
            if e.raw == line {
                if acked.is_none() {
                    acked = Some(e.clone());
                }
                false
            } else {
                true
            }
        });
        if acked.is_some() {
            metrics::inc_mesh_acked();
            debug!("mesh: ack received for {}", escape_log(line));
            if self.entries.is_empty() {
                self.tick.stop();
            }
        }
        acked
    }

    /// Run one tick if it is due. Returns the frames to write again, in order.
    pub fn poll(&mut self, now: Instant) -> Vec<String> {
        if !self.tick.fired(now) {
            return Vec::new();
        }
        let mut resend = Vec::new();
        self.entries.retain_mut(|e| {
            if now.duration_since(e.last_sent_at) < RESEND_AFTER {
                return true;
            }
            if e.attempts_remaining == 0 {
                metrics::inc_mesh_retry_dropped();
                warn!("mesh: no ack received for {}", escape_log(&e.raw));
                return false;
            }
            e.attempts_remaining -= 1;
            e.last_sent_at = now;
            resend.push(e.raw.clone());
            true
        });
        if !self.entries.is_empty() {
            self.tick.start(now, TICK);
        }
        resend
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, raw: &str) -> Option<&PendingRetry> {
        self.entries.iter().find(|e| e.raw == raw)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.tick.deadline()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.tick.stop();
    }
}
