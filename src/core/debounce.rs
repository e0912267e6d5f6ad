// src/core/debounce.rs
use std::time::Duration;
use tokio::time::Instant;

use crate::core::entity::{coalesce, FieldPatch};

/// Trailing-edge debounce over field patches.
///
/// Holds the coalesced not-yet-sent change and the instant it becomes due.
/// The owner sleeps until `deadline()` and then calls `take()`; every
/// `schedule()` pushes the deadline out again.
#[derive(Debug)]
pub struct Debouncer {
    delay: Duration,
    pending: Option<FieldPatch>,
    deadline: Option<Instant>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: None,
            deadline: None,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Coalesce `change` with anything pending and re-arm the timer.
    pub fn schedule(&mut self, change: FieldPatch, now: Instant) {
        match self.pending.as_mut() {
            Some(pending) => coalesce(pending, change),
            None => self.pending = Some(change),
        }
        self.deadline = Some(now + self.delay);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Return the pending change if its quiet period has elapsed.
    pub fn take_due(&mut self, now: Instant) -> Option<FieldPatch> {
        match self.deadline {
            Some(at) if at <= now => self.take(),
            _ => None,
        }
    }

    /// Disarm and hand back whatever is pending.
    pub fn take(&mut self) -> Option<FieldPatch> {
        self.deadline = None;
        self.pending.take()
    }
}
