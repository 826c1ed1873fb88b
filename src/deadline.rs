//! Run-wide deadline propagated into every suspension point.

use std::time::{Duration, Instant};

/// Absolute cutoff for the run's token and API work. Copied freely; every
/// network await caps its own timeout against the remaining budget.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
        }
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// Time left before the cutoff, zero once past it.
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    /// Per-operation timeout bounded by the remaining run budget.
    pub fn cap(&self, op_timeout: Duration) -> Duration {
        op_timeout.min(self.remaining())
    }
}
