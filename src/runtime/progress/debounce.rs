// SPDX-License-Identifier: MIT

//! Report debouncing

use std::time::{Duration, Instant};

/// Decides whether a progress report should be emitted.
///
/// A report goes out when the value changed since the last report, or when
/// at least `interval` has passed since the last report.
#[derive(Debug, Clone)]
pub struct ProgressDebouncer {
    interval: Duration,
    last_report: Instant,
    last_value: f64,
}

impl ProgressDebouncer {
    pub fn new(interval: Duration, initial_value: f64, now: Instant) -> Self {
        Self {
            interval,
            last_report: now,
            last_value: initial_value,
        }
    }

    pub fn should_report(&self, value: f64, now: Instant) -> bool {
        value != self.last_value || now.saturating_duration_since(self.last_report) >= self.interval
    }

    pub fn mark_reported(&mut self, value: f64, now: Instant) {
        self.last_value = value;
        self.last_report = now;
    }

    /// `should_report` and `mark_reported` in one step
    pub fn check(&mut self, value: f64, now: Instant) -> bool {
        if self.should_report(value, now) {
            self.mark_reported(value, now);
            true
        } else {
            false
        }
    }
}
