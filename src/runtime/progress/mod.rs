// SPDX-License-Identifier: MIT

//! Progress inference for long-running commands
//!
//! This module provides:
//! - `ProgressParser` - maps accumulated output to a progress value
//! - `PatternProgressParser` - ordered weighted regex rules, last match wins
//! - `ProgressTracker` - enforces the monotonic floor within one execution
//! - `ProgressDebouncer` - bounds how often reports are emitted
//! - `ProgressReporter` - sink for reports (log, channel, ...)

mod debounce;
mod patterns;

pub use debounce::ProgressDebouncer;
pub use patterns::{
    build_progress_parser, PatternProgressParser, ProgressPattern, ProgressPatternDef,
};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Progress of one command execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressState {
    pub current: f64,
    pub total: f64,
    pub last_message: Option<String>,
}

impl ProgressState {
    pub fn new(total: f64) -> Self {
        Self {
            current: 0.0,
            total,
            last_message: None,
        }
    }

    /// Fraction complete in `0.0..=1.0`
    pub fn fraction(&self) -> f64 {
        if self.total <= 0.0 {
            return 0.0;
        }
        (self.current / self.total).clamp(0.0, 1.0)
    }
}

impl Default for ProgressState {
    fn default() -> Self {
        Self::new(100.0)
    }
}

/// A value proposed by a parser
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub value: f64,
    pub message: Option<String>,
}

/// Maps cumulative output plus current progress to a proposed new value.
///
/// Implementations must be pure: the same input gives the same answer.
pub trait ProgressParser: Send + Sync {
    fn parse(&self, output: &str, state: &ProgressState) -> Option<ProgressUpdate>;
}

impl<F> ProgressParser for F
where
    F: Fn(&str, &ProgressState) -> Option<ProgressUpdate> + Send + Sync,
{
    fn parse(&self, output: &str, state: &ProgressState) -> Option<ProgressUpdate> {
        self(output, state)
    }
}

/// Applies parser output to a `ProgressState` without ever moving backwards
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    state: ProgressState,
}

impl ProgressTracker {
    pub fn new(total: f64) -> Self {
        Self {
            state: ProgressState::new(total),
        }
    }

    pub fn state(&self) -> &ProgressState {
        &self.state
    }

    /// Run the parser over `output`; returns true if the value moved forward.
    pub fn observe(&mut self, parser: &dyn ProgressParser, output: &str) -> bool {
        let Some(update) = parser.parse(output, &self.state) else {
            return false;
        };
        self.apply(update)
    }

    /// Apply an update. Lower values are ignored; the message is only
    /// taken together with a forward move.
    pub fn apply(&mut self, update: ProgressUpdate) -> bool {
        let value = update.value.min(self.state.total);
        if value <= self.state.current {
            return false;
        }
        self.state.current = value;
        if update.message.is_some() {
            self.state.last_message = update.message;
        }
        true
    }
}

/// A progress report handed to a `ProgressReporter`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub current: f64,
    pub total: f64,
    pub message: Option<String>,
    pub elapsed_ms: u64,
}

impl ProgressReport {
    pub fn from_state(state: &ProgressState, elapsed_ms: u64) -> Self {
        Self {
            current: state.current,
            total: state.total,
            message: state.last_message.clone(),
            elapsed_ms,
        }
    }
}

/// Sink for progress reports
pub trait ProgressReporter: Send + Sync {
    fn report(&self, report: &ProgressReport);
}

impl ProgressReporter for mpsc::UnboundedSender<ProgressReport> {
    fn report(&self, report: &ProgressReport) {
        // Receiver gone means nobody is listening any more
        let _ = self.send(report.clone());
    }
}

/// Writes progress reports through the `log` facade
pub struct LogReporter {
    label: String,
}

impl LogReporter {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl ProgressReporter for LogReporter {
    fn report(&self, report: &ProgressReport) {
        log::info!(
            "[{}] {:.0}/{:.0} ({}s) {}",
            self.label,
            report.current,
            report.total,
            report.elapsed_ms / 1000,
            report.message.as_deref().unwrap_or("working")
        );
    }
}
