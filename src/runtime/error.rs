// SPDX-License-Identifier: MIT

//! Typed error handling for stepwise-rs
//!
//! Each layer owns a small `thiserror` enum. `StepwiseError` is the
//! top-level type the binary and embedding callers deal with.

use thiserror::Error;

use crate::stepwise::workflow::error::WorkflowError;

/// Top-level error type for stepwise-rs
#[derive(Debug, Error)]
pub enum StepwiseError {
    /// Configuration errors (bad file, bad env override)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Workflow/orchestration errors
    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    /// Command execution errors
    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    /// I/O errors
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Errors raised by the command execution engine.
///
/// A non-zero exit is not an error: it comes back as a `CommandResult`
/// with `success == false`.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The process could not be started
    #[error("Failed to spawn '{executable}': {source}")]
    Spawn {
        executable: String,
        #[source]
        source: std::io::Error,
    },

    /// The process did not finish before the deadline
    #[error("'{executable}' timed out after {elapsed_ms}ms")]
    Timeout { executable: String, elapsed_ms: u64 },

    /// Reading output or writing the output file failed
    #[error("I/O error while running '{executable}': {source}")]
    Io {
        executable: String,
        #[source]
        source: std::io::Error,
    },
}

impl CommandError {
    pub fn spawn(executable: impl Into<String>, source: std::io::Error) -> Self {
        Self::Spawn {
            executable: executable.into(),
            source,
        }
    }

    pub fn timeout(executable: impl Into<String>, elapsed_ms: u64) -> Self {
        Self::Timeout {
            executable: executable.into(),
            elapsed_ms,
        }
    }

    pub fn io(executable: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            executable: executable.into(),
            source,
        }
    }

    /// True when the command never finished, as opposed to finishing badly
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid YAML for the config schema
    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    /// An environment override could not be parsed
    #[error("Invalid value for {var}: '{value}'")]
    InvalidEnv { var: String, value: String },

    /// A progress or recovery pattern is not a valid regex
    #[error("Invalid pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}
