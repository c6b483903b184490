// SPDX-License-Identifier: MIT

//! Workflow-specific errors
//!
//! `WorkflowError` is what callers of `Orchestrator::step` see. The other
//! enums are produced inside the graph and never escape the executor: it
//! turns them into `fatalErrors` entries or into an `InvalidResult` outcome.

use thiserror::Error;

use crate::runtime::error::CommandError;
use crate::stepwise::workflow::state::FieldType;

/// Caller-facing orchestration errors. None of these touch workflow state.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Another `step` call for this session is in flight
    #[error("Session '{0}' is busy")]
    SessionBusy(String),

    /// Resume/continue for a session that was never started
    #[error("Session '{0}' not found")]
    SessionNotFound(String),

    /// Start event for a session that already has a checkpoint
    #[error("Session '{0}' has already been started")]
    SessionAlreadyStarted(String),

    /// A tool result arrived but the session is not waiting for one
    #[error("Session '{session}' is not suspended (status: {status})")]
    NotSuspended { session: String, status: String },

    /// A tool result answers a request the session never issued
    #[error("Session '{session}' has no pending request '{request_id}'")]
    StaleResult { session: String, request_id: String },

    /// Graph definition problems found at build time
    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    /// Start input is malformed (not an object)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Checkpoint persistence failed
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Checkpoint store failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Checkpoint I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt checkpoint at {path}: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize checkpoint: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Invalid session id '{0}'")]
    InvalidSessionId(String),

    /// Another holder, possibly in another process, has the session leased
    #[error("Session '{session}' is locked ({lock})")]
    Locked { session: String, lock: String },
}

impl StoreError {
    pub fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }
}

/// Errors returned by node bodies
#[derive(Debug, Error)]
pub enum NodeError {
    /// Input (usually a tool result) does not have the expected shape
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A state field the node depends on is absent
    #[error("Required state field '{0}' is missing")]
    MissingField(String),

    /// Command could not run or timed out
    #[error(transparent)]
    Command(#[from] CommandError),

    /// The node produced an update that does not fit the schema
    #[error(transparent)]
    State(#[from] StateError),

    /// Anything else the node considers fatal
    #[error("{0}")]
    Failed(String),
}

impl NodeError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField(field.into())
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Validation errors can be fixed by supplying better input
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::MissingField(_))
    }
}

/// Router failures. A router that cannot decide is a bug in the graph or a
/// state outside the router's precondition, and ends the workflow.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("Router '{router}' has no branch for the current state: {detail}")]
    Unmatched { router: String, detail: String },

    #[error("Router '{router}' requires state field '{field}'")]
    MissingField { router: String, field: String },
}

/// State merge failures
#[derive(Debug, Error, PartialEq)]
pub enum StateError {
    #[error("Field '{field}' expects {expected:?}, got {found}")]
    TypeMismatch {
        field: String,
        expected: FieldType,
        found: String,
    },

    #[error("Expected a JSON object for {0}")]
    NotAnObject(String),
}
