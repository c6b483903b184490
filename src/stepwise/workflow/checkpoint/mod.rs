// SPDX-License-Identifier: MIT

//! Durable session snapshots
//!
//! A checkpoint is written after every completed node and at every suspend
//! point. It is the only thing a new process needs to carry a session on.

mod file;
mod memory;

pub use file::FileCheckpointStore;
pub use memory::MemoryCheckpointStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::stepwise::workflow::error::StoreError;
use crate::stepwise::workflow::node::ToolInvocationRequest;
use crate::stepwise::workflow::state::WorkflowState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointStatus {
    /// Between nodes; `cursor` is the next node to run
    Running,
    /// Waiting on `pending`; `cursor` is the tool node to resume
    Suspended,
    Completed,
    Failed,
}

impl CheckpointStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub session_id: String,
    pub cursor: String,
    pub state: WorkflowState,
    pub status: CheckpointStatus,
    #[serde(default)]
    pub pending: Option<ToolInvocationRequest>,
    /// Id of the most recently answered request, for duplicate detection
    #[serde(default)]
    pub answered_request: Option<String>,
    /// `<node>#<sequence>` of a side-effecting node that was started and
    /// has not completed yet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_flight: Option<String>,
    /// Bumped on every node transition
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(session_id: impl Into<String>, cursor: impl Into<String>, state: WorkflowState) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            cursor: cursor.into(),
            state,
            status: CheckpointStatus::Running,
            pending: None,
            answered_request: None,
            in_flight: None,
            sequence: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Same session position, ignoring timestamps
    pub fn same_position(&self, other: &Checkpoint) -> bool {
        self.session_id == other.session_id
            && self.cursor == other.cursor
            && self.state == other.state
            && self.status == other.status
            && self.pending == other.pending
            && self.answered_request == other.answered_request
            && self.in_flight == other.in_flight
            && self.sequence == other.sequence
    }
}

/// Persistence for checkpoints, keyed by session id.
///
/// `save` must replace the previous snapshot atomically: a reader sees
/// either the old or the new checkpoint, never a mix.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, session_id: &str) -> Result<Option<Checkpoint>, StoreError>;

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), StoreError>;

    async fn exists(&self, session_id: &str) -> Result<bool, StoreError> {
        Ok(self.load(session_id).await?.is_some())
    }

    /// Returns whether a checkpoint was removed
    async fn delete(&self, session_id: &str) -> Result<bool, StoreError>;

    /// Session ids with a stored checkpoint, sorted
    async fn list(&self) -> Result<Vec<String>, StoreError>;

    /// Exclusive lease on a session, visible to every user of the same
    /// backing storage. Fails with `StoreError::Locked` instead of waiting.
    async fn try_lock(&self, session_id: &str) -> Result<SessionLease, StoreError>;
}

type ReleaseFn = Box<dyn FnOnce() + Send + Sync>;

/// Held for the duration of a `step`; releases the session when dropped
pub struct SessionLease {
    release: Option<ReleaseFn>,
}

impl SessionLease {
    pub fn new(release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionLease")
            .field("held", &self.release.is_some())
            .finish()
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_checkpoint_serializes_camel_case() {
        let mut state = WorkflowState::empty();
        state.insert("platform", json!("iOS"));
        let checkpoint = Checkpoint::new("s1", "build", state);

        let value = serde_json::to_value(&checkpoint).unwrap();
        assert_eq!(value["sessionId"], "s1");
        assert_eq!(value["status"], "running");
        assert_eq!(value["state"]["platform"], "iOS");
        assert!(value["answeredRequest"].is_null());

        let back: Checkpoint = serde_json::from_value(value).unwrap();
        assert_eq!(back, checkpoint);
    }

    #[test]
    fn test_same_position_ignores_timestamps() {
        let a = Checkpoint::new("s1", "plan", WorkflowState::empty());
        let mut b = a.clone();
        b.updated_at = b.updated_at + chrono::Duration::seconds(5);
        assert!(a.same_position(&b));
        b.sequence += 1;
        assert!(!a.same_position(&b));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(CheckpointStatus::Completed.is_terminal());
        assert!(CheckpointStatus::Failed.is_terminal());
        assert!(!CheckpointStatus::Suspended.is_terminal());
        assert_eq!(CheckpointStatus::Suspended.to_string(), "suspended");
    }
}
