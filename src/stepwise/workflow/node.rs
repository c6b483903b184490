// SPDX-License-Identifier: MIT

//! Node abstraction
//!
//! A node is a named unit of work over `WorkflowState`. It either completes
//! with a partial update or suspends with a request for an external agent.
//! Nodes keep no memory between invocations; anything durable goes into the
//! returned update so it survives a checkpoint/resume cycle.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::stepwise::workflow::error::NodeError;
use crate::stepwise::workflow::state::{StateUpdate, WorkflowState};

/// Request handed to the caller at a suspend point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocationRequest {
    /// `<node>#<sequence>`, echoed back by the caller with the result
    pub request_id: String,
    pub tool_name: String,
    pub description: String,
    pub input: Value,
    /// Name of the type the result must deserialize into
    pub result_schema_ref: String,
    /// JSON Schema of that type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_schema: Option<Value>,
}

/// Result supplied by the caller when resuming a suspended session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocationResult {
    /// The request this answers. Untagged results go to whatever is pending.
    #[serde(default)]
    pub request_id: Option<String>,
    pub payload: Value,
}

impl ToolInvocationResult {
    pub fn new(payload: Value) -> Self {
        Self {
            request_id: None,
            payload,
        }
    }

    pub fn for_request(request_id: impl Into<String>, payload: Value) -> Self {
        Self {
            request_id: Some(request_id.into()),
            payload,
        }
    }
}

/// What a node body produced
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutcome {
    Completed(StateUpdate),
    Suspended(ToolInvocationRequest),
}

/// Per-invocation information handed to a node
#[derive(Debug, Clone, Copy)]
pub struct NodeContext<'a> {
    pub session_id: &'a str,
    pub node_name: &'a str,
    /// Checkpoint sequence number at the time of the call
    pub sequence: u64,
    /// Present only when this node is being re-entered with a tool result
    pub resume: Option<&'a ToolInvocationResult>,
    /// A previous run of this same invocation started and never completed
    pub interrupted: bool,
}

impl<'a> NodeContext<'a> {
    /// Id for a request emitted by this invocation
    pub fn request_id(&self) -> String {
        format!("{}#{}", self.node_name, self.sequence)
    }
}

/// A unit of work in a workflow graph
#[async_trait]
pub trait Node: Send + Sync {
    async fn execute(
        &self,
        state: &WorkflowState,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeOutcome, NodeError>;

    /// Nodes whose effects must not silently repeat. The orchestrator
    /// persists an in-flight marker before running them and sets
    /// `NodeContext::interrupted` when it finds that marker again.
    fn side_effecting(&self) -> bool {
        false
    }
}

type NodeFn = dyn Fn(&WorkflowState) -> Result<StateUpdate, NodeError> + Send + Sync;

/// Node backed by a pure, synchronous strategy function
pub struct FnNode {
    f: Box<NodeFn>,
}

impl FnNode {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&WorkflowState) -> Result<StateUpdate, NodeError> + Send + Sync + 'static,
    {
        Self { f: Box::new(f) }
    }

    /// A node that only passes control along
    pub fn passthrough() -> Self {
        Self::new(|_| Ok(StateUpdate::new()))
    }
}

#[async_trait]
impl Node for FnNode {
    async fn execute(
        &self,
        state: &WorkflowState,
        _ctx: &NodeContext<'_>,
    ) -> Result<NodeOutcome, NodeError> {
        (self.f)(state).map(NodeOutcome::Completed)
    }
}

/// Read a required string field or fail with a validation error
pub fn require_str<'s>(state: &'s WorkflowState, field: &str) -> Result<&'s str, NodeError> {
    state
        .get_str(field)
        .ok_or_else(|| NodeError::missing_field(field))
}
