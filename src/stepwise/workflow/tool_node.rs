// SPDX-License-Identifier: MIT

//! Tool-invocation node (suspend point)
//!
//! Lifecycle per node:
//!
//! ```text
//! PENDING --execute--> SUSPENDED (request emitted, checkpoint saved)
//! SUSPENDED --resume--> RESUMED --valid--> COMPLETED
//!                               --invalid--> INVALID_RESULT (still suspended)
//! ```
//!
//! The node itself is stateless: whether it is suspended is recorded in the
//! checkpoint, and the result arrives through `NodeContext::resume`.

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::marker::PhantomData;

use crate::stepwise::workflow::error::NodeError;
use crate::stepwise::workflow::node::{Node, NodeContext, NodeOutcome, ToolInvocationRequest};
use crate::stepwise::workflow::state::{StateUpdate, WorkflowState};

type InputFn = dyn Fn(&WorkflowState) -> Result<Value, NodeError> + Send + Sync;
type ResultFn<T> = dyn Fn(T, &WorkflowState) -> Result<StateUpdate, NodeError> + Send + Sync;

/// Suspends the graph until an external agent supplies a `T`
pub struct ToolInvocationNode<T> {
    tool_name: String,
    description: String,
    input: Box<InputFn>,
    on_result: Box<ResultFn<T>>,
    _result: PhantomData<fn() -> T>,
}

impl<T> ToolInvocationNode<T>
where
    T: DeserializeOwned + JsonSchema + 'static,
{
    pub fn new(tool_name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            description: description.into(),
            input: Box::new(|_| Ok(json!({}))),
            on_result: Box::new(|_, _| Ok(StateUpdate::new())),
            _result: PhantomData,
        }
    }

    /// Build the request input from state
    pub fn with_input<F>(mut self, f: F) -> Self
    where
        F: Fn(&WorkflowState) -> Result<Value, NodeError> + Send + Sync + 'static,
    {
        self.input = Box::new(f);
        self
    }

    /// Turn a validated result into a state update. Returning
    /// `NodeError::Validation` rejects the result and re-requests input.
    pub fn on_result<F>(mut self, f: F) -> Self
    where
        F: Fn(T, &WorkflowState) -> Result<StateUpdate, NodeError> + Send + Sync + 'static,
    {
        self.on_result = Box::new(f);
        self
    }

    fn schema_ref() -> String {
        T::schema_name()
    }

    fn request(&self, state: &WorkflowState, ctx: &NodeContext<'_>) -> Result<ToolInvocationRequest, NodeError> {
        let schema = serde_json::to_value(schemars::schema_for!(T))
            .map_err(|e| NodeError::failed(format!("Failed to describe result schema: {}", e)))?;
        Ok(ToolInvocationRequest {
            request_id: ctx.request_id(),
            tool_name: self.tool_name.clone(),
            description: self.description.clone(),
            input: (self.input)(state)?,
            result_schema_ref: Self::schema_ref(),
            result_schema: Some(schema),
        })
    }
}

#[async_trait]
impl<T> Node for ToolInvocationNode<T>
where
    T: DeserializeOwned + JsonSchema + 'static,
{
    async fn execute(
        &self,
        state: &WorkflowState,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeOutcome, NodeError> {
        let Some(result) = ctx.resume else {
            log::info!(
                "Node '{}' suspending for tool '{}'",
                ctx.node_name,
                self.tool_name
            );
            return self.request(state, ctx).map(NodeOutcome::Suspended);
        };

        let typed: T = serde_json::from_value(result.payload.clone()).map_err(|e| {
            NodeError::validation(format!(
                "result for '{}' does not match {}: {}",
                self.tool_name,
                Self::schema_ref(),
                e
            ))
        })?;

        (self.on_result)(typed, state).map(NodeOutcome::Completed)
    }
}
