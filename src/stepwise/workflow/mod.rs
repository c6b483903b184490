// SPDX-License-Identifier: MIT

//! Resumable workflow graphs
//!
//! A workflow is a graph of nodes over typed state. Tool-invocation nodes
//! suspend the graph until an external agent answers; everything else runs
//! to completion inside a single `Orchestrator::step` call. Progress is
//! checkpointed after every node so any process can pick a session up.

pub mod checkpoint;
pub mod command_node;
pub mod condition;
pub mod error;
pub mod graph;
pub mod node;
pub mod recovery;
pub mod router;
pub mod state;
pub mod tool_node;

pub use checkpoint::{
    Checkpoint, CheckpointStatus, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore,
    SessionLease,
};
pub use command_node::CommandNode;
pub use error::{NodeError, RouteError, StateError, StoreError, WorkflowError};
pub use graph::{Graph, GraphBuilder, Orchestrator, StepEvent, StepOutcome, FAILURE_NODE};
pub use node::{FnNode, Node, NodeContext, NodeOutcome, ToolInvocationRequest, ToolInvocationResult};
pub use recovery::{RecoveryLoop, RecoveryNode, RecoveryRule, RecoveryRuleDef, RetryRouter};
pub use router::{ConditionRouter, FnRouter, Router};
pub use state::{FieldType, ReducerType, StateSchema, StateUpdate, WorkflowState};
pub use tool_node::ToolInvocationNode;
