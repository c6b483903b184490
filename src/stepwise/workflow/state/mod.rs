// SPDX-License-Identifier: MIT

//! State management for graph workflows
//!
//! This module provides:
//! - `StateSchema` - defines the shape and types of workflow state
//! - `WorkflowState` - runtime state storage with reducer support
//! - `StateUpdate` - the partial state a node returns

mod schema;
mod store;

pub use schema::{FieldType, ReducerType, StateFieldDef, StateSchema, FATAL_ERRORS, SESSION_ID};
pub use store::{FieldUpdate, StateUpdate, WorkflowState};
