// SPDX-License-Identifier: MIT

//! Graph-based workflow execution
//!
//! This module provides the graph definition (nodes, edges, routers) and the
//! orchestrator that steps sessions through it.

pub mod executor;
pub mod types;

pub use executor::{Orchestrator, StepEvent, StepOutcome, DEFAULT_MAX_TRANSITIONS};
pub use types::{failure_node, Edge, Graph, GraphBuilder, FAILURE_NODE, FAILURE_SUMMARY};
