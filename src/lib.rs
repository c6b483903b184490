// SPDX-License-Identifier: MIT

//! stepwise-rs: resumable, checkpointed process orchestration
//!
//! - `runtime` - command execution, progress inference, shared errors
//! - `stepwise::workflow` - state, nodes, routers, checkpoints, orchestrator
//! - `stepwise::pipeline` - the application build-and-deploy workflow
//! - `stepwise::config` - YAML + environment configuration

pub mod runtime;
pub mod stepwise;
