// SPDX-License-Identifier: MIT

//! Runtime building blocks with no knowledge of workflows
//!
//! - `command` - subprocess execution with streamed capture and timeouts
//! - `progress` - progress inference and debounced reporting
//! - `error` - typed errors shared across the crate

pub mod command;
pub mod error;
pub mod progress;
