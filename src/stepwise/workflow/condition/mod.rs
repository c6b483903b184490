// SPDX-License-Identifier: MIT

//! Routing conditions
//!
//! Small boolean expressions over workflow state, used by `ConditionRouter`:
//! - `build.success == true`
//! - `readyForRetry and buildAttemptCount < 3`
//! - `not (platform == 'Web' or build.outputTail contains 'signing')`

mod ast;
mod evaluator;
mod parser;

pub use ast::{CompareOp, Expression, Literal};
pub use evaluator::evaluate;
pub use parser::{parse, ConditionError};
