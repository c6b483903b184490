// SPDX-License-Identifier: MIT

//! Condition expression evaluator

use serde_json::Value;

use super::ast::{CompareOp, Expression, Literal};
use crate::stepwise::workflow::state::WorkflowState;

/// Evaluate a condition against workflow state. Missing fields read as null.
pub fn evaluate(expr: &Expression, state: &WorkflowState) -> bool {
    match expr {
        Expression::True => true,
        Expression::False => false,
        Expression::Truthy(path) => is_truthy(state.get_path(path)),
        Expression::Compare { path, op, value } => compare(state.get_path(path), *op, value),
        Expression::And(left, right) => evaluate(left, state) && evaluate(right, state),
        Expression::Or(left, right) => evaluate(left, state) || evaluate(right, state),
        Expression::Not(inner) => !evaluate(inner, state),
    }
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(_)) => true,
    }
}

fn compare(left: Option<&Value>, op: CompareOp, right: &Literal) -> bool {
    match op {
        CompareOp::Eq => equals(left, right),
        CompareOp::NotEq => !equals(left, right),
        CompareOp::Gt => numeric(left, right, |a, b| a > b),
        CompareOp::Gte => numeric(left, right, |a, b| a >= b),
        CompareOp::Lt => numeric(left, right, |a, b| a < b),
        CompareOp::Lte => numeric(left, right, |a, b| a <= b),
        CompareOp::Contains => contains(left, right),
    }
}

fn literal_matches(value: &Value, literal: &Literal) -> bool {
    match (value, literal) {
        (Value::Null, Literal::Null) => true,
        (Value::String(s), Literal::String(l)) => s == l,
        (Value::Number(n), Literal::Number(l)) => n.as_f64() == Some(*l),
        (Value::Bool(b), Literal::Boolean(l)) => b == l,
        _ => false,
    }
}

fn equals(left: Option<&Value>, right: &Literal) -> bool {
    match left {
        None => *right == Literal::Null,
        Some(value) => literal_matches(value, right),
    }
}

fn numeric(left: Option<&Value>, right: &Literal, cmp: impl Fn(f64, f64) -> bool) -> bool {
    match (left.and_then(Value::as_f64), right) {
        (Some(l), Literal::Number(r)) => cmp(l, *r),
        _ => false,
    }
}

fn contains(left: Option<&Value>, right: &Literal) -> bool {
    match (left, right) {
        (Some(Value::String(s)), Literal::String(needle)) => s.contains(needle.as_str()),
        (Some(Value::Array(items)), literal) => items.iter().any(|v| literal_matches(v, literal)),
        _ => false,
    }
}
