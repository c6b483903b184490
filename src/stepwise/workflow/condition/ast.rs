// SPDX-License-Identifier: MIT

//! Syntax tree for routing conditions

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// `path op literal`
    Compare {
        path: String,
        op: CompareOp,
        value: Literal,
    },
    /// A bare path, true when the value is truthy
    Truthy(String),
    And(Box<Expression>, Box<Expression>),
    Or(Box<Expression>, Box<Expression>),
    Not(Box<Expression>),
    True,
    False,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Gt,
    Gte,
    Lt,
    Lte,
    /// Substring for strings, membership for arrays
    Contains,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    String(String),
    Number(f64),
    Boolean(bool),
    Null,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompareOp::Eq => "==",
            CompareOp::NotEq => "!=",
            CompareOp::Gt => ">",
            CompareOp::Gte => ">=",
            CompareOp::Lt => "<",
            CompareOp::Lte => "<=",
            CompareOp::Contains => "contains",
        };
        f.write_str(s)
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::String(s) => write!(f, "'{}'", s),
            Literal::Number(n) => write!(f, "{}", n),
            Literal::Boolean(b) => write!(f, "{}", b),
            Literal::Null => f.write_str("null"),
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Compare { path, op, value } => write!(f, "{} {} {}", path, op, value),
            Expression::Truthy(path) => f.write_str(path),
            Expression::And(l, r) => write!(f, "({} and {})", l, r),
            Expression::Or(l, r) => write!(f, "({} or {})", l, r),
            Expression::Not(inner) => write!(f, "not {}", inner),
            Expression::True => f.write_str("true"),
            Expression::False => f.write_str("false"),
        }
    }
}
