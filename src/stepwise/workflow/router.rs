// SPDX-License-Identifier: MIT

//! Routers choose the next node from post-node state.
//!
//! A router must be a total function over the states its upstream node can
//! produce. States outside that set are reported as `RouteError`, never
//! silently routed somewhere.

use crate::stepwise::workflow::condition::{self, ConditionError, Expression};
use crate::stepwise::workflow::error::RouteError;
use crate::stepwise::workflow::state::WorkflowState;

pub trait Router: Send + Sync {
    fn name(&self) -> &str;

    /// Name of the next node
    fn route(&self, state: &WorkflowState) -> Result<String, RouteError>;

    /// Every node this router can return, for graph validation
    fn targets(&self) -> Vec<String>;
}

type RouteFn = dyn Fn(&WorkflowState) -> Result<String, RouteError> + Send + Sync;

/// Router backed by a closure over a declared target set
pub struct FnRouter {
    name: String,
    targets: Vec<String>,
    f: Box<RouteFn>,
}

impl FnRouter {
    pub fn new<F>(name: impl Into<String>, targets: &[&str], f: F) -> Self
    where
        F: Fn(&WorkflowState) -> Result<String, RouteError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            targets: targets.iter().map(|t| t.to_string()).collect(),
            f: Box::new(f),
        }
    }
}

impl Router for FnRouter {
    fn name(&self) -> &str {
        &self.name
    }

    fn route(&self, state: &WorkflowState) -> Result<String, RouteError> {
        let target = (self.f)(state)?;
        if self.targets.contains(&target) {
            Ok(target)
        } else {
            Err(RouteError::Unmatched {
                router: self.name.clone(),
                detail: format!("'{}' is not a declared target", target),
            })
        }
    }

    fn targets(&self) -> Vec<String> {
        self.targets.clone()
    }
}

struct Branch {
    expr: Expression,
    target: String,
}

/// First matching condition wins; without a default an unmatched state is
/// an error.
pub struct ConditionRouter {
    name: String,
    branches: Vec<Branch>,
    default: Option<String>,
}

impl ConditionRouter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            branches: Vec::new(),
            default: None,
        }
    }

    pub fn when(mut self, condition: &str, target: impl Into<String>) -> Result<Self, ConditionError> {
        let expr = condition::parse(condition)?;
        self.branches.push(Branch {
            expr,
            target: target.into(),
        });
        Ok(self)
    }

    pub fn otherwise(mut self, target: impl Into<String>) -> Self {
        self.default = Some(target.into());
        self
    }
}

impl Router for ConditionRouter {
    fn name(&self) -> &str {
        &self.name
    }

    fn route(&self, state: &WorkflowState) -> Result<String, RouteError> {
        for branch in &self.branches {
            if condition::evaluate(&branch.expr, state) {
                log::debug!(
                    "Router '{}' matched '{}' -> {}",
                    self.name,
                    branch.expr,
                    branch.target
                );
                return Ok(branch.target.clone());
            }
        }

        self.default.clone().ok_or_else(|| RouteError::Unmatched {
            router: self.name.clone(),
            detail: format!(
                "none of [{}] matched",
                self.branches
                    .iter()
                    .map(|b| b.expr.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        })
    }

    fn targets(&self) -> Vec<String> {
        let mut targets: Vec<String> = self.branches.iter().map(|b| b.target.clone()).collect();
        targets.extend(self.default.clone());
        targets.dedup();
        targets
    }
}
