// SPDX-License-Identifier: MIT

//! Bounded retry with failure analysis
//!
//! ```text
//! action --success--> next
//!    |failure
//!    v
//! recover --ready && attempts < max--> action
//!    |otherwise
//!    v
//! give_up --> failed
//! ```
//!
//! The attempt counter lives in state, so the loop terminates after
//! `max_attempts` executions of the action even across resumes.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::runtime::command::{Command, CommandRunner, ExecOptions};
use crate::stepwise::workflow::command_node::CommandNode;
use crate::stepwise::workflow::error::{NodeError, RouteError, WorkflowError};
use crate::stepwise::workflow::graph::{GraphBuilder, FAILURE_NODE};
use crate::stepwise::workflow::node::{FnNode, Node, NodeContext, NodeOutcome};
use crate::stepwise::workflow::router::{ConditionRouter, Router};
use crate::stepwise::workflow::state::{FieldType, ReducerType, StateUpdate, WorkflowState};

pub const FIXES_ATTEMPTED: &str = "fixesAttempted";
pub const READY_FOR_RETRY: &str = "readyForRetry";

/// A known failure signature and what to do about it. A rule without a fix
/// marks the failure as transient: retry unchanged.
#[derive(Debug, Clone)]
pub struct RecoveryRule {
    name: String,
    matcher: Regex,
    fix: Option<Command>,
    scope: Option<String>,
}

/// Serializable form of `RecoveryRule`, as it appears in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryRuleDef {
    pub name: String,
    pub pattern: String,
    #[serde(default)]
    pub fix: Option<Command>,
}

impl RecoveryRule {
    pub fn new(name: impl Into<String>, pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            name: name.into(),
            matcher: Regex::new(pattern)?,
            fix: None,
            scope: None,
        })
    }

    pub fn with_fix(mut self, fix: Command) -> Self {
        self.fix = Some(fix);
        self
    }

    /// Only apply when the node's scope field equals `scope`
    pub fn scoped_to(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn matches(&self, output: &str) -> bool {
        self.matcher.is_match(output)
    }

    fn applies_to(&self, scope: Option<&str>) -> bool {
        match (&self.scope, scope) {
            (None, _) => true,
            (Some(want), Some(have)) => want.eq_ignore_ascii_case(have),
            (Some(_), None) => false,
        }
    }
}

impl TryFrom<RecoveryRuleDef> for RecoveryRule {
    type Error = regex::Error;

    fn try_from(def: RecoveryRuleDef) -> Result<Self, Self::Error> {
        let rule = RecoveryRule::new(def.name, &def.pattern)?;
        Ok(match def.fix {
            Some(fix) => rule.with_fix(fix),
            None => rule,
        })
    }
}

/// Failure signatures worth a plain retry on any platform
pub fn transient_rules() -> Vec<RecoveryRule> {
    [
        (
            "network",
            r"(?i)(could not resolve host|connection (reset|refused|timed out)|network is unreachable|503 service unavailable)",
        ),
        (
            "lock-contention",
            r"(?i)(database is locked|blocking waiting for file lock|could not acquire lock)",
        ),
    ]
    .into_iter()
    .filter_map(|(name, pattern)| RecoveryRule::new(name, pattern).ok())
    .collect()
}

/// Inspects a failed action result and tries to make the next attempt succeed
pub struct RecoveryNode {
    runner: Arc<dyn CommandRunner>,
    result_field: String,
    rules: Vec<RecoveryRule>,
    options: ExecOptions,
    scope_field: Option<String>,
    working_dir_field: Option<String>,
}

impl RecoveryNode {
    pub fn new(runner: Arc<dyn CommandRunner>, result_field: impl Into<String>) -> Self {
        Self {
            runner,
            result_field: result_field.into(),
            rules: Vec::new(),
            options: ExecOptions::default(),
            scope_field: None,
            working_dir_field: None,
        }
    }

    pub fn rule(mut self, rule: RecoveryRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(mut self, rules: impl IntoIterator<Item = RecoveryRule>) -> Self {
        self.rules.extend(rules);
        self
    }

    pub fn with_options(mut self, options: ExecOptions) -> Self {
        self.options = options;
        self
    }

    /// State field compared against each rule's scope
    pub fn scope_field(mut self, field: impl Into<String>) -> Self {
        self.scope_field = Some(field.into());
        self
    }

    /// State field holding the directory fix commands run in by default
    pub fn working_dir_field(mut self, field: impl Into<String>) -> Self {
        self.working_dir_field = Some(field.into());
        self
    }

    fn prepare(&self, fix: &Command, state: &WorkflowState) -> Command {
        let dir = self
            .working_dir_field
            .as_deref()
            .and_then(|field| state.get_str(field));
        match (fix.working_dir(), dir) {
            (None, Some(dir)) => fix.clone().cwd(dir),
            _ => fix.clone(),
        }
    }

    async fn apply(&self, rule: &RecoveryRule, state: &WorkflowState) -> (String, bool) {
        let Some(fix) = &rule.fix else {
            return (format!("{}: transient failure, retrying", rule.name), true);
        };

        let command = self.prepare(fix, state);
        log::info!("Recovery rule '{}' running {}", rule.name, command);
        match self.runner.run(&command, &self.options).await {
            Ok(result) if result.success => (format!("{}: ran {}", rule.name, command), true),
            Ok(result) => (
                format!(
                    "{}: {} failed with exit code {:?}",
                    rule.name, command, result.exit_code
                ),
                false,
            ),
            Err(e) => (format!("{}: {}", rule.name, e), false),
        }
    }
}

#[async_trait]
impl Node for RecoveryNode {
    async fn execute(
        &self,
        state: &WorkflowState,
        _ctx: &NodeContext<'_>,
    ) -> Result<NodeOutcome, NodeError> {
        let result = state
            .get(&self.result_field)
            .ok_or_else(|| NodeError::missing_field(self.result_field.as_str()))?;

        if result["timedOut"].as_bool().unwrap_or(false) {
            log::warn!("'{}' timed out; retrying with forced kill", self.result_field);
            return Ok(NodeOutcome::Completed(
                StateUpdate::new()
                    .set(FIXES_ATTEMPTED, json!(["timeout: retrying with forced kill"]))
                    .set(READY_FOR_RETRY, true),
            ));
        }

        let output = [&result["outputTail"], &result["error"]]
            .iter()
            .filter_map(|v| v.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let scope = self
            .scope_field
            .as_deref()
            .and_then(|field| state.get_str(field));

        let mut fixes = Vec::new();
        let mut ready = false;
        for rule in self
            .rules
            .iter()
            .filter(|r| r.applies_to(scope) && r.matches(&output))
        {
            let (note, ok) = self.apply(rule, state).await;
            fixes.push(Value::String(note));
            ready |= ok;
        }

        if fixes.is_empty() {
            log::warn!(
                "No recovery rule matched the '{}' failure",
                self.result_field
            );
        }

        Ok(NodeOutcome::Completed(
            StateUpdate::new()
                .set(FIXES_ATTEMPTED, Value::Array(fixes))
                .set(READY_FOR_RETRY, ready),
        ))
    }
}

/// Sends ready failures back to the action while attempts remain
pub struct RetryRouter {
    name: String,
    retry: String,
    give_up: String,
    attempt_field: String,
    max_attempts: u32,
}

impl RetryRouter {
    pub fn new(
        name: impl Into<String>,
        retry: impl Into<String>,
        give_up: impl Into<String>,
        attempt_field: impl Into<String>,
        max_attempts: u32,
    ) -> Self {
        Self {
            name: name.into(),
            retry: retry.into(),
            give_up: give_up.into(),
            attempt_field: attempt_field.into(),
            max_attempts,
        }
    }
}

impl Router for RetryRouter {
    fn name(&self) -> &str {
        &self.name
    }

    fn route(&self, state: &WorkflowState) -> Result<String, RouteError> {
        let attempts = state
            .get_f64(&self.attempt_field)
            .ok_or_else(|| RouteError::MissingField {
                router: self.name.clone(),
                field: self.attempt_field.clone(),
            })?;
        let ready = state.get_bool(READY_FOR_RETRY).unwrap_or(false);

        if ready && attempts < f64::from(self.max_attempts) {
            log::info!(
                "Retrying '{}' (attempt {} of {})",
                self.retry,
                attempts as u64 + 1,
                self.max_attempts
            );
            Ok(self.retry.clone())
        } else {
            log::warn!(
                "Giving up on '{}' after {} attempt(s), ready: {}",
                self.retry,
                attempts,
                ready
            );
            Ok(self.give_up.clone())
        }
    }

    fn targets(&self) -> Vec<String> {
        vec![self.retry.clone(), self.give_up.clone()]
    }
}

/// Records the exhausted action as a fatal error
pub fn give_up_node(label: &str, attempt_field: &str, result_field: &str) -> FnNode {
    let label = label.to_string();
    let attempt_field = attempt_field.to_string();
    let result_field = result_field.to_string();
    FnNode::new(move |state| {
        let attempts = state.get_f64(&attempt_field).unwrap_or(0.0) as u64;
        let detail = state
            .get_path(&format!("{}.outputTail", result_field))
            .and_then(Value::as_str)
            .and_then(|tail| tail.lines().last())
            .unwrap_or("no output");
        Ok(StateUpdate::new().fatal(format!(
            "{} failed after {} attempt(s): {}",
            label, attempts, detail
        )))
    })
}

/// Wires an action node into a recovery loop
pub struct RecoveryLoop {
    action: String,
    on_success: String,
    max_attempts: u32,
}

impl RecoveryLoop {
    pub fn new(action: impl Into<String>, on_success: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            on_success: on_success.into(),
            max_attempts: 3,
        }
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn attempt_field(&self) -> String {
        format!("{}AttemptCount", self.action)
    }

    pub fn recovery_node_name(&self) -> String {
        format!("{}_recover", self.action)
    }

    pub fn give_up_node_name(&self) -> String {
        format!("{}_give_up", self.action)
    }

    /// Adds the action, its recovery and give-up nodes plus their routing.
    /// The action records into a state field named after it.
    pub fn install(
        self,
        builder: GraphBuilder,
        action: CommandNode,
        recovery: RecoveryNode,
    ) -> Result<GraphBuilder, WorkflowError> {
        let attempt_field = self.attempt_field();
        let recover = self.recovery_node_name();
        let give_up = self.give_up_node_name();
        let result_field = self.action.clone();

        let after_action = ConditionRouter::new(format!("after_{}", self.action))
            .when(&format!("{}.success == true", result_field), self.on_success.as_str())
            .and_then(|r| r.when(&format!("{}.success == false", result_field), recover.as_str()))
            .map_err(|e| WorkflowError::InvalidGraph(e.to_string()))?;

        let retry = RetryRouter::new(
            format!("retry_{}", self.action),
            self.action.as_str(),
            give_up.as_str(),
            attempt_field.as_str(),
            self.max_attempts,
        );

        let action = action
            .result_field(result_field.as_str())
            .count_attempts(attempt_field.as_str());
        let recovery = RecoveryNode {
            result_field: result_field.clone(),
            ..recovery
        };

        Ok(builder
            .field(&attempt_field, FieldType::Number, ReducerType::Max, Some(json!(0)))
            .field(&result_field, FieldType::Object, ReducerType::Overwrite, None)
            .field(FIXES_ATTEMPTED, FieldType::Array, ReducerType::Append, Some(json!([])))
            .field(READY_FOR_RETRY, FieldType::Boolean, ReducerType::Overwrite, None)
            .node(self.action.as_str(), action)
            .route(self.action.as_str(), after_action)
            .node(recover.as_str(), recovery)
            .route(recover.as_str(), retry)
            .node(
                give_up.as_str(),
                give_up_node(&self.action, &attempt_field, &result_field),
            )
            .edge(give_up.as_str(), FAILURE_NODE))
    }
}
