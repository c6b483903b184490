// SPDX-License-Identifier: MIT

//! Leaf node that runs an external command
//!
//! The outcome is written to a result field as an object:
//!
//! ```json
//! {"success": false, "exitCode": 65, "signal": null, "timedOut": false,
//!  "durationMs": 5120, "attempt": 1, "outputTail": "..."}
//! ```
//!
//! Non-zero exits, timeouts and spawn failures are recorded rather than
//! raised, so a downstream router can send them to recovery. A
//! non-idempotent node that finds its previous run interrupted records
//! `{"success": false, "interrupted": true, ...}` and does not run again.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::runtime::command::{Command, CommandRunner, ExecOptions};
use crate::runtime::error::CommandError;
use crate::stepwise::workflow::error::NodeError;
use crate::stepwise::workflow::node::{Node, NodeContext, NodeOutcome};
use crate::stepwise::workflow::state::{StateUpdate, WorkflowState};

/// Lines of output kept in `outputTail`
const TAIL_LINES: usize = 40;

type CommandFn = dyn Fn(&WorkflowState) -> Result<Option<Command>, NodeError> + Send + Sync;

pub struct CommandNode {
    label: String,
    runner: Arc<dyn CommandRunner>,
    command: Box<CommandFn>,
    options: ExecOptions,
    result_field: String,
    attempt_field: Option<String>,
    idempotent: bool,
}

impl CommandNode {
    /// `command` builds the command from state; `None` skips the step and
    /// records it as a success.
    pub fn new<F>(label: impl Into<String>, runner: Arc<dyn CommandRunner>, command: F) -> Self
    where
        F: Fn(&WorkflowState) -> Result<Option<Command>, NodeError> + Send + Sync + 'static,
    {
        let label = label.into();
        Self {
            result_field: label.clone(),
            label,
            runner,
            command: Box::new(command),
            options: ExecOptions::default(),
            attempt_field: None,
            idempotent: true,
        }
    }

    pub fn with_options(mut self, options: ExecOptions) -> Self {
        self.options = options;
        self
    }

    pub fn result_field(mut self, field: impl Into<String>) -> Self {
        self.result_field = field.into();
        self
    }

    /// Increment `field` on every execution
    pub fn count_attempts(mut self, field: impl Into<String>) -> Self {
        self.attempt_field = Some(field.into());
        self
    }

    /// Never re-run after an interruption; the command may already have
    /// taken effect
    pub fn non_idempotent(mut self) -> Self {
        self.idempotent = false;
        self
    }

    fn previous_timed_out(&self, state: &WorkflowState) -> bool {
        state
            .get_path(&format!("{}.timedOut", self.result_field))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    async fn run(&self, command: &Command, options: &ExecOptions) -> Value {
        match self.runner.run(command, options).await {
            Ok(result) => {
                if result.success {
                    log::info!("[{}] Succeeded in {}ms", self.label, result.duration_ms);
                } else {
                    log::warn!(
                        "[{}] Failed with exit code {:?} (signal {:?})",
                        self.label,
                        result.exit_code,
                        result.signal
                    );
                }
                json!({
                    "success": result.success,
                    "exitCode": result.exit_code,
                    "signal": result.signal,
                    "timedOut": false,
                    "durationMs": result.duration_ms,
                    "outputTail": result.output_tail(TAIL_LINES),
                })
            }
            Err(CommandError::Timeout { elapsed_ms, .. }) => {
                log::warn!("[{}] Timed out after {}ms", self.label, elapsed_ms);
                json!({
                    "success": false,
                    "exitCode": null,
                    "signal": null,
                    "timedOut": true,
                    "durationMs": elapsed_ms,
                    "outputTail": "",
                    "error": format!("timed out after {}ms", elapsed_ms),
                })
            }
            Err(e) => {
                log::error!("[{}] {}", self.label, e);
                json!({
                    "success": false,
                    "exitCode": null,
                    "signal": null,
                    "timedOut": false,
                    "durationMs": 0,
                    "outputTail": e.to_string(),
                    "error": e.to_string(),
                })
            }
        }
    }
}

#[async_trait]
impl Node for CommandNode {
    async fn execute(
        &self,
        state: &WorkflowState,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeOutcome, NodeError> {
        let Some(command) = (self.command)(state)? else {
            log::info!("[{}] Nothing to run, skipping", self.label);
            return Ok(NodeOutcome::Completed(StateUpdate::new().set(
                self.result_field.as_str(),
                json!({"success": true, "skipped": true}),
            )));
        };

        let attempt = self
            .attempt_field
            .as_deref()
            .map(|field| state.get_f64(field).unwrap_or(0.0) as u64 + 1);

        let mut options = self.options.clone();
        if self.previous_timed_out(state) {
            log::warn!(
                "[{}] Previous attempt timed out, escalating to forced kill",
                self.label
            );
            options.force_kill_on_timeout = true;
        }

        let mut record = if ctx.interrupted && !self.idempotent {
            log::warn!(
                "[{}] Previous run of {} was interrupted, not running it again",
                self.label,
                command
            );
            json!({
                "success": false,
                "exitCode": null,
                "signal": null,
                "timedOut": false,
                "durationMs": 0,
                "outputTail": "",
                "interrupted": true,
                "error": "interrupted before completion, not re-run",
            })
        } else {
            log::info!(
                "[{}] Running {} (attempt {})",
                self.label,
                command,
                attempt.unwrap_or(1)
            );
            self.run(&command, &options).await
        };

        if let (Some(n), Value::Object(map)) = (attempt, &mut record) {
            map.insert("attempt".to_string(), json!(n));
        }

        let mut update = StateUpdate::new().set(self.result_field.as_str(), record);
        if let (Some(field), Some(n)) = (self.attempt_field.as_deref(), attempt) {
            update = update.set(field, n);
        }
        Ok(NodeOutcome::Completed(update))
    }

    fn side_effecting(&self) -> bool {
        !self.idempotent
    }
}
