// SPDX-License-Identifier: MIT

//! Nodes of the application pipeline

use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::runtime::command::Command;
use crate::stepwise::config::{PlatformConfig, StepwiseConfig};
use crate::stepwise::workflow::error::NodeError;
use crate::stepwise::workflow::node::{require_str, FnNode};
use crate::stepwise::workflow::state::{StateUpdate, WorkflowState};
use crate::stepwise::workflow::tool_node::ToolInvocationNode;

use super::fields;

/// Agent's answer to `confirm_platform`
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct PlatformConfirmation {
    /// One of the configured platform names
    pub platform: String,
}

/// Agent's answer to `generate_sources`
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedSources {
    /// Directory the build runs in
    pub project_dir: String,
    /// Paths of the files written, relative to `project_dir`
    pub files: Vec<String>,
}

/// Reads the request and guesses a platform from it
pub fn plan(config: Arc<StepwiseConfig>) -> FnNode {
    FnNode::new(move |state| {
        let request = require_str(state, fields::REQUEST)?;
        if request.trim().is_empty() {
            return Err(NodeError::validation("request must not be empty"));
        }
        let words: Vec<String> = request
            .split(|c: char| !c.is_alphanumeric())
            .map(str::to_lowercase)
            .collect();
        let hint = config
            .platform_names()
            .into_iter()
            .find(|name| words.iter().any(|w| w == &name.to_lowercase()));

        log::info!("Planning '{}' (platform hint: {:?})", request, hint);
        Ok(match hint {
            Some(name) => StateUpdate::new().set(fields::PLATFORM_HINT, name),
            None => StateUpdate::new(),
        })
    })
}

pub fn confirm_platform(config: Arc<StepwiseConfig>) -> ToolInvocationNode<PlatformConfirmation> {
    let options: Vec<String> = config
        .platform_names()
        .into_iter()
        .map(String::from)
        .collect();

    ToolInvocationNode::new(
        "confirm_platform",
        "Confirm which platform the application should be built for",
    )
    .with_input(move |state| {
        Ok(json!({
            "request": state.get_str(fields::REQUEST),
            "suggested": state.get_str(fields::PLATFORM_HINT),
            "options": options,
        }))
    })
    .on_result(move |answer: PlatformConfirmation, _| {
        match config.platform(&answer.platform) {
            Some((key, _)) => Ok(StateUpdate::new().set(fields::PLATFORM, key)),
            None => Err(NodeError::validation(format!(
                "unknown platform '{}', expected one of: {}",
                answer.platform,
                config.platform_names().join(", ")
            ))),
        }
    })
}

pub fn generate_sources() -> ToolInvocationNode<GeneratedSources> {
    ToolInvocationNode::new(
        "generate_sources",
        "Write the application sources and report where they are",
    )
    .with_input(|state| {
        Ok(json!({
            "request": require_str(state, fields::REQUEST)?,
            "platform": require_str(state, fields::PLATFORM)?,
        }))
    })
    .on_result(|sources: GeneratedSources, _| {
        if sources.project_dir.trim().is_empty() {
            return Err(NodeError::validation("projectDir must not be empty"));
        }
        if sources.files.is_empty() {
            return Err(NodeError::validation("no files were generated"));
        }
        log::info!(
            "{} file(s) generated in {}",
            sources.files.len(),
            sources.project_dir
        );
        Ok(StateUpdate::new()
            .set(fields::PROJECT_DIR, sources.project_dir)
            .set(fields::GENERATED_FILES, sources.files))
    })
}

/// Build command for the confirmed platform, run in the project directory
pub fn build_command(
    config: &StepwiseConfig,
    state: &WorkflowState,
) -> Result<Option<Command>, NodeError> {
    let platform = lookup(config, state)?;
    Ok(Some(in_project(&platform.build, state)?))
}

/// Deploy command, `None` when the platform has none configured
pub fn deploy_command(
    config: &StepwiseConfig,
    state: &WorkflowState,
) -> Result<Option<Command>, NodeError> {
    let platform = lookup(config, state)?;
    platform
        .deploy
        .as_ref()
        .map(|deploy| in_project(deploy, state))
        .transpose()
}

fn lookup<'c>(
    config: &'c StepwiseConfig,
    state: &WorkflowState,
) -> Result<&'c PlatformConfig, NodeError> {
    let name = require_str(state, fields::PLATFORM)?;
    config
        .platform(name)
        .map(|(_, platform)| platform)
        .ok_or_else(|| NodeError::failed(format!("platform '{}' is not configured", name)))
}

fn in_project(command: &Command, state: &WorkflowState) -> Result<Command, NodeError> {
    if command.working_dir().is_some() {
        return Ok(command.clone());
    }
    let dir = require_str(state, fields::PROJECT_DIR)?;
    Ok(command.clone().cwd(dir))
}

pub fn deploy_failed() -> FnNode {
    FnNode::new(|state| {
        let detail = state
            .get_path(&format!("{}.outputTail", fields::DEPLOY))
            .and_then(Value::as_str)
            .and_then(|tail| tail.lines().last())
            .or_else(|| {
                state
                    .get_path(&format!("{}.error", fields::DEPLOY))
                    .and_then(Value::as_str)
            })
            .unwrap_or("no output");
        Ok(StateUpdate::new().fatal(format!("deploy failed: {}", detail)))
    })
}

/// Writes a one-line summary of the run
pub fn done() -> FnNode {
    FnNode::new(|state| {
        let platform = state.get_str(fields::PLATFORM).unwrap_or("unknown");
        let dir = state.get_str(fields::PROJECT_DIR).unwrap_or(".");
        let attempts = state.get_f64(fields::BUILD_ATTEMPTS).unwrap_or(0.0) as u64;
        let skipped = state
            .get_path(&format!("{}.skipped", fields::DEPLOY))
            .and_then(Value::as_bool);
        let deployed = match skipped {
            Some(true) => "no deploy configured",
            _ => "deployed",
        };
        let summary = format!(
            "Built {} app in {} after {} attempt(s), {}",
            platform, dir, attempts, deployed
        );
        log::info!("{}", summary);
        Ok(StateUpdate::new().set(fields::SUMMARY, summary))
    })
}
