// SPDX-License-Identifier: MIT

//! Application pipeline: plan, generate, build and deploy
//!
//! ```text
//! plan -> confirm_platform* -> generate_sources* -> build <-> build_recover
//!                                                     |            |
//!                                                   deploy    build_give_up -> failed
//!                                                  /      \
//!                                               done   deploy_failed -> failed
//! ```
//!
//! Nodes marked `*` suspend for the driving agent.

mod nodes;

pub use nodes::{GeneratedSources, PlatformConfirmation};

use std::sync::Arc;

use crate::runtime::command::{CommandRunner, ExecOptions};
use crate::runtime::error::StepwiseError;
use crate::runtime::progress::{LogReporter, ProgressParser, ProgressReporter};
use crate::stepwise::config::StepwiseConfig;
use crate::stepwise::workflow::checkpoint::CheckpointStore;
use crate::stepwise::workflow::command_node::CommandNode;
use crate::stepwise::workflow::error::WorkflowError;
use crate::stepwise::workflow::graph::{Graph, GraphBuilder, Orchestrator, FAILURE_NODE};
use crate::stepwise::workflow::recovery::{transient_rules, RecoveryLoop, RecoveryNode};
use crate::stepwise::workflow::router::ConditionRouter;
use crate::stepwise::workflow::state::{FieldType, StateSchema};

pub const PIPELINE_NAME: &str = "app_pipeline";

/// State fields written by the pipeline
pub mod fields {
    pub const REQUEST: &str = "request";
    pub const PLATFORM_HINT: &str = "platformHint";
    pub const PLATFORM: &str = "platform";
    pub const PROJECT_DIR: &str = "projectDir";
    pub const GENERATED_FILES: &str = "generatedFiles";
    pub const BUILD: &str = "build";
    pub const BUILD_ATTEMPTS: &str = "buildAttemptCount";
    pub const DEPLOY: &str = "deploy";
    pub const SUMMARY: &str = "summary";
}

fn schema() -> StateSchema {
    StateSchema::default()
        .field(fields::REQUEST, FieldType::String)
        .field(fields::PLATFORM_HINT, FieldType::String)
        .field(fields::PLATFORM, FieldType::String)
        .field(fields::PROJECT_DIR, FieldType::String)
        .field(fields::GENERATED_FILES, FieldType::Array)
        .field(fields::DEPLOY, FieldType::Object)
        .field(fields::SUMMARY, FieldType::String)
}

fn reporting(
    options: ExecOptions,
    label: &str,
    parser: Option<Arc<dyn ProgressParser>>,
) -> ExecOptions {
    let reporter: Arc<dyn ProgressReporter> = Arc::new(LogReporter::new(label));
    ExecOptions {
        progress_parser: parser,
        progress_reporter: Some(reporter),
        ..options
    }
}

/// Build the pipeline graph. Commands are looked up per platform in
/// `config` and run through `runner`.
pub fn app_workflow(
    config: &StepwiseConfig,
    runner: Arc<dyn CommandRunner>,
) -> Result<Graph, StepwiseError> {
    let config = Arc::new(config.clone());
    let parser: Arc<dyn ProgressParser> = config.progress_parser()?;
    let base = config.exec_options();

    let build_config = config.clone();
    let build = CommandNode::new(fields::BUILD, runner.clone(), move |state| {
        nodes::build_command(&build_config, state)
    })
    .with_options(reporting(base.clone(), fields::BUILD, Some(parser)));

    let recovery = RecoveryNode::new(runner.clone(), fields::BUILD)
        .rules(config.recovery_rules()?)
        .rules(transient_rules())
        .scope_field(fields::PLATFORM)
        .working_dir_field(fields::PROJECT_DIR)
        .with_options(base.clone());

    let deploy_config = config.clone();
    let deploy = CommandNode::new(fields::DEPLOY, runner, move |state| {
        nodes::deploy_command(&deploy_config, state)
    })
    .with_options(reporting(base, fields::DEPLOY, None))
    .non_idempotent();

    let after_deploy = ConditionRouter::new("after_deploy")
        .when(&format!("{}.success == true", fields::DEPLOY), "done")
        .map_err(|e| WorkflowError::InvalidGraph(e.to_string()))?
        .otherwise("deploy_failed");

    let builder = GraphBuilder::new(PIPELINE_NAME)
        .schema(schema())
        .require_input(fields::REQUEST)
        .start("plan")
        .node("plan", nodes::plan(config.clone()))
        .edge("plan", "confirm_platform")
        .node("confirm_platform", nodes::confirm_platform(config.clone()))
        .edge("confirm_platform", "generate_sources")
        .node("generate_sources", nodes::generate_sources())
        .edge("generate_sources", fields::BUILD)
        .node(fields::DEPLOY, deploy)
        .route(fields::DEPLOY, after_deploy)
        .node("deploy_failed", nodes::deploy_failed())
        .edge("deploy_failed", FAILURE_NODE)
        .node("done", nodes::done())
        .end("done");

    let graph = RecoveryLoop::new(fields::BUILD, fields::DEPLOY)
        .max_attempts(config.max_build_attempts)
        .install(builder, build, recovery)?
        .build()?;

    log::debug!(
        "Built '{}' with nodes {:?}",
        graph.name(),
        graph.node_names()
    );
    Ok(graph)
}

/// Orchestrator over the pipeline, honouring the configured transition ceiling
pub fn app_orchestrator(
    config: &StepwiseConfig,
    runner: Arc<dyn CommandRunner>,
    store: Arc<dyn CheckpointStore>,
) -> Result<Orchestrator, StepwiseError> {
    let graph = app_workflow(config, runner)?;
    Ok(Orchestrator::new(graph, store).with_max_transitions(config.max_transitions))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::command::{ScriptedResponse, ScriptedRunner};
    use crate::stepwise::workflow::checkpoint::{Checkpoint, MemoryCheckpointStore};
    use crate::stepwise::workflow::graph::{StepEvent, StepOutcome};
    use crate::stepwise::workflow::node::ToolInvocationResult;
    use crate::stepwise::workflow::state::WorkflowState;
    use serde_json::{json, Value};

    fn pipeline(config: &StepwiseConfig, runner: &ScriptedRunner) -> Orchestrator {
        app_orchestrator(
            config,
            Arc::new(runner.clone()),
            Arc::new(MemoryCheckpointStore::new()),
        )
        .unwrap()
    }

    fn answer(outcome: &StepOutcome, payload: Value) -> StepEvent {
        let request = outcome.request().expect("outcome has a pending request");
        StepEvent::Resume(ToolInvocationResult::for_request(
            request.request_id.clone(),
            payload,
        ))
    }

    /// Drives the session up to the build and returns the last outcome
    async fn run_to_build(orch: &Orchestrator, platform: &str) -> StepOutcome {
        let first = orch
            .step("s1", StepEvent::Start(json!({"request": "build iOS app"})))
            .await
            .unwrap();
        let second = orch
            .step("s1", answer(&first, json!({"platform": platform})))
            .await
            .unwrap();
        orch.step(
            "s1",
            answer(
                &second,
                json!({"projectDir": "/tmp/app", "files": ["App.swift"]}),
            ),
        )
        .await
        .unwrap()
    }

    #[test]
    fn test_graph_shape() {
        let graph =
            app_workflow(&StepwiseConfig::default(), Arc::new(ScriptedRunner::new())).unwrap();
        assert_eq!(graph.start(), "plan");
        for node in [
            "plan",
            "confirm_platform",
            "generate_sources",
            "build",
            "build_recover",
            "build_give_up",
            "deploy",
            "deploy_failed",
            "done",
            FAILURE_NODE,
        ] {
            assert!(graph.contains(node), "missing node {node}");
        }
        assert_eq!(graph.required_inputs(), ["request".to_string()]);
    }

    #[tokio::test]
    async fn test_first_step_asks_for_platform_with_hint() {
        let runner = ScriptedRunner::new();
        let orch = pipeline(&StepwiseConfig::default(), &runner);

        let outcome = orch
            .step("s1", StepEvent::Start(json!({"request": "build iOS app"})))
            .await
            .unwrap();
        let request = outcome.request().unwrap();
        assert_eq!(request.tool_name, "confirm_platform");
        assert_eq!(request.request_id, "confirm_platform#1");
        assert_eq!(request.input["suggested"], "iOS");
        assert_eq!(request.input["options"], json!(["Android", "Web", "iOS"]));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_platform_answer_is_canonicalised() {
        let orch = pipeline(&StepwiseConfig::default(), &ScriptedRunner::new());
        let first = orch
            .step("s1", StepEvent::Start(json!({"request": "build iOS app"})))
            .await
            .unwrap();
        let second = orch
            .step("s1", answer(&first, json!({"platform": "ios"})))
            .await
            .unwrap();

        assert_eq!(second.request().unwrap().tool_name, "generate_sources");
        assert_eq!(second.request().unwrap().input["platform"], "iOS");

        let checkpoint = orch.checkpoint("s1").await.unwrap().unwrap();
        assert_eq!(checkpoint.state.get_str("platform"), Some("iOS"));
        assert_eq!(checkpoint.cursor, "generate_sources");
    }

    #[tokio::test]
    async fn test_unknown_platform_is_invalid_result() {
        let orch = pipeline(&StepwiseConfig::default(), &ScriptedRunner::new());
        let first = orch
            .step("s1", StepEvent::Start(json!({"request": "make me an app"})))
            .await
            .unwrap();
        assert_eq!(first.request().unwrap().input["suggested"], Value::Null);

        let outcome = orch
            .step("s1", answer(&first, json!({"platform": "Symbian"})))
            .await
            .unwrap();
        match outcome {
            StepOutcome::InvalidResult { error, request, .. } => {
                assert!(error.contains("unknown platform 'Symbian'"));
                assert_eq!(request.tool_name, "confirm_platform");
            }
            other => panic!("expected invalid result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_file_list_is_rejected() {
        let orch = pipeline(&StepwiseConfig::default(), &ScriptedRunner::new());
        let first = orch
            .step("s1", StepEvent::Start(json!({"request": "build iOS app"})))
            .await
            .unwrap();
        let second = orch
            .step("s1", answer(&first, json!({"platform": "iOS"})))
            .await
            .unwrap();
        let outcome = orch
            .step("s1", answer(&second, json!({"projectDir": "/tmp/app", "files": []})))
            .await
            .unwrap();
        assert!(matches!(outcome, StepOutcome::InvalidResult { .. }));
    }

    #[tokio::test]
    async fn test_happy_path_builds_and_deploys() {
        let runner = ScriptedRunner::with_responses([
            ScriptedResponse::success("** BUILD SUCCEEDED **"),
            ScriptedResponse::success("uploaded"),
        ]);
        let orch = pipeline(&StepwiseConfig::default(), &runner);

        match run_to_build(&orch, "iOS").await {
            StepOutcome::Completed { state, .. } => {
                assert_eq!(state["platform"], "iOS");
                assert_eq!(state["buildAttemptCount"], 1);
                assert_eq!(state["build"]["success"], true);
                assert_eq!(state["deploy"]["success"], true);
                assert_eq!(state["generatedFiles"], json!(["App.swift"]));
                assert_eq!(
                    state["summary"],
                    "Built iOS app in /tmp/app after 1 attempt(s), deployed"
                );
            }
            other => panic!("expected completion, got {other:?}"),
        }

        assert_eq!(runner.executables(), vec!["xcodebuild", "fastlane"]);
        for call in runner.calls() {
            assert_eq!(
                call.command.working_dir(),
                Some(std::path::Path::new("/tmp/app"))
            );
        }
    }

    #[tokio::test]
    async fn test_build_failure_recovers_with_platform_fix() {
        let runner = ScriptedRunner::with_responses([
            ScriptedResponse::failure(65, "error: no such module 'Alamofire'"),
            ScriptedResponse::success("Pod installation complete"),
            ScriptedResponse::success("** BUILD SUCCEEDED **"),
            ScriptedResponse::success("uploaded"),
        ]);
        let orch = pipeline(&StepwiseConfig::default(), &runner);

        match run_to_build(&orch, "iOS").await {
            StepOutcome::Completed { state, .. } => {
                assert_eq!(state["buildAttemptCount"], 2);
                assert!(state["fatalErrors"].as_array().map_or(true, Vec::is_empty));
                let fixes = state["fixesAttempted"].as_array().unwrap();
                assert_eq!(fixes.len(), 1);
                assert!(fixes[0].as_str().unwrap().starts_with("pods-out-of-sync: ran pod"));
            }
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(
            runner.executables(),
            vec!["xcodebuild", "pod", "xcodebuild", "fastlane"]
        );
    }

    #[tokio::test]
    async fn test_build_gives_up_after_configured_attempts() {
        let config = StepwiseConfig {
            max_build_attempts: 2,
            ..StepwiseConfig::default()
        };
        let runner = ScriptedRunner::with_responses([
            ScriptedResponse::failure(1, "fatal: Could not resolve host: github.com"),
            ScriptedResponse::failure(1, "fatal: Could not resolve host: github.com"),
        ]);
        let orch = pipeline(&config, &runner);

        match run_to_build(&orch, "iOS").await {
            StepOutcome::Failed { errors, summary, .. } => {
                assert_eq!(errors.len(), 1);
                assert!(errors[0].starts_with("build failed after 2 attempt(s)"));
                assert!(summary.contains("Workflow failed with 1 error(s)"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(runner.executables(), vec!["xcodebuild", "xcodebuild"]);
    }

    #[tokio::test]
    async fn test_deploy_failure_fails_workflow() {
        let runner = ScriptedRunner::with_responses([
            ScriptedResponse::success("BUILD SUCCESSFUL"),
            ScriptedResponse::failure(1, "401 Unauthorized"),
        ]);
        let orch = pipeline(&StepwiseConfig::default(), &runner);

        match run_to_build(&orch, "Android").await {
            StepOutcome::Failed { errors, .. } => {
                assert_eq!(errors, vec!["deploy failed: 401 Unauthorized"]);
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(runner.executables(), vec!["./gradlew", "./gradlew"]);
    }

    #[tokio::test]
    async fn test_platform_without_deploy_skips_it() {
        let mut config = StepwiseConfig::default();
        if let Some(web) = config.platforms.get_mut("Web") {
            web.deploy = None;
        }
        let runner = ScriptedRunner::new();
        let orch = pipeline(&config, &runner);

        match run_to_build(&orch, "web").await {
            StepOutcome::Completed { state, .. } => {
                assert_eq!(state["deploy"]["skipped"], true);
                assert!(state["summary"]
                    .as_str()
                    .unwrap()
                    .ends_with("no deploy configured"));
            }
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(runner.executables(), vec!["npm"]);
    }

    #[tokio::test]
    async fn test_interrupted_deploy_is_not_run_again() {
        let store = MemoryCheckpointStore::new();
        let runner = ScriptedRunner::with_responses([ScriptedResponse::success("uploaded")]);
        let orch = app_orchestrator(
            &StepwiseConfig::default(),
            Arc::new(runner.clone()),
            Arc::new(store.clone()),
        )
        .unwrap();

        let mut state = WorkflowState::empty();
        state.insert(fields::REQUEST, json!("build Android app"));
        state.insert(fields::PLATFORM, json!("Android"));
        state.insert(fields::PROJECT_DIR, json!("/tmp/app"));
        state.insert(fields::BUILD_ATTEMPTS, json!(1));
        state.insert(fields::BUILD, json!({"success": true, "exitCode": 0}));
        let mut checkpoint = Checkpoint::new("s1", fields::DEPLOY, state);
        checkpoint.sequence = 6;
        checkpoint.in_flight = Some("deploy#6".to_string());
        store.save(&checkpoint).await.unwrap();

        match orch.step("s1", StepEvent::Continue).await.unwrap() {
            StepOutcome::Failed { errors, .. } => {
                assert_eq!(
                    errors,
                    vec!["deploy failed: interrupted before completion, not re-run"]
                );
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(runner.calls().is_empty());

        let saved = store.load("s1").await.unwrap().unwrap();
        assert_eq!(saved.state.get_path("deploy.interrupted"), Some(&json!(true)));
        assert!(saved.in_flight.is_none());
    }

    #[tokio::test]
    async fn test_in_flight_marker_from_older_position_is_ignored() {
        let store = MemoryCheckpointStore::new();
        let runner = ScriptedRunner::with_responses([ScriptedResponse::success("uploaded")]);
        let orch = app_orchestrator(
            &StepwiseConfig::default(),
            Arc::new(runner.clone()),
            Arc::new(store.clone()),
        )
        .unwrap();

        let mut state = WorkflowState::empty();
        state.insert(fields::REQUEST, json!("build Android app"));
        state.insert(fields::PLATFORM, json!("Android"));
        state.insert(fields::PROJECT_DIR, json!("/tmp/app"));
        state.insert(fields::BUILD_ATTEMPTS, json!(1));
        let mut checkpoint = Checkpoint::new("s1", fields::DEPLOY, state);
        checkpoint.sequence = 6;
        checkpoint.in_flight = Some("deploy#2".to_string());
        store.save(&checkpoint).await.unwrap();

        let outcome = orch.step("s1", StepEvent::Continue).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Completed { .. }));
        assert_eq!(runner.executables(), vec!["./gradlew"]);
    }
}
