// SPDX-License-Identifier: MIT

//! Graph orchestrator
//!
//! `step` runs a session forward from its checkpoint until the graph either
//! suspends on a tool node or reaches a terminal node. One call produces at
//! most one suspension; pure and leaf nodes in between chain freely.

use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use serde_json::{json, Value};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use super::types::{Edge, Graph, FAILURE_NODE, FAILURE_SUMMARY};
use crate::stepwise::workflow::checkpoint::{Checkpoint, CheckpointStatus, CheckpointStore};
use crate::stepwise::workflow::error::{NodeError, StoreError, WorkflowError};
use crate::stepwise::workflow::node::{
    NodeContext, NodeOutcome, ToolInvocationRequest, ToolInvocationResult,
};
use crate::stepwise::workflow::state::{StateUpdate, WorkflowState, SESSION_ID};

/// Default ceiling on node executions per `step` call
pub const DEFAULT_MAX_TRANSITIONS: usize = 1000;

/// What the caller asks `step` to do
#[derive(Debug, Clone, PartialEq)]
pub enum StepEvent {
    /// Begin a new session with the given input object
    Start(Value),
    /// Deliver a tool result to the suspended node
    Resume(ToolInvocationResult),
    /// Re-enter a running checkpoint, or replay a settled one
    Continue,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum StepOutcome {
    #[serde(rename_all = "camelCase")]
    Suspended {
        session_id: String,
        request: ToolInvocationRequest,
    },
    /// The result did not validate; the same request is still pending
    #[serde(rename_all = "camelCase")]
    InvalidResult {
        session_id: String,
        error: String,
        request: ToolInvocationRequest,
    },
    #[serde(rename_all = "camelCase")]
    Completed { session_id: String, state: Value },
    #[serde(rename_all = "camelCase")]
    Failed {
        session_id: String,
        errors: Vec<String>,
        summary: String,
    },
}

impl StepOutcome {
    pub fn session_id(&self) -> &str {
        match self {
            StepOutcome::Suspended { session_id, .. }
            | StepOutcome::InvalidResult { session_id, .. }
            | StepOutcome::Completed { session_id, .. }
            | StepOutcome::Failed { session_id, .. } => session_id,
        }
    }

    /// The pending request, if the session is waiting on one
    pub fn request(&self) -> Option<&ToolInvocationRequest> {
        match self {
            StepOutcome::Suspended { request, .. } | StepOutcome::InvalidResult { request, .. } => {
                Some(request)
            }
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepOutcome::Completed { .. } | StepOutcome::Failed { .. }
        )
    }
}

/// Drives sessions of one graph against a checkpoint store
#[derive(Clone)]
pub struct Orchestrator {
    graph: Arc<Graph>,
    store: Arc<dyn CheckpointStore>,
    max_transitions: usize,
}

impl Orchestrator {
    pub fn new(graph: Graph, store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            graph: Arc::new(graph),
            store,
            max_transitions: DEFAULT_MAX_TRANSITIONS,
        }
    }

    pub fn with_max_transitions(mut self, max_transitions: usize) -> Self {
        self.max_transitions = max_transitions.max(1);
        self
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub async fn checkpoint(&self, session_id: &str) -> Result<Option<Checkpoint>, WorkflowError> {
        Ok(self.store.load(session_id).await?)
    }

    /// Advance `session_id` by one event. A second caller for the same
    /// session, in this process or another one sharing the store, gets
    /// `SessionBusy` while the first is running.
    pub async fn step(
        &self,
        session_id: &str,
        event: StepEvent,
    ) -> Result<StepOutcome, WorkflowError> {
        let _lease = self.store.try_lock(session_id).await.map_err(|e| match e {
            StoreError::Locked { session, lock } => {
                log::warn!("Session '{}' is held elsewhere ({})", session, lock);
                WorkflowError::SessionBusy(session)
            }
            other => WorkflowError::Store(other),
        })?;
        let existing = self.store.load(session_id).await?;

        match event {
            StepEvent::Start(input) => {
                if existing.is_some() {
                    return Err(WorkflowError::SessionAlreadyStarted(session_id.to_string()));
                }
                let checkpoint = self.initialize(session_id, input)?;
                log::info!(
                    "Starting session '{}' on graph '{}'",
                    session_id,
                    self.graph.name()
                );
                self.run(checkpoint, None).await
            }
            StepEvent::Continue => {
                let checkpoint = existing
                    .ok_or_else(|| WorkflowError::SessionNotFound(session_id.to_string()))?;
                self.settle(checkpoint).await
            }
            StepEvent::Resume(result) => {
                let checkpoint = existing
                    .ok_or_else(|| WorkflowError::SessionNotFound(session_id.to_string()))?;
                self.resume(checkpoint, result).await
            }
        }
    }

    fn initialize(&self, session_id: &str, input: Value) -> Result<Checkpoint, WorkflowError> {
        let update =
            StateUpdate::from_object(input).map_err(|e| WorkflowError::InvalidInput(e.to_string()))?;

        let schema = self.graph.schema();
        let mut state = WorkflowState::new(schema);
        state.insert(SESSION_ID, json!(session_id));

        let mut checkpoint = Checkpoint::new(session_id, self.graph.start(), state);
        if let Err(e) = checkpoint.state.apply(&update, schema) {
            self.record_fatal(&mut checkpoint, format!("Invalid start input: {}", e));
        }
        for field in self.graph.required_inputs() {
            if !checkpoint.state.contains(field) {
                self.record_fatal(
                    &mut checkpoint,
                    format!("Missing required input '{}'", field),
                );
            }
        }
        Ok(checkpoint)
    }

    async fn resume(
        &self,
        checkpoint: Checkpoint,
        result: ToolInvocationResult,
    ) -> Result<StepOutcome, WorkflowError> {
        let pending_id = checkpoint.pending.as_ref().map(|p| p.request_id.clone());

        if let Some(id) = result.request_id.as_deref() {
            if checkpoint.answered_request.as_deref() == Some(id) && pending_id.as_deref() != Some(id) {
                log::info!(
                    "Session '{}': request '{}' was already answered, replaying",
                    checkpoint.session_id,
                    id
                );
                return self.settle(checkpoint).await;
            }
        }

        let pending_id = match (checkpoint.status, pending_id) {
            (CheckpointStatus::Suspended, Some(id)) => id,
            (status, _) => {
                return Err(WorkflowError::NotSuspended {
                    session: checkpoint.session_id.clone(),
                    status: status.to_string(),
                })
            }
        };

        if let Some(id) = result.request_id.as_deref() {
            if id != pending_id {
                return Err(WorkflowError::StaleResult {
                    session: checkpoint.session_id.clone(),
                    request_id: id.to_string(),
                });
            }
        }

        self.run(checkpoint, Some(result)).await
    }

    /// Continue a running checkpoint, or report where a settled one stands
    async fn settle(&self, checkpoint: Checkpoint) -> Result<StepOutcome, WorkflowError> {
        if checkpoint.status == CheckpointStatus::Running {
            log::info!(
                "Session '{}': continuing at '{}'",
                checkpoint.session_id,
                checkpoint.cursor
            );
            return self.run(checkpoint, None).await;
        }
        self.outcome(&checkpoint)
    }

    fn outcome(&self, checkpoint: &Checkpoint) -> Result<StepOutcome, WorkflowError> {
        let session_id = checkpoint.session_id.clone();
        match (checkpoint.status, &checkpoint.pending) {
            (CheckpointStatus::Suspended, Some(request)) => Ok(StepOutcome::Suspended {
                session_id,
                request: request.clone(),
            }),
            (CheckpointStatus::Completed, _) => Ok(StepOutcome::Completed {
                session_id,
                state: checkpoint.state.to_json(),
            }),
            (CheckpointStatus::Failed, _) => {
                let errors = checkpoint.state.fatal_errors();
                let summary = checkpoint
                    .state
                    .get_str(FAILURE_SUMMARY)
                    .map(str::to_string)
                    .unwrap_or_else(|| errors.join("; "));
                Ok(StepOutcome::Failed {
                    session_id,
                    errors,
                    summary,
                })
            }
            (status, _) => Err(WorkflowError::NotSuspended {
                session: session_id,
                status: status.to_string(),
            }),
        }
    }

    async fn run(
        &self,
        mut checkpoint: Checkpoint,
        mut resume: Option<ToolInvocationResult>,
    ) -> Result<StepOutcome, WorkflowError> {
        let mut transitions = 0usize;

        loop {
            if checkpoint.state.has_fatal_errors() && checkpoint.cursor != FAILURE_NODE {
                self.divert_to_failure(&mut checkpoint);
            }

            transitions += 1;
            if transitions > self.max_transitions && checkpoint.cursor != FAILURE_NODE {
                let message = format!(
                    "Exceeded {} node transitions in one step (last node '{}')",
                    self.max_transitions, checkpoint.cursor
                );
                self.record_fatal(&mut checkpoint, message);
                continue;
            }

            let cursor = checkpoint.cursor.clone();
            let Some(node) = self.graph.node(&cursor).cloned() else {
                if cursor == FAILURE_NODE {
                    return self.finish(&mut checkpoint, CheckpointStatus::Failed).await;
                }
                self.record_fatal(&mut checkpoint, format!("Unknown node '{}'", cursor));
                continue;
            };

            let interrupted = if node.side_effecting() && resume.is_none() {
                self.mark_in_flight(&mut checkpoint).await?
            } else {
                false
            };

            let answering = resume.is_some();
            let result = {
                let ctx = NodeContext {
                    session_id: &checkpoint.session_id,
                    node_name: &cursor,
                    sequence: checkpoint.sequence,
                    resume: resume.as_ref(),
                    interrupted,
                };
                AssertUnwindSafe(node.execute(&checkpoint.state, &ctx))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        Err(NodeError::failed(format!(
                            "panicked: {}",
                            panic_message(panic.as_ref())
                        )))
                    })
            };
            checkpoint.in_flight = None;

            match result {
                Ok(NodeOutcome::Suspended(request)) => {
                    log::info!(
                        "Session '{}' suspended at '{}' waiting for '{}' ({})",
                        checkpoint.session_id,
                        cursor,
                        request.tool_name,
                        request.request_id
                    );
                    checkpoint.status = CheckpointStatus::Suspended;
                    checkpoint.pending = Some(request.clone());
                    self.persist(&mut checkpoint).await?;
                    return Ok(StepOutcome::Suspended {
                        session_id: checkpoint.session_id.clone(),
                        request,
                    });
                }
                Err(e) if answering && e.is_validation() && checkpoint.pending.is_some() => {
                    let request = checkpoint.pending.clone().ok_or_else(|| {
                        WorkflowError::NotSuspended {
                            session: checkpoint.session_id.clone(),
                            status: checkpoint.status.to_string(),
                        }
                    })?;
                    log::warn!(
                        "Session '{}': rejected result for '{}': {}",
                        checkpoint.session_id,
                        request.request_id,
                        e
                    );
                    return Ok(StepOutcome::InvalidResult {
                        session_id: checkpoint.session_id.clone(),
                        error: e.to_string(),
                        request,
                    });
                }
                Err(e) => {
                    if cursor == FAILURE_NODE {
                        log::error!("Failure node itself failed: {}", e);
                        return self.finish(&mut checkpoint, CheckpointStatus::Failed).await;
                    }
                    if resume.take().is_some() {
                        self.mark_answered(&mut checkpoint);
                    }
                    self.record_fatal(&mut checkpoint, format!("Node '{}' failed: {}", cursor, e));
                }
                Ok(NodeOutcome::Completed(update)) => {
                    if resume.take().is_some() {
                        self.mark_answered(&mut checkpoint);
                    }
                    if let Err(e) = checkpoint.state.apply(&update, self.graph.schema()) {
                        if cursor == FAILURE_NODE {
                            log::error!("Failure node produced an invalid update: {}", e);
                            return self.finish(&mut checkpoint, CheckpointStatus::Failed).await;
                        }
                        self.record_fatal(
                            &mut checkpoint,
                            format!("Node '{}' produced an invalid update: {}", cursor, e),
                        );
                        continue;
                    }
                    log::info!("Node '{}' completed", cursor);

                    if cursor == FAILURE_NODE {
                        return self.finish(&mut checkpoint, CheckpointStatus::Failed).await;
                    }
                    if checkpoint.state.has_fatal_errors() {
                        continue;
                    }

                    let next = match self.graph.edge(&cursor) {
                        None | Some(Edge::End) => {
                            return self
                                .finish(&mut checkpoint, CheckpointStatus::Completed)
                                .await;
                        }
                        Some(Edge::To(next)) => next.clone(),
                        Some(Edge::Route(router)) => match router.route(&checkpoint.state) {
                            Ok(next) if self.graph.contains(&next) => next,
                            Ok(next) => {
                                self.record_fatal(
                                    &mut checkpoint,
                                    format!(
                                        "Router '{}' chose unknown node '{}'",
                                        router.name(),
                                        next
                                    ),
                                );
                                continue;
                            }
                            Err(e) => {
                                self.record_fatal(&mut checkpoint, e.to_string());
                                continue;
                            }
                        },
                    };

                    log::debug!("Session '{}': {} -> {}", checkpoint.session_id, cursor, next);
                    self.advance(&mut checkpoint, next);
                    self.persist(&mut checkpoint).await?;
                }
            }
        }
    }

    /// Persist the in-flight marker for the node at the cursor. Returns true
    /// when the marker was already there, meaning an earlier run of the same
    /// invocation never completed.
    async fn mark_in_flight(&self, checkpoint: &mut Checkpoint) -> Result<bool, WorkflowError> {
        let marker = format!("{}#{}", checkpoint.cursor, checkpoint.sequence);
        if checkpoint.in_flight.as_deref() == Some(marker.as_str()) {
            log::warn!(
                "Session '{}': '{}' was interrupted before completing",
                checkpoint.session_id,
                marker
            );
            return Ok(true);
        }
        checkpoint.in_flight = Some(marker);
        self.persist(checkpoint).await?;
        Ok(false)
    }

    fn mark_answered(&self, checkpoint: &mut Checkpoint) {
        checkpoint.answered_request = checkpoint.pending.take().map(|r| r.request_id);
        checkpoint.status = CheckpointStatus::Running;
    }

    fn advance(&self, checkpoint: &mut Checkpoint, next: String) {
        checkpoint.cursor = next;
        checkpoint.sequence += 1;
        checkpoint.status = CheckpointStatus::Running;
        checkpoint.pending = None;
    }

    fn divert_to_failure(&self, checkpoint: &mut Checkpoint) {
        log::warn!(
            "Session '{}': diverting from '{}' to '{}'",
            checkpoint.session_id,
            checkpoint.cursor,
            FAILURE_NODE
        );
        self.advance(checkpoint, FAILURE_NODE.to_string());
    }

    fn record_fatal(&self, checkpoint: &mut Checkpoint, message: String) {
        log::error!("Session '{}': {}", checkpoint.session_id, message);
        let update = StateUpdate::new().fatal(message);
        if let Err(e) = checkpoint.state.apply(&update, self.graph.schema()) {
            log::error!("Failed to record fatal error: {}", e);
        }
    }

    async fn finish(
        &self,
        checkpoint: &mut Checkpoint,
        status: CheckpointStatus,
    ) -> Result<StepOutcome, WorkflowError> {
        checkpoint.status = status;
        checkpoint.pending = None;
        self.persist(checkpoint).await?;
        log::info!("Session '{}' {}", checkpoint.session_id, status);
        self.outcome(checkpoint)
    }

    async fn persist(&self, checkpoint: &mut Checkpoint) -> Result<(), WorkflowError> {
        checkpoint.updated_at = Utc::now();
        self.store.save(checkpoint).await?;
        Ok(())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::command::{Command, ScriptedResponse, ScriptedRunner};
    use crate::stepwise::workflow::checkpoint::MemoryCheckpointStore;
    use crate::stepwise::workflow::command_node::CommandNode;
    use crate::stepwise::workflow::graph::GraphBuilder;
    use crate::stepwise::workflow::node::{FnNode, Node};
    use crate::stepwise::workflow::recovery::{RecoveryLoop, RecoveryNode, RecoveryRule};
    use crate::stepwise::workflow::router::FnRouter;
    use crate::stepwise::workflow::state::{FieldType, StateSchema};
    use crate::stepwise::workflow::tool_node::ToolInvocationNode;
    use async_trait::async_trait;
    use schemars::JsonSchema;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    #[derive(Debug, Deserialize, JsonSchema)]
    struct PlatformChoice {
        platform: String,
    }

    #[derive(Debug, Deserialize, JsonSchema)]
    struct Approval {
        approved: bool,
    }

    fn confirm_platform() -> ToolInvocationNode<PlatformChoice> {
        ToolInvocationNode::new("confirm_platform", "Confirm the target platform")
            .with_input(|state| Ok(json!({"request": state.get_str("request")})))
            .on_result(|choice: PlatformChoice, _| match choice.platform.as_str() {
                "iOS" | "Android" => Ok(StateUpdate::new().set("platform", choice.platform)),
                other => Err(NodeError::validation(format!("unsupported platform '{}'", other))),
            })
    }

    fn counting(counter: &Arc<AtomicUsize>) -> FnNode {
        let counter = counter.clone();
        FnNode::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(StateUpdate::new().set("planned", true))
        })
    }

    /// request -> confirm (tool) -> plan (pure) -> approve (tool) -> end
    fn two_suspends(counter: &Arc<AtomicUsize>) -> Graph {
        GraphBuilder::new("two_suspends")
            .schema(
                StateSchema::default()
                    .field("request", FieldType::String)
                    .field("platform", FieldType::String)
                    .field("approved", FieldType::Boolean),
            )
            .require_input("request")
            .node("confirm", confirm_platform())
            .node("plan", counting(counter))
            .node(
                "approve",
                ToolInvocationNode::new("approve_plan", "Approve the plan")
                    .on_result(|a: Approval, _| Ok(StateUpdate::new().set("approved", a.approved))),
            )
            .start("confirm")
            .edge("confirm", "plan")
            .edge("plan", "approve")
            .end("approve")
            .build()
            .unwrap()
    }

    fn orchestrator(graph: Graph) -> (Orchestrator, MemoryCheckpointStore) {
        let store = MemoryCheckpointStore::new();
        (Orchestrator::new(graph, Arc::new(store.clone())), store)
    }

    fn start_input() -> StepEvent {
        StepEvent::Start(json!({"request": "build iOS app"}))
    }

    fn request_of(outcome: &StepOutcome) -> ToolInvocationRequest {
        match outcome {
            StepOutcome::Suspended { request, .. } => request.clone(),
            other => panic!("expected suspension, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_happy_path_platform_confirmation() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (orch, store) = orchestrator(two_suspends(&counter));

        let first = orch.step("s1", start_input()).await.unwrap();
        let request = request_of(&first);
        assert_eq!(request.tool_name, "confirm_platform");
        assert_eq!(request.request_id, "confirm#0");
        assert_eq!(request.input, json!({"request": "build iOS app"}));

        let saved = store.load("s1").await.unwrap().unwrap();
        assert_eq!(saved.status, CheckpointStatus::Suspended);
        assert_eq!(saved.cursor, "confirm");

        let second = orch
            .step(
                "s1",
                StepEvent::Resume(ToolInvocationResult::for_request(
                    "confirm#0",
                    json!({"platform": "iOS"}),
                )),
            )
            .await
            .unwrap();
        assert_eq!(request_of(&second).tool_name, "approve_plan");

        let saved = store.load("s1").await.unwrap().unwrap();
        assert_eq!(saved.state.get_str("platform"), Some("iOS"));
        assert_eq!(saved.cursor, "approve");
        assert_eq!(saved.answered_request.as_deref(), Some("confirm#0"));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exactly_one_suspension_per_call() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (orch, _) = orchestrator(two_suspends(&counter));

        let first = orch.step("s1", start_input()).await.unwrap();
        assert_eq!(request_of(&first).tool_name, "confirm_platform");

        let second = orch
            .step(
                "s1",
                StepEvent::Resume(ToolInvocationResult::new(json!({"platform": "Android"}))),
            )
            .await
            .unwrap();
        let approve = request_of(&second);
        assert_eq!(approve.tool_name, "approve_plan");

        let third = orch
            .step(
                "s1",
                StepEvent::Resume(ToolInvocationResult::for_request(
                    approve.request_id,
                    json!({"approved": true}),
                )),
            )
            .await
            .unwrap();
        match third {
            StepOutcome::Completed { state, .. } => {
                assert_eq!(state["platform"], "Android");
                assert_eq!(state["approved"], true);
                assert_eq!(state[SESSION_ID], "s1");
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_duplicate_resume_replays_without_executing() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (orch, store) = orchestrator(two_suspends(&counter));
        orch.step("s1", start_input()).await.unwrap();

        let event = StepEvent::Resume(ToolInvocationResult::for_request(
            "confirm#0",
            json!({"platform": "iOS"}),
        ));
        let first = orch.step("s1", event.clone()).await.unwrap();
        let after_first = store.load("s1").await.unwrap().unwrap();

        let again = orch.step("s1", event).await.unwrap();
        let after_again = store.load("s1").await.unwrap().unwrap();

        assert_eq!(first, again);
        assert_eq!(after_first, after_again);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resume_after_lost_save_converges() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (orch, store) = orchestrator(two_suspends(&counter));
        orch.step("s1", start_input()).await.unwrap();
        let before = store.load("s1").await.unwrap().unwrap();

        let event = StepEvent::Resume(ToolInvocationResult::for_request(
            "confirm#0",
            json!({"platform": "iOS"}),
        ));
        let first = orch.step("s1", event.clone()).await.unwrap();
        let after_first = store.load("s1").await.unwrap().unwrap();

        // the process died before the new checkpoint became durable
        store.save(&before).await.unwrap();
        let second = orch.step("s1", event).await.unwrap();
        let after_second = store.load("s1").await.unwrap().unwrap();

        assert_eq!(first, second);
        assert!(after_first.same_position(&after_second));
    }

    #[tokio::test]
    async fn test_invalid_result_keeps_request_pending() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (orch, store) = orchestrator(two_suspends(&counter));
        orch.step("s1", start_input()).await.unwrap();

        let rejected = orch
            .step(
                "s1",
                StepEvent::Resume(ToolInvocationResult::new(json!({"platform": "Symbian"}))),
            )
            .await
            .unwrap();
        match &rejected {
            StepOutcome::InvalidResult { error, request, .. } => {
                assert!(error.contains("unsupported platform 'Symbian'"));
                assert_eq!(request.request_id, "confirm#0");
            }
            other => panic!("expected invalid result, got {other:?}"),
        }

        let wrong_shape = orch
            .step(
                "s1",
                StepEvent::Resume(ToolInvocationResult::new(json!({"os": "iOS"}))),
            )
            .await
            .unwrap();
        assert!(matches!(wrong_shape, StepOutcome::InvalidResult { .. }));

        let saved = store.load("s1").await.unwrap().unwrap();
        assert_eq!(saved.status, CheckpointStatus::Suspended);
        assert!(!saved.state.has_fatal_errors());

        let accepted = orch
            .step(
                "s1",
                StepEvent::Resume(ToolInvocationResult::new(json!({"platform": "iOS"}))),
            )
            .await
            .unwrap();
        assert_eq!(request_of(&accepted).tool_name, "approve_plan");
    }

    #[tokio::test]
    async fn test_caller_errors() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (orch, _) = orchestrator(two_suspends(&counter));

        assert!(matches!(
            orch.step("nope", StepEvent::Continue).await,
            Err(WorkflowError::SessionNotFound(_))
        ));
        assert!(matches!(
            orch.step("s1", StepEvent::Start(json!("not an object"))).await,
            Err(WorkflowError::InvalidInput(_))
        ));

        orch.step("s1", start_input()).await.unwrap();
        assert!(matches!(
            orch.step("s1", start_input()).await,
            Err(WorkflowError::SessionAlreadyStarted(_))
        ));
        assert!(matches!(
            orch.step(
                "s1",
                StepEvent::Resume(ToolInvocationResult::for_request("approve#7", json!({})))
            )
            .await,
            Err(WorkflowError::StaleResult { request_id, .. }) if request_id == "approve#7"
        ));
    }

    #[tokio::test]
    async fn test_missing_required_input_fails() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (orch, store) = orchestrator(two_suspends(&counter));

        let outcome = orch.step("s1", StepEvent::Start(json!({}))).await.unwrap();
        match outcome {
            StepOutcome::Failed { errors, summary, .. } => {
                assert_eq!(errors, vec!["Missing required input 'request'"]);
                assert!(summary.contains("1. Missing required input 'request'"));
            }
            other => panic!("expected failure, got {other:?}"),
        }

        let saved = store.load("s1").await.unwrap().unwrap();
        assert_eq!(saved.status, CheckpointStatus::Failed);
        assert_eq!(saved.cursor, FAILURE_NODE);
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        assert!(matches!(
            orch.step("s1", StepEvent::Resume(ToolInvocationResult::new(json!({})))).await,
            Err(WorkflowError::NotSuspended { .. })
        ));
        assert!(matches!(
            orch.step("s1", StepEvent::Continue).await.unwrap(),
            StepOutcome::Failed { .. }
        ));
    }

    #[tokio::test]
    async fn test_router_failure_is_fatal() {
        let graph = GraphBuilder::new("router")
            .node("a", FnNode::passthrough())
            .node("b", FnNode::passthrough())
            .route(
                "a",
                FnRouter::new("pick", &["b"], |_| {
                    Err(crate::stepwise::workflow::error::RouteError::MissingField {
                        router: "pick".to_string(),
                        field: "choice".to_string(),
                    })
                }),
            )
            .end("b")
            .start("a")
            .build()
            .unwrap();
        let (orch, _) = orchestrator(graph);

        let outcome = orch.step("s1", StepEvent::Start(json!({}))).await.unwrap();
        match outcome {
            StepOutcome::Failed { errors, .. } => {
                assert_eq!(errors, vec!["Router 'pick' requires state field 'choice'"]);
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    struct Panicking;

    #[async_trait]
    impl Node for Panicking {
        async fn execute(
            &self,
            _state: &WorkflowState,
            _ctx: &NodeContext<'_>,
        ) -> Result<NodeOutcome, NodeError> {
            panic!("boom");
        }
    }

    #[tokio::test]
    async fn test_panicking_node_is_fatal() {
        let graph = GraphBuilder::new("panics")
            .node("a", Panicking)
            .end("a")
            .start("a")
            .build()
            .unwrap();
        let (orch, _) = orchestrator(graph);

        match orch.step("s1", StepEvent::Start(json!({}))).await.unwrap() {
            StepOutcome::Failed { errors, .. } => {
                assert_eq!(errors, vec!["Node 'a' failed: panicked: boom"]);
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_state_type_error_is_fatal() {
        let graph = GraphBuilder::new("types")
            .field(
                "count",
                FieldType::Number,
                crate::stepwise::workflow::state::ReducerType::Overwrite,
                None,
            )
            .node("a", FnNode::new(|_| Ok(StateUpdate::new().set("count", "many"))))
            .end("a")
            .start("a")
            .build()
            .unwrap();
        let (orch, _) = orchestrator(graph);

        match orch.step("s1", StepEvent::Start(json!({}))).await.unwrap() {
            StepOutcome::Failed { errors, .. } => {
                assert!(errors[0].contains("Field 'count' expects Number, got string"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_runaway_loop_hits_transition_ceiling() {
        let graph = GraphBuilder::new("loop")
            .node("a", FnNode::passthrough())
            .node("b", FnNode::passthrough())
            .edge("a", "b")
            .edge("b", "a")
            .start("a")
            .build()
            .unwrap();
        let store = MemoryCheckpointStore::new();
        let orch = Orchestrator::new(graph, Arc::new(store)).with_max_transitions(10);

        match orch.step("s1", StepEvent::Start(json!({}))).await.unwrap() {
            StepOutcome::Failed { errors, .. } => {
                assert_eq!(errors.len(), 1);
                assert!(errors[0].starts_with("Exceeded 10 node transitions"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_continue_runs_a_running_checkpoint() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (orch, store) = orchestrator(two_suspends(&counter));

        let mut state = WorkflowState::empty();
        state.insert("request", json!("build iOS app"));
        state.insert("platform", json!("iOS"));
        let mut checkpoint = Checkpoint::new("s1", "plan", state);
        checkpoint.sequence = 1;
        store.save(&checkpoint).await.unwrap();

        let outcome = orch.step("s1", StepEvent::Continue).await.unwrap();
        assert_eq!(request_of(&outcome).request_id, "approve#2");
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // settled sessions just report where they are
        let again = orch.step("s1", StepEvent::Continue).await.unwrap();
        assert_eq!(again, outcome);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    fn build_graph(runner: &ScriptedRunner, max_attempts: u32) -> Graph {
        let runner: Arc<ScriptedRunner> = Arc::new(runner.clone());
        let builder = GraphBuilder::new("build_loop")
            .node("done", FnNode::new(|state| {
                let attempts = state.get_f64("buildAttemptCount").unwrap_or(0.0);
                Ok(StateUpdate::new().set("summary", format!("built in {} attempt(s)", attempts)))
            }))
            .end("done")
            .start("build");

        RecoveryLoop::new("build", "done")
            .max_attempts(max_attempts)
            .install(
                builder,
                CommandNode::new("build", runner.clone(), |_| Ok(Some(Command::new("make")))),
                RecoveryNode::new(runner, "build")
                    .rule(
                        RecoveryRule::new("stale-cache", "stale cache")
                            .unwrap()
                            .with_fix(Command::new("make").arg("clean")),
                    )
                    .rule(RecoveryRule::new("flaky", "flaky network").unwrap()),
            )
            .unwrap()
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_build_failure_recovers_and_succeeds() {
        let runner = ScriptedRunner::with_responses([
            ScriptedResponse::failure(2, "error: stale cache detected"),
            ScriptedResponse::success("make clean"),
            ScriptedResponse::success("ok"),
        ]);
        let (orch, _) = orchestrator(build_graph(&runner, 3));

        match orch.step("s1", StepEvent::Start(json!({}))).await.unwrap() {
            StepOutcome::Completed { state, .. } => {
                assert_eq!(state["buildAttemptCount"], 2);
                assert_eq!(state["build"]["success"], true);
                assert_eq!(state["fixesAttempted"], json!(["stale-cache: ran make clean"]));
                assert_eq!(state["summary"], "built in 2 attempt(s)");
                assert!(state.get("fatalErrors").is_none());
            }
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(runner.executables(), vec!["make", "make", "make"]);
    }

    #[tokio::test]
    async fn test_retry_loop_terminates_at_max_attempts() {
        let runner = ScriptedRunner::new();
        for _ in 0..10 {
            runner.push(ScriptedResponse::failure(2, "error: flaky network"));
        }
        let (orch, _) = orchestrator(build_graph(&runner, 3));

        match orch.step("s1", StepEvent::Start(json!({}))).await.unwrap() {
            StepOutcome::Failed { errors, summary, .. } => {
                assert_eq!(
                    errors,
                    vec!["build failed after 3 attempt(s): error: flaky network"]
                );
                assert!(summary.starts_with("Workflow failed with 1 error(s)"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(runner.calls().len(), 3);
        assert_eq!(runner.remaining(), 7);
    }

    #[tokio::test]
    async fn test_unfixable_failure_gives_up_immediately() {
        let runner = ScriptedRunner::with_responses([ScriptedResponse::failure(1, "error: syntax")]);
        let (orch, _) = orchestrator(build_graph(&runner, 3));

        let outcome = orch.step("s1", StepEvent::Start(json!({}))).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Failed { .. }));
        assert_eq!(runner.calls().len(), 1);
    }

    struct Gate {
        entered: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl Node for Gate {
        async fn execute(
            &self,
            _state: &WorkflowState,
            _ctx: &NodeContext<'_>,
        ) -> Result<NodeOutcome, NodeError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(NodeOutcome::Completed(StateUpdate::new()))
        }
    }

    #[tokio::test]
    async fn test_concurrent_step_on_same_session_is_busy() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let graph = GraphBuilder::new("gate")
            .node(
                "wait",
                Gate {
                    entered: entered.clone(),
                    release: release.clone(),
                },
            )
            .end("wait")
            .start("wait")
            .build()
            .unwrap();
        let (orch, _) = orchestrator(graph);

        let background = orch.clone();
        let first = tokio::spawn(async move {
            background.step("s1", StepEvent::Start(json!({}))).await
        });
        entered.notified().await;

        assert!(matches!(
            orch.step("s1", StepEvent::Continue).await,
            Err(WorkflowError::SessionBusy(id)) if id == "s1"
        ));

        release.notify_one();
        let outcome = first.await.unwrap().unwrap();
        assert!(outcome.is_terminal());

        // lock released once the first call returned
        assert!(orch.step("s1", StepEvent::Continue).await.unwrap().is_terminal());
    }

    /// Records what the store held while it was running
    struct Effect {
        store: MemoryCheckpointStore,
        seen: Arc<std::sync::Mutex<Vec<(Option<String>, bool)>>>,
    }

    #[async_trait]
    impl Node for Effect {
        async fn execute(
            &self,
            _state: &WorkflowState,
            ctx: &NodeContext<'_>,
        ) -> Result<NodeOutcome, NodeError> {
            let saved = self.store.load(ctx.session_id).await.unwrap();
            let marker = saved.and_then(|c| c.in_flight);
            self.seen.lock().unwrap().push((marker, ctx.interrupted));
            Ok(NodeOutcome::Completed(StateUpdate::new().set("sent", true)))
        }

        fn side_effecting(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_side_effecting_node_is_marked_before_it_runs() {
        let store = MemoryCheckpointStore::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let graph = GraphBuilder::new("effects")
            .node("prepare", FnNode::passthrough())
            .node(
                "send",
                Effect {
                    store: store.clone(),
                    seen: seen.clone(),
                },
            )
            .edge("prepare", "send")
            .end("send")
            .start("prepare")
            .build()
            .unwrap();
        let orch = Orchestrator::new(graph, Arc::new(store.clone()));

        let outcome = orch.step("s1", StepEvent::Start(json!({}))).await.unwrap();
        assert!(outcome.is_terminal());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(Some("send#1".to_string()), false)]
        );

        let saved = store.load("s1").await.unwrap().unwrap();
        assert!(saved.in_flight.is_none());
        assert_eq!(saved.state.get("sent"), Some(&json!(true)));

        // a crash mid-node leaves the marker; the next run sees it
        let mut crashed = saved.clone();
        crashed.cursor = "send".to_string();
        crashed.status = CheckpointStatus::Running;
        crashed.in_flight = Some(format!("send#{}", crashed.sequence));
        store.save(&crashed).await.unwrap();

        orch.step("s1", StepEvent::Continue).await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert!(seen.lock().unwrap()[1].1);
    }

    #[test]
    fn test_outcome_serialization() {
        let outcome = StepOutcome::Failed {
            session_id: "s1".to_string(),
            errors: vec!["boom".to_string()],
            summary: "Workflow failed".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&outcome).unwrap(),
            json!({"status": "failed", "sessionId": "s1", "errors": ["boom"], "summary": "Workflow failed"})
        );
    }
}
