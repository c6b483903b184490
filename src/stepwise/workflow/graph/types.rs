// SPDX-License-Identifier: MIT

//! Graph definition and validation

use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use crate::stepwise::workflow::error::WorkflowError;
use crate::stepwise::workflow::node::{FnNode, Node};
use crate::stepwise::workflow::router::Router;
use crate::stepwise::workflow::state::{FieldType, ReducerType, StateSchema, StateUpdate};

/// Built-in terminal node every fatal error is routed to
pub const FAILURE_NODE: &str = "failed";
/// Written by the failure node
pub const FAILURE_SUMMARY: &str = "failureSummary";

/// Where control goes after a node completes
#[derive(Clone)]
pub enum Edge {
    To(String),
    Route(Arc<dyn Router>),
    End,
}

impl Edge {
    fn targets(&self) -> Vec<String> {
        match self {
            Edge::To(target) => vec![target.clone()],
            Edge::Route(router) => router.targets(),
            Edge::End => Vec::new(),
        }
    }
}

impl fmt::Debug for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Edge::To(target) => write!(f, "To({})", target),
            Edge::Route(router) => write!(f, "Route({} -> {:?})", router.name(), router.targets()),
            Edge::End => f.write_str("End"),
        }
    }
}

/// A validated, immutable workflow graph
pub struct Graph {
    name: String,
    schema: StateSchema,
    start: String,
    nodes: HashMap<String, Arc<dyn Node>>,
    edges: HashMap<String, Edge>,
    required_inputs: Vec<String>,
}

impl Graph {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &StateSchema {
        &self.schema
    }

    pub fn start(&self) -> &str {
        &self.start
    }

    pub fn node(&self, name: &str) -> Option<&Arc<dyn Node>> {
        self.nodes.get(name)
    }

    pub fn edge(&self, name: &str) -> Option<&Edge> {
        self.edges.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// Node names, sorted
    pub fn node_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.nodes.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Start-input fields whose absence is a fatal error
    pub fn required_inputs(&self) -> &[String] {
        &self.required_inputs
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("name", &self.name)
            .field("start", &self.start)
            .field("nodes", &self.node_names())
            .field("edges", &self.edges)
            .finish()
    }
}

/// The built-in failure terminal: summarises every accumulated fatal error
pub fn failure_node() -> FnNode {
    FnNode::new(|state| {
        let errors = state.fatal_errors();
        let summary = if errors.is_empty() {
            "Workflow failed".to_string()
        } else {
            let lines: Vec<String> = errors
                .iter()
                .enumerate()
                .map(|(i, e)| format!("{}. {}", i + 1, e))
                .collect();
            format!(
                "Workflow failed with {} error(s):\n{}",
                errors.len(),
                lines.join("\n")
            )
        };
        Ok(StateUpdate::new().set(FAILURE_SUMMARY, summary))
    })
}

/// Collects nodes and edges, then validates them into a `Graph`
pub struct GraphBuilder {
    name: String,
    schema: StateSchema,
    start: Option<String>,
    nodes: HashMap<String, Arc<dyn Node>>,
    edges: HashMap<String, Edge>,
    required_inputs: Vec<String>,
    problems: Vec<String>,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema: StateSchema::new().field(FAILURE_SUMMARY, FieldType::String),
            start: None,
            nodes: HashMap::new(),
            edges: HashMap::new(),
            required_inputs: Vec::new(),
            problems: Vec::new(),
        }
    }

    /// Add every field of `schema`; later declarations win
    pub fn schema(mut self, schema: StateSchema) -> Self {
        self.schema.fields.extend(schema.fields);
        self
    }

    pub fn field(
        mut self,
        name: &str,
        field_type: FieldType,
        reducer: ReducerType,
        default: Option<Value>,
    ) -> Self {
        self.schema = self.schema.field_with(name, field_type, reducer, default);
        self
    }

    pub fn start(mut self, name: impl Into<String>) -> Self {
        self.start = Some(name.into());
        self
    }

    pub fn node(mut self, name: impl Into<String>, node: impl Node + 'static) -> Self {
        let name = name.into();
        if self.nodes.insert(name.clone(), Arc::new(node)).is_some() {
            self.problems.push(format!("node '{}' is defined twice", name));
        }
        self
    }

    pub fn edge(self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.set_edge(from.into(), Edge::To(to.into()))
    }

    pub fn route(self, from: impl Into<String>, router: impl Router + 'static) -> Self {
        self.set_edge(from.into(), Edge::Route(Arc::new(router)))
    }

    /// Mark `from` as a terminal node
    pub fn end(self, from: impl Into<String>) -> Self {
        self.set_edge(from.into(), Edge::End)
    }

    /// Fail at start when `field` is absent from the start input
    pub fn require_input(mut self, field: impl Into<String>) -> Self {
        self.required_inputs.push(field.into());
        self
    }

    fn set_edge(mut self, from: String, edge: Edge) -> Self {
        if self.edges.insert(from.clone(), edge).is_some() {
            self.problems
                .push(format!("node '{}' has more than one outgoing edge", from));
        }
        self
    }

    pub fn build(mut self) -> Result<Graph, WorkflowError> {
        if !self.nodes.contains_key(FAILURE_NODE) {
            self.nodes
                .insert(FAILURE_NODE.to_string(), Arc::new(failure_node()));
            self.edges.insert(FAILURE_NODE.to_string(), Edge::End);
        }

        let mut problems = std::mem::take(&mut self.problems);

        let start = match self.start.take() {
            Some(start) if self.nodes.contains_key(&start) => start,
            Some(start) => {
                problems.push(format!("start node '{}' does not exist", start));
                String::new()
            }
            None => {
                problems.push("no start node".to_string());
                String::new()
            }
        };

        if !matches!(self.edges.get(FAILURE_NODE), Some(Edge::End)) {
            problems.push(format!("'{}' must be a terminal node", FAILURE_NODE));
        }

        let mut names: Vec<&String> = self.nodes.keys().collect();
        names.sort();
        for name in names {
            match self.edges.get(name) {
                None => problems.push(format!("node '{}' has no outgoing edge", name)),
                Some(edge) => {
                    for target in edge.targets() {
                        if !self.nodes.contains_key(&target) {
                            problems.push(format!(
                                "node '{}' routes to unknown node '{}'",
                                name, target
                            ));
                        }
                    }
                }
            }
        }

        let mut dangling: Vec<&String> = self
            .edges
            .keys()
            .filter(|from| !self.nodes.contains_key(*from))
            .collect();
        dangling.sort();
        for from in dangling {
            problems.push(format!("edge from unknown node '{}'", from));
        }

        if !problems.is_empty() {
            return Err(WorkflowError::InvalidGraph(format!(
                "'{}': {}",
                self.name,
                problems.join("; ")
            )));
        }

        for unreachable in self.unreachable_from(&start) {
            log::warn!(
                "Graph '{}': node '{}' is unreachable from '{}'",
                self.name,
                unreachable,
                start
            );
        }

        Ok(Graph {
            name: self.name,
            schema: self.schema,
            start,
            nodes: self.nodes,
            edges: self.edges,
            required_inputs: self.required_inputs,
        })
    }

    fn unreachable_from(&self, start: &str) -> Vec<String> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = VecDeque::from([start.to_string(), FAILURE_NODE.to_string()]);
        while let Some(name) = queue.pop_front() {
            if !seen.insert(name.clone()) {
                continue;
            }
            if let Some(edge) = self.edges.get(&name) {
                queue.extend(edge.targets());
            }
        }
        let mut missing: Vec<String> = self
            .nodes
            .keys()
            .filter(|n| !seen.contains(*n))
            .cloned()
            .collect();
        missing.sort();
        missing
    }
}
