// Loader
// Plans configuration documents, applies them to the live graph and runs evaluation passes

use crate::component::Registry;
use crate::controller::component_node::ComponentNode;
use crate::controller::config_node::ExportConfigNode;
use crate::controller::events::{ControllerEvent, EventSender};
use crate::controller::graph::{resolve_reference, DependencyGraph, GraphError};
use crate::controller::metrics::ControllerMetrics;
use crate::controller::node::{Node, NodeContext, NodeError};
use crate::controller::runner::RunnerState;
use crate::controller::scope::NodeScope;
use crate::syntax::{is_valid_label, Block, Document};

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// A declaration problem found before anything is mutated
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlanError {
    #[error("block '{name}' needs a label")]
    MissingLabel { name: String },

    #[error("block '{name}': invalid label '{label}'")]
    InvalidLabel { name: String, label: String },

    #[error("{node}: unknown component '{name}'")]
    UnknownComponent { node: String, name: String },

    #[error("'{0}' is declared more than once")]
    Duplicate(String),

    #[error("{node}: {error}")]
    Node { node: String, error: NodeError },

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// A node that failed to evaluate during a pass
#[derive(Debug, Clone, PartialEq)]
pub struct NodeFailure {
    pub node_id: String,
    pub error: NodeError,
}

impl fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.node_id, self.error)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LoadError {
    #[error("invalid configuration: {}", join(.0))]
    Structural(Vec<PlanError>),

    #[error("failed to evaluate configuration: {}", join(.0))]
    Evaluation(Vec<NodeFailure>),

    #[error("a configuration is already loaded")]
    AlreadyLoaded,

    #[error("the controller has been shut down")]
    ShutDown,
}

impl From<GraphError> for LoadError {
    fn from(err: GraphError) -> Self {
        LoadError::Structural(vec![PlanError::Graph(err)])
    }
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|item| item.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// A validated document: fresh nodes and the order they evaluate in
pub struct Plan {
    nodes: BTreeMap<String, Node>,
    order: Vec<String>,
}

impl Plan {
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn block(&self, id: &str) -> Option<Block> {
        self.nodes.get(id).map(Node::block)
    }
}

/// What one evaluation pass did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassReport {
    pub evaluated: Vec<String>,
    pub failed: Vec<NodeFailure>,
    /// Not evaluated because something they read failed in this pass
    pub skipped: Vec<String>,
    pub started: Vec<String>,
}

/// Outcome of applying a new document to the running graph
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
    pub pass: PassReport,
}

impl UpdateReport {
    /// True when the document matched the running configuration exactly
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    pub fn has_failures(&self) -> bool {
        !self.pass.failed.is_empty()
    }
}

/// Owns the dependency graph and serializes every evaluation pass
pub struct Loader {
    registry: Registry,
    context: NodeContext,
    metrics: Option<ControllerMetrics>,
    graph: RwLock<DependencyGraph>,
    order: RwLock<Vec<String>>,
    pass: Mutex<bool>,
}

impl Loader {
    pub fn new(registry: Registry, context: NodeContext) -> Self {
        Self {
            registry,
            context,
            metrics: None,
            graph: RwLock::new(DependencyGraph::new()),
            order: RwLock::new(Vec::new()),
            pass: Mutex::new(false),
        }
    }

    pub fn with_metrics(mut self, metrics: ControllerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Validate a document and build fresh nodes for it without touching
    /// the live graph
    pub fn plan(&self, document: &Document) -> Result<Plan, LoadError> {
        let mut errors = Vec::new();
        let mut nodes = BTreeMap::new();

        for block in &document.blocks {
            match &block.label {
                None => {
                    errors.push(PlanError::MissingLabel {
                        name: block.name.clone(),
                    });
                    continue;
                }
                Some(label) if !is_valid_label(label) => {
                    errors.push(PlanError::InvalidLabel {
                        name: block.name.clone(),
                        label: label.clone(),
                    });
                    continue;
                }
                Some(_) => {}
            }

            let id = block.node_id();
            if nodes.contains_key(&id) {
                errors.push(PlanError::Duplicate(id));
                continue;
            }

            match self.build_node(block) {
                Ok(node) => {
                    nodes.insert(id, node);
                }
                Err(err) => errors.push(err),
            }
        }

        // Every reference must name a declared node
        for (id, node) in &nodes {
            for path in node.program().references() {
                let parts: Vec<&str> = path.iter().map(String::as_str).collect();
                if resolve_reference(&parts, |candidate| nodes.contains_key(candidate)).is_none() {
                    errors.push(PlanError::Graph(GraphError::UnknownReference {
                        node: id.clone(),
                        reference: path.join("."),
                    }));
                }
            }
        }

        if !errors.is_empty() {
            return Err(LoadError::Structural(errors));
        }

        let mut scratch = DependencyGraph::new();
        for node in nodes.values() {
            scratch.add_or_replace(node.clone())?;
        }
        scratch.resolve_edges()?;
        let order = scratch.topological_order()?;

        Ok(Plan { nodes, order })
    }

    fn build_node(&self, block: &Block) -> Result<Node, PlanError> {
        let id = block.node_id();
        if block.is_export() {
            return ExportConfigNode::new(block.clone())
                .map(|node| Node::Config(Arc::new(node)))
                .map_err(|error| PlanError::Node { node: id, error });
        }

        let registration =
            self.registry
                .get(&block.name)
                .cloned()
                .ok_or_else(|| PlanError::UnknownComponent {
                    node: id.clone(),
                    name: block.name.clone(),
                })?;

        ComponentNode::new(block.clone(), registration, self.context.clone())
            .map(|node| Node::Component(Arc::new(node)))
            .map_err(|error| PlanError::Node { node: id, error })
    }

    /// Build the graph from scratch, evaluate everything once and start
    /// every component. Nothing is started if any node fails.
    pub async fn load_initial(&self, document: &Document) -> Result<PassReport, LoadError> {
        let shut_down = self.pass.lock().await;
        if *shut_down {
            return Err(LoadError::ShutDown);
        }
        if !self.graph.read().is_empty() {
            return Err(LoadError::AlreadyLoaded);
        }

        let plan = self.plan(document)?;
        {
            let mut graph = self.graph.write();
            for node in plan.nodes.values() {
                graph.add_or_replace(node.clone())?;
            }
            graph.resolve_edges()?;
            *self.order.write() = plan.order.clone();
        }

        let dirty: BTreeSet<String> = plan.order.iter().cloned().collect();
        let mut report = self.run_pass(&dirty);

        if !report.failed.is_empty() {
            warn!(
                failed = report.failed.len(),
                "initial evaluation failed, discarding configuration"
            );
            *self.graph.write() = DependencyGraph::new();
            self.order.write().clear();
            return Err(LoadError::Evaluation(report.failed));
        }

        report.started = self.start_components();
        info!(
            nodes = plan.order.len(),
            components = report.started.len(),
            "loaded configuration"
        );
        Ok(report)
    }

    /// Diff `document` against the running graph and apply the difference
    pub async fn apply_update(&self, document: &Document) -> Result<UpdateReport, LoadError> {
        let shut_down = self.pass.lock().await;
        if *shut_down {
            return Err(LoadError::ShutDown);
        }

        let plan = self.plan(document)?;
        let mut report = self.diff(&plan);
        if report.is_noop() {
            debug!("configuration unchanged");
            return Ok(report);
        }

        for id in &report.removed {
            let node = self.graph.read().get(id).cloned();
            if let Some(Node::Component(component)) = &node {
                component.stop().await;
            }
            self.graph.write().remove(id)?;
        }

        {
            let mut graph = self.graph.write();
            for id in report.added.iter().chain(&report.changed) {
                if let Some(node) = plan.nodes.get(id) {
                    graph.add_or_replace(node.clone())?;
                }
            }
            if graph.resolve_edges()? {
                *self.order.write() = graph.topological_order()?;
            }
        }

        let dirty: BTreeSet<String> = report
            .added
            .iter()
            .chain(&report.changed)
            .cloned()
            .collect();
        report.pass = self.run_pass(&dirty);
        report.pass.started = self.start_components();

        if let Some(metrics) = &self.metrics {
            metrics.updates.inc();
        }
        info!(
            added = report.added.len(),
            removed = report.removed.len(),
            changed = report.changed.len(),
            failed = report.pass.failed.len(),
            "applied configuration update"
        );
        self.context.events.send_event(ControllerEvent::UpdateApplied {
            added: report.added.len(),
            removed: report.removed.len(),
            changed: report.changed.len(),
            failed: report.pass.failed.len(),
        });

        Ok(report)
    }

    fn diff(&self, plan: &Plan) -> UpdateReport {
        let graph = self.graph.read();
        let mut report = UpdateReport::default();

        for id in graph.ids() {
            if !plan.nodes.contains_key(id) {
                report.removed.push(id.to_string());
            }
        }
        for id in plan.nodes.keys() {
            match graph.get(id) {
                None => report.added.push(id.clone()),
                Some(existing) if Some(existing.block()) != plan.block(id) => {
                    report.changed.push(id.clone())
                }
                Some(_) => {}
            }
        }
        report
    }

    /// Re-evaluate the direct dependents of nodes whose exports changed
    pub async fn evaluate_dependents(&self, ids: &[String]) -> PassReport {
        let shut_down = self.pass.lock().await;
        if *shut_down {
            return PassReport::default();
        }

        let dirty: BTreeSet<String> = {
            let graph = self.graph.read();
            ids.iter()
                .filter(|id| graph.contains(id))
                .flat_map(|id| graph.direct_dependents(id))
                .collect()
        };
        if dirty.is_empty() {
            return PassReport::default();
        }

        let mut report = self.run_pass(&dirty);
        report.started = self.start_components();
        report
    }

    /// One pass in evaluation order.
    ///
    /// A node is evaluated when it is in `dirty` or when something it reads
    /// was evaluated successfully earlier in the pass. Nodes reading a node
    /// that failed (or was skipped for that reason) are skipped.
    fn run_pass(&self, dirty: &BTreeSet<String>) -> PassReport {
        let order = self.order.read().clone();
        let (snapshot, dependencies) = {
            let graph = self.graph.read();
            let dependencies: BTreeMap<String, Vec<String>> = order
                .iter()
                .map(|id| (id.clone(), graph.direct_dependencies(id)))
                .collect();
            (graph.snapshot(), dependencies)
        };
        let scope = NodeScope::new(snapshot.clone());

        let mut report = PassReport::default();
        let mut succeeded = BTreeSet::new();
        let mut blocked = BTreeSet::new();

        for id in &order {
            let Some(node) = snapshot.get(id) else {
                continue;
            };
            let deps = dependencies.get(id).map(Vec::as_slice).unwrap_or_default();

            if let Some(blocker) = deps.iter().find(|dep| blocked.contains(*dep)) {
                if dirty.contains(id) || deps.iter().any(|dep| succeeded.contains(dep)) {
                    debug!(node_id = %id, blocker = %blocker, "skipping evaluation");
                    self.context.events.send_event(ControllerEvent::node_skipped(
                        id,
                        format!("dependency '{}' failed to evaluate", blocker),
                    ));
                    report.skipped.push(id.clone());
                }
                blocked.insert(id.clone());
                continue;
            }

            if !dirty.contains(id) && !deps.iter().any(|dep| succeeded.contains(dep)) {
                continue;
            }

            match node.evaluate(&scope) {
                Ok(()) => {
                    debug!(node_id = %id, "evaluated node");
                    if let Some(metrics) = &self.metrics {
                        metrics.evaluations.inc();
                    }
                    self.context
                        .events
                        .send_event(ControllerEvent::node_evaluated(id));
                    succeeded.insert(id.clone());
                    report.evaluated.push(id.clone());
                }
                Err(error) => {
                    warn!(node_id = %id, error = %error, "failed to evaluate node");
                    if let Some(metrics) = &self.metrics {
                        metrics
                            .evaluation_failures
                            .with_label_values(&[id.as_str()])
                            .inc();
                    }
                    self.context
                        .events
                        .send_event(ControllerEvent::node_evaluation_failed(id, error.to_string()));
                    blocked.insert(id.clone());
                    report.failed.push(NodeFailure {
                        node_id: id.clone(),
                        error,
                    });
                }
            }
        }

        report
    }

    /// Start every built component that has not been started yet
    fn start_components(&self) -> Vec<String> {
        let nodes: Vec<Node> = {
            let graph = self.graph.read();
            let order = self.order.read();
            order.iter().filter_map(|id| graph.get(id).cloned()).collect()
        };

        let mut started = Vec::new();
        for node in nodes {
            let Some(component) = node.as_component() else {
                continue;
            };
            match component.start() {
                Ok(true) => started.push(component.id().to_string()),
                Ok(false) => {}
                Err(err) => warn!(node_id = %component.id(), error = %err, "failed to start component"),
            }
        }

        self.refresh_running_gauge();
        started
    }

    fn refresh_running_gauge(&self) {
        if let Some(metrics) = &self.metrics {
            let running = self
                .graph
                .read()
                .nodes()
                .filter_map(Node::as_component)
                .filter_map(|c| c.runner())
                .filter(|r| r.state() == RunnerState::Running)
                .count();
            metrics.running_components.set(running as i64);
        }
    }

    /// Cancel every component, then wait for all of them to finish.
    /// Later loads and updates are refused.
    pub async fn shutdown(&self) {
        let mut shut_down = self.pass.lock().await;
        if *shut_down {
            return;
        }
        *shut_down = true;

        let components: Vec<Arc<ComponentNode>> = self
            .graph
            .read()
            .nodes()
            .filter_map(Node::as_component)
            .cloned()
            .collect();

        info!(components = components.len(), "stopping components");
        let mut stopping = JoinSet::new();
        for component in components {
            stopping.spawn(async move { component.stop().await });
        }
        while let Some(result) = stopping.join_next().await {
            if let Err(err) = result {
                warn!(error = %err, "component stop task failed");
            }
        }
        self.refresh_running_gauge();
    }

    /// Node handles in evaluation order
    pub fn nodes(&self) -> Vec<Node> {
        let graph = self.graph.read();
        self.order
            .read()
            .iter()
            .filter_map(|id| graph.get(id).cloned())
            .collect()
    }

    pub fn node(&self, id: &str) -> Option<Node> {
        self.graph.read().get(id).cloned()
    }

    pub fn order(&self) -> Vec<String> {
        self.order.read().clone()
    }

    pub fn dependencies_of(&self, id: &str) -> Vec<String> {
        self.graph.read().direct_dependencies(id)
    }
}
