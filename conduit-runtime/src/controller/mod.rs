// Runtime controller
// Dependency graph, loader, lifecycle runner and the controller facade

pub mod component_node;
pub mod config_node;
pub mod events;
pub mod flow;
pub mod graph;
pub mod health;
pub mod loader;
pub mod metrics;
pub mod node;
pub mod runner;
pub mod scope;

pub use component_node::{ComponentNode, EvaluationOutcome};
pub use config_node::ExportConfigNode;
pub use events::{
    event_channel, ControllerEvent, ControllerEventReceiver, ControllerEventSender, EventSender,
};
pub use flow::{ComponentInfo, Controller, ControllerConfig};
pub use graph::{resolve_reference, topological_sort, DependencyGraph, GraphError};
pub use health::{Health, HealthType};
pub use loader::{LoadError, Loader, NodeFailure, PassReport, Plan, PlanError, UpdateReport};
pub use metrics::ControllerMetrics;
pub use node::{Node, NodeContext, NodeError};
pub use runner::{LifecycleRunner, RunnerError, RunnerState, UpdateSlot};
pub use scope::NodeScope;
