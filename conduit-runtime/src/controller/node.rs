// Graph nodes
// The two node kinds held by the dependency graph and what they share

use crate::component::{ComponentError, DecodeError, ExportChanges};
use crate::controller::component_node::ComponentNode;
use crate::controller::config_node::ExportConfigNode;
use crate::controller::events::ControllerEventSender;
use crate::controller::health::Health;
use crate::controller::runner::RunnerError;
use crate::expression::{CompileError, EvalError, Program, Scope};
use crate::syntax::Block;
use crate::value::Value;

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// Why a node could not be built or evaluated
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NodeError {
    #[error("{0}")]
    Compile(#[from] CompileError),

    #[error("{0}")]
    Evaluation(#[from] EvalError),

    #[error("invalid arguments: {0}")]
    Decode(#[from] DecodeError),

    #[error("failed to build component: {0}")]
    Build(#[from] ComponentError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error("{0}")]
    Invalid(String),
}

/// Shared resources handed to every node the loader creates
#[derive(Clone, Default)]
pub struct NodeContext {
    /// Root directory; each component gets `<root>/<node id>`
    pub data_path: PathBuf,
    pub registerer: prometheus::Registry,
    /// Collects the identity of a component whenever its exports change
    pub export_changes: Option<Arc<ExportChanges>>,
    pub events: Option<ControllerEventSender>,
}

/// A graph vertex. Identity is fixed for the node's lifetime; its
/// declaration and derived state may be replaced in place.
#[derive(Clone)]
pub enum Node {
    Config(Arc<ExportConfigNode>),
    Component(Arc<ComponentNode>),
}

impl Node {
    pub fn id(&self) -> &str {
        match self {
            Node::Config(node) => node.id(),
            Node::Component(node) => node.id(),
        }
    }

    pub fn block(&self) -> Block {
        match self {
            Node::Config(node) => node.block(),
            Node::Component(node) => node.block(),
        }
    }

    pub fn program(&self) -> Arc<Program> {
        match self {
            Node::Config(node) => node.program(),
            Node::Component(node) => node.program(),
        }
    }

    /// Swap in a new declaration for the same identity
    pub fn replace_block(&self, block: Block) -> Result<(), NodeError> {
        match self {
            Node::Config(node) => node.replace_block(block),
            Node::Component(node) => node.replace_block(block),
        }
    }

    pub fn evaluate(&self, scope: &dyn Scope) -> Result<(), NodeError> {
        match self {
            Node::Config(node) => node.evaluate(scope),
            Node::Component(node) => node.evaluate(scope),
        }
    }

    /// What other nodes read through a reference to this node
    pub fn value(&self) -> Value {
        match self {
            Node::Config(node) => node.scope_value(),
            Node::Component(node) => node.exports(),
        }
    }

    pub fn health(&self) -> Health {
        match self {
            Node::Config(node) => node.health(),
            Node::Component(node) => node.health(),
        }
    }

    pub fn as_component(&self) -> Option<&Arc<ComponentNode>> {
        match self {
            Node::Component(node) => Some(node),
            Node::Config(_) => None,
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Node::Config(node) => write!(f, "Config({})", node.id()),
            Node::Component(node) => write!(f, "Component({})", node.id()),
        }
    }
}
