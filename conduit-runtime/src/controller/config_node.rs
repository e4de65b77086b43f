// Export nodes
// Config-only declarations that hold a single evaluated value for other nodes to read

use crate::controller::health::Health;
use crate::controller::node::NodeError;
use crate::expression::{Program, Scope};
use crate::syntax::Block;
use crate::value::Value;

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

const VALUE_ATTR: &str = "value";

/// An `export` block. Referenced as `export.<label>.value`.
pub struct ExportConfigNode {
    id: String,
    state: RwLock<ConfigState>,
}

struct ConfigState {
    block: Block,
    program: Arc<Program>,
    value: Value,
    health: Health,
}

impl ExportConfigNode {
    pub fn new(block: Block) -> Result<Self, NodeError> {
        let program = compile(&block)?;
        Ok(Self {
            id: block.node_id(),
            state: RwLock::new(ConfigState {
                block,
                program: Arc::new(program),
                value: Value::Null,
                health: Health::unknown(),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn block(&self) -> Block {
        self.state.read().block.clone()
    }

    pub fn program(&self) -> Arc<Program> {
        self.state.read().program.clone()
    }

    /// Replace the declaration; the last value is kept until the next evaluation
    pub fn replace_block(&self, block: Block) -> Result<(), NodeError> {
        let program = compile(&block)?;
        let mut state = self.state.write();
        state.block = block;
        state.program = Arc::new(program);
        Ok(())
    }

    /// Evaluate `value`; on failure the previous value stays visible
    pub fn evaluate(&self, scope: &dyn Scope) -> Result<(), NodeError> {
        let program = self.program();
        let result = program
            .evaluate_attribute(VALUE_ATTR, scope)
            .unwrap_or(Ok(Value::Null));

        let mut state = self.state.write();
        match result {
            Ok(value) => {
                state.value = value;
                state.health = Health::healthy("value evaluated");
                Ok(())
            }
            Err(err) => {
                state.health = Health::unhealthy(err.to_string());
                Err(err.into())
            }
        }
    }

    pub fn value(&self) -> Value {
        self.state.read().value.clone()
    }

    /// The object other nodes see: `{ value: <value> }`
    pub fn scope_value(&self) -> Value {
        let mut fields = BTreeMap::new();
        fields.insert(VALUE_ATTR.to_string(), self.value());
        Value::Object(fields)
    }

    pub fn health(&self) -> Health {
        self.state.read().health.clone()
    }
}

fn compile(block: &Block) -> Result<Program, NodeError> {
    if let Some(unknown) = block.body.keys().find(|k| k.as_str() != VALUE_ATTR) {
        return Err(NodeError::Invalid(format!(
            "export blocks only accept '{}', found '{}'",
            VALUE_ATTR, unknown
        )));
    }
    if !block.body.contains_key(VALUE_ATTR) {
        return Err(NodeError::Invalid(format!(
            "export blocks require a '{}' attribute",
            VALUE_ATTR
        )));
    }
    Ok(Program::compile(&block.body)?)
}
