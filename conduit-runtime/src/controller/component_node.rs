// Component nodes
// Evaluate a component block into arguments and drive the component built from them

use crate::component::{ErasedComponent, ExportsHandle, Options, Registration};
use crate::controller::health::{Health, HealthType};
use crate::controller::node::{NodeContext, NodeError};
use crate::controller::runner::{LifecycleRunner, RunnerError, RunnerState};
use crate::expression::{Program, Scope};
use crate::syntax::Block;
use crate::value::Value;

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

/// What a successful evaluation did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationOutcome {
    /// First evaluation; the component was built but not started
    Built,
    /// New arguments were handed to the running component
    Updated,
    /// The arguments were identical to the last ones
    Unchanged,
    /// The component's run has already returned; the arguments were only recorded
    Exited,
}

/// A component block and the live component behind it
pub struct ComponentNode {
    id: String,
    registration: Registration,
    context: NodeContext,
    exports: ExportsHandle,
    state: RwLock<ComponentState>,
}

struct ComponentState {
    block: Block,
    program: Arc<Program>,
    arguments: Option<Value>,
    eval_health: Health,
    runner: Option<Arc<LifecycleRunner>>,
}

impl ComponentNode {
    pub fn new(
        block: Block,
        registration: Registration,
        context: NodeContext,
    ) -> Result<Self, NodeError> {
        let program = Program::compile(&block.body)?;
        let id = block.node_id();
        let exports = ExportsHandle::new(id.clone(), context.export_changes.clone());
        Ok(Self {
            id,
            registration,
            context,
            exports,
            state: RwLock::new(ComponentState {
                block,
                program: Arc::new(program),
                arguments: None,
                eval_health: Health::unknown(),
                runner: None,
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Registered component kind, e.g. `loki.echo`
    pub fn kind(&self) -> &str {
        self.registration.name()
    }

    pub fn label(&self) -> Option<String> {
        self.state.read().block.label.clone()
    }

    pub fn block(&self) -> Block {
        self.state.read().block.clone()
    }

    pub fn program(&self) -> Arc<Program> {
        self.state.read().program.clone()
    }

    pub fn replace_block(&self, block: Block) -> Result<(), NodeError> {
        let program = Program::compile(&block.body)?;
        let mut state = self.state.write();
        state.block = block;
        state.program = Arc::new(program);
        Ok(())
    }

    pub fn evaluate(&self, scope: &dyn Scope) -> Result<(), NodeError> {
        self.evaluate_with_outcome(scope).map(|_| ())
    }

    /// Evaluate the block body and push the result to the component.
    ///
    /// Any failure is recorded as evaluation health and leaves the previous
    /// arguments, component and runner untouched.
    pub fn evaluate_with_outcome(&self, scope: &dyn Scope) -> Result<EvaluationOutcome, NodeError> {
        let result = self.try_evaluate(scope);
        let mut state = self.state.write();
        match &result {
            Ok(EvaluationOutcome::Unchanged)
                if state.eval_health.health == HealthType::Healthy => {}
            Ok(_) => state.eval_health = Health::healthy("component evaluated"),
            Err(err) => state.eval_health = Health::unhealthy(err.to_string()),
        }
        result
    }

    fn try_evaluate(&self, scope: &dyn Scope) -> Result<EvaluationOutcome, NodeError> {
        let (program, previous, runner) = {
            let state = self.state.read();
            (
                state.program.clone(),
                state.arguments.clone(),
                state.runner.clone(),
            )
        };

        let arguments = program.evaluate(scope)?;
        if runner.is_some() && previous.as_ref() == Some(&arguments) {
            debug!(node_id = %self.id, "arguments unchanged");
            return Ok(EvaluationOutcome::Unchanged);
        }

        let decoded = self.registration.decode(&arguments)?;

        let outcome = match runner {
            Some(runner) => match runner.update(decoded) {
                Ok(()) => EvaluationOutcome::Updated,
                Err(RunnerError::Stopped(_)) => {
                    debug!(node_id = %self.id, "component has exited, not handing off arguments");
                    EvaluationOutcome::Exited
                }
                Err(err) => return Err(err.into()),
            },
            None => {
                let component = self.registration.build(self.options(), decoded)?;
                let runner = LifecycleRunner::new(self.id.clone(), component)
                    .with_events(self.context.events.clone());
                self.state.write().runner = Some(Arc::new(runner));
                EvaluationOutcome::Built
            }
        };

        self.state.write().arguments = Some(arguments);
        Ok(outcome)
    }

    fn options(&self) -> Options {
        Options {
            id: self.id.clone(),
            data_path: self.context.data_path.join(&self.id),
            registerer: self.context.registerer.clone(),
            exports: self.exports.clone(),
        }
    }

    pub fn runner(&self) -> Option<Arc<LifecycleRunner>> {
        self.state.read().runner.clone()
    }

    pub fn component(&self) -> Option<Arc<dyn ErasedComponent>> {
        self.runner().map(|runner| runner.component().clone())
    }

    /// Start the component if it has been built and never started
    pub fn start(&self) -> Result<bool, NodeError> {
        match self.runner() {
            Some(runner) if runner.state() == RunnerState::Created => {
                runner.start()?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Stop the component and wait for its task to finish
    pub async fn stop(&self) {
        if let Some(runner) = self.runner() {
            runner.stop().await;
        }
    }

    pub fn arguments(&self) -> Value {
        self.state.read().arguments.clone().unwrap_or_default()
    }

    pub fn exports(&self) -> Value {
        self.exports.get()
    }

    /// Least healthy of evaluation, runner and component-reported health
    pub fn health(&self) -> Health {
        let eval_health = self.state.read().eval_health.clone();
        let runner = self.runner();
        let runner_health = runner.as_ref().map(|r| r.health());
        let component_health = runner
            .as_ref()
            .and_then(|r| r.component().current_health());

        Health::least_healthy(
            std::iter::once(&eval_health)
                .chain(runner_health.as_ref())
                .chain(component_health.as_ref()),
        )
    }

    pub fn debug_info(&self) -> Option<serde_json::Value> {
        self.component().and_then(|c| c.debug_info())
    }
}
