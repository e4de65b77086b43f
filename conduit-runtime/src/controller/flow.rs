// Controller
// Public entry point tying the loader, export notifications and metrics together

use crate::component::{ExportChanges, Registry};
use crate::controller::events::ControllerEventSender;
use crate::controller::health::Health;
use crate::controller::loader::{Loader, PassReport, Plan, UpdateReport};
use crate::controller::metrics::ControllerMetrics;
use crate::controller::node::{Node, NodeContext};
use crate::error::{RuntimeError, RuntimeResult};
use crate::syntax::Document;
use crate::value::Value;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Controller settings
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Root for per-component state (default: <local data dir>/conduit)
    pub data_path: PathBuf,

    /// Optional sink for controller events
    pub events: Option<ControllerEventSender>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        let data_path = dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("conduit");

        Self {
            data_path,
            events: None,
        }
    }
}

impl ControllerConfig {
    pub fn with_data_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_path = path.into();
        self
    }

    pub fn with_events(mut self, events: ControllerEventSender) -> Self {
        self.events = Some(events);
        self
    }
}

/// Snapshot of one component node for inspection
#[derive(Debug, Clone, Serialize)]
pub struct ComponentInfo {
    pub id: String,
    pub name: String,
    pub label: Option<String>,
    pub health: Health,
    pub arguments: Value,
    pub exports: Value,
    pub dependencies: Vec<String>,
    pub debug_info: Option<serde_json::Value>,
}

/// Runs one configuration: load it, apply updates to it, keep dependents of
/// changing exports up to date, and shut it down.
///
/// Dependents of changed exports are only re-evaluated while [`Controller::run`]
/// is driven. Until then changes accumulate, one pending entry per component.
pub struct Controller {
    loader: Loader,
    metrics_registry: prometheus::Registry,
    export_changes: Arc<ExportChanges>,
    running: AtomicBool,
}

impl Controller {
    pub fn new(config: ControllerConfig, registry: Registry) -> RuntimeResult<Self> {
        let metrics_registry = prometheus::Registry::new();
        let metrics = ControllerMetrics::new(&metrics_registry)?;
        let export_changes = Arc::new(ExportChanges::new());

        let context = NodeContext {
            data_path: config.data_path,
            registerer: metrics_registry.clone(),
            export_changes: Some(export_changes.clone()),
            events: config.events,
        };

        Ok(Self {
            loader: Loader::new(registry, context).with_metrics(metrics),
            metrics_registry,
            export_changes,
            running: AtomicBool::new(false),
        })
    }

    /// Validate a document without mutating anything
    pub fn plan(&self, document: &Document) -> RuntimeResult<Plan> {
        Ok(self.loader.plan(document)?)
    }

    /// Load the first configuration and start its components
    pub async fn load(&self, document: &Document) -> RuntimeResult<PassReport> {
        Ok(self.loader.load_initial(document).await?)
    }

    pub async fn load_file(&self, path: impl AsRef<Path>) -> RuntimeResult<PassReport> {
        let document = Document::from_file(path)?;
        self.load(&document).await
    }

    /// Apply a new configuration to the running one
    pub async fn update(&self, document: &Document) -> RuntimeResult<UpdateReport> {
        Ok(self.loader.apply_update(document).await?)
    }

    pub async fn update_file(&self, path: impl AsRef<Path>) -> RuntimeResult<UpdateReport> {
        let document = Document::from_file(path)?;
        self.update(&document).await
    }

    /// Re-evaluate dependents whenever a component publishes new exports,
    /// until `cancel` fires; then stop every component.
    pub async fn run(&self, cancel: CancellationToken) -> RuntimeResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(RuntimeError::AlreadyRunning);
        }

        info!("controller running");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                ids = self.export_changes.next() => {
                    debug!(nodes = ?ids, "exports changed");
                    self.loader.evaluate_dependents(&ids).await;
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.loader.shutdown().await;
        info!("controller stopped");
    }

    pub fn components(&self) -> Vec<ComponentInfo> {
        self.loader
            .nodes()
            .iter()
            .filter_map(Node::as_component)
            .map(|node| ComponentInfo {
                id: node.id().to_string(),
                name: node.kind().to_string(),
                label: node.label(),
                health: node.health(),
                arguments: node.arguments(),
                exports: node.exports(),
                dependencies: self.loader.dependencies_of(node.id()),
                debug_info: node.debug_info(),
            })
            .collect()
    }

    pub fn component(&self, id: &str) -> Option<ComponentInfo> {
        self.components().into_iter().find(|info| info.id == id)
    }

    /// Values of every export block, keyed by identity
    pub fn exports(&self) -> BTreeMap<String, Value> {
        self.loader
            .nodes()
            .into_iter()
            .filter_map(|node| match node {
                Node::Config(config) => Some((config.id().to_string(), config.value())),
                Node::Component(_) => None,
            })
            .collect()
    }

    /// Evaluation order of the loaded configuration
    pub fn order(&self) -> Vec<String> {
        self.loader.order()
    }

    /// Registry holding controller and component metrics
    pub fn metrics(&self) -> &prometheus::Registry {
        &self.metrics_registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_data_path() {
        let config = ControllerConfig::default();
        assert!(config.data_path.ends_with("conduit"));

        let config = config.with_data_path("/var/lib/conduit-test");
        assert_eq!(config.data_path, PathBuf::from("/var/lib/conduit-test"));
    }

    #[tokio::test]
    async fn test_exports_and_run_twice() {
        let controller = Controller::new(ControllerConfig::default(), Registry::new()).unwrap();
        let document = Document::parse(
            "blocks:\n  - block: export\n    label: a\n    value: \"${{ upper('x') }}\"\n",
        )
        .unwrap();
        controller.load(&document).await.unwrap();
        assert_eq!(controller.exports()["export.a"], Value::from("X"));
        assert!(controller.components().is_empty());

        let cancel = CancellationToken::new();
        cancel.cancel();
        controller.run(cancel.clone()).await.unwrap();
        assert!(matches!(
            controller.run(cancel).await,
            Err(RuntimeError::AlreadyRunning)
        ));
    }
}
