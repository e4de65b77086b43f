// Component plugin contract
// The lifecycle interface every component implements, plus the explicit registry of component kinds

pub mod args;

pub use args::{parse_duration, Arguments, Body, DecodeError};

use crate::controller::health::Health;
use crate::value::Value;

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Failure inside a component's `run` or `update`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ComponentError {
    pub message: String,
}

impl ComponentError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for ComponentError {
    fn from(err: std::io::Error) -> Self {
        Self::new(err.to_string())
    }
}

impl From<DecodeError> for ComponentError {
    fn from(err: DecodeError) -> Self {
        Self::new(err.to_string())
    }
}

/// A long-running pipeline component.
///
/// `run` is called exactly once and should return only when `cancel` fires
/// (returning `Ok`) or on an unrecoverable failure. `update` is never called
/// concurrently with itself.
#[async_trait]
pub trait Component: Send + Sync + 'static {
    type Arguments: Arguments;

    async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), ComponentError>;

    async fn update(&self, args: Self::Arguments) -> Result<(), ComponentError>;

    /// Health reported by the component itself, if it tracks any
    fn current_health(&self) -> Option<Health> {
        None
    }

    /// Structured snapshot for operational inspection
    fn debug_info(&self) -> Option<serde_json::Value> {
        None
    }
}

/// Arguments decoded for some component kind
pub type AnyArguments = Box<dyn Any + Send + Sync>;

/// Object-safe view of a [`Component`] used by the controller
#[async_trait]
pub trait ErasedComponent: Send + Sync {
    async fn run(&self, cancel: CancellationToken) -> Result<(), ComponentError>;
    async fn update(&self, args: AnyArguments) -> Result<(), ComponentError>;
    fn current_health(&self) -> Option<Health>;
    fn debug_info(&self) -> Option<serde_json::Value>;
}

/// Wrap a concrete component for the controller
pub fn erase<C: Component>(component: C) -> Arc<dyn ErasedComponent> {
    Arc::new(Erased(Arc::new(component)))
}

struct Erased<C>(Arc<C>);

#[async_trait]
impl<C: Component> ErasedComponent for Erased<C> {
    async fn run(&self, cancel: CancellationToken) -> Result<(), ComponentError> {
        self.0.clone().run(cancel).await
    }

    async fn update(&self, args: AnyArguments) -> Result<(), ComponentError> {
        let args = args
            .downcast::<C::Arguments>()
            .map_err(|_| ComponentError::new("arguments decoded for a different component kind"))?;
        self.0.update(*args).await
    }

    fn current_health(&self) -> Option<Health> {
        self.0.current_health()
    }

    fn debug_info(&self) -> Option<serde_json::Value> {
        self.0.debug_info()
    }
}

/// Identities of components whose exports changed and are not yet handled.
///
/// Repeated changes of one component before the next drain collapse into a
/// single entry, so the set stays bounded by the number of components.
#[derive(Default)]
pub struct ExportChanges {
    pending: Mutex<BTreeSet<String>>,
    notify: Notify,
}

impl ExportChanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, node_id: &str) {
        self.pending.lock().insert(node_id.to_string());
        self.notify.notify_one();
    }

    /// Take every pending identity, sorted
    pub fn drain(&self) -> Vec<String> {
        std::mem::take(&mut *self.pending.lock()).into_iter().collect()
    }

    /// Wait until at least one identity is pending, then drain
    pub async fn next(&self) -> Vec<String> {
        loop {
            let ids = self.drain();
            if !ids.is_empty() {
                return ids;
            }
            self.notify.notified().await;
        }
    }
}

/// Shared slot holding a component's exports.
///
/// Setting a different value notifies the controller so it can re-evaluate
/// the nodes that read these exports.
#[derive(Clone)]
pub struct ExportsHandle {
    node_id: String,
    slot: Arc<RwLock<Value>>,
    changes: Option<Arc<ExportChanges>>,
}

impl ExportsHandle {
    pub fn new(node_id: impl Into<String>, changes: Option<Arc<ExportChanges>>) -> Self {
        Self {
            node_id: node_id.into(),
            slot: Arc::new(RwLock::new(Value::Null)),
            changes,
        }
    }

    /// Publish new exports; a no-op when the value is unchanged
    pub fn set(&self, exports: Value) {
        {
            let mut slot = self.slot.write();
            if *slot == exports {
                return;
            }
            *slot = exports;
        }
        if let Some(changes) = &self.changes {
            changes.mark(&self.node_id);
        }
    }

    pub fn get(&self) -> Value {
        self.slot.read().clone()
    }
}

impl fmt::Debug for ExportsHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportsHandle")
            .field("node_id", &self.node_id)
            .finish()
    }
}

/// Everything a component gets from the controller at construction time
#[derive(Debug, Clone)]
pub struct Options {
    /// Node identity, e.g. `loki.source.aws_firehose.default`
    pub id: String,
    /// Per-component directory for persistent state (not created eagerly)
    pub data_path: PathBuf,
    /// Registry for the component's own metrics
    pub registerer: prometheus::Registry,
    pub exports: ExportsHandle,
}

type DecodeFn = dyn Fn(&Body<'_>) -> Result<AnyArguments, DecodeError> + Send + Sync;
type BuildFn =
    dyn Fn(Options, AnyArguments) -> Result<Arc<dyn ErasedComponent>, ComponentError> + Send + Sync;

/// A component kind: its block name and how to decode and build it
#[derive(Clone)]
pub struct Registration {
    name: String,
    decode: Arc<DecodeFn>,
    build: Arc<BuildFn>,
}

impl Registration {
    pub fn new<C, F>(name: impl Into<String>, build: F) -> Self
    where
        C: Component,
        F: Fn(Options, C::Arguments) -> Result<C, ComponentError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            decode: Arc::new(|body: &Body<'_>| {
                C::Arguments::decode(body).map(|args| Box::new(args) as AnyArguments)
            }),
            build: Arc::new(move |opts: Options, args: AnyArguments| {
                let args = args.downcast::<C::Arguments>().map_err(|_| {
                    ComponentError::new("arguments decoded for a different component kind")
                })?;
                Ok(erase(build(opts, *args)?))
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn decode(&self, value: &Value) -> Result<AnyArguments, DecodeError> {
        (self.decode)(&Body::new(value))
    }

    pub fn build(
        &self,
        opts: Options,
        args: AnyArguments,
    ) -> Result<Arc<dyn ErasedComponent>, ComponentError> {
        (self.build)(opts, args)
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("name", &self.name)
            .finish()
    }
}

/// The set of component kinds available to a controller
#[derive(Debug, Clone, Default)]
pub struct Registry {
    registrations: BTreeMap<String, Registration>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a component kind; a later registration with the same name wins
    pub fn register(mut self, registration: Registration) -> Self {
        self.registrations
            .insert(registration.name.clone(), registration);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Registration> {
        self.registrations.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.registrations.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.registrations.keys().map(String::as_str)
    }
}
