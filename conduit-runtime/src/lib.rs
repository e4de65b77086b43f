// Conduit Runtime Library
// Live-reconfigurable pipeline controller and bundled components

pub mod component;
pub mod components;
pub mod controller;
pub mod error;
pub mod expression;
pub mod syntax;
pub mod value;

// Re-export commonly used types
pub use error::{RuntimeError, RuntimeResult};

// Re-export configuration types
pub use syntax::{Block, Document, SyntaxError, SyntaxErrorKind};
pub use value::{Capsule, Value};

// Re-export expression types
pub use expression::{EvalError, Program, Scope};

// Re-export component contract types
pub use component::{
    Arguments, Body, Component, ComponentError, DecodeError, ExportChanges, ExportsHandle, Options,
    Registration, Registry,
};
pub use components::default_registry;

// Re-export controller types
pub use controller::{
    event_channel, ComponentInfo, Controller, ControllerConfig, ControllerEvent,
    ControllerEventReceiver, ControllerEventSender, Health, HealthType, LoadError, PassReport,
    Plan, UpdateReport,
};
