// otelcol.exporter.debug
// Writes received log records to the process log

use crate::component::{Arguments, Body, Component, ComponentError, DecodeError, Options};
use crate::components::otelcol::{LogRecord, Logs, LogsConsumer, CONSUMER_CAPACITY};
use crate::value::Value;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub const NAME: &str = "otelcol.exporter.debug";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Verbosity {
    /// One summary line per batch
    #[default]
    Basic,
    /// One line per record
    Normal,
    /// One line per record, with attributes and timestamps
    Detailed,
}

impl Verbosity {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "basic" => Some(Self::Basic),
            "normal" => Some(Self::Normal),
            "detailed" => Some(Self::Detailed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DebugArguments {
    pub verbosity: Verbosity,
}

impl Arguments for DebugArguments {
    fn decode(body: &Body<'_>) -> Result<Self, DecodeError> {
        body.check_known(&["verbosity"])?;
        let verbosity = body.string_or("verbosity", "basic")?;
        let verbosity = Verbosity::parse(&verbosity).ok_or_else(|| {
            DecodeError::invalid(
                "verbosity",
                format!("expected basic, normal or detailed, got '{}'", verbosity),
            )
        })?;
        Ok(Self { verbosity })
    }
}

pub struct DebugExporter {
    id: String,
    batches: Mutex<Option<mpsc::Receiver<Logs>>>,
    verbosity: RwLock<Verbosity>,
    records: AtomicU64,
}

impl DebugExporter {
    pub fn new(opts: Options, args: DebugArguments) -> Result<Self, ComponentError> {
        let (consumer, batches) = LogsConsumer::channel(CONSUMER_CAPACITY);
        let mut exports = BTreeMap::new();
        exports.insert("input".to_string(), consumer.into_value());
        opts.exports.set(Value::Object(exports));

        Ok(Self {
            id: opts.id,
            batches: Mutex::new(Some(batches)),
            verbosity: RwLock::new(args.verbosity),
            records: AtomicU64::new(0),
        })
    }

    pub fn records(&self) -> u64 {
        self.records.load(Ordering::Relaxed)
    }

    fn export(&self, logs: &[LogRecord]) {
        self.records.fetch_add(logs.len() as u64, Ordering::Relaxed);
        match *self.verbosity.read() {
            Verbosity::Basic => {
                info!(component = %self.id, records = logs.len(), "LogsExporter");
            }
            Verbosity::Normal => {
                for record in logs {
                    info!(component = %self.id, "{}", record.body);
                }
            }
            Verbosity::Detailed => {
                for record in logs {
                    info!(
                        component = %self.id,
                        timestamp = %record.timestamp.to_rfc3339(),
                        observed_timestamp = %record.observed_timestamp.to_rfc3339(),
                        attributes = ?record.attributes,
                        "{}",
                        record.body
                    );
                }
            }
        }
    }
}

#[async_trait]
impl Component for DebugExporter {
    type Arguments = DebugArguments;

    async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), ComponentError> {
        let mut batches = self
            .batches
            .lock()
            .take()
            .ok_or_else(|| ComponentError::new("component already ran"))?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                batch = batches.recv() => {
                    let Some(batch) = batch else { return Ok(()) };
                    self.export(&batch);
                }
            }
        }
    }

    async fn update(&self, args: DebugArguments) -> Result<(), ComponentError> {
        *self.verbosity.write() = args.verbosity;
        Ok(())
    }

    fn debug_info(&self) -> Option<serde_json::Value> {
        Some(serde_json::json!({ "records": self.records() }))
    }
}
