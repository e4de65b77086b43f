// otelcol.receiver.loki
// Accepts log entries and forwards them as OpenTelemetry log records

use crate::component::{Arguments, Body, Component, ComponentError, DecodeError, Options};
use crate::components::loki::{Entry, LogsReceiver, RECEIVER_CAPACITY};
use crate::components::otelcol::{fanout_logs, LogRecord, LogsConsumer};
use crate::value::Value;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const NAME: &str = "otelcol.receiver.loki";

/// Attribute listing which attributes came from entry labels
pub const LABELS_HINT_ATTRIBUTE: &str = "loki.attribute.labels";

#[derive(Debug, Clone)]
pub struct ReceiverArguments {
    pub logs: Vec<Arc<LogsConsumer>>,
}

impl Arguments for ReceiverArguments {
    fn decode(body: &Body<'_>) -> Result<Self, DecodeError> {
        body.check_known(&["output"])?;
        let output = body
            .object("output")?
            .ok_or_else(|| DecodeError::Missing("output".to_string()))?;
        output.check_known(&["logs"])?;

        Ok(Self {
            logs: output.capsules::<LogsConsumer>("logs")?,
        })
    }
}

/// Build the record for one entry.
///
/// Every label becomes an attribute; a `filename` label also yields
/// `log.file.path` and `log.file.name`.
pub fn convert_entry(entry: Entry) -> LogRecord {
    let mut attributes = BTreeMap::new();

    if let Some(filename) = entry.labels.get("filename") {
        attributes.insert("log.file.path".to_string(), filename.clone());
        let name = filename.rsplit('/').find(|s| !s.is_empty()).unwrap_or(filename.as_str());
        attributes.insert("log.file.name".to_string(), name.to_string());
    }

    if !entry.labels.is_empty() {
        let names: Vec<&str> = entry.labels.keys().map(String::as_str).collect();
        attributes.insert(LABELS_HINT_ATTRIBUTE.to_string(), names.join(","));
    }
    attributes.extend(entry.labels);

    LogRecord {
        timestamp: entry.timestamp,
        observed_timestamp: Utc::now(),
        body: entry.line,
        attributes,
    }
}

pub struct LokiReceiver {
    entries: Mutex<Option<mpsc::Receiver<Entry>>>,
    consumers: RwLock<Vec<Arc<LogsConsumer>>>,
    forwarded: AtomicU64,
}

impl LokiReceiver {
    pub fn new(opts: Options, args: ReceiverArguments) -> Result<Self, ComponentError> {
        let (receiver, entries) = LogsReceiver::channel(RECEIVER_CAPACITY);
        let mut exports = BTreeMap::new();
        exports.insert("receiver".to_string(), receiver.into_value());
        opts.exports.set(Value::Object(exports));

        Ok(Self {
            entries: Mutex::new(Some(entries)),
            consumers: RwLock::new(args.logs),
            forwarded: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl Component for LokiReceiver {
    type Arguments = ReceiverArguments;

    async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), ComponentError> {
        let mut entries = self
            .entries
            .lock()
            .take()
            .ok_or_else(|| ComponentError::new("component already ran"))?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                entry = entries.recv() => {
                    let Some(entry) = entry else { return Ok(()) };
                    let consumers = self.consumers.read().clone();
                    fanout_logs(&consumers, vec![convert_entry(entry)]).await;
                    self.forwarded.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    async fn update(&self, args: ReceiverArguments) -> Result<(), ComponentError> {
        *self.consumers.write() = args.logs;
        Ok(())
    }

    fn debug_info(&self) -> Option<serde_json::Value> {
        Some(serde_json::json!({
            "forwarded": self.forwarded.load(Ordering::Relaxed),
            "consumers": self.consumers.read().len(),
        }))
    }
}
