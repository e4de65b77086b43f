// loki.echo
// Sink that logs every entry it receives

use crate::component::{Arguments, Body, Component, ComponentError, DecodeError, Options};
use crate::components::loki::{Entry, LogsReceiver, RECEIVER_CAPACITY};
use crate::value::Value;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub const NAME: &str = "loki.echo";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EchoArguments;

impl Arguments for EchoArguments {
    fn decode(body: &Body<'_>) -> Result<Self, DecodeError> {
        body.check_known(&[])?;
        Ok(Self)
    }
}

pub struct Echo {
    id: String,
    entries: Mutex<Option<mpsc::Receiver<Entry>>>,
    received: AtomicU64,
}

impl Echo {
    pub fn new(opts: Options, _args: EchoArguments) -> Result<Self, ComponentError> {
        let (receiver, entries) = LogsReceiver::channel(RECEIVER_CAPACITY);
        let mut exports = BTreeMap::new();
        exports.insert("receiver".to_string(), receiver.into_value());
        opts.exports.set(Value::Object(exports));

        Ok(Self {
            id: opts.id,
            entries: Mutex::new(Some(entries)),
            received: AtomicU64::new(0),
        })
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Component for Echo {
    type Arguments = EchoArguments;

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
                    self.received.fetch_add(1, Ordering::Relaxed);
                    info!(
                        component = %self.id,
                        labels = ?entry.labels,
                        ts = %entry.timestamp.to_rfc3339(),
                        "{}",
                        entry.line
                    );
                }
            }
        }
    }

    async fn update(&self, _args: EchoArguments) -> Result<(), ComponentError> {
        Ok(())
    }

    fn debug_info(&self) -> Option<serde_json::Value> {
        Some(serde_json::json!({ "received": self.received() }))
    }
}
