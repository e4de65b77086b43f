// OpenTelemetry log records
// Record type and consumer handle shared by the otelcol components

pub mod exporter_debug;
pub mod receiver_loki;

use crate::value::{Capsule, Value};

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

/// Capacity of each consumer's incoming batch channel
pub const CONSUMER_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub observed_timestamp: DateTime<Utc>,
    pub body: String,
    pub attributes: BTreeMap<String, String>,
}

/// A batch of records delivered together
pub type Logs = Vec<LogRecord>;

/// Write side of a component's log batch channel, exported as `input`
#[derive(Debug, Clone)]
pub struct LogsConsumer {
    sender: mpsc::Sender<Logs>,
}

impl LogsConsumer {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Logs>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }

    /// False once the consuming component is gone
    pub async fn consume(&self, logs: Logs) -> bool {
        self.sender.send(logs).await.is_ok()
    }

    pub fn into_value(self) -> Value {
        Value::Capsule(Capsule::new(self))
    }
}

/// Deliver `logs` to every consumer
pub async fn fanout_logs(consumers: &[Arc<LogsConsumer>], logs: Logs) {
    for consumer in consumers {
        if !consumer.consume(logs.clone()).await {
            debug!("dropping logs for closed consumer");
        }
    }
}
