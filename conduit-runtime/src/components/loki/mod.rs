// Loki log entries
// Entry and label types shared by log components, plus the channel handle they pass around

pub mod aws_firehose;
pub mod echo;
pub mod relabel;

use crate::value::{Capsule, Value};

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::debug;

/// Label name to value
pub type LabelSet = BTreeMap<String, String>;

/// Reserved label carrying the tenant of an entry
pub const TENANT_LABEL: &str = "__tenant_id__";

/// Labels starting with this prefix are internal and dropped before forwarding
pub const RESERVED_LABEL_PREFIX: &str = "__";

/// Capacity of each component's incoming entry channel
pub const RECEIVER_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub labels: LabelSet,
    pub timestamp: DateTime<Utc>,
    pub line: String,
}

impl Entry {
    pub fn new(labels: LabelSet, timestamp: DateTime<Utc>, line: impl Into<String>) -> Self {
        Self {
            labels,
            timestamp,
            line: line.into(),
        }
    }
}

/// Write side of a component's entry channel, exported as `receiver`
#[derive(Debug, Clone)]
pub struct LogsReceiver {
    sender: mpsc::Sender<Entry>,
}

impl LogsReceiver {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Entry>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }

    /// Send one entry, waiting for space; false once the reader is gone
    pub async fn send(&self, entry: Entry) -> bool {
        self.sender.send(entry).await.is_ok()
    }

    /// Wrap in a capsule so it can be exported and referenced
    pub fn into_value(self) -> Value {
        Value::Capsule(Capsule::new(self))
    }
}

/// Send `entry` to every receiver in `forward_to`
pub async fn fanout(forward_to: &[Arc<LogsReceiver>], entry: Entry) {
    let Some((last, rest)) = forward_to.split_last() else {
        return;
    };
    for receiver in rest {
        if !receiver.send(entry.clone()).await {
            debug!("dropping entry for closed receiver");
        }
    }
    if !last.send(entry).await {
        debug!("dropping entry for closed receiver");
    }
}

/// Valid label names match `[a-zA-Z_][a-zA-Z0-9_]*`
pub fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Turn an arbitrary name into a label name.
///
/// Uppercase letters become lowercase, prefixed with `_` unless first;
/// `%` becomes `_percent`; anything else outside `[a-zA-Z0-9_]` becomes `_`.
/// The result can still be invalid (a leading digit is kept).
pub fn sanitize_label_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for (i, c) in name.chars().enumerate() {
        match c {
            'A'..='Z' => {
                if i > 0 {
                    out.push('_');
                }
                out.push(c.to_ascii_lowercase());
            }
            '%' => out.push_str("_percent"),
            c if c.is_ascii_alphanumeric() || c == '_' => out.push(c),
            _ => out.push('_'),
        }
    }
    out
}

/// Remove internal `__` labels, keeping the tenant label
pub fn drop_internal_labels(labels: &mut LabelSet) {
    labels.retain(|name, _| !name.starts_with(RESERVED_LABEL_PREFIX) || name == TENANT_LABEL);
}
