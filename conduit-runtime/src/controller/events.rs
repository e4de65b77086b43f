// Controller Events
// Notifications emitted while evaluating nodes and supervising components

use crate::controller::health::Health;

use tokio::sync::mpsc;

/// Sender for controller events
pub type ControllerEventSender = mpsc::UnboundedSender<ControllerEvent>;

/// Receiver for controller events
pub type ControllerEventReceiver = mpsc::UnboundedReceiver<ControllerEvent>;

/// Create a new controller event channel
pub fn event_channel() -> (ControllerEventSender, ControllerEventReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted by the loader and the lifecycle runners
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    /// A node was evaluated and its new value or arguments stored
    NodeEvaluated { node_id: String },

    /// Evaluation failed; the node keeps its previous value
    NodeEvaluationFailed { node_id: String, error: String },

    /// A node was not evaluated in this pass
    NodeSkipped { node_id: String, reason: String },

    /// A component's run task was spawned
    ComponentStarted { node_id: String },

    /// A component was stopped and its task joined
    ComponentStopped { node_id: String },

    /// A component's run task returned on its own
    ComponentExited { node_id: String, health: Health },

    /// A configuration update finished
    UpdateApplied {
        added: usize,
        removed: usize,
        changed: usize,
        failed: usize,
    },
}

impl ControllerEvent {
    pub fn node_evaluated(node_id: impl Into<String>) -> Self {
        Self::NodeEvaluated {
            node_id: node_id.into(),
        }
    }

    pub fn node_evaluation_failed(node_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self::NodeEvaluationFailed {
            node_id: node_id.into(),
            error: error.into(),
        }
    }

    pub fn node_skipped(node_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::NodeSkipped {
            node_id: node_id.into(),
            reason: reason.into(),
        }
    }

    pub fn component_started(node_id: impl Into<String>) -> Self {
        Self::ComponentStarted {
            node_id: node_id.into(),
        }
    }

    pub fn component_stopped(node_id: impl Into<String>) -> Self {
        Self::ComponentStopped {
            node_id: node_id.into(),
        }
    }

    pub fn component_exited(node_id: impl Into<String>, health: Health) -> Self {
        Self::ComponentExited {
            node_id: node_id.into(),
            health,
        }
    }

    /// Identity of the node the event is about, if any
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::NodeEvaluated { node_id }
            | Self::NodeEvaluationFailed { node_id, .. }
            | Self::NodeSkipped { node_id, .. }
            | Self::ComponentStarted { node_id }
            | Self::ComponentStopped { node_id }
            | Self::ComponentExited { node_id, .. } => Some(node_id),
            Self::UpdateApplied { .. } => None,
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: ControllerEvent);
}

impl EventSender for ControllerEventSender {
    fn send_event(&self, event: ControllerEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ControllerEventSender> {
    fn send_event(&self, event: ControllerEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_channel() {
        let (tx, mut rx) = event_channel();

        tx.send_event(ControllerEvent::node_evaluated("export.a"));
        tx.send_event(ControllerEvent::component_started("loki.echo.out"));

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, ControllerEvent::NodeEvaluated { .. }));
        assert_eq!(event.node_id(), Some("export.a"));

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, ControllerEvent::ComponentStarted { .. }));
    }

    #[test]
    fn test_optional_sender_without_channel() {
        let sender: Option<ControllerEventSender> = None;
        sender.send_event(ControllerEvent::node_skipped("export.a", "unchanged"));

        let event = ControllerEvent::UpdateApplied {
            added: 1,
            removed: 0,
            changed: 2,
            failed: 0,
        };
        assert_eq!(event.node_id(), None);
    }
}
