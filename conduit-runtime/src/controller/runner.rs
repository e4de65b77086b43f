// Lifecycle runner
// Supervises one component's run task and hands it argument updates, latest wins

use crate::component::{AnyArguments, ErasedComponent};
use crate::controller::events::{ControllerEvent, ControllerEventSender, EventSender};
use crate::controller::health::{Health, HealthType};

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunnerError {
    #[error("component '{0}' is already started")]
    AlreadyStarted(String),

    #[error("component '{0}' is stopped")]
    Stopped(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Created,
    Running,
    Stopped,
}

/// Single-slot mailbox: offering replaces whatever is pending.
///
/// Exactly one consumer calls [`UpdateSlot::take`]. Once closed, pending
/// values are dropped and further offers are refused.
pub struct UpdateSlot<T> {
    inner: Mutex<SlotState<T>>,
    notify: Notify,
}

struct SlotState<T> {
    pending: Option<T>,
    closed: bool,
}

impl<T> UpdateSlot<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SlotState {
                pending: None,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Store `value` as the latest pending value; false if the slot is closed
    pub fn offer(&self, value: T) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return false;
            }
            inner.pending = Some(value);
        }
        self.notify.notify_one();
        true
    }

    /// Wait for the next pending value; `None` once closed
    pub async fn take(&self) -> Option<T> {
        loop {
            {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return None;
                }
                if let Some(value) = inner.pending.take() {
                    return Some(value);
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.pending = None;
        }
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

impl<T> Default for UpdateSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns the long-running task of one component
pub struct LifecycleRunner {
    node_id: String,
    component: Arc<dyn ErasedComponent>,
    slot: Arc<UpdateSlot<AnyArguments>>,
    cancel: CancellationToken,
    health: Arc<RwLock<Health>>,
    state: Mutex<RunnerState>,
    task: Mutex<Option<JoinHandle<()>>>,
    events: Option<ControllerEventSender>,
}

impl LifecycleRunner {
    pub fn new(node_id: impl Into<String>, component: Arc<dyn ErasedComponent>) -> Self {
        Self {
            node_id: node_id.into(),
            component,
            slot: Arc::new(UpdateSlot::new()),
            cancel: CancellationToken::new(),
            health: Arc::new(RwLock::new(Health::unknown())),
            state: Mutex::new(RunnerState::Created),
            task: Mutex::new(None),
            events: None,
        }
    }

    pub fn with_events(mut self, events: Option<ControllerEventSender>) -> Self {
        self.events = events;
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn component(&self) -> &Arc<dyn ErasedComponent> {
        &self.component
    }

    pub fn state(&self) -> RunnerState {
        *self.state.lock()
    }

    pub fn health(&self) -> Health {
        self.health.read().clone()
    }

    /// Spawn the supervised run task and the update consumer
    pub fn start(&self) -> Result<(), RunnerError> {
        {
            let mut state = self.state.lock();
            match *state {
                RunnerState::Created => *state = RunnerState::Running,
                RunnerState::Running => return Err(RunnerError::AlreadyStarted(self.node_id.clone())),
                RunnerState::Stopped => return Err(RunnerError::Stopped(self.node_id.clone())),
            }
        }

        *self.health.write() = Health::healthy("started component");
        info!(node_id = %self.node_id, "starting component");

        let handle = tokio::spawn(supervise(
            self.node_id.clone(),
            self.component.clone(),
            self.slot.clone(),
            self.cancel.clone(),
            self.health.clone(),
            self.events.clone(),
        ));
        *self.task.lock() = Some(handle);

        self.events
            .send_event(ControllerEvent::component_started(&self.node_id));
        Ok(())
    }

    /// Hand new arguments to the component without waiting for them to apply
    pub fn update(&self, args: AnyArguments) -> Result<(), RunnerError> {
        if self.slot.offer(args) {
            Ok(())
        } else {
            Err(RunnerError::Stopped(self.node_id.clone()))
        }
    }

    /// Cancel the component and wait for its task to finish
    pub async fn stop(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), RunnerState::Stopped);
        if previous == RunnerState::Stopped {
            return;
        }

        debug!(node_id = %self.node_id, "stopping component");
        self.cancel.cancel();
        self.slot.close();

        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(node_id = %self.node_id, error = %err, "component supervisor failed");
            }
        }

        self.events
            .send_event(ControllerEvent::component_stopped(&self.node_id));
    }
}

impl Drop for LifecycleRunner {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.slot.close();
    }
}

async fn supervise(
    node_id: String,
    component: Arc<dyn ErasedComponent>,
    slot: Arc<UpdateSlot<AnyArguments>>,
    cancel: CancellationToken,
    health: Arc<RwLock<Health>>,
    events: Option<ControllerEventSender>,
) {
    let run = {
        let component = component.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { component.run(cancel).await })
    };
    let updates = tokio::spawn(apply_updates(
        node_id.clone(),
        component,
        slot.clone(),
        health.clone(),
    ));

    let exited = match run.await {
        Ok(Ok(())) => Health::exited("component shut down cleanly"),
        Ok(Err(err)) => Health::exited(err.message),
        Err(err) if err.is_panic() => Health::exited("component panicked"),
        Err(_) => Health::exited("component task was aborted"),
    };

    slot.close();
    let _ = updates.await;

    if exited.message == "component shut down cleanly" {
        debug!(node_id = %node_id, "component exited");
    } else {
        warn!(node_id = %node_id, reason = %exited.message, "component exited");
    }
    *health.write() = exited.clone();

    if !cancel.is_cancelled() {
        events.send_event(ControllerEvent::component_exited(node_id, exited));
    }
}

async fn apply_updates(
    node_id: String,
    component: Arc<dyn ErasedComponent>,
    slot: Arc<UpdateSlot<AnyArguments>>,
    health: Arc<RwLock<Health>>,
) {
    while let Some(args) = slot.take().await {
        let target = component.clone();
        let outcome = tokio::spawn(async move { target.update(args).await }).await;

        let next = match outcome {
            Ok(Ok(())) => {
                debug!(node_id = %node_id, "applied component update");
                Health::healthy("component updated")
            }
            Ok(Err(err)) => {
                warn!(node_id = %node_id, error = %err, "component update failed");
                Health::unhealthy(format!("failed to update component: {}", err))
            }
            Err(_) => {
                warn!(node_id = %node_id, "component update panicked");
                Health::unhealthy("component update panicked")
            }
        };

        let mut current = health.write();
        if current.health != HealthType::Exited {
            *current = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{erase, Arguments, Body, Component, ComponentError, DecodeError};
    use crate::controller::events::event_channel;

    use std::time::Duration;

    use async_trait::async_trait;

    #[derive(Default)]
    struct Shared {
        applied: Mutex<Vec<i64>>,
        entered: Notify,
        release: Notify,
    }

    struct Recorder {
        shared: Arc<Shared>,
        block_first: bool,
        run_result: Option<&'static str>,
        panic_in_run: bool,
    }

    impl Recorder {
        fn new(shared: Arc<Shared>) -> Self {
            Self {
                shared,
                block_first: false,
                run_result: None,
                panic_in_run: false,
            }
        }
    }

    struct Step(i64);

    impl Arguments for Step {
        fn decode(body: &Body<'_>) -> Result<Self, DecodeError> {
            Ok(Step(body.i64_or("n", 0)?))
        }
    }

    #[async_trait]
    impl Component for Recorder {
        type Arguments = Step;

        async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), ComponentError> {
            if self.panic_in_run {
                panic!("run blew up");
            }
            if let Some(message) = self.run_result {
                return Err(ComponentError::new(message));
            }
            cancel.cancelled().await;
            Ok(())
        }

        async fn update(&self, args: Step) -> Result<(), ComponentError> {
            let first = {
                let mut applied = self.shared.applied.lock();
                applied.push(args.0);
                applied.len() == 1
            };
            if first && self.block_first {
                self.shared.entered.notify_one();
                self.shared.release.notified().await;
            }
            if args.0 < 0 {
                return Err(ComponentError::new("negative step"));
            }
            Ok(())
        }
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_update_slot_latest_wins() {
        let slot = UpdateSlot::new();
        assert!(slot.offer(1));
        assert!(slot.offer(2));
        assert_eq!(slot.take().await, Some(2));

        slot.close();
        assert!(!slot.offer(3));
        assert_eq!(slot.take().await, None);
        assert!(slot.is_closed());
    }

    #[tokio::test]
    async fn test_updates_coalesce_while_one_is_in_flight() {
        let shared = Arc::new(Shared::default());
        let mut recorder = Recorder::new(shared.clone());
        recorder.block_first = true;
        let runner = LifecycleRunner::new("test.recorder.a", erase(recorder));
        runner.start().unwrap();

        runner.update(Box::new(Step(1))).unwrap();
        shared.entered.notified().await;

        runner.update(Box::new(Step(2))).unwrap();
        runner.update(Box::new(Step(3))).unwrap();
        runner.update(Box::new(Step(4))).unwrap();
        shared.release.notify_one();

        wait_for(|| shared.applied.lock().len() == 2).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*shared.applied.lock(), vec![1, 4]);

        runner.stop().await;
    }

    #[tokio::test]
    async fn test_stop_joins_and_rejects_updates() {
        let (tx, mut rx) = event_channel();
        let shared = Arc::new(Shared::default());
        let runner = LifecycleRunner::new("test.recorder.a", erase(Recorder::new(shared)))
            .with_events(Some(tx));
        assert_eq!(runner.state(), RunnerState::Created);
        assert_eq!(runner.health().health, HealthType::Unknown);

        runner.start().unwrap();
        assert_eq!(runner.state(), RunnerState::Running);
        assert_eq!(
            runner.start().unwrap_err(),
            RunnerError::AlreadyStarted("test.recorder.a".to_string())
        );

        runner.stop().await;
        assert_eq!(runner.state(), RunnerState::Stopped);
        assert_eq!(runner.health().health, HealthType::Exited);
        assert_eq!(runner.health().message, "component shut down cleanly");
        assert_eq!(
            runner.update(Box::new(Step(1))).unwrap_err(),
            RunnerError::Stopped("test.recorder.a".to_string())
        );

        assert!(matches!(
            rx.recv().await.unwrap(),
            ControllerEvent::ComponentStarted { .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            ControllerEvent::ComponentStopped { .. }
        ));
    }

    #[tokio::test]
    async fn test_failed_update_marks_unhealthy_until_next_success() {
        let shared = Arc::new(Shared::default());
        let runner = LifecycleRunner::new("test.recorder.a", erase(Recorder::new(shared.clone())));
        runner.start().unwrap();

        runner.update(Box::new(Step(-1))).unwrap();
        wait_for(|| runner.health().health == HealthType::Unhealthy).await;
        assert!(runner.health().message.contains("negative step"));
        assert_eq!(runner.state(), RunnerState::Running);

        runner.update(Box::new(Step(2))).unwrap();
        wait_for(|| runner.health().health == HealthType::Healthy).await;
        assert_eq!(*shared.applied.lock(), vec![-1, 2]);

        runner.stop().await;
    }

    #[tokio::test]
    async fn test_run_error_is_terminal() {
        let (tx, mut rx) = event_channel();
        let mut recorder = Recorder::new(Arc::new(Shared::default()));
        recorder.run_result = Some("listener closed");
        let runner =
            LifecycleRunner::new("test.recorder.a", erase(recorder)).with_events(Some(tx));
        runner.start().unwrap();

        wait_for(|| runner.health().health == HealthType::Exited).await;
        assert_eq!(runner.health().message, "listener closed");

        let _started = rx.recv().await.unwrap();
        match rx.recv().await.unwrap() {
            ControllerEvent::ComponentExited { node_id, health } => {
                assert_eq!(node_id, "test.recorder.a");
                assert_eq!(health.message, "listener closed");
            }
            other => panic!("unexpected event {:?}", other),
        }

        wait_for(|| runner.update(Box::new(Step(1))).is_err()).await;
        runner.stop().await;
        assert_eq!(runner.health().message, "listener closed");
    }

    #[tokio::test]
    async fn test_run_panic_is_contained() {
        let mut recorder = Recorder::new(Arc::new(Shared::default()));
        recorder.panic_in_run = true;
        let runner = LifecycleRunner::new("test.recorder.a", erase(recorder));
        runner.start().unwrap();

        wait_for(|| runner.health().health == HealthType::Exited).await;
        assert_eq!(runner.health().message, "component panicked");
        runner.stop().await;
    }
}
