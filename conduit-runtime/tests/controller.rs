// Controller integration tests
// Loading, updating and shutting down graphs of probe components

use conduit_runtime::component::{
    Arguments, Body, Component, ComponentError, DecodeError, ExportsHandle, Options, Registration,
    Registry,
};
use conduit_runtime::controller::{
    Controller, ControllerConfig, GraphError, HealthType, LoadError, PlanError,
};
use conduit_runtime::{Document, RuntimeError, Value};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

const KIND: &str = "test.passthrough";

/// Observations shared by every probe component of one test
#[derive(Default)]
struct Probe {
    builds: AtomicUsize,
    runs: AtomicUsize,
    stops: AtomicUsize,
    updates: Mutex<BTreeMap<String, Vec<i64>>>,
}

impl Probe {
    fn updates_of(&self, id: &str) -> Vec<i64> {
        self.updates.lock().get(id).cloned().unwrap_or_default()
    }
}

struct PassthroughArgs {
    value: i64,
    fail: bool,
}

impl Arguments for PassthroughArgs {
    fn decode(body: &Body<'_>) -> Result<Self, DecodeError> {
        body.check_known(&["value", "fail"])?;
        Ok(Self {
            value: body.i64_or("value", 0)?,
            fail: body.bool_or("fail", false)?,
        })
    }
}

/// Exports `value` unchanged
struct Passthrough {
    id: String,
    fail: bool,
    exports: ExportsHandle,
    probe: Arc<Probe>,
}

impl Passthrough {
    fn publish(&self, value: i64) {
        let mut exports = BTreeMap::new();
        exports.insert("value".to_string(), Value::from(value));
        self.exports.set(Value::Object(exports));
    }
}

#[async_trait]
impl Component for Passthrough {
    type Arguments = PassthroughArgs;

    async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), ComponentError> {
        self.probe.runs.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ComponentError::new("boom"));
        }
        cancel.cancelled().await;
        self.probe.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update(&self, args: PassthroughArgs) -> Result<(), ComponentError> {
        self.probe
            .updates
            .lock()
            .entry(self.id.clone())
            .or_default()
            .push(args.value);
        self.publish(args.value);
        Ok(())
    }
}

fn registry(probe: &Arc<Probe>) -> Registry {
    let probe = probe.clone();
    Registry::new().register(Registration::new::<Passthrough, _>(
        KIND,
        move |opts: Options, args: PassthroughArgs| {
            probe.builds.fetch_add(1, Ordering::SeqCst);
            let component = Passthrough {
                id: opts.id,
                fail: args.fail,
                exports: opts.exports,
                probe: probe.clone(),
            };
            component.publish(args.value);
            Ok(component)
        },
    ))
}

fn controller(probe: &Arc<Probe>) -> Controller {
    let dir = std::env::temp_dir().join("conduit-controller-tests");
    Controller::new(ControllerConfig::default().with_data_path(dir), registry(probe)).unwrap()
}

fn doc(yaml: &str) -> Document {
    Document::parse(yaml).unwrap()
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

const PIPELINE: &str = r#"
blocks:
  - block: export
    label: base
    value: 1
  - block: export
    label: note
    value: x
  - block: test.passthrough
    label: a
    value: "${{ export.base.value }}"
  - block: test.passthrough
    label: b
    value: "${{ test.passthrough.a.value * 10 }}"
"#;

#[tokio::test]
async fn test_evaluation_order_is_deterministic() {
    let probe = Arc::new(Probe::default());
    let controller = controller(&probe);
    let yaml = r#"
blocks:
  - block: test.passthrough
    label: x
    value: "${{ test.passthrough.z.value }}"
  - block: test.passthrough
    label: y
  - block: test.passthrough
    label: z
"#;

    let first = controller.plan(&doc(yaml)).unwrap().order().to_vec();
    let second = controller.plan(&doc(yaml)).unwrap().order().to_vec();
    assert_eq!(first, second);
    assert_eq!(
        first,
        vec!["test.passthrough.z", "test.passthrough.x", "test.passthrough.y"]
    );
    assert_eq!(probe.builds.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cycle_starts_nothing() {
    let probe = Arc::new(Probe::default());
    let controller = controller(&probe);
    let yaml = r#"
blocks:
  - block: test.passthrough
    label: a
    value: "${{ test.passthrough.b.value }}"
  - block: test.passthrough
    label: b
    value: "${{ test.passthrough.a.value }}"
"#;

    match controller.load(&doc(yaml)).await {
        Err(RuntimeError::Load(LoadError::Structural(errors))) => {
            assert!(errors
                .iter()
                .any(|e| matches!(e, PlanError::Graph(GraphError::Cycle { .. }))));
        }
        other => panic!("expected a cycle error, got {:?}", other),
    }
    assert_eq!(probe.builds.load(Ordering::SeqCst), 0);
    assert!(controller.components().is_empty());
}

#[tokio::test]
async fn test_initial_evaluation_failure_starts_nothing() {
    let probe = Arc::new(Probe::default());
    let controller = controller(&probe);
    let yaml = r#"
blocks:
  - block: test.passthrough
    label: good
    value: 1
  - block: test.passthrough
    label: bad
    value: "${{ 1 / 0 }}"
"#;

    match controller.load(&doc(yaml)).await {
        Err(RuntimeError::Load(LoadError::Evaluation(failures))) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].node_id, "test.passthrough.bad");
        }
        other => panic!("expected an evaluation error, got {:?}", other),
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(probe.runs.load(Ordering::SeqCst), 0);
    assert!(controller.components().is_empty());
}

#[tokio::test]
async fn test_apply_is_idempotent() {
    let probe = Arc::new(Probe::default());
    let controller = controller(&probe);

    let report = controller.load(&doc(PIPELINE)).await.unwrap();
    assert_eq!(report.started, vec!["test.passthrough.a", "test.passthrough.b"]);
    assert!(eventually(|| probe.runs.load(Ordering::SeqCst) == 2).await);

    let report = controller.update(&doc(PIPELINE)).await.unwrap();
    assert!(report.is_noop());

    // A change nothing reads leaves the components alone
    let report = controller
        .update(&doc(&PIPELINE.replace("value: x", "value: y")))
        .await
        .unwrap();
    assert_eq!(report.changed, vec!["export.note"]);
    assert_eq!(report.pass.evaluated, vec!["export.note"]);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(probe.updates.lock().is_empty());
    assert_eq!(probe.builds.load(Ordering::SeqCst), 2);

    controller.shutdown().await;
    assert_eq!(probe.stops.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_export_changes_propagate_to_dependents() {
    let probe = Arc::new(Probe::default());
    let controller = Arc::new(controller(&probe));
    controller.load(&doc(PIPELINE)).await.unwrap();
    assert_eq!(
        controller.component("test.passthrough.b").unwrap().arguments,
        Value::Object([("value".to_string(), Value::from(10i64))].into())
    );

    let cancel = CancellationToken::new();
    let running = {
        let controller = controller.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { controller.run(cancel).await })
    };

    let report = controller
        .update(&doc(&PIPELINE.replace("value: 1", "value: 2")))
        .await
        .unwrap();
    assert_eq!(report.changed, vec!["export.base"]);
    assert!(report.pass.evaluated.contains(&"test.passthrough.a".to_string()));

    assert!(eventually(|| probe.updates_of("test.passthrough.a") == vec![2]).await);
    assert!(eventually(|| probe.updates_of("test.passthrough.b") == vec![20]).await);

    cancel.cancel();
    running.await.unwrap().unwrap();
    assert_eq!(probe.stops.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_failures_stay_isolated() {
    let probe = Arc::new(Probe::default());
    let controller = controller(&probe);
    let yaml = r#"
blocks:
  - block: test.passthrough
    label: a
    value: 1
  - block: test.passthrough
    label: b
    value: 2
  - block: test.passthrough
    label: c
    value: "${{ test.passthrough.b.value + 1 }}"
"#;
    controller.load(&doc(yaml)).await.unwrap();

    let broken = yaml
        .replace("value: 2", "value: \"${{ 1 / 0 }}\"")
        .replace("value + 1", "value + 2");
    let report = controller.update(&doc(&broken)).await.unwrap();
    assert_eq!(report.changed, vec!["test.passthrough.b", "test.passthrough.c"]);
    assert_eq!(report.pass.failed.len(), 1);
    assert_eq!(report.pass.failed[0].node_id, "test.passthrough.b");
    assert_eq!(report.pass.skipped, vec!["test.passthrough.c"]);

    let b = controller.component("test.passthrough.b").unwrap();
    assert_eq!(b.health.health, HealthType::Unhealthy);
    assert_eq!(
        b.arguments,
        Value::Object([("value".to_string(), Value::from(2i64))].into())
    );
    let c = controller.component("test.passthrough.c").unwrap();
    assert_eq!(
        c.arguments,
        Value::Object([("value".to_string(), Value::from(3i64))].into())
    );
    assert_ne!(
        controller.component("test.passthrough.a").unwrap().health.health,
        HealthType::Unhealthy
    );

    // Fixing the expression recovers the node on the next update
    let report = controller.update(&doc(&yaml.replace("value + 1", "value + 2"))).await.unwrap();
    assert_eq!(report.changed, vec!["test.passthrough.b"]);
    assert!(report.pass.failed.is_empty());
    assert!(eventually(|| probe.updates_of("test.passthrough.c") == vec![4]).await);
    assert_ne!(
        controller.component("test.passthrough.b").unwrap().health.health,
        HealthType::Unhealthy
    );
    assert!(probe.updates_of("test.passthrough.a").is_empty());

    controller.shutdown().await;
}

#[tokio::test]
async fn test_failed_node_does_not_block_siblings() {
    let probe = Arc::new(Probe::default());
    let controller = controller(&probe);
    let yaml = r#"
blocks:
  - block: test.passthrough
    label: a
    value: 1
  - block: test.passthrough
    label: b
    value: 2
"#;
    controller.load(&doc(yaml)).await.unwrap();

    let broken = yaml
        .replace("value: 1", "value: 5")
        .replace("value: 2", "value: \"${{ 1 / 0 }}\"");
    let report = controller.update(&doc(&broken)).await.unwrap();
    assert_eq!(report.changed, vec!["test.passthrough.a", "test.passthrough.b"]);
    assert_eq!(report.pass.failed.len(), 1);
    assert_eq!(report.pass.failed[0].node_id, "test.passthrough.b");
    assert_eq!(report.pass.evaluated, vec!["test.passthrough.a"]);
    assert!(eventually(|| probe.updates_of("test.passthrough.a") == vec![5]).await);
    assert!(probe.updates_of("test.passthrough.b").is_empty());

    controller.shutdown().await;
}

#[tokio::test]
async fn test_exited_component_does_not_fail_later_passes() {
    let probe = Arc::new(Probe::default());
    let controller = controller(&probe);
    let yaml = r#"
blocks:
  - block: export
    label: base
    value: 1
  - block: test.passthrough
    label: bad
    fail: true
    value: "${{ export.base.value }}"
  - block: export
    label: reader
    value: "${{ test.passthrough.bad.value + export.base.value }}"
"#;
    controller.load(&doc(yaml)).await.unwrap();
    assert!(
        eventually(|| {
            controller.component("test.passthrough.bad").unwrap().health.health
                == HealthType::Exited
        })
        .await
    );

    let report = controller
        .update(&doc(&yaml.replace("value: 1", "value: 2")))
        .await
        .unwrap();
    assert!(!report.has_failures());
    assert!(report.pass.skipped.is_empty());
    assert_eq!(
        report.pass.evaluated,
        vec!["export.base", "test.passthrough.bad", "export.reader"]
    );
    // The exited component's exports still carry the value it was built with
    assert_eq!(controller.exports()["export.reader"], Value::from(3i64));

    let bad = controller.component("test.passthrough.bad").unwrap();
    assert_eq!(bad.health.health, HealthType::Exited);
    assert_eq!(
        bad.arguments,
        Value::Object(
            [
                ("fail".to_string(), Value::from(true)),
                ("value".to_string(), Value::from(2i64)),
            ]
            .into()
        )
    );
    assert!(probe.updates_of("test.passthrough.bad").is_empty());

    controller.shutdown().await;
}

#[tokio::test]
async fn test_run_failure_reports_exited() {
    let probe = Arc::new(Probe::default());
    let controller = controller(&probe);
    let yaml = r#"
blocks:
  - block: test.passthrough
    label: bad
    fail: true
  - block: test.passthrough
    label: good
"#;
    controller.load(&doc(yaml)).await.unwrap();

    assert!(
        eventually(|| {
            controller.component("test.passthrough.bad").unwrap().health.health
                == HealthType::Exited
        })
        .await
    );
    let bad = controller.component("test.passthrough.bad").unwrap();
    assert_eq!(bad.health.message, "boom");
    assert_ne!(
        controller.component("test.passthrough.good").unwrap().health.health,
        HealthType::Exited
    );

    controller.shutdown().await;
    assert_eq!(probe.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_removed_components_are_stopped() {
    let probe = Arc::new(Probe::default());
    let controller = controller(&probe);
    controller.load(&doc(PIPELINE)).await.unwrap();
    assert!(eventually(|| probe.runs.load(Ordering::SeqCst) == 2).await);

    let without_b = r#"
blocks:
  - block: export
    label: base
    value: 1
  - block: export
    label: note
    value: x
  - block: test.passthrough
    label: a
    value: "${{ export.base.value }}"
"#;
    let report = controller.update(&doc(without_b)).await.unwrap();
    assert_eq!(report.removed, vec!["test.passthrough.b"]);
    assert_eq!(probe.stops.load(Ordering::SeqCst), 1);
    assert!(controller.component("test.passthrough.b").is_none());
    assert_eq!(controller.order(), vec!["export.base", "export.note", "test.passthrough.a"]);

    controller.shutdown().await;
    assert!(matches!(
        controller.update(&doc(PIPELINE)).await,
        Err(RuntimeError::Load(LoadError::ShutDown))
    ));
}
