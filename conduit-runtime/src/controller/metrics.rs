// Controller metrics
// Prometheus counters and gauges describing evaluation passes and running components

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

/// Metrics owned by the controller, registered into the shared registry that
/// components also register into.
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Successful node evaluations
    pub evaluations: IntCounter,
    /// Failed node evaluations by node
    pub evaluation_failures: IntCounterVec,
    /// Configuration updates applied
    pub updates: IntCounter,
    /// Components whose run task is live
    pub running_components: IntGauge,
}

impl ControllerMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let evaluations = IntCounter::with_opts(
            Opts::new("evaluations_total", "Total successful node evaluations")
                .namespace("conduit")
                .subsystem("controller"),
        )?;

        let evaluation_failures = IntCounterVec::new(
            Opts::new("evaluation_failures_total", "Total failed node evaluations")
                .namespace("conduit")
                .subsystem("controller"),
            &["node_id"],
        )?;

        let updates = IntCounter::with_opts(
            Opts::new("updates_total", "Total configuration updates applied")
                .namespace("conduit")
                .subsystem("controller"),
        )?;

        let running_components = IntGauge::with_opts(
            Opts::new("running_components", "Number of running components")
                .namespace("conduit")
                .subsystem("controller"),
        )?;

        registry.register(Box::new(evaluations.clone()))?;
        registry.register(Box::new(evaluation_failures.clone()))?;
        registry.register(Box::new(updates.clone()))?;
        registry.register(Box::new(running_components.clone()))?;

        Ok(Self {
            evaluations,
            evaluation_failures,
            updates,
            running_components,
        })
    }
}
