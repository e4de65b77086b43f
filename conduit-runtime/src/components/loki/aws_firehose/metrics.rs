// Firehose receiver metrics
// Prometheus counters for received records and rejected input

use prometheus::{IntCounterVec, Opts, Registry};

const NAMESPACE: &str = "loki_source_awsfirehose";

/// Counters owned by one `loki.source.aws_firehose` component.
///
/// Every series carries a `component_id` const label so several receivers can
/// share the controller registry. Collectors are unregistered on drop.
pub struct FirehoseMetrics {
    registry: Option<Registry>,
    pub records_received: IntCounterVec,
    pub record_errors: IntCounterVec,
    pub batch_errors: IntCounterVec,
    pub invalid_static_labels_errors: IntCounterVec,
}

impl FirehoseMetrics {
    pub fn new(registry: &Registry, component_id: &str) -> Result<Self, prometheus::Error> {
        let opts = |name: &str, help: &str| {
            Opts::new(name, help)
                .namespace(NAMESPACE)
                .const_label("component_id", component_id)
        };

        let records_received = IntCounterVec::new(
            opts("records_received", "Number of records received, by record type"),
            &["type"],
        )?;
        let record_errors = IntCounterVec::new(
            opts("record_errors", "Number of records that could not be processed"),
            &["reason"],
        )?;
        let batch_errors = IntCounterVec::new(
            opts("batch_errors", "Number of requests rejected before record processing"),
            &["reason"],
        )?;
        let invalid_static_labels_errors = IntCounterVec::new(
            opts(
                "invalid_static_labels_errors",
                "Number of errors while processing AWS Firehose static labels",
            ),
            &["reason", "tenant_id"],
        )?;

        let mut metrics = Self {
            registry: None,
            records_received,
            record_errors,
            batch_errors,
            invalid_static_labels_errors,
        };
        let registered = metrics.collectors();
        for (i, collector) in metrics.collectors().into_iter().enumerate() {
            if let Err(err) = registry.register(collector) {
                for previous in registered.into_iter().take(i) {
                    let _ = registry.unregister(previous);
                }
                return Err(err);
            }
        }
        metrics.registry = Some(registry.clone());
        Ok(metrics)
    }

    fn collectors(&self) -> Vec<Box<dyn prometheus::core::Collector>> {
        vec![
            Box::new(self.records_received.clone()),
            Box::new(self.record_errors.clone()),
            Box::new(self.batch_errors.clone()),
            Box::new(self.invalid_static_labels_errors.clone()),
        ]
    }
}

impl Drop for FirehoseMetrics {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.take() {
            for collector in self.collectors() {
                let _ = registry.unregister(collector);
            }
        }
    }
}
