// Bundled components
// Log, OpenTelemetry and profiling components shipped with the runtime

pub mod loki;
pub mod otelcol;
pub mod profile;

use crate::component::{Registration, Registry};

use loki::aws_firehose::FirehoseSource;
use loki::echo::Echo;
use otelcol::exporter_debug::DebugExporter;
use otelcol::receiver_loki::LokiReceiver;
use profile::sampler::ProfileSampler;

/// Registrations of every bundled component kind
pub fn registrations() -> Vec<Registration> {
    vec![
        Registration::new::<Echo, _>(loki::echo::NAME, Echo::new),
        Registration::new::<FirehoseSource, _>(loki::aws_firehose::NAME, FirehoseSource::new),
        Registration::new::<LokiReceiver, _>(otelcol::receiver_loki::NAME, LokiReceiver::new),
        Registration::new::<DebugExporter, _>(otelcol::exporter_debug::NAME, DebugExporter::new),
        Registration::new::<ProfileSampler, _>(profile::sampler::NAME, ProfileSampler::new),
    ]
}

/// Registry holding every bundled component kind
pub fn default_registry() -> Registry {
    registrations()
        .into_iter()
        .fold(Registry::new(), Registry::register)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_names() {
        let registry = default_registry();
        let names: Vec<&str> = registry.names().collect();
        assert_eq!(
            names,
            vec![
                "loki.echo",
                "loki.source.aws_firehose",
                "otelcol.exporter.debug",
                "otelcol.receiver.loki",
                "profile.sampler",
            ]
        );
    }
}
