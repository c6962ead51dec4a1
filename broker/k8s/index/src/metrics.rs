use crate::SharedClusters;
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeMetric},
    metrics::{gauge::ConstGauge, MetricType},
    registry::Registry,
};

#[derive(Debug)]
struct Instrumented(SharedClusters);

pub fn register(prom: &mut Registry, clusters: SharedClusters) {
    prom.register_collector(Box::new(Instrumented(clusters)));
}

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let (total, connected) = {
            let clusters = self.0.read();
            let connected = clusters.values().filter(|c| c.is_connected()).count();
            (clusters.len(), connected)
        };

        let clusters = ConstGauge::new(total as i64);
        let clusters_encoder = encoder.encode_descriptor(
            "registry_clusters",
            "The number of managed clusters in the registry",
            None,
            MetricType::Gauge,
        )?;
        clusters.encode(clusters_encoder)?;

        let connected = ConstGauge::new(connected as i64);
        let connected_encoder = encoder.encode_descriptor(
            "registry_connected_clusters",
            "The number of managed clusters with an established tunnel",
            None,
            MetricType::Gauge,
        )?;
        connected.encode(connected_encoder)?;

        Ok(())
    }
}
