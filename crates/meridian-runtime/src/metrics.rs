//! Prometheus metrics for the Meridian pipeline

use prometheus::{CounterVec, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Metrics collection for the Meridian engine
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    pub events_total: CounterVec,
    pub transitions_total: CounterVec,
    pub errors_total: CounterVec,
    pub late_events_total: CounterVec,
    pub spatial_query_latency: HistogramVec,
    pub partition_queue_size: GaugeVec,
    pub active_geofences: Gauge,
    pub tracked_pairs: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let events_total = CounterVec::new(
            Opts::new("meridian_events_total", "Total events ingested"),
            &["source"],
        )
        .expect("failed to create events_total counter");

        let transitions_total = CounterVec::new(
            Opts::new("meridian_transitions_total", "Geofence transitions emitted"),
            &["transition"],
        )
        .expect("failed to create transitions_total counter");

        let errors_total = CounterVec::new(
            Opts::new("meridian_errors_total", "Errors by kind"),
            &["kind"],
        )
        .expect("failed to create errors_total counter");

        let late_events_total = CounterVec::new(
            Opts::new("meridian_late_events_total", "Late events dropped"),
            &["stage"],
        )
        .expect("failed to create late_events_total counter");

        let spatial_query_latency = HistogramVec::new(
            HistogramOpts::new(
                "meridian_spatial_query_latency_seconds",
                "Spatial index query latency",
            )
            .buckets(vec![
                0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05,
            ]),
            &["query"],
        )
        .expect("failed to create spatial_query_latency histogram");

        let partition_queue_size = GaugeVec::new(
            Opts::new("meridian_partition_queue_size", "Partition queue depth"),
            &["partition"],
        )
        .expect("failed to create partition_queue_size gauge");

        let active_geofences = Gauge::new("meridian_active_geofences", "Geofences in the live index")
            .expect("failed to create active_geofences gauge");

        let tracked_pairs = Gauge::new(
            "meridian_tracked_pairs",
            "Live entity-geofence pair records",
        )
        .expect("failed to create tracked_pairs gauge");

        registry
            .register(Box::new(events_total.clone()))
            .expect("failed to register events_total");
        registry
            .register(Box::new(transitions_total.clone()))
            .expect("failed to register transitions_total");
        registry
            .register(Box::new(errors_total.clone()))
            .expect("failed to register errors_total");
        registry
            .register(Box::new(late_events_total.clone()))
            .expect("failed to register late_events_total");
        registry
            .register(Box::new(spatial_query_latency.clone()))
            .expect("failed to register spatial_query_latency");
        registry
            .register(Box::new(partition_queue_size.clone()))
            .expect("failed to register partition_queue_size");
        registry
            .register(Box::new(active_geofences.clone()))
            .expect("failed to register active_geofences");
        registry
            .register(Box::new(tracked_pairs.clone()))
            .expect("failed to register tracked_pairs");

        Self {
            registry: Arc::new(registry),
            events_total,
            transitions_total,
            errors_total,
            late_events_total,
            spatial_query_latency,
            partition_queue_size,
            active_geofences,
            tracked_pairs,
        }
    }

    /// Record an ingested event
    pub fn record_event(&self, source: &str) {
        self.events_total.with_label_values(&[source]).inc();
    }

    /// Record an emitted transition
    pub fn record_transition(&self, transition: &str) {
        self.transitions_total
            .with_label_values(&[transition])
            .inc();
    }

    /// Record an error by taxonomy kind
    pub fn record_error(&self, kind: &str) {
        self.errors_total.with_label_values(&[kind]).inc();
    }

    /// Record a late event dropped at a pipeline stage
    pub fn record_late(&self, stage: &str) {
        self.late_events_total.with_label_values(&[stage]).inc();
    }

    /// Record a spatial query latency
    pub fn record_spatial_query(&self, query: &str, latency_secs: f64) {
        self.spatial_query_latency
            .with_label_values(&[query])
            .observe(latency_secs);
    }

    /// Get Prometheus text output
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// HTTP server for the Prometheus metrics endpoint
pub struct MetricsServer {
    metrics: Metrics,
    addr: String,
}

impl MetricsServer {
    pub fn new(metrics: Metrics, addr: impl Into<String>) -> Self {
        Self {
            metrics,
            addr: addr.into(),
        }
    }

    /// Run the metrics HTTP server
    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.addr).await?;
        info!("Metrics server listening on http://{}/metrics", self.addr);

        loop {
            let (mut socket, _addr) = listener.accept().await?;

            let metrics_output = self.metrics.gather();
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
                metrics_output.len(),
                metrics_output
            );

            if let Err(e) = socket.write_all(response.as_bytes()).await {
                error!("Failed to write response: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_counters() {
        let metrics = Metrics::new();
        metrics.record_event("fleet-mqtt");
        metrics.record_transition("Enter");
        metrics.record_error("node_execution");
        metrics.record_late("window");
        metrics.active_geofences.set(42.0);

        let output = metrics.gather();
        assert!(output.contains("meridian_events_total"));
        assert!(output.contains("meridian_transitions_total"));
        assert!(output.contains("meridian_errors_total"));
        assert!(output.contains("meridian_late_events_total"));
        assert!(output.contains("meridian_active_geofences"));
    }

    #[test]
    fn test_metrics_query_histogram() {
        let metrics = Metrics::new();
        metrics.record_spatial_query("contains", 0.0002);
        metrics.record_spatial_query("nearby", 0.001);
        let output = metrics.gather();
        assert!(output.contains("meridian_spatial_query_latency_seconds_bucket"));
    }

    #[test]
    fn test_metrics_clone_shares_registry() {
        let m1 = Metrics::new();
        m1.record_event("a");
        let m2 = m1.clone();
        m2.record_event("b");

        let output = m2.gather();
        assert!(output.contains("source=\"a\""));
        assert!(output.contains("source=\"b\""));
    }
}
