//! Observability infrastructure for the ETL engine
//!
//! Provides:
//! - Prometheus metrics mirroring the metering counters and timers
//! - Text exposition of those metrics to a file for node-exporter style scraping
//! - Structured JSON logging of pipeline events with tracing

use anyhow::{Context, Result};
use prometheus::{
    register_gauge_vec, register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge_vec, Encoder, GaugeVec, HistogramVec, IntCounter, IntCounterVec,
    IntGaugeVec, TextEncoder,
};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Histogram buckets for backend call latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

static GLOBAL_METRICS: OnceLock<EtlMetricsInner> = OnceLock::new();

struct EtlMetricsInner {
    process_events_total: IntCounterVec,
    process_latency_seconds: HistogramVec,
    process_latency_p95_seconds: GaugeVec,
    cycles_total: IntCounterVec,
    cycle_duration_seconds: HistogramVec,
    batcher_queued_items: IntGaugeVec,
    status_messages_total: IntCounterVec,
    clients_constructed_total: IntCounter,
}

impl EtlMetricsInner {
    fn new() -> Self {
        Self {
            process_events_total: register_int_counter_vec!(
                "metrics_etl_process_events_total",
                "Metered process outcomes",
                &["process", "status"]
            )
            .expect("Failed to register process_events_total"),

            process_latency_seconds: register_histogram_vec!(
                "metrics_etl_process_latency_seconds",
                "Latency of extract and load calls",
                &["process"],
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register process_latency_seconds"),

            process_latency_p95_seconds: register_gauge_vec!(
                "metrics_etl_process_latency_p95_seconds",
                "95th percentile latency over the last metering cycle",
                &["process"]
            )
            .expect("Failed to register process_latency_p95_seconds"),

            cycles_total: register_int_counter_vec!(
                "metrics_etl_cycles_total",
                "Completed pipeline cycles",
                &["configuration", "outcome"]
            )
            .expect("Failed to register cycles_total"),

            cycle_duration_seconds: register_histogram_vec!(
                "metrics_etl_cycle_duration_seconds",
                "Wall time of a full extract, transform and load cycle",
                &["configuration"],
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register cycle_duration_seconds"),

            batcher_queued_items: register_int_gauge_vec!(
                "metrics_etl_batcher_queued_items",
                "Items waiting in a load batcher",
                &["batcher"]
            )
            .expect("Failed to register batcher_queued_items"),

            status_messages_total: register_int_counter_vec!(
                "metrics_etl_status_messages_total",
                "Status messages published to consumers",
                &["level"]
            )
            .expect("Failed to register status_messages_total"),

            clients_constructed_total: register_int_counter!(
                "metrics_etl_clients_constructed_total",
                "Backend clients constructed by the client factories"
            )
            .expect("Failed to register clients_constructed_total"),
        }
    }
}

/// Handle to the process-wide Prometheus metrics
///
/// Clones share the same registered collectors.
#[derive(Clone)]
pub struct EtlMetrics {
    _private: (),
}

impl Default for EtlMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl EtlMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(EtlMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &EtlMetricsInner {
        GLOBAL_METRICS.get_or_init(EtlMetricsInner::new)
    }

    pub fn inc_process_event(&self, process: &str, status: &str) {
        self.inner()
            .process_events_total
            .with_label_values(&[process, status])
            .inc();
    }

    pub fn observe_process_latency(&self, process: &str, duration_secs: f64) {
        self.inner()
            .process_latency_seconds
            .with_label_values(&[process])
            .observe(duration_secs);
    }

    pub fn set_process_latency_p95(&self, process: &str, secs: f64) {
        self.inner()
            .process_latency_p95_seconds
            .with_label_values(&[process])
            .set(secs);
    }

    pub fn inc_cycle(&self, configuration: &str, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.inner()
            .cycles_total
            .with_label_values(&[configuration, outcome])
            .inc();
    }

    pub fn observe_cycle_duration(&self, configuration: &str, duration_secs: f64) {
        self.inner()
            .cycle_duration_seconds
            .with_label_values(&[configuration])
            .observe(duration_secs);
    }

    pub fn set_batcher_queued(&self, batcher: &str, items: i64) {
        self.inner()
            .batcher_queued_items
            .with_label_values(&[batcher])
            .set(items);
    }

    pub fn inc_status_message(&self, level: &str) {
        self.inner()
            .status_messages_total
            .with_label_values(&[level])
            .inc();
    }

    pub fn inc_clients_constructed(&self) {
        self.inner().clients_constructed_total.inc();
    }
}

/// Render every registered collector in the Prometheus text format
pub fn encode_metrics() -> Result<String> {
    EtlMetrics::new();
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    encoder
        .encode(&metric_families, &mut buffer)
        .context("Failed to encode metrics")?;
    String::from_utf8(buffer).context("Metrics exposition is not UTF-8")
}

/// Write the current exposition to `path`
///
/// The file is replaced through a rename so scrapers never see a partial write.
pub async fn write_metrics_file(path: &Path) -> Result<()> {
    let body = encode_metrics()?;
    let mut staging = path.as_os_str().to_owned();
    staging.push(".tmp");
    let staging = PathBuf::from(staging);

    tokio::fs::write(&staging, body)
        .await
        .with_context(|| format!("Failed to write {}", staging.display()))?;
    tokio::fs::rename(&staging, path)
        .await
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

/// Rewrite the metrics file every `period` until shutdown, then once more
pub async fn export_metrics(
    path: PathBuf,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    info!(
        path = %path.display(),
        interval_ms = period.as_millis() as u64,
        "Starting metrics export"
    );

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match write_metrics_file(&path).await {
                    Ok(()) => debug!(path = %path.display(), "Metrics exported"),
                    Err(e) => warn!(path = %path.display(), error = %format!("{e:#}"), "Metrics export failed"),
                }
            }
            _ = shutdown.recv() => {
                if let Err(e) = write_metrics_file(&path).await {
                    warn!(path = %path.display(), error = %format!("{e:#}"), "Final metrics export failed");
                }
                info!("Metrics export shutting down");
                break;
            }
        }
    }
}

/// Structured logger for engine lifecycle and cycle events
#[derive(Clone)]
pub struct StructuredLogger {
    member: String,
}

impl StructuredLogger {
    pub fn new(member: impl Into<String>) -> Self {
        Self {
            member: member.into(),
        }
    }

    pub fn log_startup(&self, version: &str, configurations: usize, connectors: usize) {
        info!(
            event = "etl_started",
            member = %self.member,
            version = %version,
            configurations = configurations,
            connectors = connectors,
            "Metrics ETL engine started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "etl_shutdown",
            member = %self.member,
            reason = %reason,
            "Metrics ETL engine shutting down"
        );
    }

    /// Log the end of one configuration's cycle
    pub fn log_cycle(
        &self,
        configuration: &str,
        success: bool,
        points_extracted: usize,
        points_loaded: usize,
        duration_ms: u64,
    ) {
        if success {
            info!(
                event = "cycle_completed",
                member = %self.member,
                configuration = %configuration,
                points_extracted = points_extracted,
                points_loaded = points_loaded,
                duration_ms = duration_ms,
                "Pipeline cycle completed"
            );
        } else {
            warn!(
                event = "cycle_completed",
                member = %self.member,
                configuration = %configuration,
                points_extracted = points_extracted,
                points_loaded = points_loaded,
                duration_ms = duration_ms,
                "Pipeline cycle completed with failures"
            );
        }
    }

    pub fn log_reload(&self, previous: usize, current: usize, changed: bool) {
        info!(
            event = "configurations_reloaded",
            member = %self.member,
            previous = previous,
            current = current,
            changed = changed,
            "Configurations reloaded"
        );
    }

    pub fn log_mastership(&self, is_master: bool) {
        info!(
            event = "mastership",
            member = %self.member,
            is_master = is_master,
            "Cluster mastership evaluated"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_handles_share_registry() {
        let a = EtlMetrics::new();
        let b = EtlMetrics::new();

        a.inc_process_event("extract.prom", "failed");
        b.inc_process_event("extract.prom", "failed");
        a.observe_process_latency("extract.prom", 0.2);
        b.set_batcher_queued("bulk", 3);
        a.inc_cycle("cpu", true);
        b.inc_clients_constructed();
    }

    #[test]
    fn test_encode_metrics_includes_recorded_values() {
        let metrics = EtlMetrics::new();
        metrics.inc_cycle("encode-check", false);
        metrics.set_process_latency_p95("extract.encode-check", 0.25);

        let text = encode_metrics().unwrap();
        assert!(text.contains("# TYPE metrics_etl_cycles_total counter"));
        assert!(text.contains(
            r#"metrics_etl_cycles_total{configuration="encode-check",outcome="failure"}"#
        ));
        assert!(text.contains(
            r#"metrics_etl_process_latency_p95_seconds{process="extract.encode-check"} 0.25"#
        ));
    }

    #[tokio::test]
    async fn test_write_metrics_file_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("etl.prom");
        std::fs::write(&path, "stale").unwrap();

        EtlMetrics::new().inc_cycle("file-check", true);
        write_metrics_file(&path).await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(!text.contains("stale"));
        assert!(text.contains(r#"configuration="file-check""#));
        assert!(!dir.path().join("etl.prom.tmp").exists());
    }

    #[tokio::test]
    async fn test_export_metrics_writes_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.prom");
        let (tx, rx) = broadcast::channel(1);

        let task = tokio::spawn(export_metrics(path.clone(), Duration::from_secs(3600), rx));
        EtlMetrics::new().inc_cycle("shutdown-check", true);
        tx.send(()).unwrap();
        task.await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains(r#"configuration="shutdown-check""#));
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("member-1");
        assert_eq!(logger.member, "member-1");
    }
}
