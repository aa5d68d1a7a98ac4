//! Self-metering of the pipeline
//!
//! Producers record outcomes against a process name (for example
//! `extract.prom-1`) without blocking. A periodic check swaps every counter
//! back to zero, compares the counts of the last interval with the configured
//! thresholds and publishes the resulting [`StatusMessage`]s to every
//! registered [`StatusConsumer`].

mod consumer;

pub use consumer::{LogStatusConsumer, StatusConsumer};

use crate::observability::EtlMetrics;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::interval;
use tracing::{info, warn};

const DEFAULT_CHECK_INTERVAL_MS: u64 = 60_000;

/// Outcome recorded for one extract or load attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProcessStatus {
    Succeeded,
    Failed,
    NoData,
    AuthenticationFailure,
}

impl ProcessStatus {
    /// Key segment used in threshold lookups and metric labels
    pub fn key(&self) -> &'static str {
        match self {
            ProcessStatus::Succeeded => "succeeded",
            ProcessStatus::Failed => "failed",
            ProcessStatus::NoData => "noData",
            ProcessStatus::AuthenticationFailure => "authenticationFailure",
        }
    }
}

/// Direction in which a count becomes alarming
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertComparison {
    /// Alarming when the count reaches the threshold from below
    GreaterThan,
    /// Alarming when the count drops to the threshold or under
    LessThan,
}

impl AlertComparison {
    pub fn triggers(&self, value: f64, threshold: f64) -> bool {
        match self {
            AlertComparison::GreaterThan => value >= threshold,
            AlertComparison::LessThan => value <= threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeterType {
    pub alert_comparison: AlertComparison,
    pub process_status: ProcessStatus,
}

impl MeterType {
    /// Too few successes is alarming, too many of anything else is
    pub fn for_status(process_status: ProcessStatus) -> Self {
        let alert_comparison = match process_status {
            ProcessStatus::Succeeded => AlertComparison::LessThan,
            _ => AlertComparison::GreaterThan,
        };
        Self {
            alert_comparison,
            process_status,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StatusLevel {
    Ok,
    Warn,
    Crit,
}

impl StatusLevel {
    pub fn key(&self) -> &'static str {
        match self {
            StatusLevel::Ok => "ok",
            StatusLevel::Warn => "warn",
            StatusLevel::Crit => "crit",
        }
    }
}

impl std::fmt::Display for StatusLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusLevel::Ok => write!(f, "OK"),
            StatusLevel::Warn => write!(f, "WARN"),
            StatusLevel::Crit => write!(f, "CRIT"),
        }
    }
}

/// One line of the self-status report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusMessage {
    pub level: StatusLevel,
    pub text: String,
    /// `<process>.<status>`, empty for the synthetic all-clear message
    pub meter: String,
    pub value: f64,
}

impl StatusMessage {
    fn all_clear() -> Self {
        Self {
            level: StatusLevel::Ok,
            text: "OK: all pipeline meters within thresholds".to_string(),
            meter: String::new(),
            value: 0.0,
        }
    }
}

/// Alerting section of the application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_check_interval", alias = "check_interval_millis")]
    pub check_interval_millis: u64,
    /// `<process>.<status>.<level>` or `*.<status>.<level>` to a count,
    /// matched case-insensitively
    #[serde(default)]
    pub thresholds: HashMap<String, f64>,
}

fn default_check_interval() -> u64 {
    DEFAULT_CHECK_INTERVAL_MS
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            check_interval_millis: DEFAULT_CHECK_INTERVAL_MS,
            thresholds: HashMap::new(),
        }
    }
}

impl AlertConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_millis)
    }

    /// Copy with every threshold key lowercased
    ///
    /// Environment overrides arrive lowercased, so keys are compared
    /// in that form.
    pub fn normalized(mut self) -> Self {
        self.thresholds = self
            .thresholds
            .into_iter()
            .map(|(key, value)| (key.to_lowercase(), value))
            .collect();
        self
    }

    /// Threshold for a process, falling back to the wildcard entry
    pub fn threshold(&self, process: &str, status: ProcessStatus, level: StatusLevel) -> Option<f64> {
        let suffix = format!("{}.{}", status.key(), level.key()).to_lowercase();
        let find = |key: String| {
            self.thresholds
                .get(&key)
                .or_else(|| self.thresholds.get(&key.to_lowercase()))
                .copied()
        };
        find(format!("{process}.{suffix}")).or_else(|| find(format!("*.{suffix}")))
    }
}

/// Resettable counter for one (process, status) pair
struct Meter {
    process: String,
    meter_type: MeterType,
    count: AtomicU64,
}

/// Latency samples collected since the last check
#[derive(Default)]
struct Timer {
    samples_ms: Mutex<Vec<f64>>,
}

/// 95th percentile by nearest rank
fn p95(samples: &mut [f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    samples.sort_by(|a, b| a.total_cmp(b));
    let rank = ((samples.len() as f64) * 0.95).ceil() as usize;
    Some(samples[rank.clamp(1, samples.len()) - 1])
}

/// Pipeline health counters, timers and status publishing
pub struct SystemStatus {
    config: AlertConfig,
    meters: DashMap<(String, ProcessStatus), Arc<Meter>>,
    timers: DashMap<String, Arc<Timer>>,
    consumers: RwLock<Vec<Arc<dyn StatusConsumer>>>,
    metrics: EtlMetrics,
}

impl SystemStatus {
    pub fn new(config: AlertConfig) -> Self {
        Self {
            config: config.normalized(),
            meters: DashMap::new(),
            timers: DashMap::new(),
            consumers: RwLock::new(Vec::new()),
            metrics: EtlMetrics::new(),
        }
    }

    pub fn config(&self) -> &AlertConfig {
        &self.config
    }

    pub fn add_consumer(&self, consumer: Arc<dyn StatusConsumer>) {
        let mut consumers = self.consumers.write().unwrap_or_else(|e| e.into_inner());
        consumers.push(consumer);
    }

    pub fn succeeded(&self, process: &str) {
        self.record(process, ProcessStatus::Succeeded);
    }

    pub fn failed(&self, process: &str) {
        self.record(process, ProcessStatus::Failed);
    }

    pub fn no_data(&self, process: &str) {
        self.record(process, ProcessStatus::NoData);
    }

    pub fn authentication_failure(&self, process: &str) {
        self.record(process, ProcessStatus::AuthenticationFailure);
    }

    pub fn record(&self, process: &str, status: ProcessStatus) {
        let meter = self
            .meters
            .entry((process.to_string(), status))
            .or_insert_with(|| {
                Arc::new(Meter {
                    process: process.to_string(),
                    meter_type: MeterType::for_status(status),
                    count: AtomicU64::new(0),
                })
            })
            .clone();
        meter.count.fetch_add(1, Ordering::Relaxed);
        self.metrics.inc_process_event(process, status.key());
    }

    /// Record the latency of one call
    pub fn record_latency(&self, process: &str, elapsed: Duration) {
        let timer = self
            .timers
            .entry(process.to_string())
            .or_default()
            .clone();
        timer
            .samples_ms
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(elapsed.as_secs_f64() * 1000.0);
        self.metrics
            .observe_process_latency(process, elapsed.as_secs_f64());
    }

    /// Count recorded since the last check
    pub fn current_count(&self, process: &str, status: ProcessStatus) -> u64 {
        self.meters
            .get(&(process.to_string(), status))
            .map(|m| m.count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Evaluate and reset every meter and timer
    pub fn check(&self) -> Vec<StatusMessage> {
        let meters: Vec<Arc<Meter>> = self.meters.iter().map(|e| Arc::clone(e.value())).collect();
        let mut messages = Vec::new();

        for meter in meters {
            let count = meter.count.swap(0, Ordering::Relaxed) as f64;
            let status = meter.meter_type.process_status;
            let comparison = meter.meter_type.alert_comparison;
            let name = format!("{}.{}", meter.process, status.key());

            let triggered = [StatusLevel::Crit, StatusLevel::Warn]
                .into_iter()
                .find_map(|level| {
                    self.config
                        .threshold(&meter.process, status, level)
                        .filter(|t| comparison.triggers(count, *t))
                        .map(|t| (level, t))
                });

            match triggered {
                Some((level, threshold)) => messages.push(StatusMessage {
                    level,
                    text: format!(
                        "{level}: {name} counted {count} in the last interval (threshold {threshold})"
                    ),
                    meter: name,
                    value: count,
                }),
                None => info!(meter = %name, count = count, "Meter OK"),
            }
        }

        for entry in self.timers.iter() {
            let mut samples = {
                let mut guard = entry.value().samples_ms.lock().unwrap_or_else(|e| e.into_inner());
                std::mem::take(&mut *guard)
            };
            // An idle timer reports zero
            let latency = p95(&mut samples).unwrap_or(0.0);
            info!(
                process = %entry.key(),
                p95_ms = latency,
                samples = samples.len(),
                "Latency over last interval"
            );
            self.metrics
                .set_process_latency_p95(entry.key(), latency / 1000.0);
        }

        if messages.is_empty() {
            messages.push(StatusMessage::all_clear());
        }
        messages.sort_by(|a, b| b.level.cmp(&a.level));
        messages
    }

    /// Deliver messages to every consumer concurrently
    ///
    /// A failing or panicking consumer does not affect the others.
    pub async fn publish(&self, messages: Vec<StatusMessage>) {
        for m in &messages {
            self.metrics.inc_status_message(m.level.key());
        }

        let consumers = self
            .consumers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let messages = Arc::new(messages);

        let mut tasks = JoinSet::new();
        for consumer in consumers {
            let messages = Arc::clone(&messages);
            tasks.spawn(async move {
                let name = consumer.name().to_string();
                if let Err(e) = consumer.accept(&messages).await {
                    warn!(consumer = %name, error = %e, "Status consumer failed");
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Status consumer task aborted");
            }
        }
    }

    /// One metering cycle: check then publish
    pub async fn run_check(&self) -> Vec<StatusMessage> {
        let messages = self.check();
        self.publish(messages.clone()).await;
        messages
    }

    /// Run metering cycles until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let period = self.config.check_interval();
        info!(interval_ms = period.as_millis() as u64, "Starting metering loop");

        let mut ticker = interval(period);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_check().await;
                }
                _ = shutdown.recv() => {
                    info!("Metering loop shutting down");
                    break;
                }
            }
        }
    }
}

impl Default for SystemStatus {
    fn default() -> Self {
        Self::new(AlertConfig::default())
    }
}
