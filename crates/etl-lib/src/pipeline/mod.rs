//! Extract, transform and load cycles
//!
//! A [`Pipeline`] owns the shared machinery every configuration uses: the
//! HTTP client factory, metering, the I/O permit pool and the bulk load
//! batchers. The [`Scheduler`] drives one cycle per configuration and
//! interval.

mod config;
mod extract;
mod load;
mod scheduler;
mod tasks;

#[cfg(test)]
mod tests;

pub use config::{
    load_configurations, parse_configuration, Configuration, ExtractSpec, HttpBulkLoad,
    HttpJsonExtract, HttpWebhookLoad, LoadSpec, LogLevel, LogLoad, StaticExtract,
};
pub use extract::ExtractOutcome;
pub use load::LoadOutcome;
pub use scheduler::{ConfigurationSource, DirectorySource, Scheduler, SchedulerConfig};

use crate::batcher::LoadBatcher;
use crate::client::{ClientFactory, HttpClient};
use crate::error::BootstrapError;
use crate::metering::SystemStatus;
use crate::models::{Cacheable, Matrix, TransformationResult};
use crate::observability::{EtlMetrics, StructuredLogger};
use crate::shutdown::ShutdownSequence;
use crate::transform::{apply_chain, worst_severity};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::debug;

/// Default number of concurrent endpoint tasks
pub const DEFAULT_IO_POOL_SIZE: usize = 16;

/// A decoded extract response kept in the endpoint cache
#[derive(Debug, Clone)]
pub struct CachedResponse {
    key: String,
    pub matrix: Matrix,
}

impl CachedResponse {
    pub fn new(key: impl Into<String>, matrix: Matrix) -> Self {
        Self {
            key: key.into(),
            matrix,
        }
    }
}

impl Cacheable for CachedResponse {
    fn cache_key(&self) -> String {
        self.key.clone()
    }
}

/// Factory for the generic HTTP backend
pub type HttpClientFactory = ClientFactory<HttpClient, CachedResponse>;

/// Where a configuration is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Due,
    Extracting,
    Transforming,
    Loading,
}

/// Current [`CycleState`] of every scheduled configuration
#[derive(Debug, Default)]
pub struct CycleStates {
    states: DashMap<String, CycleState>,
}

impl CycleStates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, configuration: &str, state: CycleState) {
        self.states.insert(configuration.to_string(), state);
    }

    pub fn get(&self, configuration: &str) -> Option<CycleState> {
        self.states.get(configuration).map(|s| *s)
    }

    pub fn remove(&self, configuration: &str) {
        self.states.remove(configuration);
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// Result of one configuration's cycle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleOutcome {
    /// Every endpoint touched by the cycle succeeded
    pub success: bool,
    pub points_extracted: usize,
    pub points_loaded: usize,
    pub failed_endpoints: Vec<String>,
    /// Matrix handed to the loads
    pub matrix: Matrix,
}

/// Tunables for a [`Pipeline`]
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Maximum concurrent endpoint tasks across all configurations
    pub io_pool_size: usize,
    /// Background flush cadence of bulk load batchers
    pub bulk_flush_interval: Duration,
    /// Member name used in structured events
    pub member_name: String,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            io_pool_size: DEFAULT_IO_POOL_SIZE,
            bulk_flush_interval: Duration::from_secs(10),
            member_name: "metrics-etl".to_string(),
        }
    }
}

/// Shared machinery for running cycles
pub struct Pipeline {
    http: Arc<HttpClientFactory>,
    status: Arc<SystemStatus>,
    shutdown: ShutdownSequence,
    io_permits: Arc<Semaphore>,
    batchers: DashMap<String, Arc<LoadBatcher<TransformationResult>>>,
    bulk_flush_interval: Duration,
    logger: StructuredLogger,
    metrics: EtlMetrics,
}

impl Pipeline {
    pub fn new(
        http: Arc<HttpClientFactory>,
        status: Arc<SystemStatus>,
        shutdown: ShutdownSequence,
        options: PipelineOptions,
    ) -> Self {
        Self {
            http,
            status,
            shutdown,
            io_permits: Arc::new(Semaphore::new(options.io_pool_size.max(1))),
            batchers: DashMap::new(),
            bulk_flush_interval: options.bulk_flush_interval,
            logger: StructuredLogger::new(options.member_name),
            metrics: EtlMetrics::new(),
        }
    }

    pub fn status(&self) -> &Arc<SystemStatus> {
        &self.status
    }

    pub fn logger(&self) -> &StructuredLogger {
        &self.logger
    }

    pub fn shutdown(&self) -> &ShutdownSequence {
        &self.shutdown
    }

    /// Run extract, transform and load once for `configuration`
    ///
    /// Only bootstrap failures are returned as errors; everything else is
    /// metered and reflected in [`CycleOutcome::success`].
    pub async fn run_cycle(
        self: &Arc<Self>,
        configuration: &Configuration,
        states: &CycleStates,
    ) -> Result<CycleOutcome, BootstrapError> {
        let name = configuration.name.as_str();
        let start = Instant::now();

        states.set(name, CycleState::Extracting);
        let extracted = match self.extract(configuration).await {
            Ok(extracted) => extracted,
            Err(e) => {
                states.set(name, CycleState::Idle);
                return Err(e);
            }
        };
        let points_extracted = extracted.points();

        states.set(name, CycleState::Transforming);
        let matrix = apply_chain(&configuration.transform, extracted.matrix);
        debug!(
            configuration = %name,
            series = matrix.len(),
            worst = %worst_severity(&matrix),
            "Transforms applied"
        );

        states.set(name, CycleState::Loading);
        let matrix = Arc::new(matrix);
        let loaded = match self.load(configuration, Arc::clone(&matrix)).await {
            Ok(loaded) => loaded,
            Err(e) => {
                states.set(name, CycleState::Idle);
                return Err(e);
            }
        };
        states.set(name, CycleState::Idle);

        let mut failed_endpoints = extracted.failed_endpoints;
        failed_endpoints.extend(loaded.failed_endpoints);
        let success = failed_endpoints.is_empty();
        let elapsed = start.elapsed();

        self.metrics.inc_cycle(name, success);
        self.metrics
            .observe_cycle_duration(name, elapsed.as_secs_f64());
        self.logger.log_cycle(
            name,
            success,
            points_extracted,
            loaded.points_loaded,
            elapsed.as_millis() as u64,
        );

        Ok(CycleOutcome {
            success,
            points_extracted,
            points_loaded: loaded.points_loaded,
            failed_endpoints,
            matrix: Arc::try_unwrap(matrix).unwrap_or_else(|shared| (*shared).clone()),
        })
    }
}
