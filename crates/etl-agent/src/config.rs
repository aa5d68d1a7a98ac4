//! Application configuration

use anyhow::{ensure, Context, Result};
use etl_lib::cluster::ClusterConfig;
use etl_lib::metering::AlertConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level application configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub global: GlobalConfig,

    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub alert: AlertConfig,
}

/// Paths and engine tunables
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalConfig {
    /// Configuration documents, a JSON file or a directory of them
    #[serde(default = "default_configurations_path", alias = "configurations_path")]
    pub configurations_path: PathBuf,

    /// Connector documents, a JSON file or a directory of them
    #[serde(default = "default_connectors_path", alias = "connectors_path")]
    pub connectors_path: PathBuf,

    /// Configuration reload cadence in milliseconds
    #[serde(
        default = "default_update_interval",
        alias = "update_configuration_interval_millis"
    )]
    pub update_configuration_interval_millis: u64,

    /// Maximum concurrent endpoint tasks
    #[serde(default = "default_io_pools_thread_size", alias = "io_pools_thread_size")]
    pub io_pools_thread_size: usize,

    /// Background flush cadence of bulk loads in milliseconds
    #[serde(default = "default_bulk_flush_interval", alias = "bulk_flush_interval_millis")]
    pub bulk_flush_interval_millis: u64,

    /// Prometheus text exposition file, rewritten periodically when set
    #[serde(default, alias = "metrics_file")]
    pub metrics_file: Option<PathBuf>,

    #[serde(default = "default_metrics_interval", alias = "metrics_interval_millis")]
    pub metrics_interval_millis: u64,
}

fn default_configurations_path() -> PathBuf {
    PathBuf::from("conf/configurations")
}

fn default_connectors_path() -> PathBuf {
    PathBuf::from("conf/connectors")
}

fn default_update_interval() -> u64 {
    60_000
}

fn default_io_pools_thread_size() -> usize {
    etl_lib::pipeline::DEFAULT_IO_POOL_SIZE
}

fn default_bulk_flush_interval() -> u64 {
    10_000
}

fn default_metrics_interval() -> u64 {
    15_000
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            configurations_path: default_configurations_path(),
            connectors_path: default_connectors_path(),
            update_configuration_interval_millis: default_update_interval(),
            io_pools_thread_size: default_io_pools_thread_size(),
            bulk_flush_interval_millis: default_bulk_flush_interval(),
            metrics_file: None,
            metrics_interval_millis: default_metrics_interval(),
        }
    }
}

impl GlobalConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_configuration_interval_millis)
    }

    pub fn bulk_flush_interval(&self) -> Duration {
        Duration::from_millis(self.bulk_flush_interval_millis)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_millis)
    }
}

impl AppConfig {
    /// Load configuration from an optional file and `ETL__` environment overrides
    ///
    /// `ETL__GLOBAL__IO_POOLS_THREAD_SIZE=4` overrides `global.ioPoolsThreadSize`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("ETL")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read application configuration")?;

        let app: AppConfig = config
            .try_deserialize()
            .context("Invalid application configuration")?;
        app.validate()?;
        Ok(app)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.global.io_pools_thread_size > 0,
            "global.ioPoolsThreadSize must be positive"
        );
        ensure!(
            self.global.update_configuration_interval_millis > 0,
            "global.updateConfigurationIntervalMillis must be positive"
        );
        ensure!(
            !self.alert.enabled || self.alert.check_interval_millis > 0,
            "alert.checkIntervalMillis must be positive when alerting is enabled"
        );
        ensure!(
            self.global.metrics_file.is_none() || self.global.metrics_interval_millis > 0,
            "global.metricsIntervalMillis must be positive when metricsFile is set"
        );
        // Each process would hold its own single-member hub and elect itself master
        ensure!(
            !self.cluster.enabled,
            "cluster.enabled is not supported: the bundled cluster backend is in-process \
             and cannot coordinate separate metrics-etl processes"
        );
        Ok(())
    }

    /// Configured member name, or one derived from the process id
    pub fn member_name(&self) -> String {
        self.cluster
            .config
            .member_name
            .clone()
            .unwrap_or_else(|| format!("metrics-etl-{}", std::process::id()))
    }
}
