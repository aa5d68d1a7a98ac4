//! Periodic driver for configuration cycles
//!
//! Each enabled configuration gets its own task ticking every
//! `repeatIntervalMillis`. Only the cluster master runs cycles. The
//! configuration set is reloaded on a fixed cadence and the tasks are
//! replaced wholesale when it changes.

use super::{load_configurations, Configuration, CycleState, CycleStates, Pipeline};
use crate::cluster::ClusterCoordinator;
use crate::error::{BootstrapError, EtlError};
use crate::shutdown::ShutdownSequence;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Time allowed for in-flight cycles to finish after shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Where configurations come from
pub trait ConfigurationSource: Send + Sync {
    fn load(&self) -> anyhow::Result<Vec<Configuration>>;
}

impl<F> ConfigurationSource for F
where
    F: Fn() -> anyhow::Result<Vec<Configuration>> + Send + Sync,
{
    fn load(&self) -> anyhow::Result<Vec<Configuration>> {
        self()
    }
}

/// Configurations read from a JSON file or directory
pub struct DirectorySource {
    path: PathBuf,
}

impl DirectorySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConfigurationSource for DirectorySource {
    fn load(&self) -> anyhow::Result<Vec<Configuration>> {
        load_configurations(&self.path)
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Cadence of configuration reloads
    pub update_interval: Duration,
    /// Run every enabled configuration once and return
    pub run_once: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            update_interval: Duration::from_secs(60),
            run_once: false,
        }
    }
}

/// Everything a per-configuration task needs
#[derive(Clone)]
struct TaskContext {
    pipeline: Arc<Pipeline>,
    coordinator: Arc<ClusterCoordinator>,
    shutdown: ShutdownSequence,
    states: Arc<CycleStates>,
    fatal: mpsc::UnboundedSender<BootstrapError>,
}

impl TaskContext {
    /// One gated cycle; false when a bootstrap failure was raised
    async fn cycle(&self, configuration: &Configuration) -> bool {
        if !self.coordinator.is_master() {
            debug!(configuration = %configuration.name, "Not cluster master, skipping cycle");
            return true;
        }

        self.states.set(&configuration.name, CycleState::Due);
        match self.pipeline.run_cycle(configuration, &self.states).await {
            Ok(_) => true,
            Err(e) => {
                error!(configuration = %configuration.name, error = %e, "Bootstrap failure during cycle");
                let _ = self.fatal.send(e);
                false
            }
        }
    }

    async fn drive(self, configuration: Arc<Configuration>) {
        let name = configuration.name.clone();
        self.states.set(&name, CycleState::Idle);

        if configuration.run_once {
            if !self.shutdown.is_shutting_down() {
                self.cycle(&configuration).await;
            }
            self.states.remove(&name);
            return;
        }

        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = interval(configuration.repeat_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.shutdown.is_shutting_down() || !self.cycle(&configuration).await {
                        break;
                    }
                }
                _ = shutdown.recv() => break,
            }
        }

        self.states.remove(&name);
        debug!(configuration = %name, "Configuration task stopped");
    }
}

/// Top-level driver of all configurations
pub struct Scheduler {
    pipeline: Arc<Pipeline>,
    source: Arc<dyn ConfigurationSource>,
    coordinator: Arc<ClusterCoordinator>,
    shutdown: ShutdownSequence,
    config: SchedulerConfig,
    states: Arc<CycleStates>,
}

impl Scheduler {
    pub fn new(
        pipeline: Arc<Pipeline>,
        source: Arc<dyn ConfigurationSource>,
        coordinator: Arc<ClusterCoordinator>,
        config: SchedulerConfig,
    ) -> Self {
        let shutdown = pipeline.shutdown().clone();
        Self {
            pipeline,
            source,
            coordinator,
            shutdown,
            config,
            states: Arc::new(CycleStates::new()),
        }
    }

    /// Live view of every configuration's cycle state
    pub fn states(&self) -> Arc<CycleStates> {
        Arc::clone(&self.states)
    }

    /// Aborted tasks never reach their own cleanup
    fn clear_states(&self, configurations: &[Configuration]) {
        for configuration in configurations {
            self.states.remove(&configuration.name);
        }
    }

    fn spawn_all(
        &self,
        configurations: &[Configuration],
        fatal: &mpsc::UnboundedSender<BootstrapError>,
    ) -> JoinSet<()> {
        let mut tasks = JoinSet::new();
        for configuration in configurations {
            if configuration.disabled {
                info!(configuration = %configuration.name, "Configuration disabled, skipping");
                continue;
            }
            let context = TaskContext {
                pipeline: Arc::clone(&self.pipeline),
                coordinator: Arc::clone(&self.coordinator),
                shutdown: self.shutdown.clone(),
                states: Arc::clone(&self.states),
                fatal: fatal.clone(),
            };
            tasks.spawn(context.drive(Arc::new(configuration.clone())));
        }
        tasks
    }

    /// Run until shutdown, or once when configured for single-shot operation
    ///
    /// Returns an error when the initial configuration load fails or when a
    /// cycle raises a bootstrap failure.
    pub async fn run(self) -> Result<(), EtlError> {
        let mut configurations = self.source.load().map_err(EtlError::Configuration)?;
        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();

        info!(
            configurations = configurations.len(),
            run_once = self.config.run_once,
            "Scheduler started"
        );

        if self.config.run_once {
            return self.run_once(&configurations).await;
        }

        let mut tasks = self.spawn_all(&configurations, &fatal_tx);
        let mut shutdown = self.shutdown.subscribe();
        let mut reload = interval(self.config.update_interval);
        reload.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        reload.tick().await;

        loop {
            if self.shutdown.is_shutting_down() {
                break;
            }

            tokio::select! {
                _ = reload.tick() => {
                    match self.source.load() {
                        Ok(loaded) if loaded != configurations => {
                            self.pipeline
                                .logger()
                                .log_reload(configurations.len(), loaded.len(), true);
                            tasks.shutdown().await;
                            self.clear_states(&configurations);
                            configurations = loaded;
                            tasks = self.spawn_all(&configurations, &fatal_tx);
                        }
                        Ok(_) => debug!("Configurations unchanged"),
                        Err(e) => warn!(error = %e, "Failed to reload configurations, keeping current set"),
                    }
                }
                Some(e) = fatal_rx.recv() => {
                    tasks.shutdown().await;
                    self.clear_states(&configurations);
                    return Err(e.into());
                }
                _ = shutdown.recv() => break,
            }
        }

        info!(tasks = tasks.len(), "Scheduler stopping, waiting for running cycles");
        let drained = timeout(SHUTDOWN_GRACE, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("Cycles still running after grace period, aborting");
            tasks.shutdown().await;
            self.clear_states(&configurations);
        }
        Ok(())
    }

    async fn run_once(&self, configurations: &[Configuration]) -> Result<(), EtlError> {
        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();

        for configuration in configurations.iter().filter(|c| !c.disabled) {
            let context = TaskContext {
                pipeline: Arc::clone(&self.pipeline),
                coordinator: Arc::clone(&self.coordinator),
                shutdown: self.shutdown.clone(),
                states: Arc::clone(&self.states),
                fatal: fatal_tx.clone(),
            };
            let configuration = Arc::new(Configuration {
                run_once: true,
                ..configuration.clone()
            });
            tasks.spawn(context.drive(configuration));
        }
        drop(fatal_tx);

        while tasks.join_next().await.is_some() {}

        match fatal_rx.recv().await {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}
