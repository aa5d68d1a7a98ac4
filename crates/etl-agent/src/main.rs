//! Metrics ETL Agent
//!
//! Runs configured extract, transform and load cycles on a schedule and
//! alerts on the pipeline's own health.

mod config;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use config::AppConfig;
use etl_lib::client::HttpClient;
use etl_lib::cluster::ClusterCoordinator;
use etl_lib::connector::{load_connector_sources, ConnectorRegistry};
use etl_lib::metering::{LogStatusConsumer, SystemStatus};
use etl_lib::pipeline::{
    load_configurations, Configuration, DirectorySource, HttpClientFactory, Pipeline,
    PipelineOptions, Scheduler, SchedulerConfig,
};
use etl_lib::observability::export_metrics;
use etl_lib::{ShutdownSequence, StructuredLogger};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Scheduled metrics ETL with threshold alerting
#[derive(Parser)]
#[command(name = "metrics-etl")]
#[command(author, version, about = "Scheduled metrics ETL with threshold alerting", long_about = None)]
struct Cli {
    /// Application configuration file (TOML, JSON or YAML)
    #[arg(long, short, env = "ETL_CONFIG")]
    config: Option<PathBuf>,

    /// Run every enabled configuration once and exit
    #[arg(long)]
    once: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Clone, Copy, Default)]
enum Command {
    /// Run the scheduler (default)
    #[default]
    Run,
    /// Load connectors and configurations, report problems and exit
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;

    match cli.command.unwrap_or_default() {
        Command::Run => run(config, cli.once).await,
        Command::Validate => validate(&config),
    }
}

/// Connector ids referenced by a configuration that the registry lacks
fn unknown_endpoints(configuration: &Configuration, registry: &ConnectorRegistry) -> Vec<String> {
    let extract = configuration.extract.iter().filter_map(|e| e.endpoint());
    let load = configuration.load.iter().filter_map(|l| l.endpoint());
    let mut unknown: Vec<String> = extract
        .chain(load)
        .filter(|id| registry.find_connector(id).is_none())
        .map(str::to_string)
        .collect();
    unknown.sort();
    unknown.dedup();
    unknown
}

fn load_registry(config: &AppConfig) -> Result<Arc<ConnectorRegistry>> {
    let sources = load_connector_sources(&config.global.connectors_path)?;
    let registry = ConnectorRegistry::new(sources).context("Invalid connectors")?;
    Ok(Arc::new(registry))
}

fn validate(config: &AppConfig) -> Result<()> {
    let registry = load_registry(config)?;
    let configurations = load_configurations(&config.global.configurations_path)?;

    println!("Connectors: {}", registry.len());
    let mut problems = 0;
    for configuration in &configurations {
        let unknown = unknown_endpoints(configuration, &registry);
        let state = if configuration.disabled { "disabled" } else { "enabled" };
        if unknown.is_empty() {
            println!("  ok    {} ({state})", configuration.name);
        } else {
            problems += 1;
            println!(
                "  error {} ({state}): unknown endpoints {}",
                configuration.name,
                unknown.join(", ")
            );
        }
    }
    println!("Configurations: {}", configurations.len());

    if problems > 0 {
        bail!("{problems} configuration(s) reference unknown endpoints");
    }
    Ok(())
}

async fn run(config: AppConfig, once: bool) -> Result<()> {
    let member_name = config.member_name();
    let logger = StructuredLogger::new(member_name.clone());

    let registry = load_registry(&config)?;
    let configurations = load_configurations(&config.global.configurations_path)?;
    for configuration in &configurations {
        let unknown = unknown_endpoints(configuration, &registry);
        if !unknown.is_empty() {
            warn!(
                configuration = %configuration.name,
                endpoints = ?unknown,
                "Configuration references unknown endpoints"
            );
        }
    }
    logger.log_startup(VERSION, configurations.len(), registry.len());

    let shutdown = ShutdownSequence::new();

    let http = Arc::new(HttpClientFactory::new(
        Arc::clone(&registry),
        Arc::new(HttpClient::from_connector),
    ));

    let status = Arc::new(SystemStatus::new(config.alert.clone()));
    status.add_consumer(Arc::new(LogStatusConsumer));

    // Configuration validation rejects cluster.enabled
    let coordinator = Arc::new(ClusterCoordinator::standalone(&member_name));
    coordinator.initialize(&shutdown)?;
    logger.log_mastership(coordinator.is_master());

    let pipeline = Arc::new(Pipeline::new(
        http,
        Arc::clone(&status),
        shutdown.clone(),
        PipelineOptions {
            io_pool_size: config.global.io_pools_thread_size,
            bulk_flush_interval: config.global.bulk_flush_interval(),
            member_name: member_name.clone(),
        },
    ));

    let scheduler = Scheduler::new(
        pipeline,
        Arc::new(DirectorySource::new(config.global.configurations_path.clone())),
        Arc::clone(&coordinator),
        SchedulerConfig {
            update_interval: config.global.update_interval(),
            run_once: once,
        },
    );

    if config.alert.enabled {
        let status = Arc::clone(&status);
        let receiver = shutdown.subscribe();
        tokio::spawn(async move { status.run(receiver).await });
    }

    let exporter = config.global.metrics_file.clone().map(|path| {
        let receiver = shutdown.subscribe();
        tokio::spawn(export_metrics(path, config.global.metrics_interval(), receiver))
    });

    let mut scheduler_task = tokio::spawn(scheduler.run());

    let result = tokio::select! {
        finished = &mut scheduler_task => {
            if once && config.alert.enabled {
                // Report on the single pass before exiting
                status.run_check().await;
            }
            let reason = if once { "run completed" } else { "scheduler stopped" };
            logger.log_shutdown(reason);
            shutdown.trigger(reason).await;
            finished
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            info!("Received shutdown signal");
            logger.log_shutdown("SIGINT received");
            shutdown.trigger("SIGINT received").await;
            scheduler_task.await
        }
    };

    if let Some(exporter) = exporter {
        if let Err(e) = exporter.await {
            warn!(error = %e, "Metrics export task panicked");
        }
    }

    match result.context("Scheduler task panicked")? {
        Ok(()) => Ok(()),
        Err(e) => {
            error!(error = %e, "Scheduler stopped with an error");
            Err(e.into())
        }
    }
}
