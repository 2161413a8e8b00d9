//! CLI command definitions and the serve wiring.

use std::collections::HashMap;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::artifacts::cache::ArtifactCache;
use crate::config::OrchestratorConfig;
use crate::coordinator::Coordinator;
use crate::events::EventBus;
use crate::pools::registry::PoolRegistry;
use crate::repository::{InMemoryExecutionRepository, InMemoryJobRepository};
use crate::scheduler::placement::{
    PlacementScheduler, PlacementStrategy, ResourceMonitor, StaticResourceMonitor,
};
use crate::scheduler::queue::JobQueue;
use crate::session::SessionRegistry;
use crate::workers::docker::DockerInstanceManager;
use crate::workers::factory::{WorkerConfiguration, WorkerFactory};
use crate::workers::instance::InstanceManager;
use crate::workers::local::LocalInstanceManager;

/// Process exit codes of the CLI.
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const GENERIC_FAILURE: i32 = 1;
    pub const INVALID_INPUT: i32 = 2;
    pub const VALIDATION_FAILURE: i32 = 3;
    pub const PROVISIONING_FAILURE: i32 = 4;
    pub const AUTHENTICATION_FAILURE: i32 = 5;
}

/// hodei orchestration engine.
#[derive(Debug, Parser)]
#[command(name = "hodei", version, about = "Distributed job orchestration engine")]
pub struct Cli {
    /// Log level when RUST_LOG is not set.
    #[arg(long, default_value = "info", env = "HODEI_LOG_LEVEL")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the orchestration engine until interrupted.
    Serve,
    /// Print the resolved configuration and exit.
    Config,
}

/// Parses the command line.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Runs the parsed command, returning the process exit code.
pub async fn run_with_cli(cli: Cli) -> i32 {
    match cli.command {
        Command::Serve => serve().await,
        Command::Config => show_config(),
    }
}

fn show_config() -> i32 {
    match OrchestratorConfig::from_env() {
        Ok(config) => {
            println!("{config:#?}");
            exit_codes::SUCCESS
        }
        Err(error) => {
            eprintln!("configuration error: {error}");
            exit_codes::INVALID_INPUT
        }
    }
}

async fn serve() -> i32 {
    let config = match OrchestratorConfig::from_env() {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {error}");
            return exit_codes::INVALID_INPUT;
        }
    };

    crate::metrics::init_metrics();

    let registry = Arc::new(PoolRegistry::new());

    let monitor: Arc<dyn ResourceMonitor> = Arc::new(StaticResourceMonitor::new(
        num_cpus() as f64,
        8 * 1024 * 1024 * 1024,
    ));
    let mut monitors: HashMap<String, Arc<dyn ResourceMonitor>> = HashMap::new();
    monitors.insert("local".to_string(), Arc::clone(&monitor));
    monitors.insert("docker".to_string(), Arc::clone(&monitor));
    monitors.insert("kubernetes".to_string(), monitor);

    let strategy = match PlacementStrategy::from_name(&config.placement_strategy) {
        Ok(strategy) => strategy,
        Err(error) => {
            eprintln!("configuration error: {error}");
            return exit_codes::INVALID_INPUT;
        }
    };
    let placement = Arc::new(PlacementScheduler::new(
        Arc::clone(&registry),
        monitors,
        strategy,
    ));

    let mut managers: HashMap<String, Arc<dyn InstanceManager>> = HashMap::new();
    let mut configurations = HashMap::new();
    managers.insert(
        "local".to_string(),
        Arc::new(LocalInstanceManager::new()) as Arc<dyn InstanceManager>,
    );
    configurations.insert(
        "local".to_string(),
        WorkerConfiguration::default_for("local", config.server_endpoint.clone()),
    );
    match DockerInstanceManager::connect() {
        Ok(docker) => {
            managers.insert("docker".to_string(), Arc::new(docker));
            let mut docker_config =
                WorkerConfiguration::default_for("docker", config.server_endpoint.clone());
            docker_config.image = config.worker_image.clone();
            configurations.insert("docker".to_string(), docker_config);
        }
        Err(error) => {
            warn!(%error, "docker backend unavailable, serving local pools only");
        }
    }
    let factory = Arc::new(WorkerFactory::new(configurations, managers));

    let (session_tx, session_rx) = mpsc::channel(256);
    let sessions = Arc::new(SessionRegistry::new(config.heartbeat_interval, session_tx));

    let queue = Arc::new(JobQueue::new(config.queue_max_size, config.queue_strategy));
    let cache = Arc::new(ArtifactCache::new(config.artifact_cache_bytes));
    let events = EventBus::new(config.event_backlog);

    let coordinator = Coordinator::new(
        queue,
        placement,
        factory,
        sessions,
        Arc::new(InMemoryJobRepository::new()),
        Arc::new(InMemoryExecutionRepository::new()),
        cache,
        events,
        session_rx,
        config.coordinator(),
    );

    info!("hodei orchestrator serving");
    let runner = tokio::spawn(Arc::clone(&coordinator).run());

    if tokio::signal::ctrl_c().await.is_err() {
        warn!("failed to listen for shutdown signal");
    }
    info!("shutting down");
    coordinator.shutdown();
    let _ = runner.await;

    exit_codes::SUCCESS
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_serve() {
        let cli = Cli::try_parse_from(["hodei", "serve"]).unwrap();
        assert!(matches!(cli.command, Command::Serve));
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_cli_parses_log_level() {
        let cli = Cli::try_parse_from(["hodei", "--log-level", "debug", "config"]).unwrap();
        assert!(matches!(cli.command, Command::Config));
        assert_eq!(cli.log_level, "debug");
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_codes::SUCCESS, 0);
        assert_eq!(exit_codes::GENERIC_FAILURE, 1);
        assert_eq!(exit_codes::INVALID_INPUT, 2);
        assert_eq!(exit_codes::VALIDATION_FAILURE, 3);
        assert_eq!(exit_codes::PROVISIONING_FAILURE, 4);
        assert_eq!(exit_codes::AUTHENTICATION_FAILURE, 5);
    }
}
