//! `convoy`: run a supervisor with locally hosted workers.

mod config_watcher;
mod workers;

use anyhow::Context;
use clap::{Parser, Subcommand};
use config_watcher::ConfigWatcher;
use convoy_core::Payload;
use convoy_orchestrator::{
    BackgroundTasks, InProcessBus, OrchestratorConfig, Supervisor, TaskSpec, WorkflowSpec,
};
use convoy_store::{AuditLog, FileTaskStore};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use workers::WorkerConfig;

#[derive(Parser)]
#[command(name = "convoy", about = "Convoy: task and workflow orchestration")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "convoy.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervisor and the configured workers until Ctrl-C
    Serve,
    /// Create one task, wait for it and print it as JSON
    Submit {
        #[arg(long)]
        task_type: String,
        #[arg(long, default_value = "")]
        description: String,
        /// Requirements as a JSON object
        #[arg(long)]
        requirements: Option<String>,
        #[arg(long)]
        max_retries: Option<u32>,
        /// Per-task deadline in seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// How long to wait for a terminal status
        #[arg(long, default_value_t = 600)]
        wait_secs: u64,
    },
    /// Create a workflow from a JSON file, wait and print its report
    RunWorkflow {
        file: PathBuf,
        #[arg(long, default_value_t = 3600)]
        wait_secs: u64,
    },
    /// List the configured workers after registration
    Agents,
}

#[derive(Deserialize)]
struct ConvoyConfig {
    #[serde(default = "default_data_dir")]
    data_dir: PathBuf,
    #[serde(default)]
    orchestrator: OrchestratorConfig,
    #[serde(default)]
    workers: Vec<WorkerConfig>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

/// A running supervisor and the bus its workers hang off.
struct Node {
    supervisor: Supervisor,
    bus: Arc<InProcessBus>,
    background: BackgroundTasks,
}

async fn boot(config: &ConvoyConfig) -> anyhow::Result<Node> {
    let store = Arc::new(FileTaskStore::open(config.data_dir.join("store")).await?);
    let audit = Arc::new(AuditLog::new(config.data_dir.join("audit")));
    let bus = Arc::new(InProcessBus::new());
    let inbound = bus.subscribe(config.orchestrator.supervisor_id.clone());

    let supervisor = Supervisor::new(config.orchestrator.clone(), store, bus.clone(), audit)?;
    let background = supervisor.start(inbound)?;

    let started = workers::host_new(&supervisor, &bus, &config.workers);
    info!(count = started.len(), "Local workers registered");

    Ok(Node {
        supervisor,
        bus,
        background,
    })
}

fn parse_requirements(raw: Option<&str>) -> anyhow::Result<Payload> {
    match raw {
        None => Ok(Payload::new()),
        Some(raw) => serde_json::from_str(raw).context("--requirements must be a JSON object"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();

    let config_str = tokio::fs::read_to_string(&cli.config)
        .await
        .with_context(|| format!("Failed to read config file '{}'", cli.config.display()))?;
    let config: ConvoyConfig = toml::from_str(&config_str)?;

    match cli.command {
        Commands::Serve => {
            let node = boot(&config).await?;
            let recovered = node.supervisor.recover().await?;
            info!(?recovered, "Convoy supervisor running");

            let supervisor = node.supervisor.clone();
            let bus = node.bus.clone();
            let runtime = tokio::runtime::Handle::current();
            let _watcher = ConfigWatcher::start(cli.config.clone(), 500, move |reloaded| {
                let Some(configs) = reloaded.workers else {
                    return;
                };
                let supervisor = supervisor.clone();
                let bus = bus.clone();
                runtime.spawn(async move {
                    let started = workers::host_new(&supervisor, &bus, &configs);
                    if !started.is_empty() {
                        info!(workers = ?started, "Workers added from reloaded config");
                    }
                });
            })
            .map_err(|e| warn!(error = %e, "Config hot-reload disabled"))
            .ok();

            tokio::signal::ctrl_c().await?;
            info!("Shutting down");
            node.background.abort();
        }
        Commands::Submit {
            task_type,
            description,
            requirements,
            max_retries,
            timeout,
            wait_secs,
        } => {
            let node = boot(&config).await?;
            let mut spec = TaskSpec::new(task_type)
                .with_description(description)
                .with_requirements(parse_requirements(requirements.as_deref())?);
            if let Some(n) = max_retries {
                spec = spec.with_max_retries(n);
            }
            if let Some(seconds) = timeout {
                spec = spec.with_timeout(seconds);
            }
            let id = node.supervisor.create_task(spec).await?;
            let task = node
                .supervisor
                .wait_for_task(id, Duration::from_secs(wait_secs))
                .await?;
            println!("{}", serde_json::to_string_pretty(&task)?);
            node.background.abort();
        }
        Commands::RunWorkflow { file, wait_secs } => {
            let raw = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("Failed to read workflow file '{}'", file.display()))?;
            let spec: WorkflowSpec = serde_json::from_str(&raw)?;

            let node = boot(&config).await?;
            let id = node.supervisor.create_workflow(spec).await?;
            let report = node
                .supervisor
                .wait_for_workflow(id, Duration::from_secs(wait_secs))
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            node.background.abort();
        }
        Commands::Agents => {
            let node = boot(&config).await?;
            let agents = node.supervisor.list_agents();
            if agents.is_empty() {
                println!("No workers configured.");
                println!("Declare workers in convoy.toml under [[workers]]");
            } else {
                println!("Registered agents:");
                for agent in &agents {
                    let capabilities: Vec<&str> =
                        agent.capabilities.iter().map(String::as_str).collect();
                    println!(
                        "  {} ({}) {} [{}]",
                        agent.agent_id,
                        agent.agent_type,
                        agent.status,
                        capabilities.join(", ")
                    );
                }
                println!("\nTotal: {} agent(s)", agents.len());
            }
            node.background.abort();
        }
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use convoy_orchestrator::AssignmentStrategy;

    #[test]
    fn test_config_defaults_apply() {
        let config: ConvoyConfig = toml::from_str("").unwrap();
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.orchestrator.default_task_timeout_secs, 300);
        assert!(config.workers.is_empty());
    }

    #[test]
    fn test_config_overrides() {
        let config: ConvoyConfig = toml::from_str(
            r#"
data_dir = "/var/lib/convoy"

[orchestrator]
assignment_strategy = "random"
random_seed = 7
retry_timeouts = true

[orchestrator.quality]
confidence_floor = 0.5

[[workers]]
agent_id = "collector-1"
agent_type = "collector"
capabilities = ["fetch"]
"#,
        )
        .unwrap();
        assert_eq!(
            config.orchestrator.assignment_strategy,
            AssignmentStrategy::Random
        );
        assert_eq!(config.orchestrator.random_seed, Some(7));
        assert!(config.orchestrator.retry_timeouts);
        assert_eq!(config.orchestrator.quality.confidence_floor, 0.5);
        assert_eq!(config.orchestrator.quality.completion_time_secs, 300);
        assert_eq!(config.workers.len(), 1);
    }

    #[test]
    fn test_parse_requirements() {
        assert!(parse_requirements(None).unwrap().is_empty());
        let payload = parse_requirements(Some(r#"{"symbol": "AAPL"}"#)).unwrap();
        assert_eq!(payload["symbol"], "AAPL");
        assert!(parse_requirements(Some("[1, 2]")).is_err());
    }
}
