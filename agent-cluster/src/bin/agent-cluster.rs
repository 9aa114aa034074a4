//! Agent Cluster coordinator
//!
//! Reads one JSON request per line from stdin and writes one JSON response per
//! line to stdout. Logs go to stderr.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use agent_cluster::{ClusterCoordinator, CoordinatorConfig, NodeRegistry, Strategy};
use anyhow::Context;
use clap::Parser;
use env_logger::Env;
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser, Debug)]
#[command(name = "agent-cluster")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Cluster coordinator driven by JSON lines on stdin", long_about = None)]
struct Cli {
    /// Seconds without a heartbeat before a node is unhealthy
    #[arg(long, default_value_t = agent_cluster::config::DEFAULT_HEARTBEAT_TIMEOUT)]
    heartbeat_timeout: u64,

    /// Seconds without a heartbeat before a node is evicted
    #[arg(long, default_value_t = agent_cluster::config::DEFAULT_EVICTION_TIMEOUT)]
    eviction_timeout: u64,

    /// Seconds between background sweeps
    #[arg(long, default_value_t = agent_cluster::config::DEFAULT_SWEEP_INTERVAL)]
    sweep_interval: u64,

    /// Default balancing strategy (round_robin, least_loaded, weighted, capacity_aware, service_affinity)
    #[arg(short, long, default_value = "least_loaded")]
    strategy: Strategy,

    /// JSON configuration file; replaces the timing and strategy flags
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log cluster events as they happen
    #[arg(long)]
    log_events: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn coordinator_config(&self) -> anyhow::Result<CoordinatorConfig> {
        let config = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("parsing {}", path.display()))?
            }
            None => CoordinatorConfig::new()
                .heartbeat_timeout(Duration::from_secs(self.heartbeat_timeout))
                .eviction_timeout(Duration::from_secs(self.eviction_timeout))
                .sweep_interval(Duration::from_secs(self.sweep_interval))
                .default_strategy(self.strategy),
        };
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or(cli.log_level.as_str())).init();

    let coordinator = Arc::new(ClusterCoordinator::new(
        cli.coordinator_config()?,
        Arc::new(NodeRegistry::new()),
    )?);

    let config = coordinator.config();
    info!(
        "Starting coordinator: heartbeat timeout {:?}, eviction timeout {:?}, strategy {}",
        config.heartbeat_timeout, config.eviction_timeout, config.default_strategy
    );

    if cli.log_events {
        let mut events = coordinator.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => info!("Event: {:?}", event),
                    Err(RecvError::Lagged(skipped)) => warn!("Event log skipped {} events", skipped),
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    let sweeper = coordinator.start_sweeper();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    debug!("stdin closed");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }

                let mut response = coordinator.handle_json(&line)?;
                response.push('\n');
                stdout.write_all(response.as_bytes()).await?;
                stdout.flush().await?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    sweeper.stop().await;
    info!("Coordinator stopped");
    Ok(())
}
