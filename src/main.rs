//! WolfShard - Partitioned MariaDB Write Coordinator
//!
//! Command line entry point: runs the coordinator service and offers
//! operator commands for health, pending replications and recovery.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfshard::api::HttpServer;
use wolfshard::config::{LogBackend, WolfShardConfig};
use wolfshard::connection::{MemoryConnector, MySqlConnector, NodeConnector};
use wolfshard::error::{Error, Result};
use wolfshard::log::{MySqlReplicationLog, ReplicationLog, SqliteReplicationLog};
use wolfshard::replication::WriteCoordinator;

/// WolfShard - Partitioned MariaDB Write Coordinator
#[derive(Parser)]
#[command(name = "wolfshard")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfshard.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the coordinator service
    Start {
        /// Use in-process nodes and a local SQLite log instead of MariaDB
        #[arg(long)]
        dry_run: bool,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfshard.toml")]
        output: PathBuf,

        /// Node this process writes for
        #[arg(long, default_value = "node1")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,

    /// Check every node once
    Health,

    /// List pending replications written by a node
    Pending {
        /// Source node (defaults to the configured node)
        #[arg(short, long)]
        node: Option<String>,
    },

    /// Retry pending replications written by a node
    Recover {
        /// Source node (defaults to the configured node)
        #[arg(short, long)]
        node: Option<String>,
    },

    /// Query a running service
    Status {
        /// Service address to query
        #[arg(short, long, default_value = "localhost:8090")]
        address: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { dry_run } => {
            run_start(cli.config, cli.log_level, dry_run).await
        }
        Commands::Init { output, node_id } => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), "pretty");
            run_init(output, node_id)
        }
        Commands::Validate => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), "pretty");
            run_validate(cli.config)
        }
        Commands::Health => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"), "pretty");
            run_health(cli.config).await
        }
        Commands::Pending { node } => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"), "pretty");
            run_pending(cli.config, node).await
        }
        Commands::Recover { node } => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), "pretty");
            run_recover(cli.config, node).await
        }
        Commands::Status { address } => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"), "pretty");
            run_status(address).await
        }
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn load_config(config_path: &Path) -> Result<WolfShardConfig> {
    match WolfShardConfig::from_file(config_path) {
        Ok(config) => Ok(config),
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            Err(e)
        }
    }
}

/// Wire up connector, replication log and coordinator
fn build_coordinator(config: &WolfShardConfig, dry_run: bool) -> Result<Arc<WriteCoordinator>> {
    let connector: Arc<dyn NodeConnector> = if dry_run {
        tracing::warn!("Dry run: writes go to in-process nodes and are lost on exit");
        Arc::new(MemoryConnector::new(config.nodes.iter().map(|n| n.id.clone())))
    } else {
        Arc::new(MySqlConnector::new())
    };

    let log: Arc<dyn ReplicationLog> = match (config.replication.log_backend, dry_run) {
        (LogBackend::Sqlite, _) | (_, true) => {
            let path = &config.replication.sqlite_path;
            tracing::info!("Replication log: SQLite file {:?}", path);
            Arc::new(SqliteReplicationLog::open(path)?)
        }
        (LogBackend::Node, false) => {
            let log_node = config
                .replication
                .log_node
                .as_deref()
                .unwrap_or(&config.partition.primary);
            let node = config
                .nodes
                .iter()
                .find(|n| n.id == log_node)
                .ok_or_else(|| Error::Config(format!("log node {} is not in [[nodes]]", log_node)))?;
            tracing::info!("Replication log: table on {}", node.id);
            Arc::new(MySqlReplicationLog::connect_lazy(node))
        }
    };

    Ok(Arc::new(WriteCoordinator::new(config, connector, log)))
}

/// Start the coordinator service
async fn run_start(config_path: PathBuf, log_level: Option<String>, dry_run: bool) -> Result<()> {
    let config = match WolfShardConfig::from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            init_logging(log_level.as_deref().unwrap_or("info"), "pretty");
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            tracing::error!("Please check that the config file exists and is valid TOML");
            return Err(e);
        }
    };
    init_logging(
        log_level.as_deref().unwrap_or(&config.logging.level),
        &config.logging.format,
    );

    tracing::info!("Starting WolfShard for node {}...", config.node.id);
    tracing::info!(
        "Registry: {} nodes, primary {}, table {}",
        config.nodes.len(),
        config.partition.primary,
        config.schema.table
    );

    let coordinator = build_coordinator(&config, dry_run)?;

    if config.replication.recover_on_startup {
        match coordinator.retry_pending(&config.node.id).await {
            Ok(report) => tracing::info!(
                "Startup recovery: {} processed, {} recovered, {} still pending",
                report.processed,
                report.recovered,
                report.still_pending
            ),
            Err(e) => tracing::warn!("Startup recovery skipped: {}", e),
        }
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let sweeps = config.sweep_interval().map(|every| {
        coordinator
            .sweeper()
            .spawn_periodic(config.node.id.clone(), every, shutdown_rx.clone())
    });
    let mut reaper = None;

    if config.api.enabled {
        let server = HttpServer::new(config.api.clone(), Arc::clone(&coordinator));
        reaper = config.api.session_idle_timeout().map(|idle| {
            let every = (idle / 2).max(Duration::from_secs(1));
            server.state().spawn_reaper(idle, every, shutdown_rx.clone())
        });
        tokio::select! {
            result = server.start() => {
                if let Err(e) = result {
                    tracing::error!("HTTP API failed: {}", e);
                    let _ = shutdown_tx.send(true);
                    return Err(e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received shutdown signal");
            }
        }
    } else {
        tracing::info!("HTTP API disabled; running recovery sweeps only");
        tokio::signal::ctrl_c().await?;
    }

    let _ = shutdown_tx.send(true);
    if let Some(handle) = sweeps {
        if let Err(e) = handle.await {
            tracing::warn!("Recovery sweep task ended abnormally: {}", e);
        }
    }
    if let Some(handle) = reaper {
        if let Err(e) = handle.await {
            tracing::warn!("Session reaper ended abnormally: {}", e);
        }
    }

    tracing::info!("WolfShard stopped");
    Ok(())
}

/// Initialize configuration file
fn run_init(output: PathBuf, node_id: String) -> Result<()> {
    if output.exists() {
        eprintln!("Configuration file {:?} already exists", output);
        return Err(Error::Config(format!("{:?} already exists", output)));
    }

    std::fs::write(&output, WolfShardConfig::sample(&node_id))?;
    println!("Configuration written to {:?}", output);
    println!("Edit [[nodes]] and [schema] to match your deployment, then run:");
    println!("  wolfshard --config {:?} validate", output);
    Ok(())
}

/// Validate configuration file
fn run_validate(config_path: PathBuf) -> Result<()> {
    match WolfShardConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Nodes: {}", config.nodes.len());
            for node in &config.nodes {
                println!(
                    "    {} {}@{}:{}/{} (range {})",
                    node.id, node.user, node.host, node.port, node.database, node.range_index
                );
            }
            println!("  Table: {} (key {}, route {})",
                config.schema.table,
                config.schema.key_column,
                config.schema.route_column);
            println!("  Primary: {}", config.partition.primary);
            println!("  Groups: <= {} {:?}, > {} {:?}",
                config.partition.boundary,
                config.partition.lower_group,
                config.partition.boundary,
                config.partition.upper_group);
            println!("  Replication log: {:?}", config.replication.log_backend);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Check every node once
async fn run_health(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    let coordinator = build_coordinator(&config, false)?;

    for (node, health) in coordinator.node_health().await {
        println!("{:<16} {}", node, health);
    }
    Ok(())
}

/// List pending replications
async fn run_pending(config_path: PathBuf, node: Option<String>) -> Result<()> {
    let config = load_config(&config_path)?;
    let node = node.unwrap_or_else(|| config.node.id.clone());
    let coordinator = build_coordinator(&config, false)?;

    let entries = coordinator.list_pending_replications(&node).await?;
    if entries.is_empty() {
        println!("No pending replications from {}", node);
        return Ok(());
    }

    println!("{:>8}  {:<12} {:<7} {:<20} {:>7}  LAST ERROR", "ID", "KEY", "OP", "TARGETS", "RETRIES");
    for entry in entries {
        println!(
            "{:>8}  {:<12} {:<7} {:<20} {:>7}  {}",
            entry.id,
            entry.record_key.as_deref().unwrap_or("-"),
            entry.op_kind,
            entry.target_nodes.join(","),
            entry.retry_count,
            entry.last_error.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

/// Retry pending replications
async fn run_recover(config_path: PathBuf, node: Option<String>) -> Result<()> {
    let config = load_config(&config_path)?;
    let node = node.unwrap_or_else(|| config.node.id.clone());
    let coordinator = build_coordinator(&config, false)?;

    let report = coordinator.retry_pending(&node).await?;
    println!("Recovery for {}:", node);
    println!("  Processed:     {}", report.processed);
    println!("  Recovered:     {}", report.recovered);
    println!("  Still pending: {}", report.still_pending);
    println!("  Failed:        {}", report.failed);
    Ok(())
}

/// Check a running service
async fn run_status(address: String) -> Result<()> {
    for path in ["health", "nodes/health"] {
        let url = format!("http://{}/{}", address, path);
        let response = reqwest::get(&url).await.map_err(|e| {
            eprintln!("Failed to get status: {}", e);
            Error::unreachable(&address, e)
        })?;
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::unreachable(&address, e))?;
        let pretty = serde_json::to_string_pretty(&body)
            .map_err(|e| Error::Internal(e.to_string()))?;
        println!("{}", pretty);
    }
    Ok(())
}
