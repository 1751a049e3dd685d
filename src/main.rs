use clap::{Parser, ValueEnum};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use fleet_router::api::run_api;
use fleet_router::config::FleetConfig;
use fleet_router::fleet::{CapabilityCheck, ClusterState};
use fleet_router::health::HealthSupervisor;
use fleet_router::history::TaskHistoryEntry;
use fleet_router::registry::NodeSummary;
use fleet_router::shutdown::install_shutdown_handler;
use fleet_router::transport::HttpTransport;
use fleet_router::FleetManager;

#[derive(Parser, Debug)]
#[command(name = "fleet-router")]
#[command(version)]
#[command(about = "Capability-aware task router for a fleet of compute nodes")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the cluster API and the health supervisor
    Server(ServerArgs),

    /// Query a running router
    Cluster {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: ClusterCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// TOML configuration file. Flags below override its values.
    #[arg(long, short = 'c', env = "FLEET_ROUTER_CONFIG")]
    config: Option<PathBuf>,

    /// Port of the cluster API
    #[arg(long)]
    port: Option<u16>,

    /// Seconds without a heartbeat before an active node goes stale
    #[arg(long)]
    heartbeat_ttl: Option<u64>,

    /// Seconds between health sweeps
    #[arg(long)]
    health_interval: Option<u64>,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Router address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:8420")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum ClusterCommands {
    /// Capacity, status counts and routing metrics
    Status,
    /// List registered nodes
    Nodes {
        /// Only nodes in this status (e.g. active, stale)
        #[arg(long)]
        status: Option<String>,

        /// Only nodes of this tier (light, standard, powerhouse)
        #[arg(long)]
        tier: Option<String>,

        /// Only nodes with this capability tag
        #[arg(long)]
        capability: Option<String>,
    },
    /// Recently routed tasks
    History {
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Check whether a task type could be placed right now
    CanHandle {
        /// Task type (e.g. build, ai_inference)
        task_type: String,
    },
}

#[derive(Deserialize)]
struct NodeListOutput {
    nodes: Vec<NodeSummary>,
    total: usize,
}

#[derive(Deserialize)]
struct ErrorOutput {
    code: String,
    error: String,
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = match &args.config {
        Some(path) => FleetConfig::from_file(path)?,
        None => FleetConfig::default(),
    };
    if let Some(port) = args.port {
        config.listen_addr.set_port(port);
    }
    if let Some(ttl) = args.heartbeat_ttl {
        config.heartbeat_ttl_secs = ttl;
    }
    if let Some(interval) = args.health_interval {
        config.health_check_interval_secs = interval;
    }
    config.validate()?;

    tracing::info!(
        listen_addr = %config.listen_addr,
        heartbeat_ttl_secs = config.heartbeat_ttl_secs,
        health_check_interval_secs = config.health_check_interval_secs,
        hard_filter_tags = ?config.hard_filter_tags,
        "Starting fleet-router"
    );

    let listen_addr = config.listen_addr;
    let transport = Arc::new(HttpTransport::new(&config.source_cloud)?);
    let fleet = Arc::new(FleetManager::new(config, transport));
    let shutdown = install_shutdown_handler();

    let supervisor = HealthSupervisor::new(fleet.clone()).spawn(shutdown.clone());

    let served = run_api(listen_addr, fleet, shutdown.clone()).await;
    shutdown.cancel();
    if let Err(e) = supervisor.await {
        tracing::error!(error = %e, "Health supervisor task failed");
    }
    served?;

    tracing::info!("Shutdown complete");
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn fetch<T: DeserializeOwned>(
    client: &reqwest::Client,
    args: &ClientArgs,
    path: &str,
    query: &[(&str, String)],
) -> Result<T, Box<dyn std::error::Error>> {
    let url = format!("{}{}", args.addr.trim_end_matches('/'), path);
    let response = client.get(&url).query(query).send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorOutput>(&body) {
            Ok(err) => eprintln!("Error: {} ({})", err.error, err.code),
            Err(_) => eprintln!("Error: router returned {}", status),
        }
        std::process::exit(1);
    }
    Ok(response.json::<T>().await?)
}

async fn handle_cluster_status(
    client: &reqwest::Client,
    args: &ClientArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let state: ClusterState = fetch(client, args, "/api/cluster/state", &[]).await?;

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&state)?),
        OutputFormat::Table => {
            let cap = &state.capacity;
            println!(
                "{} node(s) {:?}, tiers {:?}, avg reliability {}",
                state.total_nodes, state.by_status, state.by_tier, state.avg_reliability
            );
            println!(
                "Active: {} cores, {:.1} GB RAM, {} GPU node(s), slots {}/{} ({}%)",
                cap.total_cores,
                cap.total_ram_gb,
                cap.gpu_nodes,
                cap.used_slots,
                cap.total_slots,
                cap.utilization_pct
            );
            println!(
                "Tasks: {} routed, {} completed, {} failed, {} failovers",
                state.metrics.tasks_routed,
                state.metrics.tasks_completed,
                state.metrics.tasks_failed,
                state.metrics.failovers
            );
        }
    }
    Ok(())
}

async fn handle_cluster_nodes(
    client: &reqwest::Client,
    args: &ClientArgs,
    filters: Vec<(&str, String)>,
) -> Result<(), Box<dyn std::error::Error>> {
    let list: NodeListOutput = fetch(client, args, "/api/cluster/nodes", &filters).await?;

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&list.nodes)?),
        OutputFormat::Table => {
            if list.nodes.is_empty() {
                println!("No nodes found.");
                return Ok(());
            }
            println!(
                "{:<20} {:<11} {:<10} {:>5} {:>7} {:>6} LOCATION",
                "NODE ID", "TIER", "STATUS", "CORES", "RAM GB", "SLOTS"
            );
            println!("{}", "-".repeat(78));
            for node in &list.nodes {
                println!(
                    "{:<20} {:<11} {:<10} {:>5} {:>7.1} {:>6} {}",
                    node.node_id,
                    node.tier.to_string(),
                    node.status.to_string(),
                    node.hardware.cpu_cores,
                    node.hardware.ram_gb,
                    format!("{}/{}", node.current_tasks, node.max_concurrent),
                    node.location
                );
            }
            println!();
            println!("{} node(s)", list.total);
        }
    }
    Ok(())
}

async fn handle_cluster_history(
    client: &reqwest::Client,
    args: &ClientArgs,
    limit: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let entries: Vec<TaskHistoryEntry> = fetch(
        client,
        args,
        "/api/cluster/tasks/history",
        &[("limit", limit.to_string())],
    )
    .await?;

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
        OutputFormat::Table => {
            if entries.is_empty() {
                println!("No tasks routed yet.");
                return Ok(());
            }
            println!(
                "{:<42} {:<14} {:<4} {:<20} STATUS",
                "TASK ID", "TYPE", "PRI", "NODE"
            );
            println!("{}", "-".repeat(92));
            for entry in &entries {
                println!(
                    "{:<42} {:<14} {:<4} {:<20} {}",
                    entry.task_id,
                    entry.task_type,
                    entry.priority.to_string(),
                    entry.node_id,
                    entry.status
                );
            }
        }
    }
    Ok(())
}

async fn handle_can_handle(
    client: &reqwest::Client,
    args: &ClientArgs,
    task_type: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let path = format!("/api/cluster/capabilities/{}", task_type);
    let check: CapabilityCheck = fetch(client, args, &path, &[]).await?;

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&check)?),
        OutputFormat::Table => {
            let best = check
                .best_node
                .map(|b| format!("{} (score {:.1})", b.node_id, b.score))
                .unwrap_or_else(|| "none".to_string());
            println!(
                "{}: {} eligible node(s), best {}",
                check.requirements.label, check.eligible_nodes, best
            );
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Cluster { client, command } => {
            let http = reqwest::Client::new();
            match command {
                ClusterCommands::Status => handle_cluster_status(&http, &client).await?,
                ClusterCommands::Nodes {
                    status,
                    tier,
                    capability,
                } => {
                    let filters: Vec<(&str, String)> = [
                        ("status", status),
                        ("tier", tier),
                        ("capability", capability),
                    ]
                    .into_iter()
                    .filter_map(|(key, value)| value.map(|v| (key, v)))
                    .collect();
                    handle_cluster_nodes(&http, &client, filters).await?;
                }
                ClusterCommands::History { limit } => {
                    handle_cluster_history(&http, &client, limit).await?
                }
                ClusterCommands::CanHandle { task_type } => {
                    handle_can_handle(&http, &client, &task_type).await?
                }
            }
        }
    }

    Ok(())
}
