//! CLI for in-process clusters

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use shardcoord::cluster::{ShardRouting, ShardRoutingState};
use shardcoord::{ClusterAllocationExplainRequest, ClusterNode, Config, IndexMetadata, LocalTransport};
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "shardcoord")]
#[command(about = "shardcoord cluster coordination and allocation CLI")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an in-process cluster, allocate, and explain one shard as JSON
    LocalCluster {
        /// Number of nodes
        #[arg(long, default_value = "3")]
        nodes: usize,

        /// Index to create, as name:shards:replicas (repeatable)
        #[arg(long = "index", value_parser = parse_index)]
        indices: Vec<IndexMetadata>,

        /// Shard to explain, as index:shard:primary|replica (any unassigned if omitted)
        #[arg(long)]
        shard: Option<String>,

        /// Node currently holding the shard to explain
        #[arg(long)]
        current_node: Option<String>,

        /// Include YES decisions
        #[arg(long)]
        include_yes_decisions: bool,

        /// Include disk usage
        #[arg(long)]
        include_disk_info: bool,

        /// How long to wait for the cluster to settle
        #[arg(long, default_value = "10s", value_parser = parse_timeout)]
        timeout: Duration,
    },
}

fn parse_index(s: &str) -> Result<IndexMetadata, String> {
    let parts: Vec<&str> = s.split(':').collect();
    let [name, shards, replicas] = parts.as_slice() else {
        return Err(format!("expected name:shards:replicas, got [{}]", s));
    };
    let shards = shards.parse().map_err(|e| format!("shards [{}]: {}", shards, e))?;
    let replicas = replicas.parse().map_err(|e| format!("replicas [{}]: {}", replicas, e))?;
    Ok(IndexMetadata::new(*name, shards, replicas))
}

fn parse_timeout(s: &str) -> Result<Duration, String> {
    shardcoord::common::parse_duration(s).map_err(|e| e.to_string())
}

fn parse_shard(s: &str, current_node: Option<String>) -> anyhow::Result<ClusterAllocationExplainRequest> {
    let parts: Vec<&str> = s.split(':').collect();
    let [index, shard, kind] = parts.as_slice() else {
        bail!("expected index:shard:primary|replica, got [{}]", s);
    };
    let shard: u32 = shard.parse().with_context(|| format!("invalid shard number [{}]", shard))?;
    let primary = match *kind {
        "primary" | "p" => true,
        "replica" | "r" => false,
        other => bail!("expected primary or replica, got [{}]", other),
    };
    let request = ClusterAllocationExplainRequest::shard(*index, shard, primary);
    Ok(match current_node {
        Some(node) => request.with_current_node(node),
        None => request,
    })
}

fn node_config(name: &str, names: &[String]) -> Config {
    let mut config = Config::default();
    config.node.id = Some(name.to_string());
    config.node.name = name.to_string();
    config.node.address = format!("{}:9300", name);
    if names.len() == 1 {
        config.discovery.discovery_type = "single-node".to_string();
    } else {
        config.discovery.seed_hosts = names.iter().map(|n| format!("{}:9300", n)).collect();
        config.discovery.initial_voting_nodes = names.to_vec();
    }
    config.cluster.election_initial_timeout_ms = 20;
    config.cluster.election_back_off_ms = 20;
    config.cluster.election_max_timeout_ms = 500;
    config.cluster.follower_check_interval_ms = 200;
    config
}

async fn wait_for_leader<'a>(nodes: &'a [ClusterNode], deadline: Instant) -> anyhow::Result<&'a ClusterNode> {
    loop {
        if let Some(leader) = nodes
            .iter()
            .find(|n| n.is_leader() && n.current_state().nodes.len() == nodes.len())
        {
            return Ok(leader);
        }
        if Instant::now() >= deadline {
            bail!("no leader elected with all {} nodes joined", nodes.len());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::LocalCluster {
            nodes: count,
            indices,
            shard,
            current_node,
            include_yes_decisions,
            include_disk_info,
            timeout,
        } => {
            if count == 0 {
                bail!("--nodes must be at least 1");
            }
            let request = match shard {
                Some(shard) => parse_shard(&shard, current_node)?,
                None => ClusterAllocationExplainRequest::any_unassigned(),
            }
            .include_yes_decisions(include_yes_decisions)
            .include_disk_info(include_disk_info);

            let transport = LocalTransport::new();
            let names: Vec<String> = (1..=count).map(|i| format!("node-{}", i)).collect();
            let mut nodes = Vec::with_capacity(count);
            for name in &names {
                nodes.push(ClusterNode::start(node_config(name, &names), &transport).await?);
            }

            let deadline = Instant::now() + timeout;
            let leader = wait_for_leader(&nodes, deadline).await?;
            for index in indices {
                leader.create_index(index).await?;
            }

            // start everything the allocator hands out until nothing is recovering
            loop {
                let initializing: Vec<ShardRouting> = leader
                    .current_state()
                    .routing_table
                    .shards_with_state(ShardRoutingState::Initializing)
                    .into_iter()
                    .cloned()
                    .collect();
                if initializing.is_empty() {
                    break;
                }
                if Instant::now() >= deadline {
                    bail!("{} shard(s) still initializing at the deadline", initializing.len());
                }
                leader.shards_started(initializing).await?;
            }

            let explanation = leader
                .explain_allocation(&request)
                .map_err(|e| anyhow!("[{}] {}", e.code(), e));

            for node in &nodes {
                node.shutdown().await;
            }
            println!("{}", explanation?.to_json()?);
        }
    }

    Ok(())
}
