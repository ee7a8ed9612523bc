//! Node binary

use anyhow::Context;
use clap::{Parser, Subcommand};
use shardcoord::discovery::{DefaultHostsResolver, DiscoveryModule, SeedHostsProvider};
use shardcoord::{ClusterNode, Config, LocalTransport};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "shardcoord-node")]
#[command(about = "shardcoord cluster node")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct Overrides {
    /// Node ID (random if neither set here nor in the config)
    #[arg(long)]
    id: Option<String>,

    /// Node name
    #[arg(long)]
    name: Option<String>,

    /// Transport address
    #[arg(long)]
    address: Option<String>,

    /// Discovery type
    #[arg(long)]
    discovery_type: Option<String>,

    /// Seed hosts (comma-separated)
    #[arg(long, value_delimiter = ',')]
    seed_hosts: Vec<String>,
}

impl Overrides {
    fn apply(self, config: &mut Config) {
        if let Some(id) = self.id {
            config.node.id = Some(id);
        }
        if let Some(name) = self.name {
            config.node.name = name;
        }
        if let Some(address) = self.address {
            config.node.address = address;
        }
        if let Some(discovery_type) = self.discovery_type {
            config.discovery.discovery_type = discovery_type;
        }
        if !self.seed_hosts.is_empty() {
            config.discovery.seed_hosts = self.seed_hosts;
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Start a node and run until interrupted
    Serve {
        #[command(flatten)]
        overrides: Overrides,
    },

    /// Validate the configuration and print the resolved startup plan
    CheckConfig {
        #[command(flatten)]
        overrides: Overrides,
    },
}

fn load_config(path: Option<&PathBuf>, overrides: Overrides) -> anyhow::Result<Config> {
    let mut config = Config::load(path.map(|p| p.as_path())).context("failed to load configuration")?;
    overrides.apply(&mut config);
    config.validate().context("invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { overrides } => {
            let config = load_config(cli.config.as_ref(), overrides)?;
            tracing::info!(build = shardcoord::BUILD_INFO, cluster = %config.cluster.name, "starting node");
            let transport = LocalTransport::new();
            let node = ClusterNode::start(config, &transport)
                .await
                .context("failed to start node")?;

            tokio::signal::ctrl_c().await?;
            tracing::info!("shutdown signal received");
            node.shutdown().await;
        }
        Commands::CheckConfig { overrides } => {
            let config = load_config(cli.config.as_ref(), overrides)?;
            let discovery = DiscoveryModule::new(&config, &[]).context("invalid discovery settings")?;
            let seeds = discovery
                .seed_hosts_provider()
                .seed_addresses(&DefaultHostsResolver::default());

            println!("cluster:            {}", config.cluster.name);
            println!("node:               {} ({})", config.node.name, config.node.address);
            println!("discovery type:     {}", discovery.discovery_type());
            println!("seed providers:     {}", discovery.seed_provider_names().join(", "));
            println!("seed addresses:     {}", seeds.join(", "));
            println!("election strategy:  {}", discovery.election_strategy_name());
            println!("join validators:    {}", discovery.join_validators().len());
        }
    }

    Ok(())
}
