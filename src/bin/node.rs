//! Payment node binary

use clap::{Parser, Subcommand};
use payledger::common::{NodeConfig, PeerConfig};
use payledger::PaymentNode;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "payledger-node")]
#[command(about = "payledger node with leader election and quorum replication")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a ledger node
    Serve {
        /// Configuration file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Node ID
        #[arg(long)]
        id: Option<String>,

        /// Bind address for the line protocol
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Address peers should use to reach this node
        #[arg(long)]
        advertise: Option<String>,

        /// Data directory (WAL, indexes, snapshot)
        #[arg(long)]
        data: Option<PathBuf>,

        /// Cluster peer as id=host:port (repeatable)
        #[arg(long = "peer")]
        peers: Vec<PeerConfig>,

        /// Log level when RUST_LOG is unset
        #[arg(long)]
        log_level: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            id,
            bind,
            advertise,
            data,
            peers,
            log_level,
        } => {
            // File and environment first, then CLI flags on top
            let mut node_config = NodeConfig::load(config.as_deref())?;
            if let Some(id) = id {
                node_config.node_id = id;
            }
            if let Some(bind) = bind {
                node_config.bind_addr = bind;
            }
            if advertise.is_some() {
                node_config.advertise_addr = advertise;
            }
            if let Some(data) = data {
                node_config.data_dir = data;
            }
            if !peers.is_empty() {
                node_config.peers = peers;
            }
            if let Some(level) = log_level {
                node_config.log_level = level;
            }

            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| node_config.log_level.as_str().into()),
                )
                .with(tracing_subscriber::fmt::layer())
                .init();

            node_config.validate()?;

            let node = PaymentNode::bind(node_config).await?;
            let handle = node.handle();
            let server = tokio::spawn(node.serve());

            tokio::signal::ctrl_c().await?;
            tracing::info!("Received Ctrl-C");
            handle.shutdown();
            server.await??;
        }
    }

    Ok(())
}
