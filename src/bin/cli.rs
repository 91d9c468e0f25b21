//! CLI for payments and node administration

use clap::{Parser, Subcommand};
use payledger::replication::PeerClient;
use payledger::server::protocol::Request;
use payledger::server::PayReply;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "payledger")]
#[command(about = "payledger client and admin CLI")]
#[command(version)]
struct Cli {
    /// Node address
    #[arg(long, default_value = "127.0.0.1:7001")]
    node: String,

    /// Request timeout in milliseconds
    #[arg(long, default_value = "5000")]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a payment
    Pay {
        /// Amount (single token)
        amount: String,

        /// Payment ID (generated if omitted)
        #[arg(long)]
        id: Option<String>,
    },

    /// Show node status
    Status,

    /// Dump ledger entries
    Wal {
        /// First sequence to list
        #[arg(long, default_value = "0")]
        from: u64,
    },

    /// Deactivate the node (ledger is kept)
    Stop,

    /// Reactivate a stopped node
    Start,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let client = PeerClient::new(Duration::from_millis(cli.timeout_ms));

    match cli.command {
        Commands::Pay { amount, id } => {
            let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let reply = client.forward_pay(&cli.node, &amount, &id).await?;
            println!("{} {}", id, reply);
            if reply != PayReply::Ok {
                std::process::exit(1);
            }
        }
        Commands::Status => {
            let status = client.status(&cli.node).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Wal { from } => {
            for entry in client.fetch_wal(&cli.node, from).await? {
                println!("{}", entry);
            }
        }
        Commands::Stop => {
            client.admin(&cli.node, Request::Stop).await?;
            println!("✓ {} stopped", cli.node);
        }
        Commands::Start => {
            client.admin(&cli.node, Request::Start).await?;
            println!("✓ {} started", cli.node);
        }
    }

    Ok(())
}
