//! Config server binary

use clap::{Parser, Subcommand};
use shardmeta::{common::Config, ConfigServer};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "shardmeta-configsvr")]
#[command(about = "shardmeta config server: routing metadata for a sharded cluster")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ./shardmeta.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the config server
    Serve {
        /// Node ID
        #[arg(long)]
        id: Option<String>,

        /// Bind address for the admin API
        #[arg(long)]
        bind: Option<String>,

        /// RocksDB directory (in-memory if omitted everywhere)
        #[arg(long)]
        db: Option<PathBuf>,

        /// Shard to register at startup, `id=host` (repeatable)
        #[arg(long = "shard")]
        shards: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config from file, then override with CLI arguments
    let mut config = Config::load(cli.config.as_deref())?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Serve {
            id,
            bind,
            db,
            shards,
        } => {
            if let Some(id) = id {
                config.node_id = id;
            }
            if let Some(bind) = bind {
                config.server.bind_addr = bind.parse()?;
            }
            if db.is_some() {
                config.server.db_path = db;
            }
            if !shards.is_empty() {
                config.server.shards = shards;
            }
            config.validate()?;

            ConfigServer::new(config).serve().await?;
        }
    }

    Ok(())
}
