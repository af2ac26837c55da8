//! CLI for config server operations

use clap::{Parser, Subcommand};
use shardmeta::coordinator::commands::AdminCommand;
use shardmeta::coordinator::metadata::NamespaceEntry;
use shardmeta::ops::{fetch_status, repair_namespace, send_command, verify_metadata};

#[derive(Parser)]
#[command(name = "shardmeta")]
#[command(about = "shardmeta operator CLI")]
#[command(version)]
struct Cli {
    /// Config server URL
    #[arg(long, default_value = "http://localhost:5000")]
    config_server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check routing metadata consistency
    Verify {
        /// Database or collection namespace (whole cluster if omitted)
        #[arg(long)]
        namespace: Option<String>,
    },

    /// Overwrite a namespace record and re-check it
    Repair {
        /// JSON file holding the correct database or collection record
        #[arg(long)]
        record: std::path::PathBuf,

        /// Only report current findings
        #[arg(long)]
        dry_run: bool,
    },

    /// Run a raw admin command, e.g. '{"command": "listShards"}'
    Command {
        /// Command document
        json: String,
    },

    /// Show config server status
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Verify { namespace } => {
            let report = verify_metadata(&cli.config_server, namespace.as_deref()).await?;
            println!("Verification report ({}):", report.scope);
            println!("  Checked at: {}", report.checked_at.to_rfc3339());
            println!("  Findings: {}", report.inconsistencies.len());
            println!("  Fatal: {}", report.fatal);
            for f in &report.inconsistencies {
                println!(
                    "  - [{:?}] {:?} {} ({}): {}",
                    f.severity, f.kind, f.namespace, f.source, f.details
                );
            }
            if report.fatal > 0 {
                std::process::exit(2);
            }
        }

        Commands::Repair { record, dry_run } => {
            let raw = std::fs::read_to_string(&record)?;
            let entry: NamespaceEntry = serde_json::from_str(&raw)?;
            let report = repair_namespace(&cli.config_server, entry, dry_run).await?;
            println!("Repair report:");
            println!("  Namespace: {}", report.namespace);
            println!("  Version: {}", report.version);
            println!("  Remaining findings: {}", report.remaining);
        }

        Commands::Command { json } => {
            let cmd: AdminCommand = serde_json::from_str(&json)?;
            let reply = send_command(&cli.config_server, &cmd).await?;
            println!("{}", serde_json::to_string_pretty(&reply)?);
        }

        Commands::Status => {
            let status = fetch_status(&cli.config_server).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}
