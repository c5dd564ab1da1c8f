use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use offline_sync::config::SyncConfig;
use offline_sync::logging::init_logging;
use offline_sync::store::{open_store, RecordStore};
use offline_sync::SyncCoordinator;
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (defaults to $OFFLINE_SYNC_CONFIG or the platform config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarize unsynced local state
    Status,
    /// List queued mutations as JSON lines
    Queue {
        #[arg(short, long)]
        channel: Option<String>,
    },
    /// Print one cached record
    Inspect { key: String },
    /// Drop every cached record carrying a tag
    Purge {
        #[arg(long)]
        tag: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => SyncConfig::load_from_path(path)?,
        None => SyncConfig::load()?,
    };
    init_logging(&config.log_filter)?;

    let store = open_store(&config.store).context("Failed to open record store")?;
    let sync = SyncCoordinator::create(store.clone(), &config).await?;

    match cli.command {
        Commands::Status => {
            let pending = sync.pending_mutations().await;
            let mut by_channel: BTreeMap<&str, usize> = BTreeMap::new();
            for mutation in &pending {
                *by_channel.entry(mutation.channel.as_str()).or_default() += 1;
            }

            println!("pending mutations: {}", pending.len());
            for (channel, count) in &by_channel {
                println!("  {}: {}", channel, count);
            }
            match pending.first() {
                Some(oldest) => println!(
                    "oldest queued: {} ({} failed attempt(s))",
                    oldest.enqueued_at.to_rfc3339(),
                    oldest.attempts
                ),
                None => println!("all local writes have reached the remote"),
            }
        }
        Commands::Queue { channel } => {
            for mutation in sync.pending_mutations().await {
                if channel.as_deref().is_some_and(|c| c != mutation.channel) {
                    continue;
                }
                println!("{}", serde_json::to_string(&mutation)?);
            }
        }
        Commands::Inspect { key } => match store.get(&key).await? {
            Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
            None => anyhow::bail!("no cached record for '{}'", key),
        },
        Commands::Purge { tag } => {
            let removed = sync.invalidate_tag(&tag).await?;
            println!("removed {} record(s) tagged '{}'", removed.len(), tag);
        }
    }

    sync.dispose();
    Ok(())
}
