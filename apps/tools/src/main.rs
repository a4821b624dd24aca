use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use client_core::{config::normalize_database_url, PairKey};
use shared::domain::UserId;
use storage::Storage;

/// Maintenance for the persistent session cache.
#[derive(Parser, Debug)]
struct Cli {
    #[arg(
        long,
        env = "CARE_CHAT_CACHE_DATABASE_URL",
        default_value = "sqlite://./data/session_cache.db"
    )]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every cached pair and its session id.
    List,
    /// Drop the cached session between two users.
    Evict { user_a: String, user_b: String },
    /// Drop every cached session.
    Clear,
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let database_url = normalize_database_url(&cli.database_url);
    let storage = Storage::new(&database_url)
        .await
        .with_context(|| format!("failed to open session cache at {database_url}"))?;

    match cli.command {
        Command::List => {
            let entries = storage.list_cached_sessions().await?;
            if entries.is_empty() {
                println!("session cache is empty");
            }
            for entry in entries {
                println!(
                    "{}\t{}\t{}",
                    entry.pair_key,
                    entry.session_id,
                    entry.updated_at.to_rfc3339()
                );
            }
        }
        Command::Evict { user_a, user_b } => {
            let key = PairKey::new(&UserId::new(user_a), &UserId::new(user_b));
            if storage.evict_cached_session(key.as_str()).await? {
                println!("evicted {key}");
            } else {
                println!("no cached session for {key}");
            }
        }
        Command::Clear => {
            let removed = storage.clear_session_cache().await?;
            println!("removed {removed} cached session(s)");
        }
        Command::Health => {
            storage.health_check().await?;
            println!("ok");
        }
    }

    Ok(())
}
