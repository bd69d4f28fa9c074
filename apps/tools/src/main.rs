use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shared::{
    domain::{ConversationId, Timestamp},
    store::{ConversationStore, CursorStore, InviteStore, KeyPackageStore},
};
use storage::Storage;
use sync_core::{load_settings, SyncSettings};
use tracing::info;

/// Inspect and repair the local sync state.
#[derive(Parser, Debug)]
#[command(name = "synctl")]
struct Cli {
    /// TOML settings file. `SYNC__*` environment variables still apply on top.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Overrides the configured database.
    #[arg(long)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List stored conversations with their sync cursor.
    Conversations,
    /// Show one conversation's cursor.
    Cursor { conversation_id: String },
    /// Drop a cursor so the next activation backfills the whole window.
    ResetCursor { conversation_id: String },
    /// Show envelopes waiting to be opened and invites waiting to be joined.
    Invites,
    /// Show the local key package pool.
    KeyPackages,
    /// Print the effective settings.
    Config,
}

fn describe(at: Option<Timestamp>) -> String {
    at.map_or_else(|| "never".to_string(), |at| at.to_string())
}

async fn open(settings: &SyncSettings) -> Result<Storage> {
    Storage::new(&settings.database_url)
        .await
        .with_context(|| format!("failed to open {}", settings.database_url))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut settings = load_settings(cli.config.as_deref());
    if let Some(database_url) = cli.database_url {
        settings.database_url = database_url;
    }

    match cli.command {
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
        Command::Conversations => {
            let storage = open(&settings).await?;
            for conversation in storage.list_conversations().await? {
                let cursor = storage.get_cursor(&conversation.id).await?;
                println!(
                    "{}\t{}\tmembers={}\tmessages={}\trelays={}\tcursor={}",
                    conversation.id,
                    conversation.name,
                    conversation.members.len(),
                    conversation.message_count,
                    conversation.relays.join(","),
                    describe(cursor),
                );
            }
        }
        Command::Cursor { conversation_id } => {
            let storage = open(&settings).await?;
            let id = ConversationId::new(conversation_id);
            println!("{id}\t{}", describe(storage.get_cursor(&id).await?));
        }
        Command::ResetCursor { conversation_id } => {
            let storage = open(&settings).await?;
            let id = ConversationId::new(conversation_id);
            if storage.reset_cursor(&id).await? {
                info!(conversation_id = %id, "cursor reset");
            } else {
                println!("no cursor stored for {id}");
            }
        }
        Command::Invites => {
            let storage = open(&settings).await?;
            for envelope in storage.list_received().await? {
                println!("received\t{}\tcreated_at={}", envelope.id, envelope.created_at);
            }
            for invite in storage.list_unread().await? {
                println!(
                    "unread\t{}\tfrom={}\tgroup={}",
                    invite.envelope_id,
                    invite.rumor.pubkey,
                    invite.rumor.tag_value("name").unwrap_or("-"),
                );
            }
        }
        Command::KeyPackages => {
            let storage = open(&settings).await?;
            let pool = storage.list_key_packages().await?;
            for record in &pool {
                println!(
                    "{}\tevent={}\tpublished={}\tconsumed={}\tcreated_at={}",
                    record.id, record.advertisement.id, record.published, record.consumed, record.created_at,
                );
            }
            println!(
                "available={} of {}",
                storage.count_available_key_packages().await?,
                pool.len()
            );
        }
    }

    Ok(())
}
