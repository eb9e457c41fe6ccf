//! Command handlers for the relaydm CLI

use std::path::PathBuf;

use tokio::sync::broadcast;
use tracing::{info, warn};

use relaydm_core::{Keys, Message, MessageStatus, Timestamp};
use relaydm_nostr::{DmNotification, DmSnapshot};

use crate::app::RelaydmApp;
use crate::cli::Commands;
use crate::config::AppConfig;
use crate::error::{CliError, Result};

/// Default window for `sync` without `--since`
const DEFAULT_SYNC_WINDOW_SECS: u64 = 60 * 60 * 24;

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command
    pub async fn execute(
        command: Commands,
        config: AppConfig,
        config_path: Option<PathBuf>,
    ) -> Result<()> {
        if let Commands::Keygen { save } = command {
            return Self::handle_keygen_command(config, config_path, save);
        }

        let mut app = RelaydmApp::new(config).await?;
        let result = match command {
            Commands::Keygen { .. } => Ok(()),
            Commands::Send { to, message } => Self::handle_send_command(&mut app, &to, &message).await,
            Commands::Listen => Self::handle_listen_command(&mut app).await,
            Commands::Sync { since } => Self::handle_sync_command(&mut app, since).await,
            Commands::Retry { id } => Self::handle_retry_command(&mut app, &id).await,
            Commands::Flush => Self::handle_flush_command(&mut app).await,
            Commands::Status { json } => Self::handle_status_command(&mut app, json).await,
            Commands::Conversation { peer } => Self::handle_conversation_command(&app, &peer).await,
        };
        app.stop().await;
        result
    }

    /// Generate keys and optionally store them in the configuration file
    fn handle_keygen_command(
        mut config: AppConfig,
        config_path: Option<PathBuf>,
        save: bool,
    ) -> Result<()> {
        let keys = Keys::generate();
        println!("Public key: {}", keys.public_key_hex());

        if save {
            let path = config_path.ok_or_else(|| {
                CliError::Config("no configuration path available to save to".into())
            })?;
            config.secret_key = Some(keys.secret_key_hex());
            config.save_to_file(&path)?;
            println!("Secret key saved to {}", path.display());
        } else {
            println!("Secret key: {}", keys.secret_key_hex());
        }
        Ok(())
    }

    async fn handle_send_command(app: &mut RelaydmApp, to: &str, message: &str) -> Result<()> {
        app.start().await?;
        let result = app.controller().send_dm(to, message).await;

        match (&result.message_id, result.status) {
            (Some(id), Some(MessageStatus::Queued)) => {
                println!("Message {} queued: {}", id, result.error.as_deref().unwrap_or("no relay accepted it"));
                Ok(())
            }
            (Some(id), Some(status)) if result.success => {
                println!("Message {} {}", id, status);
                if let Some(error) = &result.error {
                    warn!("Message {} sent but not recorded: {}", id, error);
                }
                Ok(())
            }
            _ => Err(CliError::Command(format!(
                "failed to send message: {}",
                result.error.as_deref().unwrap_or("unknown error")
            ))),
        }
    }

    async fn handle_listen_command(app: &mut RelaydmApp) -> Result<()> {
        app.start().await?;
        let controller = app.controller();
        let mut notifications = controller.notifications();
        controller.subscribe_to_incoming_dms().await?;

        if let Some(pubkey) = controller.public_key().await {
            println!("Listening for messages to {} (Ctrl+C to stop)", pubkey);
        }

        loop {
            tokio::select! {
                notification = notifications.recv() => match notification {
                    Ok(DmNotification::MessageReceived(message)) => {
                        println!("{}", format_message(&message));
                    }
                    Ok(DmNotification::MessageStatusChanged(message)) => {
                        println!("Message {} is now {}", message.id, message.status);
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Missed {} notification(s)", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted, shutting down");
                    break;
                }
            }
        }
        Ok(())
    }

    async fn handle_sync_command(app: &mut RelaydmApp, since: Option<u64>) -> Result<()> {
        app.start().await?;
        let since = since
            .map(Timestamp::from_secs)
            .unwrap_or_else(|| Timestamp::now().saturating_sub_secs(DEFAULT_SYNC_WINDOW_SECS));

        let report = app.controller().sync_missed_messages(since).await?;
        println!(
            "Queried {} relay(s): {} fetched, {} new, {} duplicate, {} dropped",
            report.relays_queried, report.fetched, report.merged, report.duplicates, report.dropped
        );
        Ok(())
    }

    async fn handle_retry_command(app: &mut RelaydmApp, id: &str) -> Result<()> {
        app.start().await?;
        let message = app.controller().retry_failed_message(id).await?;
        println!("Message {} is now {}", message.id, message.status);
        Ok(())
    }

    async fn handle_flush_command(app: &mut RelaydmApp) -> Result<()> {
        app.start().await?;
        let report = app.controller().flush_offline_queue().await?;
        println!(
            "Attempted {}: {} accepted, {} rejected, {} still queued, {} skipped",
            report.attempted, report.accepted, report.rejected, report.still_queued, report.skipped
        );
        Ok(())
    }

    async fn handle_status_command(app: &mut RelaydmApp, json: bool) -> Result<()> {
        app.start().await?;
        let snapshot = app.controller().snapshot().await;

        if json {
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        } else {
            if let Some(pubkey) = app.controller().public_key().await {
                println!("Public key: {}", pubkey);
            }
            print!("{}", format_status(&snapshot));
        }
        Ok(())
    }

    async fn handle_conversation_command(app: &RelaydmApp, peer: &str) -> Result<()> {
        let conversation = app.controller().conversation_with(peer).await?;
        let messages = app.controller().get_messages_by_conversation(&conversation).await;

        if messages.is_empty() {
            println!("No messages with {}", peer);
        }
        for message in &messages {
            println!("{}", format_message(message));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Formatting
// ----------------------------------------------------------------------------

/// One-line rendering of a message
pub fn format_message(message: &Message) -> String {
    let direction = if message.is_outgoing { "->" } else { "<-" };
    let peer = message.peer.get(..8).unwrap_or(&message.peer);
    format!(
        "[{}] {} {} ({}): {}",
        message.timestamp, direction, peer, message.status, message.content
    )
}

/// Multi-line status summary
pub fn format_status(snapshot: &DmSnapshot) -> String {
    let network = &snapshot.network_state;
    let mut out = format!(
        "Status: {}\nRelays: {}/{} connected\n",
        snapshot.status, network.connected_relays, network.total_relays
    );
    for relay in &network.relays {
        out.push_str(&format!("  {} {:?} ({:?})\n", relay.url, relay.status, relay.health));
    }

    let count = |status: MessageStatus| {
        snapshot
            .messages
            .iter()
            .filter(|message| message.status == status)
            .count()
    };
    out.push_str(&format!(
        "Messages: {} total, {} delivered, {} accepted, {} queued, {} rejected\n",
        snapshot.messages.len(),
        count(MessageStatus::Delivered),
        count(MessageStatus::Accepted),
        count(MessageStatus::Queued),
        count(MessageStatus::Rejected),
    ));
    out
}
