//! Command-line interface definitions and parsing

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long, env = "RELAYDM_CONFIG")]
    pub config: Option<String>,

    /// Data directory for the message store
    #[arg(short, long)]
    pub data_dir: Option<String>,

    /// Relay URL to use instead of the configured set (repeatable)
    #[arg(short, long = "relay")]
    pub relays: Vec<String>,

    /// Use only a local relay at ws://localhost:7777
    #[arg(long)]
    pub local_relay: bool,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Generate a new key pair
    Keygen {
        /// Store the secret key in the configuration file
        #[arg(long)]
        save: bool,
    },
    /// Send one direct message and exit
    Send {
        /// Recipient public key (hex)
        #[arg(short, long)]
        to: String,
        /// Message content
        message: String,
    },
    /// Print incoming direct messages until interrupted
    Listen,
    /// Fetch messages missed while offline
    Sync {
        /// Unix timestamp to sync from (defaults to 24 hours ago)
        #[arg(long)]
        since: Option<u64>,
    },
    /// Retry a rejected or queued message
    Retry {
        /// Message id (hex)
        id: String,
    },
    /// Replay every queued message
    Flush,
    /// Show connection and message status
    Status {
        /// Print the full snapshot as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the conversation with a peer
    Conversation {
        /// Peer public key (hex)
        peer: String,
    },
}
