//! Error types for relay transport and the messaging engine

use relaydm_core::{CoreError, CryptoError};
use thiserror::Error;

use crate::connection::ConnectionStatus;
use relaydm_core::MessageStatus;

// ----------------------------------------------------------------------------
// Transport Errors
// ----------------------------------------------------------------------------

/// Failures of a single relay connection
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection to {relay} refused: {reason}")]
    ConnectionRefused { relay: String, reason: String },

    #[error("Connection to {relay} closed")]
    Closed { relay: String },

    #[error("Failed to send to {relay}: {reason}")]
    SendFailed { relay: String, reason: String },

    #[error("Relay {relay} timed out after {after_ms}ms")]
    Timeout { relay: String, after_ms: u64 },

    #[error("Invalid relay URL: {url}")]
    InvalidUrl { url: String },

    #[error("Relay {relay} cannot move from {from} to {to}")]
    InvalidState {
        relay: String,
        from: ConnectionStatus,
        to: ConnectionStatus,
    },
}

// ----------------------------------------------------------------------------
// Engine Errors
// ----------------------------------------------------------------------------

/// Errors surfaced by the pool, queue and DM controller
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error from {relay}: {reason}")]
    Protocol { relay: String, reason: String },

    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Message not found: {id}")]
    MessageNotFound { id: String },

    #[error("Message {id} is already being sent")]
    AlreadyInFlight { id: String },

    #[error("Message {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: MessageStatus,
        to: MessageStatus,
    },

    #[error("Controller not ready (status: {status})")]
    NotReady { status: String },

    #[error("Key error: {0}")]
    Key(String),
}

impl EngineError {
    /// Create a persistence error
    pub fn persistence<S: Into<String>>(reason: S) -> Self {
        Self::Persistence(reason.into())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Core(CoreError::Json(err))
    }
}

pub type Result<T> = core::result::Result<T, EngineError>;
