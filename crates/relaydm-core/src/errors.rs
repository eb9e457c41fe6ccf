//! Error types for the relaydm core
//!
//! `CryptoError` covers key handling, the direct-message payload format and
//! event signatures. `CoreError` unifies it with serialization and framing
//! failures.

use thiserror::Error;

// ----------------------------------------------------------------------------
// Cryptographic Errors
// ----------------------------------------------------------------------------

/// Failures raised by the crypto primitives and event verification
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("Invalid secret key")]
    InvalidSecretKey,
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),
    #[error("Malformed encrypted payload: {0}")]
    MalformedPayload(String),
    #[error("Invalid base64 in encrypted payload")]
    InvalidBase64,
    #[error("Invalid IV length: expected 16 bytes, got {actual}")]
    InvalidIvLength { actual: usize },
    #[error("Invalid ciphertext length: {actual} bytes is not a positive multiple of the block size")]
    InvalidCiphertextLength { actual: usize },
    #[error("Invalid PKCS7 padding")]
    InvalidPadding,
    #[error("Decrypted content is not valid UTF-8")]
    InvalidUtf8,
    #[error("Signature verification failed")]
    InvalidSignature,
    #[error("Event id does not match its canonical hash")]
    IdMismatch,
}

// ----------------------------------------------------------------------------
// Core Error
// ----------------------------------------------------------------------------

/// Core error type for the relaydm protocol
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
}

impl CoreError {
    /// Create an invalid frame error
    pub fn invalid_frame<S: Into<String>>(reason: S) -> Self {
        Self::InvalidFrame(reason.into())
    }

    /// Create an invalid event error
    pub fn invalid_event<S: Into<String>>(reason: S) -> Self {
        Self::InvalidEvent(reason.into())
    }
}

pub type Result<T> = core::result::Result<T, CoreError>;
