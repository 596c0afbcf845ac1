//! Session and wire error types.

use parley_crypto::{CryptoError, HandshakeError};

/// Errors from per-peer session operations.
///
/// None of these are fatal; the dispatcher logs and drops.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("No session key established")]
    NotEstablished,

    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("Decrypted payload is not valid UTF-8")]
    InvalidUtf8,
}

impl SessionError {
    /// Tag or padding failure on an authentic-looking envelope.
    pub const fn is_corruption(&self) -> bool {
        match self {
            Self::Crypto(e) => e.is_corruption(),
            _ => false,
        }
    }
}

/// Envelope encode/decode errors.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("Failed to encode envelope: {0}")]
    Encode(String),

    #[error("Failed to decode envelope: {0}")]
    Decode(String),
}
