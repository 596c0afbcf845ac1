//! Crypto error types.

/// Errors from symmetric encryption and decryption.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Authentication tag did not verify. The plaintext must not be used.
    #[error("Integrity check failed: message corrupted")]
    Integrity,

    #[error("Malformed padding: {0}")]
    Padding(String),

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Invalid nonce length: expected {expected}, got {actual}")]
    InvalidNonceLength { expected: usize, actual: usize },

    #[error("Invalid tag length: expected {expected}, got {actual}")]
    InvalidTagLength { expected: usize, actual: usize },
}

impl CryptoError {
    /// Integrity and padding failures are both "corrupted message" outcomes.
    pub const fn is_corruption(&self) -> bool {
        matches!(self, Self::Integrity | Self::Padding(_))
    }
}

/// Errors from the Diffie-Hellman exchange.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("Drew a degenerate secret exponent")]
    DegenerateSecret,

    #[error("Peer public value is outside [2, prime - 2]")]
    InvalidPublic,

    #[error("Derived shared secret is degenerate")]
    DegenerateSharedSecret,

    #[error("Peer offered a different modulus group")]
    GroupMismatch,

    #[error("Unexpected {step} while session is {phase}")]
    UnexpectedStep {
        step: &'static str,
        phase: &'static str,
    },
}

/// Errors loading the shared modulus group. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum GroupLoadError {
    #[error("Failed to read group file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse group file {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("Invalid modulus group: {0}")]
    Invalid(String),
}
