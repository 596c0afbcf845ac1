//! Parley wire protocol
//!
//! This crate contains:
//! - `Envelope` and `Payload`, the bincode-encoded datagram format
//! - `PeerSession`, the per-correspondent handshake and credential state machine
//! - `SessionError` and `WireError`

pub mod envelope;
pub mod error;
pub mod session;

pub use envelope::{DEFAULT_SERVER_IDENTITY, Envelope, Identity, MAX_ENVELOPE_SIZE, Payload};
pub use error::{SessionError, WireError};
pub use session::{
    CredentialFlow, CredentialKind, CredentialSubmission, HandshakeProgress, Phase, PeerSession,
};
