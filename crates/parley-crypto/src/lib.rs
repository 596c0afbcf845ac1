//! Parley crypto primitives
//!
//! Everything the messaging protocol needs below the envelope layer.
//!
//! ## Crypto primitives
//!
//! - **Group**: `(prime, generator)` loaded once from a JSON file
//! - **Exchange**: unauthenticated finite-field Diffie-Hellman → SHA3-256 → 32-byte key
//! - **Channel**: AES-256-GCM with detached tag, PKCS#7 padding to 16-byte blocks
//! - **Password**: SHA3-256 client hash, salted SHA3-256 on the server

pub mod channel;
pub mod error;
pub mod exchange;
pub mod group;
pub mod password;

pub use channel::{EncryptedData, NONCE_SIZE, SymmetricKey, TAG_SIZE};
pub use error::{CryptoError, GroupLoadError, HandshakeError};
#[cfg(any(test, feature = "test-utils"))]
pub use exchange::perform_key_exchange;
pub use exchange::{DhSecret, derive_key};
pub use group::ModulusGroup;
pub use num_bigint::BigUint;
