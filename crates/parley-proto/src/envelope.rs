//! Wire envelopes.
//!
//! Every datagram carries exactly one [`Envelope`], serialized with bincode.
//! Big integers travel as minimal big-endian byte strings; sealed payloads
//! carry their ciphertext, tag and nonce verbatim.

use std::fmt;
use std::net::SocketAddr;

use bincode::Options;
use num_bigint::BigUint;
use parley_crypto::EncryptedData;
use serde::{Deserialize, Serialize};

use crate::error::WireError;

/// Largest payload a single UDP datagram can carry over IPv4.
pub const MAX_ENVELOPE_SIZE: usize = 65_507;

/// Well-known identity of a server unless configured otherwise.
pub const DEFAULT_SERVER_IDENTITY: &str = "root";

/// Opaque peer identity: a network address, a username, or the server's name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity(String);

impl Identity {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse the identity as a socket address, if it is one.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.0.parse().ok()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<SocketAddr> for Identity {
    fn from(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }
}

impl From<&str> for Identity {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for Identity {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Message kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// Unencrypted control text.
    Plain { text: String },
    /// Handshake step 1: the initiator's group and public value.
    KeyExchangeInit {
        #[serde(with = "biguint_bytes")]
        prime: BigUint,
        #[serde(with = "biguint_bytes")]
        generator: BigUint,
        #[serde(with = "biguint_bytes")]
        public: BigUint,
    },
    /// Handshake acknowledgment; the responder is computing.
    KeyExchangeAccept,
    /// Handshake step 2: the responder's public value.
    KeyExchangeResponse {
        #[serde(with = "biguint_bytes")]
        public: BigUint,
    },
    Encrypted(EncryptedData),
    Login {
        username: EncryptedData,
        password_hash: EncryptedData,
    },
    Register {
        username: EncryptedData,
        password_hash: EncryptedData,
    },
}

impl Payload {
    pub fn plain(text: impl Into<String>) -> Self {
        Self::Plain { text: text.into() }
    }

    /// Short name for logs.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Plain { .. } => "Plain",
            Self::KeyExchangeInit { .. } => "KeyExchangeInit",
            Self::KeyExchangeAccept => "KeyExchangeAccept",
            Self::KeyExchangeResponse { .. } => "KeyExchangeResponse",
            Self::Encrypted(_) => "Encrypted",
            Self::Login { .. } => "Login",
            Self::Register { .. } => "Register",
        }
    }
}

/// Addressed message unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: Identity,
    pub recipient: Identity,
    pub payload: Payload,
}

impl Envelope {
    pub const fn new(sender: Identity, recipient: Identity, payload: Payload) -> Self {
        Self {
            sender,
            recipient,
            payload,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        wire_options()
            .serialize(self)
            .map_err(|e| WireError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        wire_options()
            .deserialize(bytes)
            .map_err(|e| WireError::Decode(e.to_string()))
    }
}

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_ENVELOPE_SIZE as u64)
}

mod biguint_bytes {
    use num_bigint::BigUint;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &BigUint, serializer: S) -> Result<S::Ok, S::Error> {
        value.to_bytes_be().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigUint, D::Error> {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        Ok(BigUint::from_bytes_be(&bytes))
    }
}
