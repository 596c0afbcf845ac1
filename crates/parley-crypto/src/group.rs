//! Shared modulus group for the Diffie-Hellman exchange.
//!
//! Generating a safe prime and a primitive root is an offline job; the result
//! is persisted as JSON (`{"prime": "<hex>", "generator": "<hex>"}`) and loaded
//! once per process. Nothing in the protocol mutates it afterwards.

use std::path::Path;

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use crate::error::GroupLoadError;

/// RFC 3526 group 14 (2048-bit MODP), generator 2.
const RFC3526_2048_PRIME: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1",
    "29024E088A67CC74020BBEA63B139B22514A08798E3404DD",
    "EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245",
    "E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D",
    "C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F",
    "83655D23DCA3AD961C62F356208552BB9ED529077096966D",
    "670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B",
    "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9",
    "DE2BCBF6955817183995497CEA956AE515D2261898FA0510",
    "15728E5A8AACAA68FFFFFFFFFFFFFFFF",
);

/// `(prime, generator)` pair defining the multiplicative group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModulusGroup {
    prime: BigUint,
    generator: BigUint,
}

/// On-disk representation.
#[derive(Serialize, Deserialize)]
struct GroupFile {
    prime: String,
    generator: String,
}

impl ModulusGroup {
    /// Build a group, rejecting obviously unusable parameters.
    pub fn new(prime: BigUint, generator: BigUint) -> Result<Self, GroupLoadError> {
        let three = BigUint::from(3u32);
        let odd = prime.to_bytes_le().first().is_some_and(|b| b & 1 == 1);
        if prime <= three || !odd {
            return Err(GroupLoadError::Invalid(
                "prime must be odd and greater than 3".into(),
            ));
        }
        let two = BigUint::from(2u32);
        if generator < two || generator > &prime - &two {
            return Err(GroupLoadError::Invalid(
                "generator must lie in [2, prime - 2]".into(),
            ));
        }
        Ok(Self { prime, generator })
    }

    /// The 2048-bit MODP group from RFC 3526.
    pub fn rfc3526_2048() -> Self {
        let prime = BigUint::parse_bytes(RFC3526_2048_PRIME.as_bytes(), 16).unwrap_or_default();
        Self {
            prime,
            generator: BigUint::from(2u32),
        }
    }

    /// Small Mersenne-prime group (2^127 - 1). Fast, and far too weak for real use.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn test_group() -> Self {
        let prime = (BigUint::from(1u32) << 127usize) - BigUint::from(1u32);
        Self {
            prime,
            generator: BigUint::from(3u32),
        }
    }

    pub fn prime(&self) -> &BigUint {
        &self.prime
    }

    pub fn generator(&self) -> &BigUint {
        &self.generator
    }

    /// Load a group file. A missing or malformed file is fatal.
    pub fn load(path: &Path) -> Result<Self, GroupLoadError> {
        let display = path.display().to_string();
        let content = std::fs::read_to_string(path).map_err(|source| GroupLoadError::Io {
            path: display.clone(),
            source,
        })?;
        let file: GroupFile =
            serde_json::from_str(&content).map_err(|e| GroupLoadError::Parse {
                path: display.clone(),
                reason: e.to_string(),
            })?;

        let prime = parse_hex(&file.prime).ok_or_else(|| GroupLoadError::Parse {
            path: display.clone(),
            reason: "prime is not a hex integer".into(),
        })?;
        let generator = parse_hex(&file.generator).ok_or_else(|| GroupLoadError::Parse {
            path: display,
            reason: "generator is not a hex integer".into(),
        })?;

        Self::new(prime, generator)
    }

    /// Write the group in the format `load` reads.
    pub fn save(&self, path: &Path) -> Result<(), GroupLoadError> {
        let file = GroupFile {
            prime: self.prime.to_str_radix(16),
            generator: self.generator.to_str_radix(16),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| GroupLoadError::Invalid(e.to_string()))?;
        std::fs::write(path, json).map_err(|source| GroupLoadError::Io {
            path: path.display().to_string(),
            source,
        })
    }
}

fn parse_hex(s: &str) -> Option<BigUint> {
    let trimmed = s.trim().trim_start_matches("0x");
    BigUint::parse_bytes(trimmed.as_bytes(), 16)
}
