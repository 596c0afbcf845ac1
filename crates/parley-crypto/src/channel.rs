//! Authenticated symmetric channel.
//!
//! AES-256-GCM with a detached 16-byte tag. Plaintext is PKCS#7-padded to a
//! 16-byte block before sealing and unpadded after the tag verifies, so a
//! padding violation is only ever reported for an authentic ciphertext.
//! Nothing here outlives a single call; the session key is owned by the caller.

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce, Tag};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Symmetric key size (SHA3-256 digest length).
pub const KEY_SIZE: usize = 32;

/// Nonce size for AES-GCM.
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size.
pub const TAG_SIZE: usize = 16;

/// Padding block size.
pub const BLOCK_SIZE: usize = 16;

/// A derived session key. Never leaves the process.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_SIZE]);

impl SymmetricKey {
    pub const fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl PartialEq for SymmetricKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for SymmetricKey {}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// Sealed payload: meaningful only relative to the key that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedData {
    pub ciphertext: Vec<u8>,
    pub tag: Vec<u8>,
    pub nonce: Vec<u8>,
}

impl EncryptedData {
    /// Decrypt and verify with `key`.
    pub fn open(&self, key: &SymmetricKey) -> Result<Vec<u8>, CryptoError> {
        decrypt(key, &self.ciphertext, &self.tag, &self.nonce)
    }
}

/// Encrypt `plaintext` under `key`.
///
/// When `nonce` is `None` a random one is drawn and returned alongside the
/// ciphertext.
pub fn encrypt(
    key: &SymmetricKey,
    plaintext: &[u8],
    nonce: Option<&[u8]>,
) -> Result<EncryptedData, CryptoError> {
    let nonce_bytes = match nonce {
        Some(n) => checked_nonce(n)?,
        None => {
            let mut n = [0u8; NONCE_SIZE];
            OsRng.fill_bytes(&mut n);
            n
        }
    };

    let cipher = cipher_for(key)?;
    let mut buffer = pad(plaintext);
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&nonce_bytes), b"", &mut buffer)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    Ok(EncryptedData {
        ciphertext: buffer,
        tag: tag.to_vec(),
        nonce: nonce_bytes.to_vec(),
    })
}

/// Verify `tag` and decrypt.
///
/// A tag mismatch yields [`CryptoError::Integrity`]; unverified plaintext is
/// never returned.
pub fn decrypt(
    key: &SymmetricKey,
    ciphertext: &[u8],
    tag: &[u8],
    nonce: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let nonce_bytes = checked_nonce(nonce)?;
    if tag.len() != TAG_SIZE {
        return Err(CryptoError::InvalidTagLength {
            expected: TAG_SIZE,
            actual: tag.len(),
        });
    }

    let cipher = cipher_for(key)?;
    let mut buffer = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(&nonce_bytes),
            b"",
            &mut buffer,
            Tag::from_slice(tag),
        )
        .map_err(|_| CryptoError::Integrity)?;

    unpad(&buffer).map(<[u8]>::to_vec)
}

fn cipher_for(key: &SymmetricKey) -> Result<Aes256Gcm, CryptoError> {
    Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| CryptoError::InvalidKeyLength {
        expected: KEY_SIZE,
        actual: key.as_bytes().len(),
    })
}

fn checked_nonce(nonce: &[u8]) -> Result<[u8; NONCE_SIZE], CryptoError> {
    nonce
        .try_into()
        .map_err(|_| CryptoError::InvalidNonceLength {
            expected: NONCE_SIZE,
            actual: nonce.len(),
        })
}

/// PKCS#7 pad to a multiple of [`BLOCK_SIZE`]. Always adds at least one byte.
pub fn pad(data: &[u8]) -> Vec<u8> {
    let fill = BLOCK_SIZE - data.len() % BLOCK_SIZE;
    let mut out = Vec::with_capacity(data.len() + fill);
    out.extend_from_slice(data);
    #[allow(clippy::cast_possible_truncation)]
    out.resize(data.len() + fill, fill as u8);
    out
}

/// Strip PKCS#7 padding.
pub fn unpad(data: &[u8]) -> Result<&[u8], CryptoError> {
    if data.is_empty() || data.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::Padding(format!(
            "length {} is not a positive multiple of {BLOCK_SIZE}",
            data.len()
        )));
    }
    let fill = usize::from(data[data.len() - 1]);
    if fill == 0 || fill > BLOCK_SIZE {
        return Err(CryptoError::Padding(format!("bad fill byte {fill}")));
    }
    let (body, padding) = data.split_at(data.len() - fill);
    if padding.iter().any(|&b| usize::from(b) != fill) {
        return Err(CryptoError::Padding("inconsistent fill bytes".into()));
    }
    Ok(body)
}
