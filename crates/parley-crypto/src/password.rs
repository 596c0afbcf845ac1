//! Password hashing for the credential flow.
//!
//! Clients never send a plaintext password: they send the hex SHA3-256 of it
//! inside an encrypted envelope. The server salts that value with a random
//! 64-bit integer (rendered as decimal text) and stores the hex SHA3-256 of
//! `client_hash || salt`.

use rand::RngCore;
use rand::rngs::OsRng;
use sha3::{Digest, Sha3_256};
use subtle::ConstantTimeEq;

/// Client-side, unsalted hash of a password.
pub fn client_password_hash(password: &str) -> String {
    hex::encode(Sha3_256::digest(password.as_bytes()))
}

/// Fresh random salt.
pub fn generate_salt() -> String {
    OsRng.next_u64().to_string()
}

/// Server-side salted hash of a client password hash.
pub fn salted_hash(password_hash: &str, salt: &str) -> String {
    let mut hasher = Sha3_256::new();
    hasher.update(password_hash.as_bytes());
    hasher.update(salt.as_bytes());
    hex::encode(hasher.finalize())
}

/// Check a submitted client hash against a stored salted hash.
pub fn verify_salted(password_hash: &str, salt: &str, stored_hash: &str) -> bool {
    constant_time_str_eq(&salted_hash(password_hash, salt), stored_hash)
}

/// Constant-time string comparison.
pub fn constant_time_str_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
