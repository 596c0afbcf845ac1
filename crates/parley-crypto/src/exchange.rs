//! Finite-field Diffie-Hellman exchange.
//!
//! The initiator draws a secret `a`, publishes `g^a mod p` together with the
//! group, and later folds the responder's `g^b` into `(g^b)^a mod p`. The
//! responder does the mirror computation in one step. Both sides hash the
//! big-endian shared secret once with SHA3-256; the digest is the session key.
//!
//! The exchange is unauthenticated. An active man-in-the-middle can sit on
//! both legs.

use num_bigint::{BigUint, RandBigInt};
use rand::rngs::OsRng;
use sha3::{Digest, Sha3_256};

use crate::channel::SymmetricKey;
use crate::error::HandshakeError;
use crate::group::ModulusGroup;

/// A private exponent. Kept out of `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct DhSecret(BigUint);

impl std::fmt::Debug for DhSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DhSecret(..)")
    }
}

/// Start an exchange: draw a secret and compute the public value to send.
pub fn initiate(group: &ModulusGroup) -> Result<(DhSecret, BigUint), HandshakeError> {
    let secret = draw_secret(group.prime())?;
    let public = group.generator().modpow(&secret.0, group.prime());
    Ok((secret, public))
}

/// Answer an exchange in one step.
///
/// Returns our secret, our public value for the reply, and the derived key.
pub fn respond(
    received_public: &BigUint,
    prime: &BigUint,
    generator: &BigUint,
) -> Result<(DhSecret, BigUint, SymmetricKey), HandshakeError> {
    validate_public(received_public, prime)?;
    let secret = draw_secret(prime)?;
    let public = generator.modpow(&secret.0, prime);
    let key = shared_key(&secret, prime, received_public)?;
    Ok((secret, public, key))
}

/// Complete the initiator side.
///
/// `local_prime` must be the prime this side put in its own init message;
/// the responder never gets to pick the modulus for the final step.
pub fn finalize(
    local_secret: &DhSecret,
    local_prime: &BigUint,
    received_public: &BigUint,
) -> Result<SymmetricKey, HandshakeError> {
    validate_public(received_public, local_prime)?;
    shared_key(local_secret, local_prime, received_public)
}

/// Hash a shared secret into a key: SHA3-256 over the minimal big-endian bytes.
pub fn derive_key(shared_secret: &BigUint) -> SymmetricKey {
    let digest: [u8; 32] = Sha3_256::digest(shared_secret.to_bytes_be()).into();
    SymmetricKey::new(digest)
}

fn shared_key(
    secret: &DhSecret,
    prime: &BigUint,
    peer_public: &BigUint,
) -> Result<SymmetricKey, HandshakeError> {
    let shared = peer_public.modpow(&secret.0, prime);
    if shared <= BigUint::from(1u32) {
        return Err(HandshakeError::DegenerateSharedSecret);
    }
    Ok(derive_key(&shared))
}

/// Uniform draw from `[1, prime - 1]`; `prime - 1` is refused rather than used.
fn draw_secret(prime: &BigUint) -> Result<DhSecret, HandshakeError> {
    let one = BigUint::from(1u32);
    let mut rng = OsRng;
    let secret = rng.gen_biguint_range(&one, prime);
    check_secret(secret, prime)
}

fn check_secret(secret: BigUint, prime: &BigUint) -> Result<DhSecret, HandshakeError> {
    let one = BigUint::from(1u32);
    if secret < one || secret >= prime - &one {
        return Err(HandshakeError::DegenerateSecret);
    }
    Ok(DhSecret(secret))
}

fn validate_public(public: &BigUint, prime: &BigUint) -> Result<(), HandshakeError> {
    let two = BigUint::from(2u32);
    if *public < two || *public > prime - &two {
        return Err(HandshakeError::InvalidPublic);
    }
    Ok(())
}

/// Run both halves locally and return `(initiator_key, responder_key)`.
#[cfg(any(test, feature = "test-utils"))]
pub fn perform_key_exchange(
    group: &ModulusGroup,
) -> Result<(SymmetricKey, SymmetricKey), HandshakeError> {
    let (a, public_a) = initiate(group)?;
    let (_b, public_b, responder_key) = respond(&public_a, group.prime(), group.generator())?;
    let initiator_key = finalize(&a, group.prime(), &public_b)?;
    Ok((initiator_key, responder_key))
}
