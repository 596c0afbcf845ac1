//! Register/login against the credential store.
//!
//! Both operations receive the client's unsalted password hash, already
//! decrypted from the peer's session.

use tracing::{info, instrument, warn};

use parley_crypto::password;
use parley_proto::{CredentialKind, CredentialSubmission, Identity};

use crate::registry::is_reserved_username;
use crate::storage::{DatabaseError, InsertOutcome, UserDatabase};

pub const REGISTERED: &str = "Successfully Registered.";
pub const ALREADY_REGISTERED: &str = "Username Already Registered.";
pub const LOGIN_SUCCESSFUL: &str = "Login Successful.";
pub const LOGIN_FAILED: &str = "Login Failed.";
pub const REGISTRATION_FAILED: &str = "Registration Failed.";

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("Username already registered")]
    DuplicateUsername,

    /// Unknown username and wrong password are indistinguishable.
    #[error("Invalid credentials")]
    CredentialMismatch,

    /// Empty, the server's identity, or shaped like a peer address.
    #[error("Username is reserved")]
    ReservedUsername,

    #[error("Credential store error: {0}")]
    Database(#[from] DatabaseError),
}

impl CredentialError {
    /// Reply text sent back to the peer for a failed `kind` submission.
    pub const fn reply_text(&self, kind: CredentialKind) -> &'static str {
        match (self, kind) {
            (Self::DuplicateUsername, _) => ALREADY_REGISTERED,
            (_, CredentialKind::Login) => LOGIN_FAILED,
            (_, CredentialKind::Register) => REGISTRATION_FAILED,
        }
    }
}

#[derive(Clone)]
pub struct CredentialService {
    db: UserDatabase,
    server_identity: Identity,
}

impl CredentialService {
    pub const fn new(db: UserDatabase, server_identity: Identity) -> Self {
        Self {
            db,
            server_identity,
        }
    }

    fn check_username(&self, username: &str) -> Result<(), CredentialError> {
        if is_reserved_username(username, &self.server_identity) {
            warn!(username = %username, "Reserved username refused");
            return Err(CredentialError::ReservedUsername);
        }
        Ok(())
    }

    /// Salt and store a new user.
    #[instrument(skip(self, password_hash), fields(op = "Register"))]
    pub async fn register(
        &self,
        username: &str,
        password_hash: &str,
    ) -> Result<(), CredentialError> {
        self.check_username(username)?;
        let salt = password::generate_salt();
        let hash = password::salted_hash(password_hash, &salt);

        match self.db.insert_credentials(username, &hash, &salt).await? {
            InsertOutcome::Inserted => {
                info!(username = %username, "User registered");
                Ok(())
            }
            InsertOutcome::DuplicateUsername => {
                warn!(username = %username, "Registration for taken username");
                Err(CredentialError::DuplicateUsername)
            }
        }
    }

    /// Check a login against the stored salted hash.
    #[instrument(skip(self, password_hash), fields(op = "Login"))]
    pub async fn login(
        &self,
        username: &str,
        password_hash: &str,
    ) -> Result<(), CredentialError> {
        self.check_username(username)?;
        let Some(stored) = self.db.lookup_credentials(username).await? else {
            warn!(username = %username, "Failed login attempt");
            return Err(CredentialError::CredentialMismatch);
        };

        if !password::verify_salted(password_hash, &stored.salt, &stored.password_hash) {
            warn!(username = %username, "Failed login attempt");
            return Err(CredentialError::CredentialMismatch);
        }

        info!(username = %username, "User logged in");
        Ok(())
    }

    /// Run a submission and return the success reply text for the peer.
    pub async fn process(
        &self,
        submission: &CredentialSubmission,
    ) -> Result<&'static str, CredentialError> {
        match submission.kind {
            CredentialKind::Register => self
                .register(&submission.username, &submission.password_hash)
                .await
                .map(|()| REGISTERED),
            CredentialKind::Login => self
                .login(&submission.username, &submission.password_hash)
                .await
                .map(|()| LOGIN_SUCCESSFUL),
        }
    }
}
