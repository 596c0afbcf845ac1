//! Data models for Parley credential storage.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub username: String,
    pub password_hash: String,
    pub salt: String,
    pub created_at: i64,
}

/// The two values a login check needs.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct StoredCredentials {
    pub password_hash: String,
    pub salt: String,
}
