//! Database queries for the credential store.

use parley_core::db::{DatabaseError, is_unique_violation, unix_timestamp};

use super::db::UserDatabase;
use super::models::{StoredCredentials, User};

/// Outcome of an insert-if-absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    DuplicateUsername,
}

impl UserDatabase {
    /// Insert a new user. The primary key makes this an atomic
    /// insert-if-absent; an existing row is left untouched.
    pub async fn insert_credentials(
        &self,
        username: &str,
        password_hash: &str,
        salt: &str,
    ) -> Result<InsertOutcome, DatabaseError> {
        let result = sqlx::query(
            "INSERT INTO users (username, password_hash, salt, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(username)
        .bind(password_hash)
        .bind(salt)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await;

        match result {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(e) if is_unique_violation(&e) => Ok(InsertOutcome::DuplicateUsername),
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch the stored hash and salt for `username`.
    pub async fn lookup_credentials(
        &self,
        username: &str,
    ) -> Result<Option<StoredCredentials>, DatabaseError> {
        let row = sqlx::query_as::<_, StoredCredentials>(
            "SELECT password_hash, salt FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    /// Get a full user row.
    pub async fn get_user(&self, username: &str) -> Result<User, DatabaseError> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("User {username}")))
    }

    pub async fn user_count(&self) -> Result<i64, DatabaseError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users")
            .fetch_one(self.pool())
            .await?;
        Ok(count)
    }
}
