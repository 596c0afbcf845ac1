//! SQLite storage for the Parley server.
//!
//! Persists registered usernames with their salted password hashes.

mod db;
mod models;
mod queries;


pub use db::UserDatabase;
pub use models::*;
pub use parley_core::db::DatabaseError;
pub use queries::InsertOutcome;
