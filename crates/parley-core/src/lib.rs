//! Parley Core Library
//!
//! Shared functionality for Parley components:
//! - Configuration resolution and hierarchy
//! - Tracing initialisation
//! - `SQLite` pool helpers and common error types

pub mod config;
pub mod db;
pub mod error;
pub mod tracing_init;

pub use config::{ClientConfig, Config, HandshakeRetryPolicy, ServerConfig};
pub use error::{Error, Result};
