//! Parley Server Library
//!
//! Core functionality for the Parley server:
//! - Session registry keyed by peer address, with a username directory
//! - Dispatcher for handshakes, sealed messages, credentials and relay
//! - SQLite credential store
//! - UDP serve loop

pub mod auth;
pub mod dispatcher;
pub mod registry;
pub mod storage;
pub mod transport;

pub use dispatcher::{Dispatcher, Outbound};
pub use registry::SessionRegistry;
pub use transport::serve;
