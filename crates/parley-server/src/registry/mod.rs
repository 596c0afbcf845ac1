//! Per-peer session registry.

mod sessions;

pub use sessions::{SessionHandle, SessionRegistry, is_reserved_username};
