//! Credential handling for the Parley server.
//!
//! Register and login over an already established session.

pub mod credentials;

pub use credentials::{CredentialError, CredentialService};
