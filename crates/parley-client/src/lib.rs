//! Parley Client Library
//!
//! Datagram chat client: per-recipient sessions, handshake gates with bounded
//! retry, and a background listener.

pub mod client;
pub mod gate;
pub mod input;

pub use client::{Client, ClientError, Inbound};
pub use gate::{GateSet, HandshakeGate};
