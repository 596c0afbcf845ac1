//! Handshake gates.
//!
//! A gate is armed before each handshake the client initiates and released
//! when that handshake completes, fails, or is abandoned. Senders wait on
//! their peer's gate; the listener holds back unrelated deliveries while any
//! gate is armed.

use std::collections::HashMap;

use tokio::sync::{Mutex, Notify, watch};

use parley_proto::Identity;

/// One-shot signal, re-armed before each handshake.
#[derive(Debug)]
pub struct HandshakeGate {
    armed: watch::Sender<bool>,
}

impl Default for HandshakeGate {
    fn default() -> Self {
        Self::new()
    }
}

impl HandshakeGate {
    /// A released gate.
    pub fn new() -> Self {
        let (armed, _) = watch::channel(false);
        Self { armed }
    }

    pub fn arm(&self) {
        self.armed.send_replace(true);
    }

    pub fn release(&self) {
        self.armed.send_replace(false);
    }

    pub fn is_armed(&self) -> bool {
        *self.armed.borrow()
    }

    /// Receiver that observes this gate's state.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.armed.subscribe()
    }
}

/// Gates for every peer this client talks to.
#[derive(Debug, Default)]
pub struct GateSet {
    gates: Mutex<HashMap<Identity, HandshakeGate>>,
    released: Notify,
}

impl GateSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `peer`'s gate and return a receiver to wait on.
    pub async fn arm(&self, peer: &Identity) -> watch::Receiver<bool> {
        let mut gates = self.gates.lock().await;
        let gate = gates.entry(peer.clone()).or_default();
        gate.arm();
        gate.subscribe()
    }

    /// Release `peer`'s gate if it is armed.
    pub async fn release(&self, peer: &Identity) {
        let gates = self.gates.lock().await;
        if let Some(gate) = gates.get(peer) {
            if gate.is_armed() {
                gate.release();
                self.released.notify_one();
            }
        }
    }

    pub async fn is_armed(&self, peer: &Identity) -> bool {
        self.gates
            .lock()
            .await
            .get(peer)
            .is_some_and(HandshakeGate::is_armed)
    }

    pub async fn any_armed(&self) -> bool {
        self.gates.lock().await.values().any(HandshakeGate::is_armed)
    }

    /// Resolves after some gate has been released.
    pub async fn released(&self) {
        self.released.notified().await;
    }
}
