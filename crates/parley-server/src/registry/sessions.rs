//! In-memory session registry.
//!
//! Sessions are keyed by the source address they were first seen from and
//! live for the lifetime of the process. A successful login binds a username
//! to that address in a side directory; the session key never changes.
//!
//! Usernames, peer addresses and the server's own identity share one
//! namespace on the wire. A username may be neither of the other two.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use parley_crypto::ModulusGroup;
use parley_proto::{Identity, PeerSession};

/// Exclusive handle to one peer's session.
///
/// Hold the lock for the whole of one envelope's handling.
pub type SessionHandle = Arc<Mutex<PeerSession>>;

/// Whether `name` cannot be used as a username: empty, the server's own
/// identity, or something that reads as a peer address.
pub fn is_reserved_username(name: &str, server_identity: &Identity) -> bool {
    name.is_empty() || name == server_identity.as_str() || name.parse::<SocketAddr>().is_ok()
}

#[derive(Default)]
struct Directory {
    by_username: HashMap<String, Identity>,
    by_address: HashMap<Identity, String>,
}

/// Thread-safe registry of peer sessions.
#[derive(Clone)]
pub struct SessionRegistry {
    server_identity: Identity,
    group: Arc<ModulusGroup>,
    sessions: Arc<RwLock<HashMap<Identity, SessionHandle>>>,
    directory: Arc<RwLock<Directory>>,
}

impl SessionRegistry {
    pub fn new(server_identity: Identity, group: Arc<ModulusGroup>) -> Self {
        Self {
            server_identity,
            group,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            directory: Arc::new(RwLock::new(Directory::default())),
        }
    }

    /// Fetch the session for `identity`, creating an idle one on first contact.
    ///
    /// Creation happens under the write lock, so concurrent first contacts
    /// from the same identity all receive the same session.
    pub async fn get_or_create(&self, identity: &Identity) -> SessionHandle {
        if let Some(existing) = self.sessions.read().await.get(identity) {
            return Arc::clone(existing);
        }

        let mut sessions = self.sessions.write().await;
        let handle = sessions.entry(identity.clone()).or_insert_with(|| {
            info!(peer = %identity, "Session created");
            Arc::new(Mutex::new(PeerSession::new(
                identity.clone(),
                Arc::clone(&self.group),
            )))
        });
        Arc::clone(handle)
    }

    pub async fn get(&self, identity: &Identity) -> Option<SessionHandle> {
        self.sessions.read().await.get(identity).cloned()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Point `username` at `address`. A later login under the same name from
    /// another address takes the name over.
    ///
    /// Returns `false`, binding nothing, for a reserved name.
    pub async fn bind_username(&self, username: &str, address: &Identity) -> bool {
        if is_reserved_username(username, &self.server_identity) {
            warn!(username = %username, peer = %address, "Refusing to bind reserved username");
            return false;
        }
        let mut dir = self.directory.write().await;
        if let Some(previous) = dir.by_username.insert(username.to_string(), address.clone()) {
            if &previous != address {
                dir.by_address.remove(&previous);
                info!(username = %username, from = %previous, to = %address, "Username rebound");
            }
        }
        if let Some(old_name) = dir.by_address.insert(address.clone(), username.to_string()) {
            if old_name != username {
                dir.by_username.remove(&old_name);
            }
        }
        info!(username = %username, peer = %address, "Username bound");
        true
    }

    /// Resolve a recipient to the address-keyed identity of a known session.
    ///
    /// The server's own identity never resolves to a peer.
    pub async fn resolve(&self, recipient: &Identity) -> Option<Identity> {
        if recipient == &self.server_identity {
            return None;
        }
        if self.sessions.read().await.contains_key(recipient) {
            return Some(recipient.clone());
        }
        if is_reserved_username(recipient.as_str(), &self.server_identity) {
            return None;
        }
        self.directory
            .read()
            .await
            .by_username
            .get(recipient.as_str())
            .cloned()
    }

    /// Name a source address is shown as to other peers: its username once
    /// logged in, otherwise the address itself.
    pub async fn public_identity(&self, address: &Identity) -> Identity {
        self.directory
            .read()
            .await
            .by_address
            .get(address)
            .map_or_else(|| address.clone(), |name| Identity::new(name.clone()))
    }
}
