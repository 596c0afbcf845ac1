//! Datagram client.
//!
//! Keeps one [`PeerSession`] per correspondent, keyed by the identity the
//! server shows for them. The interactive send path and a background listener
//! share that map; a per-peer [`GateSet`] lets a sender wait for its handshake
//! to finish while the listener holds back unrelated deliveries.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use parley_core::config::{ClientConfig, HandshakeRetryPolicy};
use parley_crypto::ModulusGroup;
use parley_crypto::password::client_password_hash;
use parley_proto::{
    CredentialKind, Envelope, HandshakeProgress, Identity, Payload, PeerSession, Phase,
    SessionError, WireError,
};

use crate::gate::GateSet;

/// Greeting sent on connect so the server creates our session up front.
const GREETING: &str = "New Client";

/// Capacity of the inbound event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

const RECV_BUFFER_BYTES: usize = 65_536;

/// Something the listener surfaces to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Decrypted message text.
    Text { from: Identity, text: String },
    /// Unencrypted control text.
    Notice { from: Identity, text: String },
    /// A sealed message failed verification and was dropped.
    Corrupted { from: Identity },
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Handshake with {peer} not completed after {attempts} attempts")]
    HandshakeTimeout { peer: Identity, attempts: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Listener stopped")]
    Closed,
}

/// State shared between the send path and the listener.
struct Shared {
    socket: UdpSocket,
    server_addr: SocketAddr,
    local: Identity,
    group: Arc<ModulusGroup>,
    sessions: Mutex<HashMap<Identity, PeerSession>>,
    gates: GateSet,
}

impl Shared {
    async fn send(&self, recipient: &Identity, payload: Payload) -> Result<(), ClientError> {
        let envelope = Envelope::new(self.local.clone(), recipient.clone(), payload);
        self.socket
            .send_to(&envelope.encode()?, self.server_addr)
            .await?;
        Ok(())
    }

    fn new_session(&self, peer: &Identity) -> PeerSession {
        PeerSession::new(peer.clone(), Arc::clone(&self.group))
    }

    /// Apply one inbound envelope. Returns what to surface to the user.
    async fn receive(&self, envelope: Envelope) -> Option<Inbound> {
        let from = envelope.sender;
        match envelope.payload {
            Payload::Plain { text } => Some(Inbound::Notice { from, text }),
            payload @ (Payload::KeyExchangeInit { .. }
            | Payload::KeyExchangeAccept
            | Payload::KeyExchangeResponse { .. }) => {
                self.receive_handshake(&from, &payload).await;
                None
            }
            Payload::Encrypted(data) => {
                let sessions = self.sessions.lock().await;
                let Some(session) = sessions.get(&from) else {
                    warn!(peer = %from, "Sealed message from unknown peer, dropping");
                    return None;
                };
                match session.open_text(&data) {
                    Ok(text) => Some(Inbound::Text { from, text }),
                    Err(e) if e.is_corruption() => {
                        warn!(peer = %from, error = %e, "Message corrupted, dropping");
                        Some(Inbound::Corrupted { from })
                    }
                    Err(e) => {
                        warn!(peer = %from, error = %e, "Dropping sealed message");
                        None
                    }
                }
            }
            other @ (Payload::Login { .. } | Payload::Register { .. }) => {
                warn!(peer = %from, kind = other.kind(), "Unexpected credential envelope");
                None
            }
        }
    }

    async fn receive_handshake(&self, from: &Identity, payload: &Payload) {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .entry(from.clone())
            .or_insert_with(|| self.new_session(from));

        match session.on_handshake(payload) {
            Ok(HandshakeProgress::Responded(replies)) => {
                for reply in replies {
                    if let Err(e) = self.send(from, reply).await {
                        warn!(peer = %from, error = %e, "Failed to answer key exchange");
                    }
                }
                info!(peer = %from, "Key exchange completed as responder");
                self.gates.release(from).await;
            }
            Ok(HandshakeProgress::PeerAccepted) => {
                debug!(peer = %from, "Peer accepted key exchange");
            }
            Ok(HandshakeProgress::Completed) => {
                info!(peer = %from, "Key exchange completed");
                self.gates.release(from).await;
            }
            Err(e) => {
                warn!(peer = %from, error = %e, phase = %session.phase(), "Key exchange step rejected");
                if session.phase() == Phase::Idle {
                    self.gates.release(from).await;
                }
            }
        }
    }
}

pub struct Client {
    shared: Arc<Shared>,
    server_identity: Identity,
    recipient: Identity,
    policy: HandshakeRetryPolicy,
    listener: JoinHandle<()>,
}

impl Drop for Client {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

impl Client {
    /// Bind an ephemeral socket, greet the server and start the listener.
    ///
    /// The current recipient starts out as the server.
    pub async fn connect(
        config: &ClientConfig,
        group: Arc<ModulusGroup>,
    ) -> Result<(Self, mpsc::Receiver<Inbound>), ClientError> {
        let socket = UdpSocket::bind(config.bind_addr).await?;
        let local_addr = socket.local_addr()?;
        let server_identity = Identity::new(config.server_identity.clone());

        let shared = Arc::new(Shared {
            socket,
            server_addr: config.server_addr,
            local: Identity::from(local_addr),
            group,
            sessions: Mutex::new(HashMap::new()),
            gates: GateSet::new(),
        });

        shared.send(&server_identity, Payload::plain(GREETING)).await?;
        info!(local = %local_addr, server = %config.server_addr, "Connected");

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let listener = tokio::spawn(listen(Arc::clone(&shared), events_tx));

        let client = Self {
            shared,
            recipient: server_identity.clone(),
            server_identity,
            policy: config.handshake.clone(),
            listener,
        };
        Ok((client, events_rx))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ClientError> {
        Ok(self.shared.socket.local_addr()?)
    }

    pub const fn recipient(&self) -> &Identity {
        &self.recipient
    }

    pub const fn server_identity(&self) -> &Identity {
        &self.server_identity
    }

    /// Switch the current recipient. Existing sessions are kept.
    pub fn set_recipient(&mut self, recipient: impl Into<Identity>) {
        self.recipient = recipient.into();
        debug!(recipient = %self.recipient, "Recipient changed");
    }

    /// Whether a key is held for `peer`.
    pub async fn is_established(&self, peer: &Identity) -> bool {
        self.shared
            .sessions
            .lock()
            .await
            .get(peer)
            .is_some_and(PeerSession::is_established)
    }

    /// Seal `text` for the current recipient, handshaking first if needed.
    pub async fn send_text(&self, text: &str) -> Result<(), ClientError> {
        let peer = self.recipient.clone();
        self.ensure_key(&peer).await?;

        let payload = {
            let sessions = self.shared.sessions.lock().await;
            let session = sessions.get(&peer).ok_or(SessionError::NotEstablished)?;
            session.seal_text(text)?
        };
        self.shared.send(&peer, payload).await
    }

    pub async fn register(&self, username: &str, password: &str) -> Result<(), ClientError> {
        self.submit_credentials(CredentialKind::Register, username, password)
            .await
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<(), ClientError> {
        self.submit_credentials(CredentialKind::Login, username, password)
            .await
    }

    async fn submit_credentials(
        &self,
        kind: CredentialKind,
        username: &str,
        password: &str,
    ) -> Result<(), ClientError> {
        let server = self.server_identity.clone();
        self.ensure_key(&server).await?;

        let hash = client_password_hash(password);
        let payload = {
            let sessions = self.shared.sessions.lock().await;
            let session = sessions.get(&server).ok_or(SessionError::NotEstablished)?;
            session.seal_credentials(kind, username, &hash)?
        };
        self.shared.send(&server, payload).await
    }

    /// Make sure a key exists for `peer`, running a bounded handshake if not.
    ///
    /// Each attempt sends a fresh init and waits for the gate with backoff.
    /// A peer that initiates concurrently also satisfies the wait.
    async fn ensure_key(&self, peer: &Identity) -> Result<(), ClientError> {
        let mut attempt = 0;
        while self.policy.should_retry(attempt) {
            let mut released = {
                let mut sessions = self.shared.sessions.lock().await;
                let session = sessions
                    .entry(peer.clone())
                    .or_insert_with(|| self.shared.new_session(peer));
                if session.is_established() {
                    return Ok(());
                }
                let init = session.begin_exchange().map_err(SessionError::from)?;
                let released = self.shared.gates.arm(peer).await;
                if let Err(e) = self.shared.send(peer, init).await {
                    self.shared.gates.release(peer).await;
                    warn!(peer = %peer, error = %e, "Failed to send key exchange init");
                    return Err(e);
                }
                released
            };

            let wait = self.policy.delay_for_attempt(attempt);
            let outcome = tokio::time::timeout(wait, released.wait_for(|armed| !*armed)).await;
            match outcome {
                Ok(Ok(_)) => {
                    if self.is_established(peer).await {
                        return Ok(());
                    }
                    debug!(peer = %peer, attempt, "Handshake failed, retrying");
                }
                Ok(Err(_)) => return Err(ClientError::Closed),
                Err(_) => warn!(peer = %peer, attempt, ?wait, "Handshake timed out, retrying"),
            }
            attempt += 1;
        }

        self.shared.gates.release(peer).await;
        warn!(peer = %peer, attempts = attempt, "Handshake abandoned");
        Err(ClientError::HandshakeTimeout {
            peer: peer.clone(),
            attempts: attempt,
        })
    }
}

/// Background receive loop.
async fn listen(shared: Arc<Shared>, events: mpsc::Sender<Inbound>) {
    let mut buf = vec![0u8; RECV_BUFFER_BYTES];
    let mut held: VecDeque<Inbound> = VecDeque::new();

    loop {
        tokio::select! {
            received = shared.socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => {
                    if from != shared.server_addr {
                        debug!(from = %from, "Ignoring datagram from non-server address");
                        continue;
                    }
                    let envelope = match Envelope::decode(&buf[..len]) {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            warn!(error = %e, "Dropping undecodable datagram");
                            continue;
                        }
                    };
                    if let Some(event) = shared.receive(envelope).await {
                        held.push_back(event);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "UDP receive failed; retrying");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            () = shared.gates.released() => {}
        }

        if !held.is_empty() && !shared.gates.any_armed().await {
            while let Some(event) = held.pop_front() {
                if events.send(event).await.is_err() {
                    debug!("Event receiver dropped, stopping listener");
                    return;
                }
            }
        }
    }
}
