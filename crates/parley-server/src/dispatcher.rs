//! Inbound envelope routing.
//!
//! Each datagram is decoded once and either handled locally, when addressed
//! to the server's own identity, or relayed untouched to the peer it names.
//! Every error below this point is logged and the datagram dropped; nothing
//! propagates to the serve loop.

use std::net::SocketAddr;

use tracing::{debug, error, info, instrument, warn};

use parley_proto::{
    CredentialKind, CredentialSubmission, Envelope, HandshakeProgress, Identity, Payload,
    PeerSession, SessionError,
};

use crate::auth::{CredentialError, CredentialService};
use crate::registry::SessionRegistry;

/// Greeting a client sends so its session exists before the first handshake.
pub const NEW_CLIENT_GREETING: &str = "New Client";

/// A datagram to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub to: SocketAddr,
    pub bytes: Vec<u8>,
}

pub struct Dispatcher {
    identity: Identity,
    registry: SessionRegistry,
    credentials: CredentialService,
    max_datagram_bytes: usize,
}

impl Dispatcher {
    pub const fn new(
        identity: Identity,
        registry: SessionRegistry,
        credentials: CredentialService,
        max_datagram_bytes: usize,
    ) -> Self {
        Self {
            identity,
            registry,
            credentials,
            max_datagram_bytes,
        }
    }

    pub const fn identity(&self) -> &Identity {
        &self.identity
    }

    pub const fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Handle one inbound datagram and return the datagrams to send.
    #[instrument(skip(self, bytes), fields(peer = %from, len = bytes.len()))]
    pub async fn handle(&self, from: SocketAddr, bytes: &[u8]) -> Vec<Outbound> {
        if bytes.len() > self.max_datagram_bytes {
            warn!("Dropping oversized datagram");
            return Vec::new();
        }

        let envelope = match Envelope::decode(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable datagram");
                return Vec::new();
            }
        };

        if envelope.recipient == self.identity {
            self.handle_local(from, envelope.payload).await
        } else {
            self.relay(from, envelope).await
        }
    }

    async fn handle_local(&self, from: SocketAddr, payload: Payload) -> Vec<Outbound> {
        let source = Identity::from(from);
        let handle = self.registry.get_or_create(&source).await;
        let mut session = handle.lock().await;
        debug!(kind = payload.kind(), phase = %session.phase(), "Handling envelope");

        match payload {
            Payload::Plain { text } => {
                Self::handle_plain(&mut session, &text);
                Vec::new()
            }
            Payload::KeyExchangeInit { .. }
            | Payload::KeyExchangeAccept
            | Payload::KeyExchangeResponse { .. } => {
                self.handle_handshake(&mut session, from, &payload)
            }
            Payload::Encrypted(data) => match session.open_text(&data) {
                Ok(text) => match session.feed_credential(text) {
                    Ok(Some(submission)) => {
                        self.handle_credentials(&mut session, from, submission)
                            .await
                    }
                    Ok(None) => {
                        debug!("Credential username received");
                        Vec::new()
                    }
                    Err(text) => {
                        info!(text = %text, "Message received");
                        Vec::new()
                    }
                },
                Err(e) => {
                    log_session_error(&e);
                    Vec::new()
                }
            },
            Payload::Login {
                username,
                password_hash,
            } => match session.open_credentials(CredentialKind::Login, &username, &password_hash) {
                Ok(submission) => self.handle_credentials(&mut session, from, submission).await,
                Err(e) => {
                    log_session_error(&e);
                    Vec::new()
                }
            },
            Payload::Register {
                username,
                password_hash,
            } => {
                match session.open_credentials(CredentialKind::Register, &username, &password_hash)
                {
                    Ok(submission) => {
                        self.handle_credentials(&mut session, from, submission)
                            .await
                    }
                    Err(e) => {
                        log_session_error(&e);
                        Vec::new()
                    }
                }
            }
        }
    }

    fn handle_plain(session: &mut PeerSession, text: &str) {
        if let Some(kind) = CredentialKind::from_control_text(text) {
            debug!(?kind, "Credential flow opened");
            session.begin_credential_flow(kind);
        } else if text == NEW_CLIENT_GREETING {
            info!("New client");
        } else {
            info!(text = %text, "Plain message received");
        }
    }

    fn handle_handshake(
        &self,
        session: &mut PeerSession,
        from: SocketAddr,
        payload: &Payload,
    ) -> Vec<Outbound> {
        match session.on_handshake(payload) {
            Ok(HandshakeProgress::Responded(replies)) => {
                debug!("Key exchange answered");
                replies
                    .into_iter()
                    .filter_map(|reply| self.to_peer(session.identity(), from, reply))
                    .collect()
            }
            Ok(HandshakeProgress::PeerAccepted) => {
                debug!("Peer accepted key exchange");
                Vec::new()
            }
            Ok(HandshakeProgress::Completed) => {
                info!("Key exchange completed");
                Vec::new()
            }
            Err(e) => {
                warn!(error = %e, phase = %session.phase(), "Key exchange step rejected");
                Vec::new()
            }
        }
    }

    async fn handle_credentials(
        &self,
        session: &mut PeerSession,
        from: SocketAddr,
        submission: CredentialSubmission,
    ) -> Vec<Outbound> {
        let text = match self.credentials.process(&submission).await {
            Ok(text) => {
                if submission.kind == CredentialKind::Login
                    && self
                        .registry
                        .bind_username(&submission.username, session.identity())
                        .await
                {
                    session.set_username(submission.username.as_str());
                }
                text
            }
            Err(e) => {
                if let CredentialError::Database(db) = &e {
                    error!(error = %db, "Credential store failure");
                }
                e.reply_text(submission.kind)
            }
        };

        let reply = match session.seal_text(text) {
            Ok(reply) => reply,
            Err(e) => {
                log_session_error(&e);
                return Vec::new();
            }
        };
        self.to_peer(session.identity(), from, reply)
            .into_iter()
            .collect()
    }

    /// Forward an envelope to another peer, re-stamping the sender.
    async fn relay(&self, from: SocketAddr, envelope: Envelope) -> Vec<Outbound> {
        let source = Identity::from(from);
        // The sender must be resolvable for the recipient's reply.
        self.registry.get_or_create(&source).await;

        let target = self
            .registry
            .resolve(&envelope.recipient)
            .await
            .and_then(|id| id.socket_addr());
        let Some(to) = target else {
            warn!(recipient = %envelope.recipient, "Relay to unknown recipient");
            let notice = Payload::plain(format!("Unknown recipient: {}", envelope.recipient));
            return self.to_peer(&source, from, notice).into_iter().collect();
        };

        let sender = self.registry.public_identity(&source).await;
        debug!(
            sender = %sender,
            recipient = %envelope.recipient,
            kind = envelope.payload.kind(),
            "Relaying envelope"
        );
        let relayed = Envelope::new(sender, envelope.recipient, envelope.payload);
        encode(&relayed, to).into_iter().collect()
    }

    fn to_peer(&self, recipient: &Identity, to: SocketAddr, payload: Payload) -> Option<Outbound> {
        let envelope = Envelope::new(self.identity.clone(), recipient.clone(), payload);
        encode(&envelope, to)
    }
}

fn encode(envelope: &Envelope, to: SocketAddr) -> Option<Outbound> {
    match envelope.encode() {
        Ok(bytes) => Some(Outbound { to, bytes }),
        Err(e) => {
            error!(error = %e, kind = envelope.payload.kind(), "Failed to encode envelope");
            None
        }
    }
}

fn log_session_error(e: &SessionError) {
    if e.is_corruption() {
        warn!(error = %e, "Message corrupted, dropping");
    } else {
        warn!(error = %e, "Dropping envelope");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::auth::credentials::{
        ALREADY_REGISTERED, LOGIN_FAILED, LOGIN_SUCCESSFUL, REGISTERED, REGISTRATION_FAILED,
    };
    use crate::storage::UserDatabase;
    use parley_crypto::{ModulusGroup, password::client_password_hash};
    use parley_proto::{DEFAULT_SERVER_IDENTITY, MAX_ENVELOPE_SIZE, Phase};

    struct Harness {
        dispatcher: Dispatcher,
        group: Arc<ModulusGroup>,
    }

    impl Harness {
        async fn new() -> Self {
            let group = Arc::new(ModulusGroup::test_group());
            let db = UserDatabase::open_in_memory().await.unwrap();
            let dispatcher = Dispatcher::new(
                DEFAULT_SERVER_IDENTITY.into(),
                SessionRegistry::new(DEFAULT_SERVER_IDENTITY.into(), Arc::clone(&group)),
                CredentialService::new(db, DEFAULT_SERVER_IDENTITY.into()),
                MAX_ENVELOPE_SIZE,
            );
            Self { dispatcher, group }
        }

        fn client(&self, addr: &str) -> (SocketAddr, PeerSession) {
            let addr: SocketAddr = addr.parse().unwrap();
            let session = PeerSession::new(DEFAULT_SERVER_IDENTITY.into(), Arc::clone(&self.group));
            (addr, session)
        }

        async fn send(&self, from: SocketAddr, recipient: &str, payload: Payload) -> Vec<Outbound> {
            let env = Envelope::new(from.into(), recipient.into(), payload);
            self.dispatcher.handle(from, &env.encode().unwrap()).await
        }

        async fn to_server(&self, from: SocketAddr, payload: Payload) -> Vec<Outbound> {
            self.send(from, DEFAULT_SERVER_IDENTITY, payload).await
        }

        /// Handshake a client session with the server.
        async fn establish(&self, from: SocketAddr, client: &mut PeerSession) {
            let init = client.begin_exchange().unwrap();
            let replies = self.to_server(from, init).await;
            assert_eq!(replies.len(), 2);
            for out in replies {
                assert_eq!(out.to, from);
                let env = Envelope::decode(&out.bytes).unwrap();
                assert_eq!(env.sender.as_str(), DEFAULT_SERVER_IDENTITY);
                client.on_handshake(&env.payload).unwrap();
            }
            assert!(client.is_established());
        }

        fn reply_text(client: &PeerSession, out: &[Outbound]) -> String {
            assert_eq!(out.len(), 1);
            let env = Envelope::decode(&out[0].bytes).unwrap();
            let Payload::Encrypted(data) = env.payload else {
                panic!("expected encrypted reply, got {}", env.payload.kind());
            };
            client.open_text(&data).unwrap()
        }
    }

    #[tokio::test]
    async fn handshake_establishes_matching_keys() {
        let h = Harness::new().await;
        let (addr, mut client) = h.client("127.0.0.1:4000");
        h.establish(addr, &mut client).await;

        let handle = h.dispatcher.registry().get(&addr.into()).await.unwrap();
        let server_session = handle.lock().await;
        assert_eq!(server_session.phase(), Phase::Established);
        assert_eq!(server_session.key(), client.key());
    }

    #[tokio::test]
    async fn greeting_creates_session_without_reply() {
        let h = Harness::new().await;
        let (addr, _) = h.client("127.0.0.1:4000");
        let out = h.to_server(addr, Payload::plain(NEW_CLIENT_GREETING)).await;
        assert!(out.is_empty());
        assert_eq!(h.dispatcher.registry().len().await, 1);
    }

    #[tokio::test]
    async fn garbage_and_oversized_datagrams_are_dropped() {
        let h = Harness::new().await;
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        assert!(h.dispatcher.handle(addr, b"Request Key Exchange").await.is_empty());
        let huge = vec![0u8; MAX_ENVELOPE_SIZE + 1];
        assert!(h.dispatcher.handle(addr, &huge).await.is_empty());
        assert!(h.dispatcher.registry().is_empty().await);
    }

    #[tokio::test]
    async fn encrypted_before_handshake_is_dropped() {
        let h = Harness::new().await;
        let (a_addr, mut a) = h.client("127.0.0.1:4000");
        h.establish(a_addr, &mut a).await;

        // Sealed under a's key but sent from a fresh address.
        let sealed = a.seal_text("hello").unwrap();
        let (b_addr, _) = h.client("127.0.0.1:4001");
        assert!(h.to_server(b_addr, sealed).await.is_empty());

        let handle = h.dispatcher.registry().get(&b_addr.into()).await.unwrap();
        assert!(handle.lock().await.key().is_none());
    }

    #[tokio::test]
    async fn register_then_duplicate() {
        let h = Harness::new().await;
        let (addr, mut client) = h.client("127.0.0.1:4000");
        h.establish(addr, &mut client).await;

        let hash = client_password_hash("pw");
        let payload = client
            .seal_credentials(CredentialKind::Register, "alice", &hash)
            .unwrap();
        let out = h.to_server(addr, payload.clone()).await;
        assert_eq!(Harness::reply_text(&client, &out), REGISTERED);

        let out = h.to_server(addr, payload).await;
        assert_eq!(Harness::reply_text(&client, &out), ALREADY_REGISTERED);
    }

    #[tokio::test]
    async fn login_binds_username() {
        let h = Harness::new().await;
        let (addr, mut client) = h.client("127.0.0.1:4000");
        h.establish(addr, &mut client).await;

        let hash = client_password_hash("pw");
        let register = client
            .seal_credentials(CredentialKind::Register, "alice", &hash)
            .unwrap();
        h.to_server(addr, register).await;

        let wrong = client
            .seal_credentials(CredentialKind::Login, "alice", &client_password_hash("pX"))
            .unwrap();
        let out = h.to_server(addr, wrong).await;
        assert_eq!(Harness::reply_text(&client, &out), LOGIN_FAILED);
        assert_eq!(h.dispatcher.registry().resolve(&"alice".into()).await, None);

        let login = client
            .seal_credentials(CredentialKind::Login, "alice", &hash)
            .unwrap();
        let out = h.to_server(addr, login).await;
        assert_eq!(Harness::reply_text(&client, &out), LOGIN_SUCCESSFUL);
        assert_eq!(
            h.dispatcher.registry().resolve(&"alice".into()).await,
            Some(Identity::from(addr))
        );
    }

    #[tokio::test]
    async fn two_message_register_flow() {
        let h = Harness::new().await;
        let (addr, mut client) = h.client("127.0.0.1:4000");
        h.establish(addr, &mut client).await;

        assert!(h.to_server(addr, Payload::plain("Register")).await.is_empty());
        let username = client.seal_text("bob").unwrap();
        assert!(h.to_server(addr, username).await.is_empty());
        let hash = client.seal_text(&client_password_hash("pw")).unwrap();
        let out = h.to_server(addr, hash).await;
        assert_eq!(Harness::reply_text(&client, &out), REGISTERED);

        // Flow is cleared; ordinary text produces no reply.
        let text = client.seal_text("just chatting").unwrap();
        assert!(h.to_server(addr, text).await.is_empty());
    }

    #[tokio::test]
    async fn relay_restamps_sender_and_forwards_untouched() {
        let h = Harness::new().await;
        let (a_addr, _) = h.client("127.0.0.1:4000");
        let (b_addr, _) = h.client("127.0.0.1:4001");
        h.to_server(b_addr, Payload::plain(NEW_CLIENT_GREETING)).await;

        // a claims to be someone else; the server overrides.
        let payload = Payload::plain("hi b");
        let env = Envelope::new("mallory".into(), b_addr.into(), payload.clone());
        let out = h.dispatcher.handle(a_addr, &env.encode().unwrap()).await;

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, b_addr);
        let relayed = Envelope::decode(&out[0].bytes).unwrap();
        assert_eq!(relayed.sender, Identity::from(a_addr));
        assert_eq!(relayed.recipient, Identity::from(b_addr));
        assert_eq!(relayed.payload, payload);
    }

    #[tokio::test]
    async fn relay_by_username_after_login() {
        let h = Harness::new().await;
        let (a_addr, _) = h.client("127.0.0.1:4000");
        let (b_addr, mut b) = h.client("127.0.0.1:4001");
        h.establish(b_addr, &mut b).await;

        let hash = client_password_hash("pw");
        h.to_server(
            b_addr,
            b.seal_credentials(CredentialKind::Register, "bob", &hash).unwrap(),
        )
        .await;
        h.to_server(
            b_addr,
            b.seal_credentials(CredentialKind::Login, "bob", &hash).unwrap(),
        )
        .await;

        let out = h.send(a_addr, "bob", Payload::KeyExchangeAccept).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, b_addr);

        // b addresses a by its address; a sees b's username as sender.
        let out = h.send(b_addr, &a_addr.to_string(), Payload::plain("yo")).await;
        let relayed = Envelope::decode(&out[0].bytes).unwrap();
        assert_eq!(out[0].to, a_addr);
        assert_eq!(relayed.sender, Identity::from("bob"));
    }

    #[tokio::test]
    async fn relay_to_unknown_recipient_is_reported() {
        let h = Harness::new().await;
        let (a_addr, _) = h.client("127.0.0.1:4000");
        let out = h.send(a_addr, "nobody", Payload::plain("hello?")).await;

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, a_addr);
        let env = Envelope::decode(&out[0].bytes).unwrap();
        assert_eq!(env.payload, Payload::plain("Unknown recipient: nobody"));
    }

    #[tokio::test]
    async fn peer_cannot_take_server_identity_or_another_address() {
        let h = Harness::new().await;
        let (m_addr, mut mallory) = h.client("127.0.0.1:4000");
        let (v_addr, _) = h.client("127.0.0.1:4001");
        let (c_addr, _) = h.client("127.0.0.1:4002");
        h.establish(m_addr, &mut mallory).await;
        h.to_server(v_addr, Payload::plain(NEW_CLIENT_GREETING)).await;

        let hash = client_password_hash("pw");
        for name in [DEFAULT_SERVER_IDENTITY, "127.0.0.1:4001"] {
            let register = mallory
                .seal_credentials(CredentialKind::Register, name, &hash)
                .unwrap();
            let out = h.to_server(m_addr, register).await;
            assert_eq!(Harness::reply_text(&mallory, &out), REGISTRATION_FAILED);

            let login = mallory
                .seal_credentials(CredentialKind::Login, name, &hash)
                .unwrap();
            let out = h.to_server(m_addr, login).await;
            assert_eq!(Harness::reply_text(&mallory, &out), LOGIN_FAILED);
        }

        // Mallory's relayed traffic still carries its own address.
        let out = h.send(m_addr, &v_addr.to_string(), Payload::plain("hi")).await;
        let relayed = Envelope::decode(&out[0].bytes).unwrap();
        assert_eq!(relayed.sender, Identity::from(m_addr));

        // A third peer addressing the victim reaches the victim.
        let out = h.send(c_addr, &v_addr.to_string(), Payload::plain("for v")).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, v_addr);
    }
}
