//! Per-peer session state machine.
//!
//! One [`PeerSession`] per correspondent. It tracks handshake progress, owns
//! the derived key once the exchange completes, and carries any half-finished
//! credential submission. Each side plays both roles: it initiates when it has
//! something to send and no key, and responds whenever a peer initiates.
//!
//! ```text
//! Idle ──begin_exchange──▶ ExchangeRequested ──Response──▶ Established
//!   │                        │  ▲ Accept (peer computing)
//!   └──Init──▶ ExchangeAccepted ──(same step)──▶ Established
//! ```
//!
//! An `Init` in any phase restarts the exchange and discards in-flight state.
//! A `Response` is accepted whenever a secret is pending, so a late duplicate
//! from an abandoned round is folded against the current secret. That yields a
//! key the peer does not share; the next decrypt fails and a new round is
//! needed.

use std::fmt;
use std::sync::Arc;

use num_bigint::BigUint;
use parley_crypto::{
    DhSecret, EncryptedData, HandshakeError, ModulusGroup, SymmetricKey, channel, exchange,
};
use tracing::{debug, warn};

use crate::envelope::{Identity, Payload};
use crate::error::SessionError;

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    ExchangeRequested,
    /// Responder is computing its half. Set and left within one
    /// `accept_exchange` call, so callers holding the session lock never see it.
    ExchangeAccepted,
    Established,
}

impl Phase {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::ExchangeRequested => "ExchangeRequested",
            Self::ExchangeAccepted => "ExchangeAccepted",
            Self::Established => "Established",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which credential operation is being submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    Register,
    Login,
}

impl CredentialKind {
    /// Control text that opens the two-message flow.
    pub const fn control_text(self) -> &'static str {
        match self {
            Self::Register => "Register",
            Self::Login => "Login",
        }
    }

    pub fn from_control_text(text: &str) -> Option<Self> {
        match text {
            "Register" => Some(Self::Register),
            "Login" => Some(Self::Login),
            _ => None,
        }
    }
}

/// Two-message credential flow: username first, then password hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialFlow {
    AwaitingUsername {
        kind: CredentialKind,
    },
    AwaitingPassword {
        kind: CredentialKind,
        username: String,
    },
}

/// A complete credential submission, however it arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialSubmission {
    pub kind: CredentialKind,
    pub username: String,
    pub password_hash: String,
}

/// What a handshake envelope did to the session.
#[derive(Debug)]
pub enum HandshakeProgress {
    /// We answered an init; send both payloads back in order. Key is set.
    Responded([Payload; 2]),
    /// The peer acknowledged our init and is computing.
    PeerAccepted,
    /// Our init was answered; key is set.
    Completed,
}

/// State for one correspondent.
pub struct PeerSession {
    identity: Identity,
    group: Arc<ModulusGroup>,
    phase: Phase,
    pending_secret: Option<DhSecret>,
    peer_accepted: bool,
    key: Option<SymmetricKey>,
    credential_flow: Option<CredentialFlow>,
    username: Option<String>,
}

impl fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSession")
            .field("identity", &self.identity)
            .field("phase", &self.phase)
            .field("has_key", &self.key.is_some())
            .field("credential_flow", &self.credential_flow)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl PeerSession {
    pub const fn new(identity: Identity, group: Arc<ModulusGroup>) -> Self {
        Self {
            identity,
            group,
            phase: Phase::Idle,
            pending_secret: None,
            peer_accepted: false,
            key: None,
            credential_flow: None,
            username: None,
        }
    }

    pub const fn identity(&self) -> &Identity {
        &self.identity
    }

    pub const fn phase(&self) -> Phase {
        self.phase
    }

    pub const fn is_established(&self) -> bool {
        matches!(self.phase, Phase::Established) && self.key.is_some()
    }

    /// Whether the peer acknowledged our pending init.
    pub const fn peer_accepted(&self) -> bool {
        self.peer_accepted
    }

    pub const fn key(&self) -> Option<&SymmetricKey> {
        self.key.as_ref()
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn set_username(&mut self, username: impl Into<String>) {
        self.username = Some(username.into());
    }

    // =========================================================================
    // Handshake
    // =========================================================================

    /// Start (or restart) an exchange as initiator and return the init payload.
    pub fn begin_exchange(&mut self) -> Result<Payload, HandshakeError> {
        let (secret, public) = exchange::initiate(&self.group)?;
        if self.phase != Phase::Idle {
            debug!(peer = %self.identity, phase = %self.phase, "Restarting key exchange");
        }

        self.key = None;
        self.pending_secret = Some(secret);
        self.peer_accepted = false;
        self.phase = Phase::ExchangeRequested;

        Ok(Payload::KeyExchangeInit {
            prime: self.group.prime().clone(),
            generator: self.group.generator().clone(),
            public,
        })
    }

    /// Answer a peer's init. Sets the key and returns `[Accept, Response]`.
    ///
    /// Valid in every phase: an init always restarts the exchange.
    pub fn accept_exchange(
        &mut self,
        prime: &BigUint,
        generator: &BigUint,
        public: &BigUint,
    ) -> Result<[Payload; 2], HandshakeError> {
        if prime != self.group.prime() || generator != self.group.generator() {
            return Err(HandshakeError::GroupMismatch);
        }
        if matches!(
            self.phase,
            Phase::ExchangeRequested | Phase::ExchangeAccepted
        ) {
            warn!(
                peer = %self.identity,
                phase = %self.phase,
                "Key exchange init during handshake, restarting as responder"
            );
        }

        self.pending_secret = None;
        self.peer_accepted = false;
        self.key = None;
        self.phase = Phase::ExchangeAccepted;

        let (_secret, own_public, key) = match exchange::respond(public, prime, generator) {
            Ok(computed) => computed,
            Err(e) => {
                self.phase = Phase::Idle;
                return Err(e);
            }
        };

        self.key = Some(key);
        self.phase = Phase::Established;
        debug!(peer = %self.identity, "Key exchange completed as responder");

        Ok([
            Payload::KeyExchangeAccept,
            Payload::KeyExchangeResponse { public: own_public },
        ])
    }

    /// Record the peer's acknowledgment of our init.
    pub fn note_accept(&mut self) -> Result<(), HandshakeError> {
        if self.phase != Phase::ExchangeRequested {
            return Err(self.unexpected("KeyExchangeAccept"));
        }
        self.peer_accepted = true;
        Ok(())
    }

    /// Fold the responder's public value into our pending secret.
    ///
    /// The final exponentiation always uses this session's own prime.
    pub fn complete_exchange(&mut self, public: &BigUint) -> Result<(), HandshakeError> {
        let Some(secret) = self.pending_secret.take() else {
            return Err(self.unexpected("KeyExchangeResponse"));
        };

        match exchange::finalize(&secret, self.group.prime(), public) {
            Ok(key) => {
                self.key = Some(key);
                self.phase = Phase::Established;
                self.peer_accepted = false;
                debug!(peer = %self.identity, "Key exchange completed as initiator");
                Ok(())
            }
            Err(e) => {
                self.phase = Phase::Idle;
                self.peer_accepted = false;
                Err(e)
            }
        }
    }

    /// Apply any handshake payload.
    pub fn on_handshake(&mut self, payload: &Payload) -> Result<HandshakeProgress, HandshakeError> {
        match payload {
            Payload::KeyExchangeInit {
                prime,
                generator,
                public,
            } => self
                .accept_exchange(prime, generator, public)
                .map(HandshakeProgress::Responded),
            Payload::KeyExchangeAccept => {
                self.note_accept()?;
                Ok(HandshakeProgress::PeerAccepted)
            }
            Payload::KeyExchangeResponse { public } => {
                self.complete_exchange(public)?;
                Ok(HandshakeProgress::Completed)
            }
            other => Err(self.unexpected(other.kind())),
        }
    }

    const fn unexpected(&self, step: &'static str) -> HandshakeError {
        HandshakeError::UnexpectedStep {
            step,
            phase: self.phase.as_str(),
        }
    }

    // =========================================================================
    // Sealed traffic
    // =========================================================================

    fn established_key(&self) -> Result<&SymmetricKey, SessionError> {
        match (&self.phase, &self.key) {
            (Phase::Established, Some(key)) => Ok(key),
            _ => Err(SessionError::NotEstablished),
        }
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<EncryptedData, SessionError> {
        let key = self.established_key()?;
        Ok(channel::encrypt(key, plaintext, None)?)
    }

    pub fn seal_text(&self, text: &str) -> Result<Payload, SessionError> {
        Ok(Payload::Encrypted(self.seal(text.as_bytes())?))
    }

    /// Verify and decrypt. Never touches the key.
    pub fn open(&self, data: &EncryptedData) -> Result<Vec<u8>, SessionError> {
        let key = self.established_key()?;
        Ok(data.open(key)?)
    }

    pub fn open_text(&self, data: &EncryptedData) -> Result<String, SessionError> {
        String::from_utf8(self.open(data)?).map_err(|_| SessionError::InvalidUtf8)
    }

    // =========================================================================
    // Credentials
    // =========================================================================

    /// Build a `Login`/`Register` payload with both fields sealed.
    pub fn seal_credentials(
        &self,
        kind: CredentialKind,
        username: &str,
        password_hash: &str,
    ) -> Result<Payload, SessionError> {
        let username = self.seal(username.as_bytes())?;
        let password_hash = self.seal(password_hash.as_bytes())?;
        Ok(match kind {
            CredentialKind::Register => Payload::Register {
                username,
                password_hash,
            },
            CredentialKind::Login => Payload::Login {
                username,
                password_hash,
            },
        })
    }

    /// Decrypt both fields of a `Login`/`Register` payload.
    pub fn open_credentials(
        &self,
        kind: CredentialKind,
        username: &EncryptedData,
        password_hash: &EncryptedData,
    ) -> Result<CredentialSubmission, SessionError> {
        Ok(CredentialSubmission {
            kind,
            username: self.open_text(username)?,
            password_hash: self.open_text(password_hash)?,
        })
    }

    pub const fn credential_flow(&self) -> Option<&CredentialFlow> {
        self.credential_flow.as_ref()
    }

    /// Open the two-message flow. Replaces any flow already in progress.
    pub fn begin_credential_flow(&mut self, kind: CredentialKind) {
        self.credential_flow = Some(CredentialFlow::AwaitingUsername { kind });
    }

    /// Feed the next decrypted value into the flow.
    ///
    /// Returns the finished submission after the second value and clears the
    /// flow. With no flow open, the value is handed back untouched.
    pub fn feed_credential(
        &mut self,
        value: String,
    ) -> Result<Option<CredentialSubmission>, String> {
        match self.credential_flow.take() {
            None => Err(value),
            Some(CredentialFlow::AwaitingUsername { kind }) => {
                self.credential_flow = Some(CredentialFlow::AwaitingPassword {
                    kind,
                    username: value,
                });
                Ok(None)
            }
            Some(CredentialFlow::AwaitingPassword { kind, username }) => {
                Ok(Some(CredentialSubmission {
                    kind,
                    username,
                    password_hash: value,
                }))
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic, clippy::expect_used)]
mod tests {
    use super::*;

    fn pair() -> (PeerSession, PeerSession) {
        let group = Arc::new(ModulusGroup::test_group());
        (
            PeerSession::new("alice".into(), Arc::clone(&group)),
            PeerSession::new("bob".into(), group),
        )
    }

    /// Drive a full exchange with `a` initiating.
    fn establish(a: &mut PeerSession, b: &mut PeerSession) {
        let init = a.begin_exchange().unwrap();
        let HandshakeProgress::Responded([accept, response]) = b.on_handshake(&init).unwrap()
        else {
            panic!("responder did not answer");
        };
        assert!(matches!(
            a.on_handshake(&accept).unwrap(),
            HandshakeProgress::PeerAccepted
        ));
        assert!(matches!(
            a.on_handshake(&response).unwrap(),
            HandshakeProgress::Completed
        ));
    }

    #[test]
    fn new_session_is_idle_without_key() {
        let (a, _) = pair();
        assert_eq!(a.phase(), Phase::Idle);
        assert!(a.key().is_none());
        assert!(!a.is_established());
    }

    #[test]
    fn full_exchange_agrees_on_key_and_carries_text() {
        let (mut a, mut b) = pair();
        establish(&mut a, &mut b);

        assert_eq!(a.phase(), Phase::Established);
        assert_eq!(b.phase(), Phase::Established);
        assert_eq!(a.key().unwrap(), b.key().unwrap());

        let Payload::Encrypted(sealed) = a.seal_text("hello").unwrap() else {
            panic!("expected encrypted payload");
        };
        assert_eq!(b.open_text(&sealed).unwrap(), "hello");
    }

    #[test]
    fn begin_exchange_moves_to_requested() {
        let (mut a, _) = pair();
        let init = a.begin_exchange().unwrap();
        assert!(matches!(init, Payload::KeyExchangeInit { .. }));
        assert_eq!(a.phase(), Phase::ExchangeRequested);
        assert!(!a.peer_accepted());

        a.note_accept().unwrap();
        assert!(a.peer_accepted());
        assert_eq!(a.phase(), Phase::ExchangeRequested);
    }

    #[test]
    fn response_may_arrive_before_accept() {
        let (mut a, mut b) = pair();
        let init = a.begin_exchange().unwrap();
        let HandshakeProgress::Responded([_accept, response]) = b.on_handshake(&init).unwrap()
        else {
            panic!("responder did not answer");
        };
        a.on_handshake(&response).unwrap();
        assert!(a.is_established());
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn encrypted_before_established_is_refused_without_touching_key() {
        let (mut a, mut b) = pair();
        establish(&mut a, &mut b);
        let sealed = a.seal(b"early").unwrap();

        let (mut idle, _) = pair();
        assert!(matches!(
            idle.open(&sealed),
            Err(SessionError::NotEstablished)
        ));
        assert!(idle.key().is_none());

        idle.begin_exchange().unwrap();
        assert!(matches!(
            idle.open(&sealed),
            Err(SessionError::NotEstablished)
        ));
        assert!(idle.key().is_none());
        assert_eq!(idle.phase(), Phase::ExchangeRequested);
    }

    #[test]
    fn seal_without_key_is_refused() {
        let (a, _) = pair();
        assert!(matches!(a.seal(b"x"), Err(SessionError::NotEstablished)));
    }

    #[test]
    fn stray_accept_and_response_are_unexpected() {
        let (mut a, _) = pair();
        assert!(matches!(
            a.note_accept(),
            Err(HandshakeError::UnexpectedStep {
                step: "KeyExchangeAccept",
                phase: "Idle"
            })
        ));
        assert!(matches!(
            a.complete_exchange(&BigUint::from(5u32)),
            Err(HandshakeError::UnexpectedStep { .. })
        ));
        assert_eq!(a.phase(), Phase::Idle);
    }

    #[test]
    fn init_while_requested_restarts_as_responder() {
        let (mut a, mut b) = pair();
        a.begin_exchange().unwrap();

        // Both sides initiated; a yields to b's init.
        let b_init = b.begin_exchange().unwrap();
        let HandshakeProgress::Responded([_, response]) = a.on_handshake(&b_init).unwrap() else {
            panic!("a did not answer");
        };
        assert!(a.is_established());

        b.on_handshake(&response).unwrap();
        assert_eq!(a.key(), b.key());

        // a's own round was discarded.
        assert!(matches!(
            a.complete_exchange(&BigUint::from(7u32)),
            Err(HandshakeError::UnexpectedStep { .. })
        ));
    }

    #[test]
    fn init_on_established_session_rekeys() {
        let (mut a, mut b) = pair();
        establish(&mut a, &mut b);
        let old = a.key().unwrap().clone();

        establish(&mut b, &mut a);
        assert_eq!(a.key(), b.key());
        assert_ne!(a.key().unwrap(), &old);
    }

    #[test]
    fn mismatched_group_is_rejected() {
        let (_, mut b) = pair();
        let mut stranger = PeerSession::new(
            "mallory".into(),
            Arc::new(ModulusGroup::rfc3526_2048()),
        );
        let init = stranger.begin_exchange().unwrap();
        assert!(matches!(
            b.on_handshake(&init),
            Err(HandshakeError::GroupMismatch)
        ));
        assert_eq!(b.phase(), Phase::Idle);
    }

    #[test]
    fn invalid_response_resets_to_idle() {
        let (mut a, _) = pair();
        a.begin_exchange().unwrap();
        let result = a.complete_exchange(&BigUint::from(1u32));
        assert!(matches!(result, Err(HandshakeError::InvalidPublic)));
        assert_eq!(a.phase(), Phase::Idle);
        assert!(a.key().is_none());
    }

    #[test]
    fn invalid_init_drops_responder_to_idle() {
        let (mut a, mut b) = pair();
        establish(&mut a, &mut b);

        let group = ModulusGroup::test_group();
        let init = Payload::KeyExchangeInit {
            prime: group.prime().clone(),
            generator: group.generator().clone(),
            public: BigUint::from(1u32),
        };
        assert!(matches!(
            b.on_handshake(&init),
            Err(HandshakeError::InvalidPublic)
        ));
        assert_eq!(b.phase(), Phase::Idle);
        assert!(b.key().is_none());
    }

    #[test]
    fn late_duplicate_response_is_folded_into_current_round() {
        let (mut a, mut b) = pair();
        let first_init = a.begin_exchange().unwrap();
        let HandshakeProgress::Responded([_, stale]) = b.on_handshake(&first_init).unwrap() else {
            panic!("b did not answer");
        };

        // a times out and retries before the first response lands.
        a.begin_exchange().unwrap();
        a.on_handshake(&stale).unwrap();

        assert!(a.is_established());
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn non_handshake_payload_is_not_a_handshake_step() {
        let (mut a, _) = pair();
        assert!(matches!(
            a.on_handshake(&Payload::plain("hi")),
            Err(HandshakeError::UnexpectedStep { step: "Plain", .. })
        ));
    }

    #[test]
    fn sealed_credentials_open_on_the_other_side() {
        let (mut a, mut b) = pair();
        establish(&mut a, &mut b);

        let payload = a
            .seal_credentials(CredentialKind::Login, "alice", "cafebabe")
            .unwrap();
        let Payload::Login {
            username,
            password_hash,
        } = payload
        else {
            panic!("expected login payload");
        };
        let submission = b
            .open_credentials(CredentialKind::Login, &username, &password_hash)
            .unwrap();
        assert_eq!(submission.username, "alice");
        assert_eq!(submission.password_hash, "cafebabe");
        assert_eq!(submission.kind, CredentialKind::Login);
    }

    #[test]
    fn two_message_credential_flow() {
        let (mut a, _) = pair();
        assert_eq!(a.feed_credential("stray".into()), Err("stray".into()));

        a.begin_credential_flow(CredentialKind::Register);
        assert_eq!(a.feed_credential("alice".into()), Ok(None));
        assert_eq!(
            a.credential_flow(),
            Some(&CredentialFlow::AwaitingPassword {
                kind: CredentialKind::Register,
                username: "alice".into()
            })
        );

        let done = a.feed_credential("hash".into()).unwrap().unwrap();
        assert_eq!(done.kind, CredentialKind::Register);
        assert_eq!(done.username, "alice");
        assert_eq!(done.password_hash, "hash");
        assert!(a.credential_flow().is_none());
    }

    #[test]
    fn control_text_maps_to_kind() {
        assert_eq!(
            CredentialKind::from_control_text("Register"),
            Some(CredentialKind::Register)
        );
        assert_eq!(
            CredentialKind::from_control_text(CredentialKind::Login.control_text()),
            Some(CredentialKind::Login)
        );
        assert_eq!(CredentialKind::from_control_text("hello"), None);
    }
}
