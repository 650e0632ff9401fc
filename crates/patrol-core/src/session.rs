//! Per-connection session state.
//!
//! A session is created with the connection, authenticated by the first
//! packet (token zero), and destroyed when the connection closes. The
//! daemon enforces three things on every subsequent packet: the token
//! matches, the sequence strictly advances (with a documented wrap
//! window), and the session is authenticated. Any violation is dropped
//! without a response.

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;
use tracing::{debug, info};

use crate::secret::SharedSecret;

/// Length of the authentication digest a client presents.
pub const AUTH_DIGEST_LEN: usize = 32;

/// Why a packet was rejected. Never encoded onto the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// Authentication payload shorter than the digest.
    #[error("auth payload too small")]
    AuthTooSmall,

    /// Authentication digest did not match.
    #[error("auth digest mismatch")]
    AuthFailed,

    /// Packet arrived on a session that never authenticated.
    #[error("session not authenticated")]
    NotAuthenticated,

    /// Packet token differs from the session token.
    #[error("token mismatch")]
    TokenMismatch,

    /// Sequence number not strictly greater than the last accepted one.
    #[error("stale sequence")]
    StaleSequence,
}

/// Accepts `incoming` against `last`: strictly greater, or inside the
/// rollover window near the top of the u32 range.
#[must_use]
pub fn sequence_acceptable(last: u32, incoming: u32) -> bool {
    if incoming > last {
        return true;
    }
    last > 0xFFFF_0000 && incoming < 0x0000_FFFF
}

/// State for one connection.
#[derive(Debug, Clone)]
pub struct Session {
    token: u32,
    last_sequence: u32,
    authenticated: bool,
    connected_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
}

impl Session {
    /// A fresh, unauthenticated session.
    #[must_use]
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            token: 0,
            last_sequence: 0,
            authenticated: false,
            connected_at: now,
            last_activity: now,
        }
    }

    /// The session token; zero until authenticated.
    #[must_use]
    pub fn token(&self) -> u32 {
        self.token
    }

    /// The last accepted sequence number.
    #[must_use]
    pub fn last_sequence(&self) -> u32 {
        self.last_sequence
    }

    /// Whether the session has authenticated.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// When the connection was registered.
    #[must_use]
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// When the session last accepted a packet.
    #[must_use]
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    /// Seconds since the session last accepted a packet.
    #[must_use]
    pub fn idle_secs(&self) -> u64 {
        let idle = Utc::now() - self.last_activity;
        idle.num_seconds().max(0).unsigned_abs()
    }

    /// Handles the authentication round-trip: the payload's first 32
    /// bytes must equal `SHA-256("AuthChallenge" ‖ secret)`. On success
    /// the session gets a fresh non-zero random token, its sequence
    /// resets, and the token is returned for the reply payload.
    pub fn authenticate(
        &mut self,
        payload: &[u8],
        secret: &SharedSecret,
    ) -> Result<u32, SessionError> {
        let Some(presented) = payload.get(..AUTH_DIGEST_LEN) else {
            debug!(len = payload.len(), "auth payload too small");
            return Err(SessionError::AuthTooSmall);
        };

        let expected = secret.auth_digest();
        if presented.ct_eq(&expected).unwrap_u8() != 1 {
            debug!("auth digest mismatch");
            return Err(SessionError::AuthFailed);
        }

        self.token = mint_token();
        self.last_sequence = 0;
        self.authenticated = true;
        self.last_activity = Utc::now();
        info!(token = self.token, "client authenticated");
        Ok(self.token)
    }

    /// Validates a post-auth packet's token and sequence. On acceptance
    /// the sequence and activity time advance.
    pub fn accept_packet(&mut self, token: u32, sequence: u32) -> Result<(), SessionError> {
        if !self.authenticated {
            return Err(SessionError::NotAuthenticated);
        }
        if token != self.token {
            debug!(expected = self.token, got = token, "token mismatch");
            return Err(SessionError::TokenMismatch);
        }
        if !sequence_acceptable(self.last_sequence, sequence) {
            debug!(
                last = self.last_sequence,
                got = sequence,
                "stale or replayed sequence"
            );
            return Err(SessionError::StaleSequence);
        }

        self.last_sequence = sequence;
        self.last_activity = Utc::now();
        Ok(())
    }

    /// Drops authentication, forcing the peer to re-authenticate. Used by
    /// the idle sweep.
    pub fn deauthenticate(&mut self) {
        self.authenticated = false;
        self.token = 0;
        self.last_sequence = 0;
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Mints a cryptographically random, non-zero session token.
fn mint_token() -> u32 {
    loop {
        let token = OsRng.next_u32();
        if token != 0 {
            return token;
        }
    }
}

/// Registry of live sessions across both endpoints.
///
/// Each connection task owns and mutates its session; the table holds a
/// shared handle per connection for accounting and for the supervisor's
/// idle sweep. At most one session exists per live connection.
#[derive(Default)]
pub struct SessionTable {
    sessions: std::sync::Mutex<std::collections::HashMap<u64, std::sync::Arc<std::sync::Mutex<Session>>>>,
    next_id: std::sync::atomic::AtomicU64,
}

/// Shared handle to one connection's session.
pub type SessionHandle = std::sync::Arc<std::sync::Mutex<Session>>;

impl SessionTable {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fresh session for a new connection and returns its
    /// connection id and handle.
    pub fn register(&self) -> (u64, SessionHandle) {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let handle = std::sync::Arc::new(std::sync::Mutex::new(Session::new()));
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        sessions.insert(id, std::sync::Arc::clone(&handle));
        (id, handle)
    }

    /// Drops the session for a closed connection.
    pub fn unregister(&self, id: u64) {
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        sessions.remove(&id);
    }

    /// Number of live sessions.
    #[must_use]
    pub fn active(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// De-authenticates sessions idle past `threshold_secs`, returning
    /// how many were swept. Their connections stay open; the next packet
    /// on one is silently dropped until the peer re-authenticates.
    pub fn sweep_idle(&self, threshold_secs: u64) -> usize {
        if threshold_secs == 0 {
            return 0;
        }
        let sessions = self
            .sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut swept = 0;
        for handle in sessions.values() {
            let mut session = handle
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if session.is_authenticated() && session.idle_secs() >= threshold_secs {
                session.deauthenticate();
                swept += 1;
            }
        }
        if swept > 0 {
            info!(swept, "idle sessions de-authenticated");
        }
        swept
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret() -> SharedSecret {
        SharedSecret::from_bytes(b"0123456789abcdef0123456789abcdef".to_vec()).unwrap()
    }

    fn authed() -> (Session, u32) {
        let mut session = Session::new();
        let token = session.authenticate(&secret().auth_digest(), &secret()).unwrap();
        (session, token)
    }

    #[test]
    fn fresh_session_is_unauthenticated_with_zero_token() {
        let session = Session::new();
        assert!(!session.is_authenticated());
        assert_eq!(session.token(), 0);
    }

    #[test]
    fn authentication_mints_nonzero_token_and_resets_sequence() {
        let (session, token) = authed();
        assert!(session.is_authenticated());
        assert_ne!(token, 0);
        assert_eq!(session.token(), token);
        assert_eq!(session.last_sequence(), 0);
    }

    #[test]
    fn auth_rejects_short_and_wrong_payloads() {
        let mut session = Session::new();
        assert_eq!(
            session.authenticate(&[0u8; 16], &secret()),
            Err(SessionError::AuthTooSmall)
        );
        assert_eq!(
            session.authenticate(&[0u8; 32], &secret()),
            Err(SessionError::AuthFailed)
        );
        assert!(!session.is_authenticated());
        assert_eq!(session.token(), 0);
    }

    #[test]
    fn extra_auth_payload_bytes_are_ignored() {
        let mut session = Session::new();
        let mut payload = secret().auth_digest().to_vec();
        payload.extend_from_slice(b"client build info");
        assert!(session.authenticate(&payload, &secret()).is_ok());
    }

    #[test]
    fn packets_advance_sequence_and_reject_replay() {
        let (mut session, token) = authed();

        assert!(session.accept_packet(token, 1).is_ok());
        assert_eq!(session.last_sequence(), 1);

        // Identical bytes again: replay.
        assert_eq!(
            session.accept_packet(token, 1),
            Err(SessionError::StaleSequence)
        );
        // Going backwards is no better.
        assert_eq!(
            session.accept_packet(token, 0),
            Err(SessionError::StaleSequence)
        );
        // Gaps are fine.
        assert!(session.accept_packet(token, 100).is_ok());
    }

    #[test]
    fn wrong_token_and_unauthenticated_packets_are_rejected() {
        let (mut session, token) = authed();
        assert_eq!(
            session.accept_packet(token.wrapping_add(1), 1),
            Err(SessionError::TokenMismatch)
        );

        let mut fresh = Session::new();
        assert_eq!(
            fresh.accept_packet(0, 1),
            Err(SessionError::NotAuthenticated)
        );
    }

    #[test]
    fn sequence_wrap_window() {
        // Inside the window on both sides.
        assert!(sequence_acceptable(0xFFFF_FFF0, 5));
        // Below the high bound: ordinary stale.
        assert!(!sequence_acceptable(0xFFFF_0000, 5));
        // Incoming at the low bound is outside the window.
        assert!(!sequence_acceptable(0xFFFF_FFF0, 0x0000_FFFF));
        // Just inside the low bound.
        assert!(sequence_acceptable(0xFFFF_FFF0, 0x0000_FFFE));
        // Plain monotonic acceptance still works up high.
        assert!(sequence_acceptable(0xFFFF_FFF0, 0xFFFF_FFF1));
    }

    #[test]
    fn wrap_then_stale_rejected() {
        let (mut session, token) = authed();
        // Drive the session to the top of the range, then wrap.
        assert!(session.accept_packet(token, 0xFFFF_FFF0).is_ok());
        assert!(session.accept_packet(token, 5).is_ok());
        assert_eq!(session.last_sequence(), 5);
        assert_eq!(
            session.accept_packet(token, 3),
            Err(SessionError::StaleSequence)
        );
    }

    #[test]
    fn deauthenticate_clears_token() {
        let (mut session, token) = authed();
        session.deauthenticate();
        assert!(!session.is_authenticated());
        assert_eq!(session.token(), 0);
        assert_eq!(
            session.accept_packet(token, 1),
            Err(SessionError::NotAuthenticated)
        );
    }
}
