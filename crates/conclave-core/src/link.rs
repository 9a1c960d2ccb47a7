//! Per-pair link: handshake progression, session keys, channel state.
//!
//! # State Machine
//!
//! ```text
//! Uninitialized ──send/recv handshake──> HandshakeSent
//!       HandshakeSent ──response or ack──> HandshakeAcked
//!       HandshakeAcked ──invite accepted──> PeerInfoExchanged
//!       PeerInfoExchanged ──peer info received──> Confirmed
//!       (any non-confirmed) ──timeout/reject──> Failed
//! ```
//!
//! The link itself is passive: it holds keys, windows, and timers, and
//! exposes small transition methods. Protocol logic (what to send when)
//! lives in the group handlers.

use std::{ops::Sub, time::Duration};

use conclave_crypto::{EncPublicKey, EncSecretKey, SessionKey, derive_session_key};

use crate::lossless::{RecvQueue, SendWindow};

/// Interval between keepalive pings on a confirmed link.
pub const PING_INTERVAL: Duration = Duration::from_secs(12);

/// A confirmed peer with no ping for this long is torn down.
pub const CONFIRMED_PEER_TIMEOUT: Duration = Duration::from_secs(72);

/// An unconfirmed link with no progress for this long is discarded.
pub const UNCONFIRMED_PEER_TIMEOUT: Duration = Duration::from_secs(12);

/// Interval between handshake retransmissions while unanswered.
pub const HANDSHAKE_RESEND_INTERVAL: Duration = Duration::from_secs(3);

/// Minimum interval between honored sync requests from one peer.
pub const SYNC_REQUEST_MIN_INTERVAL: Duration = Duration::from_secs(5);

/// Decrypt failures on one link before it is declared out of sync.
pub const DECRYPT_FAILURE_LIMIT: u32 = 8;

/// Link lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Created, no handshake traffic yet.
    Uninitialized,
    /// Our handshake frame is on the wire.
    HandshakeSent,
    /// Both sides hold the session key; invite flow in progress.
    HandshakeAcked,
    /// Invite accepted; waiting for the peer-info exchange to finish.
    PeerInfoExchanged,
    /// Fully established member link.
    Confirmed,
    /// Dead. Waiting for cleanup.
    Failed,
}

/// Per-pair session and channel state.
#[derive(Debug)]
pub struct PeerLink<I> {
    state: LinkState,
    /// True if we initiated the handshake.
    pub initiated: bool,
    /// Key for handshake frames, derived from permanent enc keys.
    pair_key: SessionKey,
    /// Our ephemeral secret, alive until the session key is derived.
    session_secret: Option<EncSecretKey>,
    /// Our ephemeral public key, resent with handshake retries.
    session_pk: Option<EncPublicKey>,
    /// Traffic key, once both ephemeral keys are known.
    session_key: Option<SessionKey>,
    /// Sending half of the lossless channel.
    pub send: SendWindow<I>,
    /// Receiving half of the lossless channel.
    pub recv: RecvQueue<I>,
    created_at: I,
    last_received: I,
    last_ping_sent: Option<I>,
    last_handshake_sent: Option<I>,
    last_sync_honored: Option<I>,
    decrypt_failures: u32,
}

impl<I> PeerLink<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    fn new(pair_key: SessionKey, now: I, initiated: bool) -> Self {
        Self {
            state: LinkState::Uninitialized,
            initiated,
            pair_key,
            session_secret: None,
            session_pk: None,
            session_key: None,
            send: SendWindow::new(),
            recv: RecvQueue::new(),
            created_at: now,
            last_received: now,
            last_ping_sent: None,
            last_handshake_sent: None,
            last_sync_honored: None,
            decrypt_failures: 0,
        }
    }

    /// Link we will initiate.
    pub fn new_outgoing(pair_key: SessionKey, now: I) -> Self {
        Self::new(pair_key, now, true)
    }

    /// Link created by an incoming handshake.
    pub fn new_incoming(pair_key: SessionKey, now: I) -> Self {
        Self::new(pair_key, now, false)
    }

    /// Current state.
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// True once the peer-info exchange completed.
    pub fn is_confirmed(&self) -> bool {
        self.state == LinkState::Confirmed
    }

    /// True if the link is dead and awaiting cleanup.
    pub fn is_failed(&self) -> bool {
        self.state == LinkState::Failed
    }

    /// Key for handshake frames.
    pub fn pair_key(&self) -> &SessionKey {
        &self.pair_key
    }

    /// Key for traffic frames, if the handshake got that far.
    pub fn session_key(&self) -> Option<&SessionKey> {
        self.session_key.as_ref()
    }

    /// Our ephemeral public key for handshake (re)sends.
    pub fn session_pk(&self) -> Option<EncPublicKey> {
        self.session_pk
    }

    /// Install a fresh ephemeral keypair and mark the handshake sent.
    ///
    /// Called when we put a handshake frame on the wire (either because we
    /// initiated or because we are answering an incoming request).
    pub fn handshake_sent(&mut self, secret: EncSecretKey, now: I) {
        self.session_pk = Some(secret.public());
        self.session_secret = Some(secret);
        self.last_handshake_sent = Some(now);
        if self.state == LinkState::Uninitialized {
            self.state = LinkState::HandshakeSent;
        }
    }

    /// Record a handshake retransmission.
    pub fn handshake_resent(&mut self, now: I) {
        self.last_handshake_sent = Some(now);
    }

    /// True if our unanswered handshake should be retransmitted.
    pub fn handshake_resend_due(&self, now: I) -> bool {
        self.state == LinkState::HandshakeSent
            && self
                .last_handshake_sent
                .is_none_or(|at| now - at >= HANDSHAKE_RESEND_INTERVAL)
    }

    /// Derive the session key from the peer's ephemeral key.
    ///
    /// Advances `HandshakeSent → HandshakeAcked`. Both sides reach the
    /// same key (x25519 is symmetric); rotation happens implicitly because
    /// every new handshake uses fresh ephemerals.
    pub fn establish_session(&mut self, their_session_pk: &EncPublicKey) -> bool {
        let Some(secret) = &self.session_secret else {
            return false;
        };

        self.session_key = Some(derive_session_key(secret, their_session_pk));
        self.session_secret = None;
        if self.state == LinkState::HandshakeSent {
            self.state = LinkState::HandshakeAcked;
        }
        true
    }

    /// Invite flow finished; only the peer-info exchange remains.
    pub fn invite_accepted(&mut self) {
        if self.state == LinkState::HandshakeAcked {
            self.state = LinkState::PeerInfoExchanged;
        }
    }

    /// Peer info received: the link is fully established.
    ///
    /// Returns true if this call performed the transition.
    pub fn confirm(&mut self) -> bool {
        if matches!(self.state, LinkState::HandshakeAcked | LinkState::PeerInfoExchanged) {
            self.state = LinkState::Confirmed;
            return true;
        }
        false
    }

    /// Mark the link dead.
    pub fn fail(&mut self) {
        self.state = LinkState::Failed;
    }

    /// Note that an authenticated packet arrived.
    pub fn touch(&mut self, now: I) {
        self.last_received = now;
        self.decrypt_failures = 0;
    }

    /// Count a decrypt failure; true when the limit is reached and the
    /// link must be torn down as out-of-sync.
    pub fn note_decrypt_failure(&mut self) -> bool {
        self.decrypt_failures += 1;
        self.decrypt_failures >= DECRYPT_FAILURE_LIMIT
    }

    /// True if the link missed its liveness deadline.
    pub fn is_timed_out(&self, now: I) -> bool {
        let timeout = if self.is_confirmed() {
            CONFIRMED_PEER_TIMEOUT
        } else {
            UNCONFIRMED_PEER_TIMEOUT
        };
        now - self.last_received >= timeout
    }

    /// True if a keepalive ping is due.
    pub fn ping_due(&self, now: I) -> bool {
        self.is_confirmed()
            && self.last_ping_sent.is_none_or(|at| now - at >= PING_INTERVAL)
    }

    /// Record a sent ping.
    pub fn ping_sent(&mut self, now: I) {
        self.last_ping_sent = Some(now);
    }

    /// Flood control: true if we may honor a sync request now.
    pub fn sync_request_allowed(&mut self, now: I) -> bool {
        if self
            .last_sync_honored
            .is_some_and(|at| now - at < SYNC_REQUEST_MIN_INTERVAL)
        {
            return false;
        }
        self.last_sync_honored = Some(now);
        true
    }

    #[cfg(test)]
    pub(crate) fn force_confirmed_for_tests(&mut self) {
        self.state = LinkState::Confirmed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_crypto::{ExtKeyPair, derive_pair_key};

    type I = std::time::Instant;

    fn keys(seed: u8) -> ExtKeyPair {
        ExtKeyPair::from_entropy(&[seed; 64])
    }

    fn link(now: I) -> PeerLink<I> {
        let a = keys(1);
        let b = keys(2);
        PeerLink::new_outgoing(derive_pair_key(&a.enc, &b.enc.public()), now)
    }

    #[test]
    fn handshake_progression() {
        let t0 = std::time::Instant::now();
        let mut link = link(t0);
        assert_eq!(link.state(), LinkState::Uninitialized);

        let ephemeral = EncSecretKey::from_bytes([3; 32]);
        link.handshake_sent(ephemeral, t0);
        assert_eq!(link.state(), LinkState::HandshakeSent);

        let their_ephemeral = EncSecretKey::from_bytes([4; 32]);
        assert!(link.establish_session(&their_ephemeral.public()));
        assert_eq!(link.state(), LinkState::HandshakeAcked);

        link.invite_accepted();
        assert_eq!(link.state(), LinkState::PeerInfoExchanged);

        assert!(link.confirm());
        assert!(link.is_confirmed());
        assert!(!link.confirm(), "confirm is not re-entrant");
    }

    #[test]
    fn session_keys_match_across_the_pair() {
        let t0 = std::time::Instant::now();
        let a_keys = keys(1);
        let b_keys = keys(2);

        let mut a_link = PeerLink::new_outgoing(derive_pair_key(&a_keys.enc, &b_keys.enc.public()), t0);
        let mut b_link = PeerLink::new_incoming(derive_pair_key(&b_keys.enc, &a_keys.enc.public()), t0);

        let a_eph = EncSecretKey::from_bytes([10; 32]);
        let b_eph = EncSecretKey::from_bytes([11; 32]);
        let a_eph_pk = a_eph.public();
        let b_eph_pk = b_eph.public();

        a_link.handshake_sent(a_eph, t0);
        b_link.handshake_sent(b_eph, t0);

        assert!(a_link.establish_session(&b_eph_pk));
        assert!(b_link.establish_session(&a_eph_pk));

        assert_eq!(a_link.session_key(), b_link.session_key());
        assert_eq!(a_link.pair_key(), b_link.pair_key());
    }

    #[test]
    fn establish_session_requires_our_ephemeral() {
        let t0 = std::time::Instant::now();
        let mut link = link(t0);
        let their = EncSecretKey::from_bytes([5; 32]).public();
        assert!(!link.establish_session(&their));
    }

    #[test]
    fn timeouts_differ_by_confirmation() {
        let t0 = std::time::Instant::now();
        let mut link = link(t0);

        assert!(!link.is_timed_out(t0 + Duration::from_secs(11)));
        assert!(link.is_timed_out(t0 + UNCONFIRMED_PEER_TIMEOUT));

        link.force_confirmed_for_tests();
        assert!(!link.is_timed_out(t0 + Duration::from_secs(60)));
        assert!(link.is_timed_out(t0 + CONFIRMED_PEER_TIMEOUT));
    }

    #[test]
    fn decrypt_failures_accumulate_until_limit() {
        let t0 = std::time::Instant::now();
        let mut link = link(t0);

        for _ in 0..DECRYPT_FAILURE_LIMIT - 1 {
            assert!(!link.note_decrypt_failure());
        }
        assert!(link.note_decrypt_failure());

        // A successful packet resets the counter.
        link.touch(t0);
        assert!(!link.note_decrypt_failure());
    }

    #[test]
    fn sync_request_flood_control() {
        let t0 = std::time::Instant::now();
        let mut link = link(t0);

        assert!(link.sync_request_allowed(t0));
        assert!(!link.sync_request_allowed(t0 + Duration::from_secs(1)));
        assert!(link.sync_request_allowed(t0 + Duration::from_secs(6)));
    }
}
