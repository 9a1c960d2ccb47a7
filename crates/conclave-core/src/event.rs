//! The upcall surface.
//!
//! Everything the engine wants the surrounding application to know arrives
//! as a [`GroupEvent`] drained via `GroupEngine::poll_event`. Events carry
//! generation-tagged peer ids; an id stays resolvable until the peer's
//! slot is reused, so stale ids from drained-late events fail lookup
//! instead of naming the wrong peer.

use crate::peer::PeerId;
use conclave_proto::{PrivacyState, StatusKind};

/// Identifies one group within an engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub(crate) u32);

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// Chat message flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Ordinary chat message.
    Normal,
    /// Action ("/me") message.
    Action,
}

/// Why a peer left the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The peer announced it was leaving.
    Quit,
    /// No ping within the confirmed-peer timeout.
    Timeout,
    /// The link was torn down (resend ceiling or repeated decrypt
    /// failures).
    SyncError,
    /// The peer disconnected without a part message.
    Disconnected,
    /// We disconnected; all peers are dropped with this reason.
    SelfDisconnected,
    /// The peer was kicked.
    Kick,
}

/// Why a join attempt failed, as reported by the responder or deduced
/// locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinFailReason {
    /// Nickname already in use.
    NickTaken,
    /// Group is full.
    PeerLimit,
    /// Wrong password.
    InvalidPassword,
    /// Anything else.
    Unknown,
}

/// A moderation transition observed by this peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModEvent {
    /// Target was kicked from the group.
    Kick,
    /// Target was demoted to observer.
    Observer,
    /// Target was restored to user.
    User,
    /// Target was promoted to moderator.
    Moderator,
}

/// Upcalls delivered to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupEvent {
    /// A chat message arrived.
    Message {
        /// Source group.
        group_id: GroupId,
        /// Sending peer.
        peer_id: PeerId,
        /// Normal or action.
        kind: MessageKind,
        /// Message bytes.
        data: Vec<u8>,
        /// Sender's wall-clock timestamp (seconds).
        timestamp: u64,
    },

    /// A private message arrived.
    PrivateMessage {
        /// Source group.
        group_id: GroupId,
        /// Sending peer.
        peer_id: PeerId,
        /// Normal or action.
        kind: MessageKind,
        /// Message bytes.
        data: Vec<u8>,
    },

    /// An opaque custom packet arrived.
    CustomPacket {
        /// Source group.
        group_id: GroupId,
        /// Sending peer.
        peer_id: PeerId,
        /// Application bytes.
        data: Vec<u8>,
    },

    /// A peer completed the handshake and is now confirmed.
    PeerJoin {
        /// Group the peer joined.
        group_id: GroupId,
        /// The new peer.
        peer_id: PeerId,
    },

    /// A confirmed peer left.
    PeerExit {
        /// Group the peer left.
        group_id: GroupId,
        /// The departed peer. No longer resolvable.
        peer_id: PeerId,
        /// The peer's last known nickname.
        nick: Vec<u8>,
        /// Why it left.
        reason: ExitReason,
        /// Part message, if the peer sent one.
        part_message: Vec<u8>,
    },

    /// A moderation transition was applied.
    Moderation {
        /// Group it happened in.
        group_id: GroupId,
        /// Acting peer, if it was not us.
        source: Option<PeerId>,
        /// Affected peer, if it was not us.
        target: Option<PeerId>,
        /// What happened.
        event: ModEvent,
    },

    /// A peer changed its nickname.
    NickChange {
        /// Group it happened in.
        group_id: GroupId,
        /// The peer.
        peer_id: PeerId,
        /// The new nickname.
        nick: Vec<u8>,
    },

    /// A peer changed its presence status.
    StatusChange {
        /// Group it happened in.
        group_id: GroupId,
        /// The peer.
        peer_id: PeerId,
        /// The new status.
        status: StatusKind,
    },

    /// The group topic changed.
    TopicChange {
        /// Group it happened in.
        group_id: GroupId,
        /// Setter, if it is a known peer (absent for synced history).
        peer_id: Option<PeerId>,
        /// The new topic.
        topic: Vec<u8>,
    },

    /// The founder changed the group password.
    PasswordChange {
        /// Group it happened in.
        group_id: GroupId,
    },

    /// The founder changed the privacy state.
    PrivacyChange {
        /// Group it happened in.
        group_id: GroupId,
        /// The new privacy state.
        privacy: PrivacyState,
    },

    /// The founder changed the peer limit.
    PeerLimitChange {
        /// Group it happened in.
        group_id: GroupId,
        /// The new limit.
        limit: u32,
    },

    /// Our own join handshake completed; the group is usable.
    SelfJoin {
        /// The joined group.
        group_id: GroupId,
    },

    /// Our join attempt was rejected.
    JoinFail {
        /// The group we failed to join.
        group_id: GroupId,
        /// Why.
        reason: JoinFailReason,
    },
}
