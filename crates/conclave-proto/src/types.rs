//! Enumerations shared across the wire format.

/// Outer datagram type, the first plaintext byte of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OuterType {
    /// Handshake frame, sealed under the pair key.
    Handshake = 0x5a,
    /// Reliable ordered frame, sealed under the session key.
    Lossless = 0x5b,
    /// Best-effort frame, sealed under the session key.
    Lossy = 0x5c,
}

impl OuterType {
    /// Parse from the wire byte.
    pub const fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x5a => Some(Self::Handshake),
            0x5b => Some(Self::Lossless),
            0x5c => Some(Self::Lossy),
            _ => None,
        }
    }

    /// The wire byte.
    pub const fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Inner group packet type, the first byte after the implicit padding.
///
/// Values 0x01–0x03 ride the lossy channel; 0xf1–0xff ride the lossless
/// channel. Zero is reserved (it is indistinguishable from padding).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum GroupPacketKind {
    /// Version-vector keepalive.
    Ping = 0x01,
    /// Lossless delivery ack / retransmit request.
    MessageAck = 0x02,
    /// Invite rejected during handshake.
    InviteReject = 0x03,

    /// Packed TCP relay list.
    TcpRelays = 0xf1,
    /// Opaque application bytes.
    Custom = 0xf2,
    /// Group-wide broadcast envelope.
    Broadcast = 0xf3,
    /// Request for peer info.
    PeerInfoRequest = 0xf4,
    /// Peer info (password, nick, status, role).
    PeerInfoResponse = 0xf5,
    /// Invite request carrying group name and password.
    InviteRequest = 0xf6,
    /// Invite accepted.
    InviteResponse = 0xf7,
    /// Request for out-of-date artifacts.
    SyncRequest = 0xf8,
    /// Single packed peer announce.
    SyncResponse = 0xf9,
    /// Signed versioned topic.
    Topic = 0xfa,
    /// Founder-signed shared state.
    SharedState = 0xfb,
    /// Moderator list.
    ModList = 0xfc,
    /// Sanctions list plus credentials.
    SanctionsList = 0xfd,
    /// Friend invite handshake-completion notice.
    FriendInvite = 0xfe,
    /// Handshake response ack, first lossless packet on a link.
    HsResponseAck = 0xff,
}

impl GroupPacketKind {
    /// Parse from the wire byte.
    pub const fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Ping),
            0x02 => Some(Self::MessageAck),
            0x03 => Some(Self::InviteReject),
            0xf1 => Some(Self::TcpRelays),
            0xf2 => Some(Self::Custom),
            0xf3 => Some(Self::Broadcast),
            0xf4 => Some(Self::PeerInfoRequest),
            0xf5 => Some(Self::PeerInfoResponse),
            0xf6 => Some(Self::InviteRequest),
            0xf7 => Some(Self::InviteResponse),
            0xf8 => Some(Self::SyncRequest),
            0xf9 => Some(Self::SyncResponse),
            0xfa => Some(Self::Topic),
            0xfb => Some(Self::SharedState),
            0xfc => Some(Self::ModList),
            0xfd => Some(Self::SanctionsList),
            0xfe => Some(Self::FriendInvite),
            0xff => Some(Self::HsResponseAck),
            _ => None,
        }
    }

    /// The wire byte.
    pub const fn to_u8(self) -> u8 {
        self as u8
    }

    /// True for types that ride the lossless channel.
    pub const fn is_lossless(self) -> bool {
        self.to_u8() >= 0xf1
    }

    /// True for types that ride the lossy channel.
    pub const fn is_lossy(self) -> bool {
        !self.is_lossless()
    }
}

/// Broadcast envelope subtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BroadcastKind {
    /// Presence status change.
    Status = 0,
    /// Nickname change.
    Nick = 1,
    /// Plain chat message.
    PlainMessage = 2,
    /// Action ("/me") message.
    ActionMessage = 3,
    /// Private message (sent to a single peer).
    PrivateMessage = 4,
    /// Peer left voluntarily; payload is the part message.
    PeerExit = 5,
    /// Moderator instructed everyone to drop a peer.
    KickPeer = 6,
    /// Moderator list promotion/demotion.
    SetMod = 7,
    /// Observer sanction set/lifted.
    SetObserver = 8,
}

impl BroadcastKind {
    /// Parse from the wire byte.
    pub const fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Status),
            1 => Some(Self::Nick),
            2 => Some(Self::PlainMessage),
            3 => Some(Self::ActionMessage),
            4 => Some(Self::PrivateMessage),
            5 => Some(Self::PeerExit),
            6 => Some(Self::KickPeer),
            7 => Some(Self::SetMod),
            8 => Some(Self::SetObserver),
            _ => None,
        }
    }

    /// The wire byte.
    pub const fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Message-ack subtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AckKind {
    /// Packet with the given id was received and processed.
    Received = 0,
    /// Packet with the given id is missing; retransmit it.
    Request = 1,
}

impl AckKind {
    /// Parse from the wire byte.
    pub const fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Received),
            1 => Some(Self::Request),
            _ => None,
        }
    }
}

/// Why a join attempt was rejected by the responder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RejectReason {
    /// Nickname already in use by a confirmed peer.
    NickTaken = 0,
    /// The group is at its peer limit.
    GroupFull = 1,
    /// Password mismatch.
    InvalidPassword = 2,
    /// Any other handshake failure.
    InviteFailed = 3,
}

impl RejectReason {
    /// Parse from the wire byte.
    pub const fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::NickTaken),
            1 => Some(Self::GroupFull),
            2 => Some(Self::InvalidPassword),
            3 => Some(Self::InviteFailed),
            _ => None,
        }
    }
}

/// Handshake frame discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HandshakeKind {
    /// Initiator's opening frame. Nonzero so it survives padding-skip.
    Request = 1,
    /// Responder's reply frame.
    Response = 2,
}

impl HandshakeKind {
    /// Parse from the wire byte.
    pub const fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Request),
            2 => Some(Self::Response),
            _ => None,
        }
    }
}

/// How the initiating peer found the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum JoinKind {
    /// Looked up via the public announce layer (chat id).
    Public = 1,
    /// Invited by a friend out-of-band.
    FriendInvite = 2,
}

impl JoinKind {
    /// Parse from the wire byte.
    pub const fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Public),
            2 => Some(Self::FriendInvite),
            _ => None,
        }
    }
}

/// Group privacy state, replicated through the shared state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PrivacyState {
    /// Announced on the DHT; anyone with the chat id may attempt to join.
    Public = 0,
    /// Invite-only.
    Private = 1,
}

impl PrivacyState {
    /// Parse from the wire byte.
    pub const fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Public),
            1 => Some(Self::Private),
            _ => None,
        }
    }
}

/// Peer role. Hierarchical: every role has all privileges of those below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Role {
    /// All-powerful; cannot be demoted or sanctioned.
    Founder = 0,
    /// May promote/demote/kick everyone below founder.
    Moderator = 1,
    /// May talk and (when unlocked) set the topic.
    User = 2,
    /// May observe only.
    Observer = 3,
}

impl Role {
    /// Parse from the wire byte.
    pub const fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Founder),
            1 => Some(Self::Moderator),
            2 => Some(Self::User),
            3 => Some(Self::Observer),
            _ => None,
        }
    }

    /// The wire byte.
    pub const fn to_u8(self) -> u8 {
        self as u8
    }

    /// True if `self` outranks `other`.
    ///
    /// Lower discriminants are higher roles, so this inverts the derived
    /// ordering.
    pub fn outranks(self, other: Role) -> bool {
        (self as u8) < (other as u8)
    }

    /// True if `self` is at least as high as `other`.
    pub fn at_least(self, other: Role) -> bool {
        (self as u8) <= (other as u8)
    }
}

/// Peer presence status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StatusKind {
    /// Active.
    None = 0,
    /// Away.
    Away = 1,
    /// Busy.
    Busy = 2,
}

impl StatusKind {
    /// Parse from the wire byte.
    pub const fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::None),
            1 => Some(Self::Away),
            2 => Some(Self::Busy),
            _ => None,
        }
    }

    /// The wire byte.
    pub const fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Which artifacts a sync request asks for. Bitfield, two wire bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncFlags(u16);

impl SyncFlags {
    /// Request the peer list.
    pub const PEER_LIST: u16 = 1 << 0;
    /// Request the topic.
    pub const TOPIC: u16 = 1 << 2;
    /// Request shared state, moderator list, and sanctions list.
    pub const STATE: u16 = 1 << 4;

    /// Construct from raw bits (unknown bits are preserved but ignored).
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    /// The raw bits.
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// True if no artifact is requested.
    pub const fn is_empty(self) -> bool {
        self.0 & (Self::PEER_LIST | Self::TOPIC | Self::STATE) == 0
    }

    /// True if the peer list is requested.
    pub const fn peer_list(self) -> bool {
        self.0 & Self::PEER_LIST != 0
    }

    /// True if the topic is requested.
    pub const fn topic(self) -> bool {
        self.0 & Self::TOPIC != 0
    }

    /// True if the state bundle is requested.
    pub const fn state(self) -> bool {
        self.0 & Self::STATE != 0
    }

    /// Set the peer-list bit.
    pub fn with_peer_list(self) -> Self {
        Self(self.0 | Self::PEER_LIST)
    }

    /// Set the topic bit.
    pub fn with_topic(self) -> Self {
        Self(self.0 | Self::TOPIC)
    }

    /// Set the state bit.
    pub fn with_state(self) -> Self {
        Self(self.0 | Self::STATE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_kind_round_trips() {
        for byte in 0u8..=255 {
            if let Some(kind) = GroupPacketKind::from_u8(byte) {
                assert_eq!(kind.to_u8(), byte);
            }
        }
    }

    #[test]
    fn lossy_and_lossless_partition() {
        assert!(GroupPacketKind::Ping.is_lossy());
        assert!(GroupPacketKind::MessageAck.is_lossy());
        assert!(GroupPacketKind::InviteReject.is_lossy());
        assert!(GroupPacketKind::Broadcast.is_lossless());
        assert!(GroupPacketKind::HsResponseAck.is_lossless());
    }

    #[test]
    fn role_hierarchy() {
        assert!(Role::Founder.outranks(Role::Moderator));
        assert!(Role::Moderator.outranks(Role::User));
        assert!(Role::User.outranks(Role::Observer));
        assert!(!Role::Observer.outranks(Role::Observer));
        assert!(Role::Moderator.at_least(Role::Moderator));
        assert!(!Role::User.at_least(Role::Moderator));
    }

    #[test]
    fn sync_flags_bits() {
        let flags = SyncFlags::default().with_topic().with_state();
        assert!(!flags.peer_list());
        assert!(flags.topic());
        assert!(flags.state());
        assert_eq!(SyncFlags::from_bits(flags.bits()), flags);
    }
}
