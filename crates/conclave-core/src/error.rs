//! Error types for the engine's public operations.
//!
//! One enum per operation category, as callers see them. Crypto and
//! integrity failures discovered while processing packets never appear
//! here: those are logged and the offending packet is dropped.

use thiserror::Error;

/// Errors from group lookup and connection-state operations.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupError {
    /// No group with that id.
    #[error("group not found")]
    NotFound,

    /// The group is already disconnected.
    #[error("group already disconnected")]
    AlreadyDisconnected,

    /// The group is disconnected.
    #[error("group is disconnected")]
    Disconnected,
}

/// Errors from `create_group`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateError {
    /// Group name exceeds 48 bytes.
    #[error("group name too long")]
    NameTooLong,

    /// Group name is empty.
    #[error("group name is empty")]
    NameEmpty,

    /// Nickname is empty.
    #[error("nickname is empty")]
    NickEmpty,

    /// Nickname exceeds 128 bytes.
    #[error("nickname too long")]
    NickTooLong,

    /// Group state failed to initialize.
    #[error("group initialization failed")]
    InitFailed,
}

/// Errors from `join_by_chat_id` and `accept_invite`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinError {
    /// Already a member of a group with this chat id.
    #[error("already in this group")]
    Duplicate,

    /// Password exceeds 32 bytes.
    #[error("password too long")]
    PasswordTooLong,

    /// Nickname is empty.
    #[error("nickname is empty")]
    NickEmpty,

    /// Nickname exceeds 128 bytes.
    #[error("nickname too long")]
    NickTooLong,

    /// Invite cookie is malformed.
    #[error("bad invite data")]
    BadInvite,

    /// Group state failed to initialize.
    #[error("group initialization failed")]
    InitFailed,
}

/// Errors from the send family (`send_message`, `send_private`,
/// `send_custom`).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// No group with that id.
    #[error("group not found")]
    GroupNotFound,

    /// No peer with that id.
    #[error("peer not found")]
    PeerNotFound,

    /// Message exceeds the maximum size.
    #[error("message too long")]
    TooLong,

    /// Message is empty.
    #[error("message is empty")]
    Empty,

    /// The group is not connected.
    #[error("not connected to group")]
    NotConnected,

    /// Observers may not write.
    #[error("permission denied")]
    PermissionDenied,

    /// The per-link send window is full.
    #[error("send queue full")]
    SendQueueFull,
}

/// Errors from `set_role` and `kick`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleError {
    /// No group with that id.
    #[error("group not found")]
    GroupNotFound,

    /// No peer with that id.
    #[error("peer not found")]
    PeerNotFound,

    /// Caller's role is insufficient for the transition.
    #[error("permission denied")]
    PermissionDenied,

    /// The requested role cannot be assigned (e.g. founder).
    #[error("invalid role assignment")]
    InvalidRole,

    /// Callers may not target themselves.
    #[error("cannot target self")]
    SelfTarget,

    /// The transition could not be applied.
    #[error("role change failed")]
    Failed,
}

/// Errors from `toggle_ignore`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreError {
    /// No group with that id.
    #[error("group not found")]
    GroupNotFound,

    /// No peer with that id.
    #[error("peer not found")]
    PeerNotFound,

    /// Callers may not ignore themselves.
    #[error("cannot target self")]
    SelfTarget,
}

/// Errors from `set_topic`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicError {
    /// No group with that id.
    #[error("group not found")]
    GroupNotFound,

    /// Topic exceeds 512 bytes.
    #[error("topic too long")]
    TooLong,

    /// Caller's role is insufficient under the current topic lock.
    #[error("permission denied")]
    PermissionDenied,

    /// The group is disconnected.
    #[error("group is disconnected")]
    Disconnected,
}

/// Errors from founder-only shared-state operations (`set_password`,
/// `set_privacy`, `set_peer_limit`, `set_topic_lock`).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FounderError {
    /// No group with that id.
    #[error("group not found")]
    GroupNotFound,

    /// Caller is not the founder.
    #[error("caller is not the founder")]
    NotFounder,

    /// Value exceeds its size limit.
    #[error("value too long")]
    TooLong,

    /// The group is disconnected.
    #[error("group is disconnected")]
    Disconnected,
}

/// Errors from `set_nick`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NickError {
    /// No group with that id.
    #[error("group not found")]
    GroupNotFound,

    /// Nickname is empty.
    #[error("nickname is empty")]
    Empty,

    /// Nickname exceeds 128 bytes.
    #[error("nickname too long")]
    TooLong,

    /// Nickname is already in use by a confirmed peer.
    #[error("nickname already taken")]
    Taken,
}

/// Errors from `leave`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveError {
    /// No group with that id.
    #[error("group not found")]
    GroupNotFound,

    /// Part message exceeds 128 bytes.
    #[error("part message too long")]
    TooLong,
}

/// Errors from saved-group pack/unpack.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistError {
    /// Record bytes are structurally invalid.
    #[error("malformed saved group: {0}")]
    Malformed(&'static str),
}

impl From<conclave_proto::CodecError> for PersistError {
    fn from(_: conclave_proto::CodecError) -> Self {
        Self::Malformed("invalid embedded artifact")
    }
}
