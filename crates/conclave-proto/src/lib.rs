//! Conclave wire model.
//!
//! Everything that crosses the datagram boundary lives here: the plaintext
//! outer header, the group packet type catalogue, the control payload
//! structs with their fixed binary encodings, and the packet codec that
//! seals and opens the AEAD portion of a frame.
//!
//! Frame layout on the wire:
//!
//! ```text
//! [outer_type:1][chat_id_hash:4][sender_enc_pk:32][nonce:24]
//! [AEAD{ padding[0..8] ‖ group_packet_type:1 ‖ (message_id:8 if lossless) ‖ payload }]
//! ```
//!
//! All multi-byte integers are big-endian. The outer header is plaintext so
//! a receiver can route (or drop) a datagram without doing any key lookup;
//! everything after it is sealed with XChaCha20-Poly1305 under either the
//! pair key (handshake frames) or the session key (traffic frames).

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod codec;
mod error;
mod header;
pub mod payloads;
mod types;

pub use codec::{OpenedPacket, PacketBody, open, peek_header, seal};
pub use error::CodecError;
pub use header::OuterHeader;
pub use types::{
    AckKind, BroadcastKind, GroupPacketKind, HandshakeKind, JoinKind, OuterType, PrivacyState,
    RejectReason, Role, StatusKind, SyncFlags,
};

/// Size of the plaintext outer header, in bytes.
pub const OUTER_HEADER_SIZE: usize = 61;

/// Largest datagram the protocol will produce or accept.
pub const MAX_PACKET_SIZE: usize = 1400;

/// Smallest valid lossless datagram (empty payload, no padding).
pub const MIN_LOSSLESS_PACKET_SIZE: usize =
    OUTER_HEADER_SIZE + 1 + MESSAGE_ID_SIZE + conclave_crypto::TAG_SIZE;

/// Smallest valid lossy datagram (empty payload, no padding).
pub const MIN_LOSSY_PACKET_SIZE: usize = OUTER_HEADER_SIZE + 1 + conclave_crypto::TAG_SIZE;

/// Size of a lossless message id on the wire.
pub const MESSAGE_ID_SIZE: usize = 8;

/// Maximum number of implicit padding bytes ahead of the packet type.
pub const MAX_PADDING: usize = 8;

/// Maximum nickname length, in bytes.
pub const MAX_NICK_SIZE: usize = 128;

/// Maximum topic length, in bytes.
pub const MAX_TOPIC_SIZE: usize = 512;

/// Maximum group name length, in bytes.
pub const MAX_GROUP_NAME_SIZE: usize = 48;

/// Maximum group password length, in bytes.
pub const MAX_PASSWORD_SIZE: usize = 32;

/// Maximum chat/private message length, in bytes.
///
/// Chosen so a broadcast frame with maximum padding still fits in
/// [`MAX_PACKET_SIZE`].
pub const MAX_MESSAGE_SIZE: usize = 1280;

/// Maximum part (leave) message length, in bytes.
pub const MAX_PART_MESSAGE_SIZE: usize = 128;

/// Maximum custom packet payload length, in bytes.
pub const MAX_CUSTOM_PACKET_SIZE: usize = 1280;

/// Maximum number of moderators a group may have.
///
/// Bounded so a full `MOD_LIST` frame fits in a single datagram.
pub const MAX_MODERATORS: usize = 30;

/// Maximum number of sanctions entries.
///
/// Bounded so a full `SANCTIONS_LIST` frame fits in a single datagram.
pub const MAX_SANCTIONS: usize = 8;

/// Maximum number of peer addresses carried in a saved group record.
pub const MAX_SAVED_PEER_ADDRS: usize = 30;

/// Maximum number of TCP relays shared per peer announce.
pub const MAX_ANNOUNCED_RELAYS: usize = 3;
