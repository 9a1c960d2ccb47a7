//! Packet codec: seal and open the AEAD portion of a frame.
//!
//! The sealed plaintext starts with 0..8 zero bytes of padding whose length
//! is implicit: every legal first content byte (group packet type or
//! handshake discriminator) is nonzero, so the opener skips leading zeroes.
//! Varying the padding length obscures the true payload length of short
//! packets from a passive observer.

use conclave_crypto::{EncPublicKey, NONCE_SIZE, SessionKey, TAG_SIZE};

use crate::{
    MAX_PACKET_SIZE, MAX_PADDING, MESSAGE_ID_SIZE, MIN_LOSSLESS_PACKET_SIZE, MIN_LOSSY_PACKET_SIZE,
    OUTER_HEADER_SIZE,
    error::CodecError,
    header::OuterHeader,
    types::{GroupPacketKind, OuterType},
};

/// Content of a frame about to be sealed.
#[derive(Debug, Clone, Copy)]
pub enum PacketBody<'a> {
    /// Handshake frame: the payload's first byte is the nonzero handshake
    /// discriminator, so no separate packet-type byte is written.
    Handshake {
        /// Packed handshake payload.
        payload: &'a [u8],
    },

    /// Reliable ordered frame.
    Lossless {
        /// Inner packet type (must be a lossless type).
        kind: GroupPacketKind,
        /// Per-link monotonic message id.
        message_id: u64,
        /// Packed payload.
        payload: &'a [u8],
    },

    /// Best-effort frame.
    Lossy {
        /// Inner packet type (must be a lossy type).
        kind: GroupPacketKind,
        /// Packed payload.
        payload: &'a [u8],
    },
}

impl PacketBody<'_> {
    fn outer_type(&self) -> OuterType {
        match self {
            Self::Handshake { .. } => OuterType::Handshake,
            Self::Lossless { .. } => OuterType::Lossless,
            Self::Lossy { .. } => OuterType::Lossy,
        }
    }
}

/// A successfully opened frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenedPacket {
    /// Handshake frame; payload still carries its leading discriminator.
    Handshake {
        /// Sender's permanent public encryption key.
        sender: EncPublicKey,
        /// Packed handshake payload.
        payload: Vec<u8>,
    },

    /// Reliable ordered frame.
    Lossless {
        /// Sender's permanent public encryption key.
        sender: EncPublicKey,
        /// Inner packet type.
        kind: GroupPacketKind,
        /// Per-link message id.
        message_id: u64,
        /// Payload bytes.
        payload: Vec<u8>,
    },

    /// Best-effort frame.
    Lossy {
        /// Sender's permanent public encryption key.
        sender: EncPublicKey,
        /// Inner packet type.
        kind: GroupPacketKind,
        /// Payload bytes.
        payload: Vec<u8>,
    },
}

/// Parse the plaintext header without touching the sealed remainder.
///
/// Used for routing: the caller needs the chat-id hash and sender key to
/// locate the group and link (and therefore the key) before calling
/// [`open`].
///
/// # Errors
///
/// - `CodecError::PacketTooShort` / `CodecError::Malformed` as in
///   [`OuterHeader::from_bytes`]
pub fn peek_header(bytes: &[u8]) -> Result<&OuterHeader, CodecError> {
    OuterHeader::from_bytes(bytes)
}

/// Seal a frame.
///
/// `padding` extra zero bytes (clamped to [`MAX_PADDING`]) are prepended to
/// the plaintext; the caller should draw the length from its randomness
/// source.
///
/// # Errors
///
/// - `CodecError::PayloadTooLarge` if the sealed frame would exceed
///   [`MAX_PACKET_SIZE`]
/// - `CodecError::EncryptFailed` if the AEAD rejects the plaintext
///   (implementation bug)
pub fn seal(
    chat_id_hash: u32,
    sender: &EncPublicKey,
    key: &SessionKey,
    nonce: [u8; NONCE_SIZE],
    padding: usize,
    body: PacketBody<'_>,
) -> Result<Vec<u8>, CodecError> {
    let padding = padding.min(MAX_PADDING);

    let mut plain = Vec::with_capacity(padding + 1 + MESSAGE_ID_SIZE + body_len(&body));
    plain.resize(padding, 0);

    match body {
        PacketBody::Handshake { payload } => {
            debug_assert!(payload.first().is_some_and(|&b| b != 0));
            plain.extend_from_slice(payload);
        },
        PacketBody::Lossless { kind, message_id, payload } => {
            debug_assert!(kind.is_lossless());
            plain.push(kind.to_u8());
            plain.extend_from_slice(&message_id.to_be_bytes());
            plain.extend_from_slice(payload);
        },
        PacketBody::Lossy { kind, payload } => {
            debug_assert!(kind.is_lossy());
            plain.push(kind.to_u8());
            plain.extend_from_slice(payload);
        },
    }

    let total = OUTER_HEADER_SIZE + plain.len() + TAG_SIZE;
    if total > MAX_PACKET_SIZE {
        return Err(CodecError::PayloadTooLarge { size: total, max: MAX_PACKET_SIZE });
    }

    let header = OuterHeader::new(body.outer_type(), chat_id_hash, sender, nonce);
    let sealed = conclave_crypto::seal(key, &nonce, &plain)?;

    let mut out = Vec::with_capacity(OUTER_HEADER_SIZE + sealed.len());
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(&sealed);
    Ok(out)
}

fn body_len(body: &PacketBody<'_>) -> usize {
    match body {
        PacketBody::Handshake { payload }
        | PacketBody::Lossless { payload, .. }
        | PacketBody::Lossy { payload, .. } => payload.len(),
    }
}

/// Open a frame addressed to the group identified by `expected_chat_id_hash`.
///
/// # Errors
///
/// - `CodecError::BadChatId` if the frame targets a different group
/// - `CodecError::PacketTooShort` if below the channel minimum
/// - `CodecError::DecryptFailed` on AEAD failure
/// - `CodecError::Malformed` on structural problems after decryption
pub fn open(
    expected_chat_id_hash: u32,
    key: &SessionKey,
    bytes: &[u8],
) -> Result<OpenedPacket, CodecError> {
    let header = OuterHeader::from_bytes(bytes)?;

    if header.chat_id_hash() != expected_chat_id_hash {
        return Err(CodecError::BadChatId {
            got: header.chat_id_hash(),
            expected: expected_chat_id_hash,
        });
    }

    let min = match header.outer_type() {
        OuterType::Lossless => MIN_LOSSLESS_PACKET_SIZE,
        // Handshake frames have no packet-type byte, but their payload is
        // never empty; the lossy minimum is the right lower bound.
        OuterType::Lossy | OuterType::Handshake => MIN_LOSSY_PACKET_SIZE,
    };
    if bytes.len() < min {
        return Err(CodecError::PacketTooShort { expected: min, actual: bytes.len() });
    }

    let plain = conclave_crypto::open(key, header.nonce(), &bytes[OUTER_HEADER_SIZE..])?;

    // Skip implicit padding.
    let start = plain.iter().take_while(|&&b| b == 0).count();
    if start > MAX_PADDING || start >= plain.len() {
        return Err(CodecError::Malformed("padding exceeds limit"));
    }
    let content = &plain[start..];

    let sender = header.sender();
    match header.outer_type() {
        OuterType::Handshake => Ok(OpenedPacket::Handshake { sender, payload: content.to_vec() }),

        OuterType::Lossless => {
            let kind = GroupPacketKind::from_u8(content[0])
                .ok_or(CodecError::Malformed("unknown group packet type"))?;
            if !kind.is_lossless() {
                return Err(CodecError::Malformed("lossy packet type on lossless channel"));
            }

            let rest = &content[1..];
            if rest.len() < MESSAGE_ID_SIZE {
                return Err(CodecError::Malformed("lossless packet missing message id"));
            }

            let mut id_bytes = [0u8; MESSAGE_ID_SIZE];
            id_bytes.copy_from_slice(&rest[..MESSAGE_ID_SIZE]);

            Ok(OpenedPacket::Lossless {
                sender,
                kind,
                message_id: u64::from_be_bytes(id_bytes),
                payload: rest[MESSAGE_ID_SIZE..].to_vec(),
            })
        },

        OuterType::Lossy => {
            let kind = GroupPacketKind::from_u8(content[0])
                .ok_or(CodecError::Malformed("unknown group packet type"))?;
            if !kind.is_lossy() {
                return Err(CodecError::Malformed("lossless packet type on lossy channel"));
            }

            Ok(OpenedPacket::Lossy { sender, kind, payload: content[1..].to_vec() })
        },
    }
}
