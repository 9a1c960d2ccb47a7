//! Plaintext outer header with zero-copy parsing.
//!
//! The 61-byte header is everything a receiver needs to route a datagram:
//! the outer type selects the handling path, the chat-id hash selects the
//! group (or discards the frame), and the sender key selects the link whose
//! key opens the sealed remainder.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use conclave_crypto::{EncPublicKey, NONCE_SIZE, PUBLIC_KEY_SIZE};

use crate::{OUTER_HEADER_SIZE, error::CodecError, types::OuterType};

/// Fixed 61-byte plaintext frame header.
///
/// All fields are raw byte arrays so any 61-byte pattern is a valid
/// in-memory representation; semantic validation (known outer type) happens
/// in [`OuterHeader::validate`]. Casting from untrusted bytes therefore
/// cannot produce undefined behaviour.
#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct OuterHeader {
    outer_type: u8,
    chat_id_hash: [u8; 4],
    sender_enc_pk: [u8; PUBLIC_KEY_SIZE],
    nonce: [u8; NONCE_SIZE],
}

impl OuterHeader {
    /// Size of the serialized header.
    pub const SIZE: usize = OUTER_HEADER_SIZE;

    /// Build a header for an outgoing frame.
    pub fn new(outer: OuterType, chat_id_hash: u32, sender: &EncPublicKey, nonce: [u8; NONCE_SIZE]) -> Self {
        Self {
            outer_type: outer.to_u8(),
            chat_id_hash: chat_id_hash.to_be_bytes(),
            sender_enc_pk: *sender.as_bytes(),
            nonce,
        }
    }

    /// Parse a header from the front of `bytes` (zero-copy).
    ///
    /// # Errors
    ///
    /// - `CodecError::PacketTooShort` if fewer than 61 bytes are available
    /// - `CodecError::Malformed` if the outer type byte is unknown
    pub fn from_bytes(bytes: &[u8]) -> Result<&Self, CodecError> {
        let header = Self::ref_from_prefix(bytes)
            .map_err(|_| CodecError::PacketTooShort {
                expected: Self::SIZE,
                actual: bytes.len(),
            })?
            .0;

        header.validate()?;
        Ok(header)
    }

    fn validate(&self) -> Result<(), CodecError> {
        if OuterType::from_u8(self.outer_type).is_none() {
            return Err(CodecError::Malformed("unknown outer packet type"));
        }
        Ok(())
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out.copy_from_slice(IntoBytes::as_bytes(self));
        out
    }

    /// Outer datagram type.
    pub fn outer_type(&self) -> OuterType {
        // validate() ran at parse time and constructors take the enum.
        OuterType::from_u8(self.outer_type).unwrap_or(OuterType::Lossy)
    }

    /// 32-bit routing hash of the target group's chat id.
    pub fn chat_id_hash(&self) -> u32 {
        u32::from_be_bytes(self.chat_id_hash)
    }

    /// The sender's permanent public encryption key.
    pub fn sender(&self) -> EncPublicKey {
        EncPublicKey::from_bytes(self.sender_enc_pk)
    }

    /// The AEAD nonce for the sealed remainder.
    pub fn nonce(&self) -> &[u8; NONCE_SIZE] {
        &self.nonce
    }
}

impl std::fmt::Debug for OuterHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OuterHeader")
            .field("outer_type", &format_args!("{:#04x}", self.outer_type))
            .field("chat_id_hash", &format_args!("{:#010x}", self.chat_id_hash()))
            .field("sender", &self.sender())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_size_is_61() {
        assert_eq!(std::mem::size_of::<OuterHeader>(), OuterHeader::SIZE);
    }

    #[test]
    fn header_round_trip() {
        let sender = EncPublicKey::from_bytes([0xaa; 32]);
        let header = OuterHeader::new(OuterType::Lossless, 0xdead_beef, &sender, [7; NONCE_SIZE]);

        let bytes = header.to_bytes();
        let parsed = OuterHeader::from_bytes(&bytes).expect("should parse");

        assert_eq!(parsed.outer_type(), OuterType::Lossless);
        assert_eq!(parsed.chat_id_hash(), 0xdead_beef);
        assert_eq!(parsed.sender(), sender);
        assert_eq!(parsed.nonce(), &[7; NONCE_SIZE]);
    }

    #[test]
    fn reject_short_buffer() {
        let result = OuterHeader::from_bytes(&[0u8; 10]);
        assert_eq!(
            result.err(),
            Some(CodecError::PacketTooShort { expected: 61, actual: 10 })
        );
    }

    #[test]
    fn reject_unknown_outer_type() {
        let mut bytes = [0u8; OuterHeader::SIZE];
        bytes[0] = 0x99;
        assert!(matches!(OuterHeader::from_bytes(&bytes), Err(CodecError::Malformed(_))));
    }
}
