//! Codec error type.

use thiserror::Error;

/// Errors produced while sealing or opening datagrams and while packing or
/// unpacking payload structs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Sealed frame would exceed the maximum datagram size.
    #[error("packet too large: {size} bytes exceeds maximum {max}")]
    PayloadTooLarge {
        /// Resulting frame size.
        size: usize,
        /// Allowed maximum.
        max: usize,
    },

    /// Datagram is shorter than the minimum for its outer type.
    #[error("packet too short: {actual} bytes, need at least {expected}")]
    PacketTooShort {
        /// Required minimum.
        expected: usize,
        /// Observed size.
        actual: usize,
    },

    /// The chat-id hash in the header does not match this group.
    #[error("chat id hash mismatch: got {got:#010x}, expected {expected:#010x}")]
    BadChatId {
        /// Hash carried by the packet.
        got: u32,
        /// Hash of the local group.
        expected: u32,
    },

    /// AEAD rejected the ciphertext.
    #[error("decryption failed")]
    DecryptFailed,

    /// AEAD refused to encrypt (implementation bug).
    #[error("encryption failed")]
    EncryptFailed,

    /// Structurally invalid frame or payload.
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
}

impl From<conclave_crypto::CryptoError> for CodecError {
    fn from(err: conclave_crypto::CryptoError) -> Self {
        match err {
            conclave_crypto::CryptoError::EncryptFailed => Self::EncryptFailed,
            _ => Self::DecryptFailed,
        }
    }
}
