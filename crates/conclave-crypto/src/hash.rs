//! Hashing helpers: SHA-256 and the 32-bit chat-id routing hash.

use sha2::{Digest, Sha256};

use crate::{SHA256_SIZE, keys::ChatId};

/// SHA-256 of `data`.
pub fn sha256(data: &[u8]) -> [u8; SHA256_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Deterministic 32-bit hash of a Chat ID.
///
/// Carried in the plaintext packet header so receivers can cheaply drop
/// datagrams addressed to a different group before attempting decryption.
/// Collisions are harmless: a colliding packet still fails AEAD opening.
pub fn chat_id_hash(chat_id: &ChatId) -> u32 {
    let digest = sha256(chat_id.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_known_vector() {
        // SHA-256("abc")
        let digest = sha256(b"abc");
        assert_eq!(
            digest[..4],
            [0xba, 0x78, 0x16, 0xbf],
            "digest prefix must match the FIPS 180-2 test vector"
        );
    }

    #[test]
    fn chat_id_hash_is_deterministic() {
        let id = ChatId::from_bytes([7u8; 32]);
        assert_eq!(chat_id_hash(&id), chat_id_hash(&id));
    }

    #[test]
    fn chat_id_hash_differs_across_ids() {
        let a = ChatId::from_bytes([1u8; 32]);
        let b = ChatId::from_bytes([2u8; 32]);
        assert_ne!(chat_id_hash(&a), chat_id_hash(&b));
    }
}
