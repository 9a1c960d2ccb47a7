//! Pair/session key derivation and the symmetric AEAD.
//!
//! Two keys exist per link. The *pair key* is derived from both peers'
//! permanent encryption keypairs and protects only handshake packets. The
//! *session key* is derived from the ephemeral keypairs exchanged during the
//! handshake and protects all lossless/lossy traffic; it is rotated on every
//! new handshake, which is what gives a link forward secrecy.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit},
};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{
    NONCE_SIZE, SESSION_KEY_SIZE,
    error::CryptoError,
    keys::{EncPublicKey, EncSecretKey},
};

const PAIR_KEY_LABEL: &[u8] = b"conclaveGroupPairV1";
const SESSION_KEY_LABEL: &[u8] = b"conclaveGroupSessionV1";

/// A derived symmetric AEAD key. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; SESSION_KEY_SIZE]);

impl SessionKey {
    /// Borrow the raw key bytes (AEAD construction only).
    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(…)")
    }
}

impl PartialEq for SessionKey {
    fn eq(&self, other: &Self) -> bool {
        // Test-support equality; keys are never compared on a hot path.
        self.0 == other.0
    }
}

impl Eq for SessionKey {}

fn derive(our: &EncSecretKey, their: &EncPublicKey, label: &[u8]) -> SessionKey {
    let shared = our.diffie_hellman(their);
    let hkdf = Hkdf::<Sha256>::new(None, shared.as_bytes());

    let mut key = [0u8; SESSION_KEY_SIZE];
    let Ok(()) = hkdf.expand(label, &mut key) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };

    SessionKey(key)
}

/// Derive the handshake pair key from permanent encryption keys.
///
/// Symmetric: `derive_pair_key(a_sk, b_pk) == derive_pair_key(b_sk, a_pk)`.
pub fn derive_pair_key(our: &EncSecretKey, their: &EncPublicKey) -> SessionKey {
    derive(our, their, PAIR_KEY_LABEL)
}

/// Derive the traffic session key from the ephemeral handshake keys.
///
/// Symmetric in the same way as [`derive_pair_key`].
pub fn derive_session_key(our: &EncSecretKey, their: &EncPublicKey) -> SessionKey {
    derive(our, their, SESSION_KEY_LABEL)
}

/// Seal `plaintext` with XChaCha20-Poly1305.
///
/// # Errors
///
/// - `CryptoError::EncryptFailed` if the AEAD rejects the input. This
///   indicates an implementation bug, never peer behaviour.
pub fn seal(key: &SessionKey, nonce: &[u8; NONCE_SIZE], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    cipher.encrypt(XNonce::from_slice(nonce), plaintext).map_err(|_| CryptoError::EncryptFailed)
}

/// Open an XChaCha20-Poly1305 ciphertext.
///
/// # Errors
///
/// - `CryptoError::DecryptFailed` on authentication failure (wrong key,
///   wrong nonce, or tampering).
pub fn open(key: &SessionKey, nonce: &[u8; NONCE_SIZE], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    cipher.decrypt(XNonce::from_slice(nonce), ciphertext).map_err(|_| CryptoError::DecryptFailed)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::keys::ExtKeyPair;

    fn pair(seed: u8) -> ExtKeyPair {
        ExtKeyPair::from_entropy(&[seed; 64])
    }

    #[test]
    fn both_sides_derive_the_same_session_key() {
        let a = pair(1);
        let b = pair(2);

        let at_a = derive_session_key(&a.enc, &b.enc.public());
        let at_b = derive_session_key(&b.enc, &a.enc.public());
        assert_eq!(at_a, at_b);
    }

    #[test]
    fn pair_and_session_keys_differ() {
        let a = pair(1);
        let b = pair(2);

        let pair_key = derive_pair_key(&a.enc, &b.enc.public());
        let session_key = derive_session_key(&a.enc, &b.enc.public());
        assert_ne!(pair_key, session_key);
    }

    #[test]
    fn seal_open_round_trip() {
        let a = pair(1);
        let b = pair(2);
        let key = derive_session_key(&a.enc, &b.enc.public());

        let nonce = [0x24u8; NONCE_SIZE];
        let sealed = seal(&key, &nonce, b"attack at dawn").unwrap();
        assert_eq!(open(&key, &nonce, &sealed).unwrap(), b"attack at dawn");
    }

    #[test]
    fn tampered_ciphertext_fails_open() {
        let a = pair(1);
        let b = pair(2);
        let key = derive_session_key(&a.enc, &b.enc.public());

        let nonce = [0u8; NONCE_SIZE];
        let mut sealed = seal(&key, &nonce, b"payload").unwrap();
        sealed[0] ^= 0xff;
        assert_eq!(open(&key, &nonce, &sealed), Err(CryptoError::DecryptFailed));
    }

    #[test]
    fn wrong_key_fails_open() {
        let a = pair(1);
        let b = pair(2);
        let c = pair(3);

        let key_ab = derive_session_key(&a.enc, &b.enc.public());
        let key_ac = derive_session_key(&a.enc, &c.enc.public());

        let nonce = [0u8; NONCE_SIZE];
        let sealed = seal(&key_ab, &nonce, b"payload").unwrap();
        assert!(open(&key_ac, &nonce, &sealed).is_err());
    }

    proptest! {
        #[test]
        fn round_trip_arbitrary_payloads(payload in prop::collection::vec(any::<u8>(), 0..1400)) {
            let a = pair(10);
            let b = pair(11);
            let key = derive_session_key(&a.enc, &b.enc.public());

            let nonce = [7u8; NONCE_SIZE];
            let sealed = seal(&key, &nonce, &payload).unwrap();
            prop_assert_eq!(open(&key, &nonce, &sealed).unwrap(), payload);
        }
    }
}
