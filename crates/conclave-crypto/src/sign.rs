//! Ed25519 signing helpers.

use ed25519_dalek::{Signer, Verifier, VerifyingKey};

use crate::{
    SIGNATURE_SIZE,
    error::CryptoError,
    keys::{SigPublicKey, SigSecretKey},
};

/// A detached Ed25519 signature.
///
/// Ordered byte-wise: the lexicographic ordering is used as the tie-breaker
/// when two signed artifacts carry the same version.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Signature([u8; SIGNATURE_SIZE]);

impl Signature {
    /// Wrap raw signature bytes.
    pub const fn from_bytes(bytes: [u8; SIGNATURE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Borrow the raw signature bytes.
    pub const fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({:02x}{:02x}{:02x}{:02x}…)", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

/// Sign `message` with the given secret signature key.
pub fn sign(key: &SigSecretKey, message: &[u8]) -> Signature {
    Signature(key.signing_key().sign(message).to_bytes())
}

/// Verify `signature` over `message` under `key`.
///
/// # Errors
///
/// - `CryptoError::InvalidKey` if `key` is not a canonical Ed25519 point
/// - `CryptoError::BadSignature` if verification fails
pub fn verify(key: &SigPublicKey, message: &[u8], signature: &Signature) -> Result<(), CryptoError> {
    let verifying_key =
        VerifyingKey::from_bytes(key.as_bytes()).map_err(|_| CryptoError::InvalidKey)?;

    let sig = ed25519_dalek::Signature::from_bytes(signature.as_bytes());
    verifying_key.verify(message, &sig).map_err(|_| CryptoError::BadSignature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::ExtKeyPair;

    #[test]
    fn sign_verify_round_trip() {
        let pair = ExtKeyPair::from_entropy(&[5; 64]);
        let sig = sign(&pair.sig, b"message");
        assert!(verify(&pair.sig.public(), b"message", &sig).is_ok());
    }

    #[test]
    fn verify_rejects_wrong_message() {
        let pair = ExtKeyPair::from_entropy(&[5; 64]);
        let sig = sign(&pair.sig, b"message");
        assert_eq!(
            verify(&pair.sig.public(), b"other message", &sig),
            Err(CryptoError::BadSignature)
        );
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let signer = ExtKeyPair::from_entropy(&[5; 64]);
        let other = ExtKeyPair::from_entropy(&[6; 64]);
        let sig = sign(&signer.sig, b"message");
        assert_eq!(verify(&other.sig.public(), b"message", &sig), Err(CryptoError::BadSignature));
    }

    #[test]
    fn signatures_order_byte_wise() {
        let lo = Signature::from_bytes([0u8; SIGNATURE_SIZE]);
        let hi = Signature::from_bytes([1u8; SIGNATURE_SIZE]);
        assert!(lo < hi);
    }
}
