//! Error type for cryptographic operations.

use thiserror::Error;

/// Errors that can occur in key handling, sealing, and verification.
///
/// These never carry key material. Integrity failures (`DecryptFailed`,
/// `BadSignature`) are expected under packet corruption or hostile input and
/// are handled by dropping the offending packet, not by tearing anything
/// down.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// AEAD rejected the ciphertext (wrong key, wrong nonce, or tampering).
    #[error("decryption failed")]
    DecryptFailed,

    /// AEAD refused to encrypt. Only reachable through an implementation
    /// bug (e.g. plaintext length overflow), never through peer input.
    #[error("encryption failed")]
    EncryptFailed,

    /// Signature did not verify under the given public key.
    #[error("bad signature")]
    BadSignature,

    /// Byte string is not a valid public key (non-canonical point).
    #[error("invalid public key")]
    InvalidKey,
}
