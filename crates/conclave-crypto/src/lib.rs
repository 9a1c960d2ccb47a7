//! Conclave Cryptographic Primitives
//!
//! Key material and sealed-box building blocks for the group-chat protocol.
//! All functions are pure: callers provide entropy, so every operation is
//! reproducible under a seeded environment.
//!
//! # Key Hierarchy
//!
//! Each peer holds one *extended* keypair per group: an x25519 encryption
//! half used only during handshakes and an Ed25519 signature half that
//! identifies the peer inside the group (moderator list, sanctions, topic
//! signatures). The group founder additionally holds the group extended
//! keypair; its public signature half is the Chat ID.
//!
//! ```text
//! permanent enc keypairs ──x25519──> pair key      (handshake packets)
//! ephemeral enc keypairs ──x25519──> session key   (lossless/lossy packets)
//!                                        │
//!                                        ▼
//!                          XChaCha20-Poly1305 AEAD
//! ```
//!
//! Session keys are rotated on every handshake and zeroized on drop, giving
//! per-session forward secrecy. Permanent secret halves are zeroized on drop
//! as well and never exposed as raw bytes outside this crate's save/restore
//! accessors.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod error;
mod hash;
mod keys;
mod session;
mod sign;

pub use error::CryptoError;
pub use hash::{chat_id_hash, sha256};
pub use keys::{
    ChatId, EncPublicKey, EncSecretKey, ExtKeyPair, ExtPublicKey, SigPublicKey, SigSecretKey,
};
pub use session::{SessionKey, derive_pair_key, derive_session_key, open, seal};
pub use sign::{Signature, sign, verify};

/// Size of a public key half (encryption or signature), in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of a secret key half, in bytes.
pub const SECRET_KEY_SIZE: usize = 32;

/// Size of an extended public key (`enc_pk ‖ sig_pk`), in bytes.
pub const EXT_PUBLIC_KEY_SIZE: usize = PUBLIC_KEY_SIZE * 2;

/// Size of an Ed25519 signature, in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// Size of a SHA-256 digest, in bytes.
pub const SHA256_SIZE: usize = 32;

/// Size of the derived symmetric session key, in bytes.
pub const SESSION_KEY_SIZE: usize = 32;

/// Size of the XChaCha20 nonce, in bytes.
pub const NONCE_SIZE: usize = 24;

/// Size of the Poly1305 authentication tag, in bytes.
pub const TAG_SIZE: usize = 16;
