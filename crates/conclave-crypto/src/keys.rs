//! Key material: public key newtypes, zeroizing secret halves, and the
//! extended keypair used for peer and group identity.
//!
//! Public keys are plain 32-byte values (they travel on the wire and live in
//! lists and maps); secret halves wrap the dalek types, which zeroize on
//! drop. Raw secret bytes are only reachable through the explicit
//! `to_bytes` accessors used by the save/restore path.

use ed25519_dalek::SigningKey;
use x25519_dalek::StaticSecret;

use crate::{EXT_PUBLIC_KEY_SIZE, PUBLIC_KEY_SIZE, SECRET_KEY_SIZE};

/// An x25519 public encryption key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EncPublicKey([u8; PUBLIC_KEY_SIZE]);

/// An Ed25519 public signature key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SigPublicKey([u8; PUBLIC_KEY_SIZE]);

/// The group's permanent identifier: the public signature half of the group
/// keypair.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChatId(SigPublicKey);

macro_rules! key_newtype_impl {
    ($name:ident) => {
        impl $name {
            /// Wrap raw key bytes.
            pub const fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
                Self(bytes)
            }

            /// Borrow the raw key bytes.
            pub const fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
                &self.0
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                // Abbreviated hex keeps logs readable.
                write!(
                    f,
                    concat!(stringify!($name), "({:02x}{:02x}{:02x}{:02x}…)"),
                    self.0[0], self.0[1], self.0[2], self.0[3]
                )
            }
        }
    };
}

key_newtype_impl!(EncPublicKey);
key_newtype_impl!(SigPublicKey);

impl ChatId {
    /// Wrap raw chat-id bytes.
    pub const fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(SigPublicKey::from_bytes(bytes))
    }

    /// Borrow the raw chat-id bytes.
    pub const fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        self.0.as_bytes()
    }

    /// The chat id viewed as the group's public signature key.
    pub const fn sig_key(&self) -> SigPublicKey {
        self.0
    }
}

impl From<SigPublicKey> for ChatId {
    fn from(key: SigPublicKey) -> Self {
        Self(key)
    }
}

impl std::fmt::Debug for ChatId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let b = self.as_bytes();
        write!(f, "ChatId({:02x}{:02x}{:02x}{:02x}…)", b[0], b[1], b[2], b[3])
    }
}

/// An extended public key: encryption half followed by signature half.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExtPublicKey {
    /// Public encryption key.
    pub enc: EncPublicKey,
    /// Public signature key.
    pub sig: SigPublicKey,
}

impl ExtPublicKey {
    /// Serialize as `enc_pk ‖ sig_pk` (64 bytes).
    pub fn to_bytes(&self) -> [u8; EXT_PUBLIC_KEY_SIZE] {
        let mut out = [0u8; EXT_PUBLIC_KEY_SIZE];
        out[..PUBLIC_KEY_SIZE].copy_from_slice(self.enc.as_bytes());
        out[PUBLIC_KEY_SIZE..].copy_from_slice(self.sig.as_bytes());
        out
    }

    /// Parse from `enc_pk ‖ sig_pk` (64 bytes).
    pub fn from_bytes(bytes: &[u8; EXT_PUBLIC_KEY_SIZE]) -> Self {
        let mut enc = [0u8; PUBLIC_KEY_SIZE];
        let mut sig = [0u8; PUBLIC_KEY_SIZE];
        enc.copy_from_slice(&bytes[..PUBLIC_KEY_SIZE]);
        sig.copy_from_slice(&bytes[PUBLIC_KEY_SIZE..]);
        Self { enc: EncPublicKey(enc), sig: SigPublicKey(sig) }
    }
}

/// An x25519 secret encryption key. Zeroized on drop by the wrapped type.
#[derive(Clone)]
pub struct EncSecretKey(StaticSecret);

impl EncSecretKey {
    /// Construct from raw secret bytes (save/restore and entropy paths).
    pub fn from_bytes(bytes: [u8; SECRET_KEY_SIZE]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    /// The matching public key.
    pub fn public(&self) -> EncPublicKey {
        EncPublicKey(*x25519_dalek::PublicKey::from(&self.0).as_bytes())
    }

    /// Raw secret bytes, for the persistence layer only.
    pub fn to_bytes(&self) -> [u8; SECRET_KEY_SIZE] {
        self.0.to_bytes()
    }

    pub(crate) fn diffie_hellman(&self, peer: &EncPublicKey) -> x25519_dalek::SharedSecret {
        self.0.diffie_hellman(&x25519_dalek::PublicKey::from(*peer.as_bytes()))
    }
}

impl std::fmt::Debug for EncSecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncSecretKey(…)")
    }
}

/// An Ed25519 secret signature key. Zeroized on drop by the wrapped type.
#[derive(Clone)]
pub struct SigSecretKey(SigningKey);

impl SigSecretKey {
    /// Construct from raw secret bytes (save/restore and entropy paths).
    pub fn from_bytes(bytes: [u8; SECRET_KEY_SIZE]) -> Self {
        Self(SigningKey::from_bytes(&bytes))
    }

    /// The matching public key.
    pub fn public(&self) -> SigPublicKey {
        SigPublicKey(self.0.verifying_key().to_bytes())
    }

    /// Raw secret bytes, for the persistence layer only.
    pub fn to_bytes(&self) -> [u8; SECRET_KEY_SIZE] {
        self.0.to_bytes()
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.0
    }
}

impl std::fmt::Debug for SigSecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SigSecretKey(…)")
    }
}

/// An extended keypair: encryption and signature secret halves.
///
/// Identifies a peer within one group, or — for the founder-held group
/// keypair — the group itself.
#[derive(Debug, Clone)]
pub struct ExtKeyPair {
    /// Encryption half.
    pub enc: EncSecretKey,
    /// Signature half.
    pub sig: SigSecretKey,
}

impl ExtKeyPair {
    /// Derive a keypair from 64 bytes of caller-provided entropy.
    ///
    /// Deterministic: the same entropy yields the same keypair, which is
    /// what lets the simulation harness replay runs from a seed.
    pub fn from_entropy(entropy: &[u8; 64]) -> Self {
        let mut enc = [0u8; SECRET_KEY_SIZE];
        let mut sig = [0u8; SECRET_KEY_SIZE];
        enc.copy_from_slice(&entropy[..SECRET_KEY_SIZE]);
        sig.copy_from_slice(&entropy[SECRET_KEY_SIZE..]);
        Self { enc: EncSecretKey::from_bytes(enc), sig: SigSecretKey::from_bytes(sig) }
    }

    /// The extended public key.
    pub fn public(&self) -> ExtPublicKey {
        ExtPublicKey { enc: self.enc.public(), sig: self.sig.public() }
    }
}
