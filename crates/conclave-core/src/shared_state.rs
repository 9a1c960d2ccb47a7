//! Founder-signed shared state: creation, re-signing, verification.
//!
//! The shared state is the group's configuration artifact. Only the
//! founder can produce a valid one (signing requires the group secret
//! key, which is the founder's to hold); everyone else verifies against
//! the Chat ID and linearizes by version.

use conclave_crypto::{ChatId, CryptoError, ExtKeyPair, ExtPublicKey, Signature, sign, verify};
use conclave_proto::{
    MAX_GROUP_NAME_SIZE,
    PrivacyState,
    payloads::{ModList, Password, SharedState},
};

/// Default peer limit for newly created groups.
pub const DEFAULT_PEER_LIMIT: u32 = 100;

/// Build and sign the initial shared state for a freshly created group.
pub fn initial_shared_state(
    group_keys: &ExtKeyPair,
    founder: ExtPublicKey,
    name: Vec<u8>,
    privacy: PrivacyState,
) -> SharedState {
    debug_assert!(!name.is_empty() && name.len() <= MAX_GROUP_NAME_SIZE);

    let mut state = SharedState {
        version: 1,
        founder,
        peer_limit: DEFAULT_PEER_LIMIT,
        name,
        privacy,
        password: Password::EMPTY,
        topic_lock: false,
        mod_list_hash: ModList::default().hash(),
        signature: Signature::from_bytes([0; 64]),
    };
    resign(&mut state, group_keys);
    state
}

/// Re-sign the state with the group key (version already set).
pub fn resign(state: &mut SharedState, group_keys: &ExtKeyPair) {
    state.signature = sign(&group_keys.sig, &state.signed_bytes());
}

/// Bump the version, apply `mutate`, and re-sign.
pub fn mutate_and_resign(
    state: &mut SharedState,
    group_keys: &ExtKeyPair,
    mutate: impl FnOnce(&mut SharedState),
) {
    state.version += 1;
    mutate(state);
    resign(state, group_keys);
}

/// Verify a received shared state against the group's Chat ID.
///
/// # Errors
///
/// - `CryptoError::BadSignature` / `InvalidKey` on verification failure
pub fn verify_shared_state(state: &SharedState, chat_id: &ChatId) -> Result<(), CryptoError> {
    verify(&chat_id.sig_key(), &state.signed_bytes(), &state.signature)
}
