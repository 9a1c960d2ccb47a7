//! Moderator list and sanctions list with their signature discipline.
//!
//! The moderator list is authoritative only through the founder-signed
//! shared state (its hash is a shared-state field). The sanctions list is
//! versioned by credentials signed by the last modifier, who must be the
//! founder or a current moderator. The standing invariant is that every
//! sanctions entry is signed by a *currently* authoritative key; when the
//! founder demotes a moderator, the founder re-signs that moderator's
//! entries before re-broadcasting.

use thiserror::Error;

use conclave_crypto::{
    EncPublicKey, SHA256_SIZE, SigPublicKey, SigSecretKey, Signature, sha256, sign, verify,
};
use conclave_proto::{
    MAX_MODERATORS, MAX_SANCTIONS,
    payloads::{ModList, Sanction, SANCTION_OBSERVER, SanctionsCreds, SanctionsList},
};

/// Validation failures while applying moderation artifacts.
///
/// Never surfaced to public-operation callers: handlers log these and drop
/// the offending packet.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModerationError {
    /// Moderator list is full.
    #[error("moderator list full")]
    ModListFull,

    /// Key already present in the moderator list.
    #[error("already a moderator")]
    DuplicateModerator,

    /// Sanctions list is full.
    #[error("sanctions list full")]
    SanctionsFull,

    /// Entry already present in the sanctions list.
    #[error("duplicate sanction")]
    DuplicateSanction,

    /// Entry setter is neither the founder nor a current moderator.
    #[error("sanction setter not authoritative")]
    NotAuthoritative,

    /// A signature did not verify.
    #[error("bad signature")]
    BadSignature,

    /// Credentials hash does not cover the presented entries.
    #[error("credentials hash mismatch")]
    HashMismatch,

    /// Credentials are older than (or tied with) what we already hold.
    #[error("credentials version regressed")]
    VersionRegressed,
}

/// Moderation state for one group.
#[derive(Debug, Clone)]
pub struct Moderation {
    mods: ModList,
    sanctions: Vec<Sanction>,
    creds: SanctionsCreds,
}

impl Moderation {
    /// Fresh state: no moderators, no sanctions, bootstrap credentials.
    ///
    /// Bootstrap credentials (version 0, zero signer) are never signature-
    /// checked; they exist so an empty list has a well-defined wire form.
    pub fn new() -> Self {
        let creds = SanctionsCreds {
            version: 0,
            hash: creds_hash(&[], 0),
            sig_pk: SigPublicKey::from_bytes([0; 32]),
            signature: Signature::from_bytes([0; 64]),
        };
        Self { mods: ModList::default(), sanctions: Vec::new(), creds }
    }

    /// The moderator list.
    pub fn mods(&self) -> &ModList {
        &self.mods
    }

    /// Replace the moderator list wholesale (sync path). The caller has
    /// already checked the hash against the accepted shared state.
    pub fn set_mods(&mut self, mods: ModList) {
        self.mods = mods;
    }

    /// Current sanctions entries.
    pub fn sanctions(&self) -> &[Sanction] {
        &self.sanctions
    }

    /// Current sanctions credentials.
    pub fn creds(&self) -> &SanctionsCreds {
        &self.creds
    }

    /// The full replicated list, for `SANCTIONS_LIST` frames.
    pub fn sanctions_list(&self) -> SanctionsList {
        SanctionsList { sanctions: self.sanctions.clone(), creds: self.creds }
    }

    /// True if `key` is in the moderator list.
    pub fn is_moderator(&self, key: &SigPublicKey) -> bool {
        self.mods.mods.contains(key)
    }

    /// True if `key` may sign moderation artifacts right now.
    pub fn is_authoritative(&self, key: &SigPublicKey, founder: &SigPublicKey) -> bool {
        key == founder || self.is_moderator(key)
    }

    /// True if the peer with this encryption key is sanctioned.
    pub fn is_observer(&self, enc_pk: &EncPublicKey) -> bool {
        self.sanctions.iter().any(|s| &s.target == enc_pk)
    }

    /// Add a moderator (founder-side mutation).
    ///
    /// # Errors
    ///
    /// - `ModerationError::DuplicateModerator` / `ModListFull`
    pub fn add_mod(&mut self, key: SigPublicKey) -> Result<(), ModerationError> {
        if self.is_moderator(&key) {
            return Err(ModerationError::DuplicateModerator);
        }
        if self.mods.mods.len() >= MAX_MODERATORS {
            return Err(ModerationError::ModListFull);
        }
        self.mods.mods.push(key);
        Ok(())
    }

    /// Remove a moderator (founder-side mutation). True if present.
    pub fn remove_mod(&mut self, key: &SigPublicKey) -> bool {
        let before = self.mods.mods.len();
        self.mods.mods.retain(|k| k != key);
        self.mods.mods.len() != before
    }

    /// Create and locally insert a signed observer sanction, refreshing
    /// the credentials.
    ///
    /// # Errors
    ///
    /// - `ModerationError::DuplicateSanction` / `SanctionsFull`
    pub fn sanction_observer(
        &mut self,
        signer: &SigSecretKey,
        target: EncPublicKey,
        timestamp: u64,
    ) -> Result<Sanction, ModerationError> {
        if self.is_observer(&target) {
            return Err(ModerationError::DuplicateSanction);
        }
        if self.sanctions.len() >= MAX_SANCTIONS {
            return Err(ModerationError::SanctionsFull);
        }

        let mut sanction = Sanction {
            kind: SANCTION_OBSERVER,
            setter: signer.public(),
            timestamp,
            target,
            signature: Signature::from_bytes([0; 64]),
        };
        sanction.signature = sign(signer, &sanction.signed_bytes());

        self.sanctions.push(sanction);
        self.refresh_creds(signer);
        Ok(sanction)
    }

    /// Remove an observer sanction locally, refreshing the credentials.
    /// True if an entry was removed.
    pub fn lift_observer(&mut self, signer: &SigSecretKey, target: &EncPublicKey) -> bool {
        let before = self.sanctions.len();
        self.sanctions.retain(|s| &s.target != target);
        if self.sanctions.len() == before {
            return false;
        }
        self.refresh_creds(signer);
        true
    }

    /// Re-sign every entry made by `demoted` with `founder_key`.
    ///
    /// Called when the founder demotes a moderator, so the invariant
    /// "every entry is signed by a currently authoritative key" survives
    /// the demotion. Returns the number of entries re-signed.
    pub fn replace_setter_signatures(
        &mut self,
        demoted: &SigPublicKey,
        founder_key: &SigSecretKey,
    ) -> usize {
        let founder_pk = founder_key.public();
        let mut replaced = 0;

        for sanction in &mut self.sanctions {
            if &sanction.setter == demoted {
                sanction.setter = founder_pk;
                sanction.signature = sign(founder_key, &sanction.signed_bytes());
                replaced += 1;
            }
        }

        if replaced > 0 {
            self.refresh_creds(founder_key);
        }
        replaced
    }

    /// Bump, rehash, and re-sign the credentials after a local mutation.
    fn refresh_creds(&mut self, signer: &SigSecretKey) {
        // Canonical order: entries sorted by signature bytes, so every
        // peer hashes the same byte string regardless of arrival order.
        self.sanctions.sort_by(|a, b| a.signature.as_bytes().cmp(b.signature.as_bytes()));

        let version = self.creds.version + 1;
        let hash = creds_hash(&self.sanctions, version);
        let mut creds = SanctionsCreds {
            version,
            hash,
            sig_pk: signer.public(),
            signature: Signature::from_bytes([0; 64]),
        };
        creds.signature = sign(signer, &creds.signed_bytes());
        self.creds = creds;
    }

    /// Validate one sanction entry against the current authority set.
    ///
    /// # Errors
    ///
    /// - `ModerationError::NotAuthoritative` / `BadSignature`
    pub fn verify_sanction(
        &self,
        sanction: &Sanction,
        founder: &SigPublicKey,
    ) -> Result<(), ModerationError> {
        if !self.is_authoritative(&sanction.setter, founder) {
            return Err(ModerationError::NotAuthoritative);
        }
        verify(&sanction.setter, &sanction.signed_bytes(), &sanction.signature)
            .map_err(|_| ModerationError::BadSignature)
    }

    /// Validate credentials over a candidate entry set.
    ///
    /// # Errors
    ///
    /// - `ModerationError::NotAuthoritative` / `HashMismatch` /
    ///   `BadSignature`
    pub fn verify_creds(
        &self,
        entries: &[Sanction],
        creds: &SanctionsCreds,
        founder: &SigPublicKey,
    ) -> Result<(), ModerationError> {
        if entries.is_empty() && creds.version == 0 {
            // Bootstrap credentials: an empty list needs no signer.
            return if creds.hash == creds_hash(&[], 0) {
                Ok(())
            } else {
                Err(ModerationError::HashMismatch)
            };
        }

        if !self.is_authoritative(&creds.sig_pk, founder) {
            return Err(ModerationError::NotAuthoritative);
        }
        if creds.hash != creds_hash(entries, creds.version) {
            return Err(ModerationError::HashMismatch);
        }
        verify(&creds.sig_pk, &creds.signed_bytes(), &creds.signature)
            .map_err(|_| ModerationError::BadSignature)
    }

    /// True if `candidate` should replace `current`.
    ///
    /// Strictly larger versions win; equal versions fall back to
    /// lexicographic comparison of the credential signature bytes, so
    /// concurrent modifications converge identically everywhere.
    pub fn creds_newer(candidate: &SanctionsCreds, current: &SanctionsCreds) -> bool {
        candidate.version > current.version
            || (candidate.version == current.version
                && candidate.signature.as_bytes() > current.signature.as_bytes())
    }

    /// Apply a remotely received observer sanction with its credentials.
    ///
    /// # Errors
    ///
    /// Any [`ModerationError`]; the caller logs and drops.
    pub fn accept_sanction(
        &mut self,
        sanction: Sanction,
        creds: SanctionsCreds,
        founder: &SigPublicKey,
    ) -> Result<(), ModerationError> {
        self.verify_sanction(&sanction, founder)?;
        if !Self::creds_newer(&creds, &self.creds) {
            return Err(ModerationError::VersionRegressed);
        }
        if self.sanctions.len() >= MAX_SANCTIONS {
            return Err(ModerationError::SanctionsFull);
        }

        let mut entries = self.sanctions.clone();
        if !entries.iter().any(|s| s.signature == sanction.signature) {
            entries.push(sanction);
        }
        entries.sort_by(|a, b| a.signature.as_bytes().cmp(b.signature.as_bytes()));

        self.verify_creds(&entries, &creds, founder)?;
        self.sanctions = entries;
        self.creds = creds;
        Ok(())
    }

    /// Apply a remotely received sanction removal with its credentials.
    ///
    /// # Errors
    ///
    /// Any [`ModerationError`]; the caller logs and drops.
    pub fn accept_removal(
        &mut self,
        target: &EncPublicKey,
        creds: SanctionsCreds,
        founder: &SigPublicKey,
    ) -> Result<(), ModerationError> {
        if !Self::creds_newer(&creds, &self.creds) {
            return Err(ModerationError::VersionRegressed);
        }

        let mut entries = self.sanctions.clone();
        entries.retain(|s| &s.target != target);
        entries.sort_by(|a, b| a.signature.as_bytes().cmp(b.signature.as_bytes()));

        self.verify_creds(&entries, &creds, founder)?;
        self.sanctions = entries;
        self.creds = creds;
        Ok(())
    }

    /// Replace the whole sanctions list from a sync response.
    ///
    /// # Errors
    ///
    /// Any [`ModerationError`]; the caller logs and drops.
    pub fn accept_list(
        &mut self,
        list: SanctionsList,
        founder: &SigPublicKey,
    ) -> Result<(), ModerationError> {
        if !Self::creds_newer(&list.creds, &self.creds) {
            return Err(ModerationError::VersionRegressed);
        }

        for sanction in &list.sanctions {
            self.verify_sanction(sanction, founder)?;
        }

        let mut entries = list.sanctions;
        entries.sort_by(|a, b| a.signature.as_bytes().cmp(b.signature.as_bytes()));
        self.verify_creds(&entries, &list.creds, founder)?;

        self.sanctions = entries;
        self.creds = list.creds;
        Ok(())
    }

    /// Drop all sanctions state (group emptied; the list is not
    /// persisted).
    pub fn reset_sanctions(&mut self) {
        self.sanctions.clear();
        self.creds = Self::new().creds;
    }
}

impl Default for Moderation {
    fn default() -> Self {
        Self::new()
    }
}

/// `sha256(packed entries ‖ version)`, entries already in canonical order.
fn creds_hash(entries: &[Sanction], version: u32) -> [u8; SHA256_SIZE] {
    let mut data = Vec::with_capacity(entries.len() * 137 + 4);
    for sanction in entries {
        data.extend_from_slice(&sanction.signed_bytes());
        data.extend_from_slice(sanction.signature.as_bytes());
    }
    data.extend_from_slice(&version.to_be_bytes());
    sha256(&data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_crypto::ExtKeyPair;

    fn keys(seed: u8) -> ExtKeyPair {
        ExtKeyPair::from_entropy(&[seed; 64])
    }

    #[test]
    fn sanction_and_creds_round_trip_between_peers() {
        let founder = keys(1);
        let target = keys(2);

        let mut actor = Moderation::new();
        let sanction = actor
            .sanction_observer(&founder.sig, target.enc.public(), 1000)
            .unwrap();

        // A second peer applies the broadcast.
        let mut observer_side = Moderation::new();
        observer_side
            .accept_sanction(sanction, *actor.creds(), &founder.sig.public())
            .unwrap();

        assert!(observer_side.is_observer(&target.enc.public()));
        assert_eq!(observer_side.creds(), actor.creds());
    }

    #[test]
    fn sanction_from_non_authoritative_setter_is_rejected() {
        let founder = keys(1);
        let rando = keys(3);
        let target = keys(2);

        let mut rando_side = Moderation::new();
        let sanction = rando_side
            .sanction_observer(&rando.sig, target.enc.public(), 1000)
            .unwrap();

        let mut receiver = Moderation::new();
        assert_eq!(
            receiver.accept_sanction(sanction, *rando_side.creds(), &founder.sig.public()),
            Err(ModerationError::NotAuthoritative)
        );
    }

    #[test]
    fn moderator_may_sanction_when_listed() {
        let founder = keys(1);
        let moderator = keys(4);
        let target = keys(2);

        let mut actor = Moderation::new();
        actor.add_mod(moderator.sig.public()).unwrap();
        let sanction = actor
            .sanction_observer(&moderator.sig, target.enc.public(), 7)
            .unwrap();

        let mut receiver = Moderation::new();
        receiver.add_mod(moderator.sig.public()).unwrap();
        receiver
            .accept_sanction(sanction, *actor.creds(), &founder.sig.public())
            .unwrap();
        assert!(receiver.is_observer(&target.enc.public()));
    }

    #[test]
    fn stale_creds_are_rejected() {
        let founder = keys(1);
        let target_a = keys(2);
        let target_b = keys(3);

        let mut actor = Moderation::new();
        let first = actor.sanction_observer(&founder.sig, target_a.enc.public(), 1).unwrap();
        let first_creds = *actor.creds();
        let _second = actor.sanction_observer(&founder.sig, target_b.enc.public(), 2).unwrap();

        let mut receiver = Moderation::new();
        receiver.accept_list(actor.sanctions_list(), &founder.sig.public()).unwrap();

        // Replay of the older single-entry update must be dropped.
        assert_eq!(
            receiver.accept_sanction(first, first_creds, &founder.sig.public()),
            Err(ModerationError::VersionRegressed)
        );
    }

    #[test]
    fn demotion_resign_preserves_entry_validity() {
        let founder = keys(1);
        let moderator = keys(4);
        let target = keys(2);

        let mut state = Moderation::new();
        state.add_mod(moderator.sig.public()).unwrap();
        state.sanction_observer(&moderator.sig, target.enc.public(), 50).unwrap();

        // Founder demotes the moderator and re-signs its entries.
        assert!(state.remove_mod(&moderator.sig.public()));
        assert_eq!(state.replace_setter_signatures(&moderator.sig.public(), &founder.sig), 1);

        // A late joiner with no knowledge of the demoted moderator
        // accepts the list because every entry is founder-signed now.
        let mut late_joiner = Moderation::new();
        late_joiner.accept_list(state.sanctions_list(), &founder.sig.public()).unwrap();
        assert!(late_joiner.is_observer(&target.enc.public()));
    }

    #[test]
    fn equal_versions_tie_break_on_signature_bytes() {
        let a = SanctionsCreds {
            version: 3,
            hash: [0; SHA256_SIZE],
            sig_pk: keys(1).sig.public(),
            signature: Signature::from_bytes([1; 64]),
        };
        let b = SanctionsCreds { signature: Signature::from_bytes([2; 64]), ..a };

        assert!(Moderation::creds_newer(&b, &a));
        assert!(!Moderation::creds_newer(&a, &b));
        assert!(!Moderation::creds_newer(&a, &a));
    }

    #[test]
    fn lift_observer_round_trips() {
        let founder = keys(1);
        let target = keys(2);

        let mut actor = Moderation::new();
        actor.sanction_observer(&founder.sig, target.enc.public(), 1).unwrap();

        let mut receiver = Moderation::new();
        receiver.accept_list(actor.sanctions_list(), &founder.sig.public()).unwrap();

        assert!(actor.lift_observer(&founder.sig, &target.enc.public()));
        receiver
            .accept_removal(&target.enc.public(), *actor.creds(), &founder.sig.public())
            .unwrap();
        assert!(!receiver.is_observer(&target.enc.public()));
    }
}
