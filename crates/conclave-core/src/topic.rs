//! Versioned signed topic.
//!
//! Anyone allowed by the topic-lock policy may set the topic; receivers
//! verify the setter's authority under the policy *currently in force*,
//! check the signature, and linearize by version with a deterministic
//! tie-break so concurrent setters converge.

use conclave_crypto::{SigPublicKey, SigSecretKey, Signature, sign, verify};
use conclave_proto::payloads::TopicInfo;

use crate::moderation::Moderation;

/// The empty topic a fresh group starts with.
pub fn initial_topic() -> TopicInfo {
    TopicInfo {
        version: 0,
        topic: Vec::new(),
        setter: SigPublicKey::from_bytes([0; 32]),
        signature: Signature::from_bytes([0; 64]),
    }
}

/// Build and sign the successor topic.
pub fn make_topic(current_version: u32, topic: Vec<u8>, setter: &SigSecretKey) -> TopicInfo {
    let mut info = TopicInfo {
        version: current_version + 1,
        topic,
        setter: setter.public(),
        signature: Signature::from_bytes([0; 64]),
    };
    info.signature = sign(setter, &info.signed_bytes());
    info
}

/// Why a received topic was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicRejection {
    /// Setter lacks authority under the current policy.
    NotPermitted,
    /// Signature did not verify.
    BadSignature,
    /// Not newer than what we hold.
    Stale,
}

/// Validate a received topic against current policy and version.
///
/// Under topic lock only the founder and current moderators may set the
/// topic; unlocked, any non-observer may. Version ties are broken by
/// lexicographic comparison of the signature bytes, so every peer picks
/// the same winner in a race.
///
/// # Errors
///
/// - [`TopicRejection`]; the caller logs and drops.
pub fn validate_topic(
    candidate: &TopicInfo,
    current: &TopicInfo,
    moderation: &Moderation,
    founder: &SigPublicKey,
    topic_lock: bool,
    setter_is_observer: bool,
) -> Result<(), TopicRejection> {
    let permitted = if topic_lock {
        moderation.is_authoritative(&candidate.setter, founder)
    } else {
        !setter_is_observer
    };
    if !permitted {
        return Err(TopicRejection::NotPermitted);
    }

    verify(&candidate.setter, &candidate.signed_bytes(), &candidate.signature)
        .map_err(|_| TopicRejection::BadSignature)?;

    let newer = candidate.version > current.version
        || (candidate.version == current.version
            && candidate.signature.as_bytes() > current.signature.as_bytes());
    if !newer {
        return Err(TopicRejection::Stale);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_crypto::ExtKeyPair;

    fn keys(seed: u8) -> ExtKeyPair {
        ExtKeyPair::from_entropy(&[seed; 64])
    }

    #[test]
    fn signed_topic_validates() {
        let founder = keys(1);
        let moderation = Moderation::new();

        let topic = make_topic(0, b"launch day".to_vec(), &founder.sig);
        assert_eq!(topic.version, 1);
        assert!(validate_topic(
            &topic,
            &initial_topic(),
            &moderation,
            &founder.sig.public(),
            true,
            false,
        )
        .is_ok());
    }

    #[test]
    fn lock_restricts_to_moderators_and_founder() {
        let founder = keys(1);
        let user = keys(2);
        let moderation = Moderation::new();

        let topic = make_topic(0, b"t".to_vec(), &user.sig);

        // Locked: a plain user is rejected.
        assert_eq!(
            validate_topic(&topic, &initial_topic(), &moderation, &founder.sig.public(), true, false),
            Err(TopicRejection::NotPermitted)
        );

        // Unlocked: the same update is fine.
        assert!(validate_topic(
            &topic,
            &initial_topic(),
            &moderation,
            &founder.sig.public(),
            false,
            false,
        )
        .is_ok());
    }

    #[test]
    fn observers_cannot_set_topic_even_unlocked() {
        let founder = keys(1);
        let observer = keys(3);
        let moderation = Moderation::new();

        let topic = make_topic(0, b"t".to_vec(), &observer.sig);
        assert_eq!(
            validate_topic(&topic, &initial_topic(), &moderation, &founder.sig.public(), false, true),
            Err(TopicRejection::NotPermitted)
        );
    }

    #[test]
    fn stale_versions_are_rejected() {
        let founder = keys(1);
        let moderation = Moderation::new();

        let v1 = make_topic(0, b"one".to_vec(), &founder.sig);
        let v2 = make_topic(1, b"two".to_vec(), &founder.sig);

        assert_eq!(
            validate_topic(&v1, &v2, &moderation, &founder.sig.public(), false, false),
            Err(TopicRejection::Stale)
        );
    }

    #[test]
    fn version_tie_breaks_on_signature_bytes() {
        let founder = keys(1);
        let m1 = keys(4);
        let m2 = keys(5);
        let mut moderation = Moderation::new();
        moderation.add_mod(m1.sig.public()).unwrap();
        moderation.add_mod(m2.sig.public()).unwrap();

        let a = make_topic(3, b"from m1".to_vec(), &m1.sig);
        let b = make_topic(3, b"from m2".to_vec(), &m2.sig);
        assert_eq!(a.version, b.version);

        let (winner, loser) = if a.signature.as_bytes() > b.signature.as_bytes() {
            (a, b)
        } else {
            (b, a)
        };

        // The winner supersedes the loser, never the other way around.
        assert!(validate_topic(&winner, &loser, &moderation, &founder.sig.public(), true, false)
            .is_ok());
        assert_eq!(
            validate_topic(&loser, &winner, &moderation, &founder.sig.public(), true, false),
            Err(TopicRejection::Stale)
        );
    }
}
