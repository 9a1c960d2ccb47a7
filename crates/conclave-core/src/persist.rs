//! Saved-group records for process restarts.
//!
//! One packed binary record per group: identity keys, the group keypair
//! when we are the founder, the signed shared state and topic, the
//! moderator list, and the last known peer addresses to retry on load.
//! The sanctions list is deliberately NOT persisted; it resets when a
//! group empties.

use bytes::BufMut;

use conclave_crypto::{ExtKeyPair, ExtPublicKey};
use conclave_proto::{
    MAX_NICK_SIZE, MAX_SAVED_PEER_ADDRS, StatusKind,
    payloads::{ModList, PeerAnnounce, SharedState, TopicInfo},
};

use crate::error::PersistError;

const RECORD_VERSION: u8 = 1;

/// Everything needed to restore a group across restarts.
#[derive(Debug, Clone)]
pub struct SavedGroup {
    /// The group's extended public key (the signature half is the chat
    /// id).
    pub chat_public_key: ExtPublicKey,
    /// The group keypair; present only when we founded the group.
    pub group_keys: Option<ExtKeyPair>,
    /// Our identity keypair within the group.
    pub self_keys: ExtKeyPair,
    /// Our nickname.
    pub self_nick: Vec<u8>,
    /// Our presence status.
    pub self_status: StatusKind,
    /// Reconnect automatically after loading.
    pub connect_on_load: bool,
    /// The signed shared state as last accepted.
    pub shared_state: SharedState,
    /// The signed topic as last accepted.
    pub topic: TopicInfo,
    /// The moderator list matching `shared_state.mod_list_hash`.
    pub mod_list: ModList,
    /// Last known peer addresses, used to re-establish links.
    pub peer_addrs: Vec<PeerAnnounce>,
}

impl SavedGroup {
    /// Pack into a binary record.
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(512);
        out.put_u8(RECORD_VERSION);
        out.put_slice(&self.chat_public_key.to_bytes());

        match &self.group_keys {
            Some(keys) => {
                out.put_u8(1);
                out.put_slice(&keys.enc.to_bytes());
                out.put_slice(&keys.sig.to_bytes());
            },
            None => out.put_u8(0),
        }

        out.put_slice(&self.self_keys.enc.to_bytes());
        out.put_slice(&self.self_keys.sig.to_bytes());

        out.put_u16(self.self_nick.len() as u16);
        out.put_slice(&self.self_nick);
        out.put_u8(self.self_status.to_u8());
        out.put_u8(u8::from(self.connect_on_load));

        let state = self.shared_state.pack();
        out.put_u16(state.len() as u16);
        out.put_slice(&state);

        let topic = self.topic.pack();
        out.put_u16(topic.len() as u16);
        out.put_slice(&topic);

        let mods = self.mod_list.pack();
        out.put_u16(mods.len() as u16);
        out.put_slice(&mods);

        let addr_count = self.peer_addrs.len().min(MAX_SAVED_PEER_ADDRS);
        out.put_u8(addr_count as u8);
        for announce in &self.peer_addrs[..addr_count] {
            let packed = announce.pack();
            out.put_u16(packed.len() as u16);
            out.put_slice(&packed);
        }

        out
    }

    /// Unpack a binary record.
    ///
    /// # Errors
    ///
    /// - `PersistError::Malformed` on truncation, unknown record version,
    ///   or invalid embedded artifacts
    pub fn unpack(bytes: &[u8]) -> Result<Self, PersistError> {
        let mut r = RecordReader { bytes, pos: 0 };

        if r.u8()? != RECORD_VERSION {
            return Err(PersistError::Malformed("unknown record version"));
        }

        let chat_public_key = ExtPublicKey::from_bytes(&r.array()?);

        let group_keys = match r.u8()? {
            0 => None,
            1 => {
                let enc = conclave_crypto::EncSecretKey::from_bytes(r.array()?);
                let sig = conclave_crypto::SigSecretKey::from_bytes(r.array()?);
                Some(ExtKeyPair { enc, sig })
            },
            _ => return Err(PersistError::Malformed("invalid founder flag")),
        };

        let self_keys = ExtKeyPair {
            enc: conclave_crypto::EncSecretKey::from_bytes(r.array()?),
            sig: conclave_crypto::SigSecretKey::from_bytes(r.array()?),
        };

        let nick_len = r.u16()? as usize;
        if nick_len > MAX_NICK_SIZE {
            return Err(PersistError::Malformed("nick too long"));
        }
        let self_nick = r.take(nick_len)?.to_vec();

        let self_status =
            StatusKind::from_u8(r.u8()?).ok_or(PersistError::Malformed("invalid status"))?;
        let connect_on_load = match r.u8()? {
            0 => false,
            1 => true,
            _ => return Err(PersistError::Malformed("invalid connect flag")),
        };

        let state_len = r.u16()? as usize;
        let shared_state = SharedState::unpack(r.take(state_len)?)?;

        let topic_len = r.u16()? as usize;
        let topic = TopicInfo::unpack(r.take(topic_len)?)?;

        let mods_len = r.u16()? as usize;
        let mod_list = ModList::unpack(r.take(mods_len)?)?;

        let addr_count = r.u8()? as usize;
        if addr_count > MAX_SAVED_PEER_ADDRS {
            return Err(PersistError::Malformed("too many saved addresses"));
        }
        let mut peer_addrs = Vec::with_capacity(addr_count);
        for _ in 0..addr_count {
            let len = r.u16()? as usize;
            peer_addrs.push(PeerAnnounce::unpack(r.take(len)?)?);
        }

        if r.pos != r.bytes.len() {
            return Err(PersistError::Malformed("trailing bytes"));
        }

        Ok(Self {
            chat_public_key,
            group_keys,
            self_keys,
            self_nick,
            self_status,
            connect_on_load,
            shared_state,
            topic,
            mod_list,
            peer_addrs,
        })
    }
}

struct RecordReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> RecordReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], PersistError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or(PersistError::Malformed("truncated record"))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, PersistError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, PersistError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], PersistError> {
        let b = self.take(N)?;
        let mut arr = [0u8; N];
        arr.copy_from_slice(b);
        Ok(arr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_crypto::{ChatId, Signature};
    use conclave_proto::{PrivacyState, payloads::Password};

    fn sample(founder: bool) -> SavedGroup {
        let group_keys = ExtKeyPair::from_entropy(&[1; 64]);
        let self_keys = ExtKeyPair::from_entropy(&[2; 64]);

        let shared_state = crate::shared_state::initial_shared_state(
            &group_keys,
            self_keys.public(),
            b"Utah Data Center".to_vec(),
            PrivacyState::Private,
        );

        SavedGroup {
            chat_public_key: group_keys.public(),
            group_keys: founder.then(|| group_keys.clone()),
            self_keys,
            self_nick: b"Winslow".to_vec(),
            self_status: StatusKind::Away,
            connect_on_load: true,
            shared_state,
            topic: TopicInfo {
                version: 3,
                topic: b"hands off".to_vec(),
                setter: ExtKeyPair::from_entropy(&[3; 64]).sig.public(),
                signature: Signature::from_bytes([4; 64]),
            },
            mod_list: ModList { mods: vec![ExtKeyPair::from_entropy(&[3; 64]).sig.public()] },
            peer_addrs: vec![PeerAnnounce {
                public_key: ExtKeyPair::from_entropy(&[5; 64]).public(),
                addr: None,
                relays: vec![],
            }],
        }
    }

    #[test]
    fn founder_record_round_trips() {
        let saved = sample(true);
        let restored = SavedGroup::unpack(&saved.pack()).unwrap();

        assert_eq!(restored.chat_public_key, saved.chat_public_key);
        assert_eq!(restored.shared_state, saved.shared_state);
        assert_eq!(restored.topic, saved.topic);
        assert_eq!(restored.mod_list, saved.mod_list);
        assert_eq!(restored.self_nick, saved.self_nick);
        assert_eq!(restored.self_status, saved.self_status);
        assert!(restored.connect_on_load);
        assert_eq!(restored.peer_addrs, saved.peer_addrs);

        // Founder identity and group secret keys survive.
        let original = saved.group_keys.unwrap();
        let restored_keys = restored.group_keys.expect("founder keys must persist");
        assert_eq!(restored_keys.public(), original.public());
        assert_eq!(restored.self_keys.public(), saved.self_keys.public());

        // The restored group key still speaks for the chat id.
        let chat_id = ChatId::from(saved.chat_public_key.sig);
        let mut state = restored.shared_state.clone();
        crate::shared_state::mutate_and_resign(&mut state, &restored_keys, |s| {
            s.password = Password::new(b"np").unwrap();
        });
        assert!(crate::shared_state::verify_shared_state(&state, &chat_id).is_ok());
    }

    #[test]
    fn non_founder_record_has_no_group_secret() {
        let saved = sample(false);
        let restored = SavedGroup::unpack(&saved.pack()).unwrap();
        assert!(restored.group_keys.is_none());
    }

    #[test]
    fn truncated_records_are_rejected() {
        let packed = sample(true).pack();
        for cut in [0, 1, 40, packed.len() - 1] {
            assert!(SavedGroup::unpack(&packed[..cut]).is_err(), "cut at {cut} must fail");
        }
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut packed = sample(true).pack();
        packed[0] = 0xff;
        assert!(matches!(SavedGroup::unpack(&packed), Err(PersistError::Malformed(_))));
    }
}
