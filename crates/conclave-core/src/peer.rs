//! The per-group peer table.
//!
//! Peers live in an arena of dense slots. A [`PeerId`] is the slot index
//! tagged with a generation counter, so an id held across a removal and a
//! slot reuse fails lookup instead of silently naming a different peer.
//!
//! Roles are deliberately NOT stored here. A peer's role is computed from
//! the signed artifacts (shared state founder key, moderator list,
//! sanctions list), which keeps exactly one source of truth.

use std::{ops::Sub, time::Duration};

use conclave_crypto::{EncPublicKey, SigPublicKey};
use conclave_proto::StatusKind;

use crate::{link::PeerLink, transport::PeerAddress};

/// Stable handle for one peer within one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId {
    index: u32,
    generation: u32,
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "p{}.{}", self.index, self.generation)
    }
}

/// One peer's record.
#[derive(Debug)]
pub struct Peer<I> {
    /// Permanent public encryption key.
    pub enc_pk: EncPublicKey,
    /// Permanent public signature key, learned in the handshake.
    pub sig_pk: SigPublicKey,
    /// Link state machine (handshake + lossless channel).
    pub link: PeerLink<I>,
    /// Where to send datagrams for this peer.
    pub addr: PeerAddress,
    /// Nickname (≤ 128 bytes), learned from peer info.
    pub nick: Vec<u8>,
    /// Presence status.
    pub status: StatusKind,
    /// When set, message upcalls from this peer are suppressed.
    pub ignore: bool,
}

impl<I> Peer<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    /// True once the full handshake and peer-info exchange completed.
    pub fn is_confirmed(&self) -> bool {
        self.link.is_confirmed()
    }
}

struct Slot<I> {
    generation: u32,
    peer: Option<Peer<I>>,
}

/// Arena of peers with generation-tagged ids.
pub struct PeerTable<I> {
    slots: Vec<Slot<I>>,
    len: usize,
}

impl<I> PeerTable<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    /// Empty table.
    pub fn new() -> Self {
        Self { slots: Vec::new(), len: 0 }
    }

    /// Number of peers (confirmed or not).
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if no peers are present.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of confirmed peers.
    pub fn confirmed_count(&self) -> u16 {
        self.iter().filter(|(_, p)| p.is_confirmed()).count() as u16
    }

    /// Insert a peer, reusing the first free slot.
    pub fn insert(&mut self, peer: Peer<I>) -> PeerId {
        self.len += 1;

        if let Some(index) = self.slots.iter().position(|slot| slot.peer.is_none()) {
            let slot = &mut self.slots[index];
            slot.generation += 1;
            slot.peer = Some(peer);
            return PeerId { index: index as u32, generation: slot.generation };
        }

        self.slots.push(Slot { generation: 0, peer: Some(peer) });
        PeerId { index: (self.slots.len() - 1) as u32, generation: 0 }
    }

    /// Remove a peer, returning its record.
    pub fn remove(&mut self, id: PeerId) -> Option<Peer<I>> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let peer = slot.peer.take();
        if peer.is_some() {
            self.len -= 1;
        }
        peer
    }

    /// Resolve an id.
    pub fn get(&self, id: PeerId) -> Option<&Peer<I>> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.peer.as_ref()
    }

    /// Resolve an id, mutably.
    pub fn get_mut(&mut self, id: PeerId) -> Option<&mut Peer<I>> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.peer.as_mut()
    }

    /// Iterate over all peers.
    pub fn iter(&self) -> impl Iterator<Item = (PeerId, &Peer<I>)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.peer.as_ref().map(|peer| {
                (PeerId { index: index as u32, generation: slot.generation }, peer)
            })
        })
    }

    /// Iterate over all peers, mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (PeerId, &mut Peer<I>)> {
        self.slots.iter_mut().enumerate().filter_map(|(index, slot)| {
            let generation = slot.generation;
            slot.peer.as_mut().map(move |peer| {
                (PeerId { index: index as u32, generation }, peer)
            })
        })
    }

    /// Find a peer by its permanent encryption key.
    pub fn find_by_enc_pk(&self, key: &EncPublicKey) -> Option<PeerId> {
        self.iter().find(|(_, p)| &p.enc_pk == key).map(|(id, _)| id)
    }

    /// Find a peer by its permanent signature key.
    pub fn find_by_sig_pk(&self, key: &SigPublicKey) -> Option<PeerId> {
        self.iter().find(|(_, p)| &p.sig_pk == key).map(|(id, _)| id)
    }

    /// True if a confirmed peer already uses this nickname.
    pub fn nick_taken(&self, nick: &[u8]) -> bool {
        self.iter().any(|(_, p)| p.is_confirmed() && p.nick == nick)
    }

    /// Order-independent 16-bit fingerprint of the confirmed peer set.
    ///
    /// Wrapping sum of the big-endian 16-bit chunks of every confirmed
    /// peer's permanent encryption key. Summation commutes, so two peers
    /// with the same confirmed set agree on the checksum regardless of
    /// arrival order.
    pub fn checksum(&self, self_enc_pk: &EncPublicKey) -> u16 {
        let mut sum = key_checksum(self_enc_pk);
        for (_, peer) in self.iter() {
            if peer.is_confirmed() {
                sum = sum.wrapping_add(key_checksum(&peer.enc_pk));
            }
        }
        sum
    }

    /// Ids of peers whose links failed or timed out at `now`.
    pub fn timed_out(&self, now: I) -> Vec<(PeerId, bool)> {
        self.iter()
            .filter(|(_, peer)| peer.link.is_failed() || peer.link.is_timed_out(now))
            .map(|(id, peer)| (id, peer.is_confirmed()))
            .collect()
    }
}

impl<I> Default for PeerTable<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    fn default() -> Self {
        Self::new()
    }
}

/// One key's contribution to the peer-list checksum.
fn key_checksum(key: &EncPublicKey) -> u16 {
    key.as_bytes()
        .chunks_exact(2)
        .fold(0u16, |sum, chunk| sum.wrapping_add(u16::from_be_bytes([chunk[0], chunk[1]])))
}
