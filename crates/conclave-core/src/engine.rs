//! The engine: group table, public operations, packet routing, timer loop.
//!
//! One engine instance owns a set of groups and runs single-threaded: the
//! embedder feeds incoming datagrams through [`GroupEngine::handle_packet`],
//! calls [`GroupEngine::iterate`] on its tick (order of 40 ms), invokes
//! public operations, and drains upcalls with [`GroupEngine::poll_event`].
//! Nothing here blocks and nothing touches shared mutable state; multiple
//! engines in separate threads never interact.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, trace};

use conclave_crypto::{ChatId, ExtKeyPair};
use conclave_proto::{
    JoinKind, MAX_GROUP_NAME_SIZE, MAX_NICK_SIZE, PrivacyState, Role, StatusKind,
    payloads::{InviteCookie, Password, PeerAnnounce, WireAddr},
};

use crate::{
    env::Environment,
    error::{
        CreateError, FounderError, GroupError, IgnoreError, JoinError, LeaveError, NickError,
        PersistError, RoleError, SendError, TopicError,
    },
    event::{ExitReason, GroupEvent, GroupId, MessageKind},
    group::Group,
    peer::PeerId,
    persist::SavedGroup,
    shared_state::initial_shared_state,
    transport::{PeerAddress, Transport},
};

/// Buffer of side effects produced by group handlers.
///
/// Handlers stay pure state transitions; the engine owns the transport and
/// the event queue and drains this after every call.
#[derive(Default)]
pub(crate) struct Effects {
    sends: Vec<(PeerAddress, Vec<u8>)>,
    events: Vec<GroupEvent>,
}

impl Effects {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn send(&mut self, to: PeerAddress, datagram: Vec<u8>) {
        self.sends.push((to, datagram));
    }

    pub(crate) fn event(&mut self, event: GroupEvent) {
        self.events.push(event);
    }
}

/// The group-chat engine.
pub struct GroupEngine<E: Environment, T: Transport> {
    env: E,
    transport: T,
    groups: HashMap<u32, Group<E::Instant>>,
    next_group: u32,
    events: VecDeque<GroupEvent>,
}

impl<E: Environment, T: Transport> GroupEngine<E, T> {
    /// New engine with no groups.
    pub fn new(env: E, transport: T) -> Self {
        Self { env, transport, groups: HashMap::new(), next_group: 0, events: VecDeque::new() }
    }

    fn apply(&mut self, fx: Effects) {
        for (addr, datagram) in fx.sends {
            if let Err(err) = self.transport.send(&addr, &datagram) {
                debug!(?err, "transport send failed");
            }
        }
        self.events.extend(fx.events);
    }

    fn alloc_group_id(&mut self) -> GroupId {
        let id = GroupId(self.next_group);
        self.next_group += 1;
        id
    }

    /// Next pending upcall, if any.
    pub fn poll_event(&mut self) -> Option<GroupEvent> {
        self.events.pop_front()
    }

    /// Number of groups this engine holds.
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Ids of all groups.
    pub fn group_ids(&self) -> Vec<GroupId> {
        let mut ids: Vec<GroupId> = self.groups.keys().copied().map(GroupId).collect();
        ids.sort();
        ids
    }

    // ------------------------------------------------------------------
    // Lifecycle operations
    // ------------------------------------------------------------------

    /// Found a new group; we become its founder.
    pub fn create_group(
        &mut self,
        privacy: PrivacyState,
        name: &[u8],
        nick: &[u8],
    ) -> Result<GroupId, CreateError> {
        if name.is_empty() {
            return Err(CreateError::NameEmpty);
        }
        if name.len() > MAX_GROUP_NAME_SIZE {
            return Err(CreateError::NameTooLong);
        }
        if nick.is_empty() {
            return Err(CreateError::NickEmpty);
        }
        if nick.len() > MAX_NICK_SIZE {
            return Err(CreateError::NickTooLong);
        }

        let keys = ExtKeyPair::from_entropy(&self.env.random_entropy());
        let group_keys = ExtKeyPair::from_entropy(&self.env.random_entropy());
        let shared_state =
            initial_shared_state(&group_keys, keys.public(), name.to_vec(), privacy);

        let id = self.alloc_group_id();
        let group = Group::create(id, keys, group_keys, shared_state, nick.to_vec());
        self.groups.insert(id.0, group);

        self.events.push_back(GroupEvent::SelfJoin { group_id: id });
        Ok(id)
    }

    /// Join a group by chat id. Link establishment starts as soon as peer
    /// announces arrive from the lookup layer via
    /// [`GroupEngine::add_peer_announce`].
    pub fn join_by_chat_id(
        &mut self,
        chat_id: ChatId,
        password: &[u8],
        nick: &[u8],
    ) -> Result<GroupId, JoinError> {
        self.check_join(nick, password)?;
        if self.find_by_chat_id(&chat_id).is_some() {
            return Err(JoinError::Duplicate);
        }

        let password = Password::new(password).map_err(|_| JoinError::PasswordTooLong)?;
        let keys = ExtKeyPair::from_entropy(&self.env.random_entropy());
        let id = self.alloc_group_id();
        let group =
            Group::join(id, keys, chat_id, password, nick.to_vec(), JoinKind::Public);
        self.groups.insert(id.0, group);
        Ok(id)
    }

    /// Join a group through a friend's invite cookie.
    pub fn accept_invite(
        &mut self,
        cookie: &[u8],
        password: &[u8],
        nick: &[u8],
    ) -> Result<GroupId, JoinError> {
        self.check_join(nick, password)?;
        let cookie = InviteCookie::unpack(cookie).map_err(|_| JoinError::BadInvite)?;
        if self.find_by_chat_id(&cookie.chat_id).is_some() {
            return Err(JoinError::Duplicate);
        }

        let password = Password::new(password).map_err(|_| JoinError::PasswordTooLong)?;
        let keys = ExtKeyPair::from_entropy(&self.env.random_entropy());
        let id = self.alloc_group_id();
        let mut group = Group::join(
            id,
            keys,
            cookie.chat_id,
            password,
            nick.to_vec(),
            JoinKind::FriendInvite,
        );

        // The inviter is our first contact point.
        let announce = PeerAnnounce {
            public_key: cookie.inviter,
            addr: cookie.addr,
            relays: cookie.relays,
        };
        let now = self.env.now();
        let mut fx = Effects::new();
        group.known_addrs.push(announce.clone());
        group.begin_handshake(&self.env, &announce, now, &mut fx);

        self.groups.insert(id.0, group);
        self.apply(fx);
        Ok(id)
    }

    fn check_join(&self, nick: &[u8], password: &[u8]) -> Result<(), JoinError> {
        if nick.is_empty() {
            return Err(JoinError::NickEmpty);
        }
        if nick.len() > MAX_NICK_SIZE {
            return Err(JoinError::NickTooLong);
        }
        if password.len() > conclave_proto::MAX_PASSWORD_SIZE {
            return Err(JoinError::PasswordTooLong);
        }
        Ok(())
    }

    fn find_by_chat_id(&self, chat_id: &ChatId) -> Option<GroupId> {
        self.groups
            .iter()
            .find(|(_, g)| &g.chat_id == chat_id)
            .map(|(&id, _)| GroupId(id))
    }

    /// Produce an invite cookie for out-of-band delivery to a friend.
    pub fn invite_friend(&self, group_id: GroupId) -> Result<Vec<u8>, GroupError> {
        let group = self.groups.get(&group_id.0).ok_or(GroupError::NotFound)?;
        Ok(InviteCookie {
            chat_id: group.chat_id,
            inviter: group.keys.public(),
            addr: group.self_addr,
            relays: Vec::new(),
        }
        .pack())
    }

    /// Feed a peer announce from the lookup layer; starts a handshake if
    /// the peer is unknown.
    pub fn add_peer_announce(
        &mut self,
        group_id: GroupId,
        announce: PeerAnnounce,
    ) -> Result<(), GroupError> {
        let now = self.env.now();
        let mut fx = Effects::new();

        let group = self.groups.get_mut(&group_id.0).ok_or(GroupError::NotFound)?;
        group.known_addrs.retain(|a| a.public_key.enc != announce.public_key.enc);
        group.known_addrs.push(announce.clone());
        group.begin_handshake(&self.env, &announce, now, &mut fx);

        self.apply(fx);
        Ok(())
    }

    /// Announce our own reachable address (learned by the embedder from
    /// the transport layer); carried in pings and invite cookies.
    pub fn set_self_addr(&mut self, group_id: GroupId, addr: WireAddr) -> Result<(), GroupError> {
        let group = self.groups.get_mut(&group_id.0).ok_or(GroupError::NotFound)?;
        group.self_addr = Some(addr);
        Ok(())
    }

    /// Tear down all links but keep the group for a later reconnect.
    pub fn disconnect(&mut self, group_id: GroupId) -> Result<(), GroupError> {
        let now = self.env.now();
        let mut fx = Effects::new();

        let group = self.groups.get_mut(&group_id.0).ok_or(GroupError::NotFound)?;
        if !group.connected {
            return Err(GroupError::AlreadyDisconnected);
        }
        group.disconnect_internal(ExitReason::SelfDisconnected, now, &mut fx);

        self.apply(fx);
        Ok(())
    }

    /// Resume a disconnected group; links re-establish from known
    /// addresses on the next ticks.
    pub fn reconnect(&mut self, group_id: GroupId) -> Result<(), GroupError> {
        let group = self.groups.get_mut(&group_id.0).ok_or(GroupError::NotFound)?;
        group.connected = true;
        group.last_reconnect = None;
        Ok(())
    }

    /// Announce departure and delete the group.
    pub fn leave(&mut self, group_id: GroupId, part_message: &[u8]) -> Result<(), LeaveError> {
        let now = self.env.now();
        let mut fx = Effects::new();

        let group = self.groups.get_mut(&group_id.0).ok_or(LeaveError::GroupNotFound)?;
        group.op_leave(&self.env, part_message, now, &mut fx)?;

        self.groups.remove(&group_id.0);
        self.apply(fx);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Messaging operations
    // ------------------------------------------------------------------

    /// Send a chat message to the whole group.
    pub fn send_message(
        &mut self,
        group_id: GroupId,
        kind: MessageKind,
        data: &[u8],
    ) -> Result<(), SendError> {
        let now = self.env.now();
        let mut fx = Effects::new();

        let group = self.groups.get_mut(&group_id.0).ok_or(SendError::GroupNotFound)?;
        let result = group.op_send_message(&self.env, kind, data, now, &mut fx);

        self.apply(fx);
        result
    }

    /// Send a private message to one peer.
    pub fn send_private(
        &mut self,
        group_id: GroupId,
        peer_id: PeerId,
        kind: MessageKind,
        data: &[u8],
    ) -> Result<(), SendError> {
        let now = self.env.now();
        let mut fx = Effects::new();

        let group = self.groups.get_mut(&group_id.0).ok_or(SendError::GroupNotFound)?;
        let result = group.op_send_private(&self.env, peer_id, kind, data, now, &mut fx);

        self.apply(fx);
        result
    }

    /// Send an opaque custom packet, reliable or lossy.
    pub fn send_custom(
        &mut self,
        group_id: GroupId,
        reliable: bool,
        data: &[u8],
    ) -> Result<(), SendError> {
        let now = self.env.now();
        let mut fx = Effects::new();

        let group = self.groups.get_mut(&group_id.0).ok_or(SendError::GroupNotFound)?;
        let result = group.op_send_custom(&self.env, reliable, data, now, &mut fx);

        self.apply(fx);
        result
    }

    // ------------------------------------------------------------------
    // Moderation operations
    // ------------------------------------------------------------------

    /// Change a peer's role.
    pub fn set_role(
        &mut self,
        group_id: GroupId,
        peer_id: PeerId,
        role: Role,
    ) -> Result<(), RoleError> {
        let now = self.env.now();
        let mut fx = Effects::new();

        let group = self.groups.get_mut(&group_id.0).ok_or(RoleError::GroupNotFound)?;
        let result = group.op_set_role(&self.env, peer_id, role, now, &mut fx);

        self.apply(fx);
        result
    }

    /// Kick a peer from the group.
    pub fn kick(&mut self, group_id: GroupId, peer_id: PeerId) -> Result<(), RoleError> {
        let now = self.env.now();
        let mut fx = Effects::new();

        let group = self.groups.get_mut(&group_id.0).ok_or(RoleError::GroupNotFound)?;
        let result = group.op_kick(&self.env, peer_id, now, &mut fx);

        self.apply(fx);
        result
    }

    /// Toggle message suppression for a peer.
    pub fn toggle_ignore(
        &mut self,
        group_id: GroupId,
        peer_id: PeerId,
        ignore: bool,
    ) -> Result<(), IgnoreError> {
        let group = self.groups.get_mut(&group_id.0).ok_or(IgnoreError::GroupNotFound)?;
        group.op_toggle_ignore(peer_id, ignore)
    }

    // ------------------------------------------------------------------
    // Group-state operations
    // ------------------------------------------------------------------

    /// Set the topic.
    pub fn set_topic(&mut self, group_id: GroupId, topic: &[u8]) -> Result<(), TopicError> {
        let now = self.env.now();
        let mut fx = Effects::new();

        let group = self.groups.get_mut(&group_id.0).ok_or(TopicError::GroupNotFound)?;
        let result = group.op_set_topic(&self.env, topic, now, &mut fx);

        self.apply(fx);
        result
    }

    /// Founder: change the group password.
    pub fn set_password(&mut self, group_id: GroupId, password: &[u8]) -> Result<(), FounderError> {
        let new = Password::new(password).map_err(|_| FounderError::TooLong)?;
        self.mutate_shared_state(group_id, move |s| s.password = new)
    }

    /// Founder: change the privacy state.
    pub fn set_privacy(
        &mut self,
        group_id: GroupId,
        privacy: PrivacyState,
    ) -> Result<(), FounderError> {
        self.mutate_shared_state(group_id, move |s| s.privacy = privacy)
    }

    /// Founder: change the peer limit.
    pub fn set_peer_limit(&mut self, group_id: GroupId, limit: u32) -> Result<(), FounderError> {
        self.mutate_shared_state(group_id, move |s| s.peer_limit = limit)
    }

    /// Founder: lock or unlock the topic.
    pub fn set_topic_lock(&mut self, group_id: GroupId, locked: bool) -> Result<(), FounderError> {
        self.mutate_shared_state(group_id, move |s| s.topic_lock = locked)
    }

    fn mutate_shared_state(
        &mut self,
        group_id: GroupId,
        mutate: impl FnOnce(&mut conclave_proto::payloads::SharedState),
    ) -> Result<(), FounderError> {
        let now = self.env.now();
        let mut fx = Effects::new();

        let group = self.groups.get_mut(&group_id.0).ok_or(FounderError::GroupNotFound)?;
        let result = group.op_mutate_shared_state(&self.env, mutate, now, &mut fx);

        self.apply(fx);
        result
    }

    /// Change our nickname.
    pub fn set_nick(&mut self, group_id: GroupId, nick: &[u8]) -> Result<(), NickError> {
        let now = self.env.now();
        let mut fx = Effects::new();

        let group = self.groups.get_mut(&group_id.0).ok_or(NickError::GroupNotFound)?;
        let result = group.op_set_nick(&self.env, nick, now, &mut fx);

        self.apply(fx);
        result
    }

    /// Change our presence status.
    pub fn set_status(&mut self, group_id: GroupId, status: StatusKind) -> Result<(), GroupError> {
        let now = self.env.now();
        let mut fx = Effects::new();

        let group = self.groups.get_mut(&group_id.0).ok_or(GroupError::NotFound)?;
        group.op_set_status(&self.env, status, now, &mut fx);

        self.apply(fx);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Network entry points
    // ------------------------------------------------------------------

    /// Feed one incoming datagram.
    ///
    /// `from` is the observed source address, used to learn return routes
    /// for handshaking peers.
    pub fn handle_packet(&mut self, datagram: &[u8], from: Option<WireAddr>) {
        let Ok(header) = conclave_proto::peek_header(datagram) else {
            trace!("dropping unparseable datagram");
            return;
        };

        let hash = header.chat_id_hash();
        let matching: Vec<u32> = self
            .groups
            .iter()
            .filter(|(_, g)| g.chat_id_hash == hash)
            .map(|(&id, _)| id)
            .collect();
        if matching.is_empty() {
            trace!(hash, "datagram for unknown group");
            return;
        }

        let now = self.env.now();
        for id in matching {
            let mut fx = Effects::new();
            if let Some(group) = self.groups.get_mut(&id) {
                group.handle_datagram(&self.env, datagram, from, now, &mut fx);
            }
            self.apply(fx);
        }
    }

    /// One timer tick: handshake retries, pings, retransmits, evictions,
    /// reconnects.
    pub fn iterate(&mut self) {
        let now = self.env.now();
        let ids: Vec<u32> = self.groups.keys().copied().collect();

        for id in ids {
            let mut fx = Effects::new();
            if let Some(group) = self.groups.get_mut(&id) {
                group.tick(&self.env, now, &mut fx);
            }
            self.apply(fx);
        }
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Pack a group for storage; clears its dirty flag.
    pub fn save_group(&mut self, group_id: GroupId) -> Result<Vec<u8>, GroupError> {
        let group = self.groups.get_mut(&group_id.0).ok_or(GroupError::NotFound)?;

        // The group's public encryption half is only held (and only
        // needed) by the founder; joiners store zeroes.
        let chat_enc = group
            .group_keys
            .as_ref()
            .map(|k| k.enc.public())
            .unwrap_or(conclave_crypto::EncPublicKey::from_bytes([0; 32]));

        let saved = SavedGroup {
            chat_public_key: conclave_crypto::ExtPublicKey {
                enc: chat_enc,
                sig: group.chat_id.sig_key(),
            },
            group_keys: group.group_keys.clone(),
            self_keys: group.keys.clone(),
            self_nick: group.self_nick.clone(),
            self_status: group.self_status,
            connect_on_load: group.connected,
            shared_state: group.shared_state.clone(),
            topic: group.topic.clone(),
            mod_list: group.moderation.mods().clone(),
            peer_addrs: group.known_addrs.clone(),
        };

        group.dirty = false;
        Ok(saved.pack())
    }

    /// Restore a saved group.
    pub fn load_group(&mut self, record: &[u8]) -> Result<GroupId, PersistError> {
        let saved = SavedGroup::unpack(record)?;

        let chat_id = ChatId::from(saved.chat_public_key.sig);
        let id = self.alloc_group_id();

        let mut group = Group::join(
            id,
            saved.self_keys,
            chat_id,
            saved.shared_state.password,
            saved.self_nick,
            JoinKind::Public,
        );
        group.group_keys = saved.group_keys;
        group.shared_state = saved.shared_state;
        group.topic = saved.topic;
        group.moderation.set_mods(saved.mod_list);
        group.self_status = saved.self_status;
        group.connected = saved.connect_on_load;
        group.self_joined = group.is_founder();
        group.known_addrs = saved.peer_addrs;
        group.dirty = false;

        self.groups.insert(id.0, group);
        Ok(id)
    }

    /// True if the group changed since its last save.
    pub fn is_dirty(&self, group_id: GroupId) -> bool {
        self.groups.get(&group_id.0).is_some_and(|g| g.dirty)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// The group's permanent identifier.
    pub fn chat_id(&self, group_id: GroupId) -> Option<ChatId> {
        self.groups.get(&group_id.0).map(|g| g.chat_id)
    }

    /// The group name from the shared state.
    pub fn group_name(&self, group_id: GroupId) -> Option<Vec<u8>> {
        self.groups.get(&group_id.0).map(|g| g.shared_state.name.clone())
    }

    /// The current topic bytes.
    pub fn topic(&self, group_id: GroupId) -> Option<Vec<u8>> {
        self.groups.get(&group_id.0).map(|g| g.topic.topic.clone())
    }

    /// The current privacy state.
    pub fn privacy(&self, group_id: GroupId) -> Option<PrivacyState> {
        self.groups.get(&group_id.0).map(|g| g.shared_state.privacy)
    }

    /// The current peer limit.
    pub fn peer_limit(&self, group_id: GroupId) -> Option<u32> {
        self.groups.get(&group_id.0).map(|g| g.shared_state.peer_limit)
    }

    /// The current group password bytes.
    pub fn password(&self, group_id: GroupId) -> Option<Vec<u8>> {
        self.groups.get(&group_id.0).map(|g| g.shared_state.password.as_bytes().to_vec())
    }

    /// Our role in the group.
    pub fn self_role(&self, group_id: GroupId) -> Option<Role> {
        self.groups.get(&group_id.0).map(|g| g.self_role())
    }

    /// Our nickname in the group.
    pub fn self_nick(&self, group_id: GroupId) -> Option<Vec<u8>> {
        self.groups.get(&group_id.0).map(|g| g.self_nick.clone())
    }

    /// Our permanent public signature key in the group.
    pub fn self_sig_pk(&self, group_id: GroupId) -> Option<conclave_crypto::SigPublicKey> {
        self.groups.get(&group_id.0).map(|g| g.keys.sig.public())
    }

    /// True while the group processes traffic.
    pub fn is_connected(&self, group_id: GroupId) -> Option<bool> {
        self.groups.get(&group_id.0).map(|g| g.connected)
    }

    /// Ids of all confirmed peers.
    pub fn confirmed_peers(&self, group_id: GroupId) -> Vec<PeerId> {
        self.groups
            .get(&group_id.0)
            .map(|g| {
                g.peers
                    .iter()
                    .filter(|(_, p)| p.is_confirmed())
                    .map(|(id, _)| id)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// A peer's role.
    pub fn peer_role(&self, group_id: GroupId, peer_id: PeerId) -> Option<Role> {
        self.groups.get(&group_id.0)?.peer_role(peer_id)
    }

    /// A peer's nickname.
    pub fn peer_nick(&self, group_id: GroupId, peer_id: PeerId) -> Option<Vec<u8>> {
        self.groups.get(&group_id.0)?.peers.get(peer_id).map(|p| p.nick.clone())
    }

    /// A peer's permanent public signature key.
    pub fn peer_sig_pk(
        &self,
        group_id: GroupId,
        peer_id: PeerId,
    ) -> Option<conclave_crypto::SigPublicKey> {
        self.groups.get(&group_id.0)?.peers.get(peer_id).map(|p| p.sig_pk)
    }

    /// Find a peer id by its signature key.
    pub fn peer_by_sig_pk(
        &self,
        group_id: GroupId,
        key: &conclave_crypto::SigPublicKey,
    ) -> Option<PeerId> {
        self.groups.get(&group_id.0)?.peers.find_by_sig_pk(key)
    }

    /// The group's current peer-list checksum (confirmed members,
    /// ourselves included).
    pub fn peer_list_checksum(&self, group_id: GroupId) -> Option<u16> {
        self.groups
            .get(&group_id.0)
            .map(|g| g.peers.checksum(&g.keys.enc.public()))
    }

    /// The accepted shared-state version.
    pub fn shared_state_version(&self, group_id: GroupId) -> Option<u32> {
        self.groups.get(&group_id.0).map(|g| g.shared_state.version)
    }

    /// The accepted topic version.
    pub fn topic_version(&self, group_id: GroupId) -> Option<u32> {
        self.groups.get(&group_id.0).map(|g| g.topic.version)
    }

    /// The moderator list as signature keys.
    pub fn moderators(&self, group_id: GroupId) -> Option<Vec<conclave_crypto::SigPublicKey>> {
        self.groups.get(&group_id.0).map(|g| g.moderation.mods().mods.clone())
    }

    /// Our own announce record for this group, as the lookup layer would
    /// publish it. Requires [`GroupEngine::set_self_addr`] to be useful.
    pub fn self_announce(&self, group_id: GroupId) -> Option<PeerAnnounce> {
        let group = self.groups.get(&group_id.0)?;
        Some(PeerAnnounce {
            public_key: group.keys.public(),
            addr: group.self_addr,
            relays: Vec::new(),
        })
    }
}
