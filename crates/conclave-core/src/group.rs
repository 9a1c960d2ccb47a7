//! Per-group state and protocol handlers.
//!
//! A [`Group`] owns everything for one chat: identity keys, the replicated
//! artifacts, the peer table, and the handlers that turn opened packets
//! into state transitions. Handlers never touch the network directly; they
//! append datagrams and upcalls to an [`Effects`] buffer that the engine
//! drains, which keeps every function here a pure state transition and
//! makes the whole protocol drivable from a deterministic test.

use std::{ops::Sub, time::Duration};

use tracing::{debug, trace, warn};

use conclave_crypto::{
    ChatId, EncPublicKey, EncSecretKey, ExtKeyPair, SessionKey, SigPublicKey, chat_id_hash,
    derive_pair_key,
};
use conclave_proto::{
    AckKind, BroadcastKind, GroupPacketKind, HandshakeKind, JoinKind, MAX_MESSAGE_SIZE,
    MAX_PART_MESSAGE_SIZE, MAX_SAVED_PEER_ADDRS, MAX_TOPIC_SIZE, OpenedPacket, PacketBody,
    PrivacyState, RejectReason, Role, StatusKind, open,
    payloads::{
        Broadcast, FriendInvite, FriendInviteKind, Handshake, InviteReject, InviteRequest,
        KickPeer, MessageAck, ModList, Password, PeerAnnounce, PeerInfo, Ping, SetMod,
        SetObserver, SharedState, SyncRequest, TcpRelays, TopicInfo, WireAddr,
    },
};

use crate::{
    engine::Effects,
    env::Environment,
    event::{ExitReason, GroupEvent, GroupId, JoinFailReason, MessageKind, ModEvent},
    link::{LinkState, PeerLink},
    lossless::{RecvOutcome, ResendPass},
    moderation::Moderation,
    peer::{Peer, PeerId, PeerTable},
    sync::out_of_sync_flags,
    topic::{initial_topic, make_topic, validate_topic},
    transport::PeerAddress,
};

/// Interval between reconnect rounds while we have no live peers.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// One group's complete state.
pub(crate) struct Group<I> {
    pub id: GroupId,
    /// Our identity keypair within this group.
    pub keys: ExtKeyPair,
    /// The group keypair; `Some` iff we are the founder.
    pub group_keys: Option<ExtKeyPair>,
    pub chat_id: ChatId,
    pub chat_id_hash: u32,
    pub shared_state: SharedState,
    pub moderation: Moderation,
    pub topic: TopicInfo,
    pub peers: PeerTable<I>,
    pub self_nick: Vec<u8>,
    pub self_status: StatusKind,
    /// False after an explicit disconnect; no traffic is processed.
    pub connected: bool,
    /// True once our own join completed (always true for the founder).
    pub self_joined: bool,
    /// The password we present while joining.
    pub join_password: Password,
    /// How we found the group; echoed in handshakes.
    pub join_kind: JoinKind,
    /// Peer announces usable to (re)establish links.
    pub known_addrs: Vec<PeerAnnounce>,
    /// Our own address as peers reported it back to us.
    pub self_addr: Option<WireAddr>,
    pub last_reconnect: Option<I>,
    /// Set whenever persistent state changed since the last save.
    pub dirty: bool,
}

/// Seal one frame; logs and returns `None` on codec failure so callers can
/// treat sends as fire-and-forget.
fn seal_frame<E: Environment>(
    env: &E,
    chat_id_hash: u32,
    sender: &EncPublicKey,
    key: &SessionKey,
    body: PacketBody<'_>,
) -> Option<Vec<u8>> {
    match conclave_proto::seal(chat_id_hash, sender, key, env.random_nonce(), env.random_padding(), body)
    {
        Ok(frame) => Some(frame),
        Err(err) => {
            warn!(?err, "failed to seal outgoing packet");
            None
        },
    }
}

impl<I> Group<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    /// Found a new group. We are the founder and immediately joined.
    pub fn create(
        id: GroupId,
        keys: ExtKeyPair,
        group_keys: ExtKeyPair,
        shared_state: SharedState,
        nick: Vec<u8>,
    ) -> Self {
        let chat_id = ChatId::from(group_keys.sig.public());
        Self {
            id,
            keys,
            chat_id,
            chat_id_hash: chat_id_hash(&chat_id),
            group_keys: Some(group_keys),
            shared_state,
            moderation: Moderation::new(),
            topic: initial_topic(),
            peers: PeerTable::new(),
            self_nick: nick,
            self_status: StatusKind::None,
            connected: true,
            self_joined: true,
            join_password: Password::EMPTY,
            join_kind: JoinKind::Public,
            known_addrs: Vec::new(),
            self_addr: None,
            last_reconnect: None,
            dirty: true,
        }
    }

    /// Join an existing group by chat id. Artifacts start empty and are
    /// filled in by the responder after the handshake.
    pub fn join(
        id: GroupId,
        keys: ExtKeyPair,
        chat_id: ChatId,
        password: Password,
        nick: Vec<u8>,
        join_kind: JoinKind,
    ) -> Self {
        let placeholder = SharedState {
            version: 0,
            founder: conclave_crypto::ExtPublicKey::from_bytes(&[0; 64]),
            peer_limit: 0,
            name: Vec::new(),
            privacy: PrivacyState::Public,
            password: Password::EMPTY,
            topic_lock: false,
            mod_list_hash: [0; 32],
            signature: conclave_crypto::Signature::from_bytes([0; 64]),
        };
        Self {
            id,
            keys,
            group_keys: None,
            chat_id,
            chat_id_hash: chat_id_hash(&chat_id),
            shared_state: placeholder,
            moderation: Moderation::new(),
            topic: initial_topic(),
            peers: PeerTable::new(),
            self_nick: nick,
            self_status: StatusKind::None,
            connected: true,
            self_joined: false,
            join_password: password,
            join_kind,
            known_addrs: Vec::new(),
            self_addr: None,
            last_reconnect: None,
            dirty: true,
        }
    }

    /// True iff we hold the group secret keys.
    pub fn is_founder(&self) -> bool {
        self.group_keys.is_some()
    }

    /// Role of an arbitrary key pair, computed from the signed artifacts.
    pub fn role_of(&self, sig_pk: &SigPublicKey, enc_pk: &EncPublicKey) -> Role {
        if sig_pk == &self.shared_state.founder.sig {
            Role::Founder
        } else if self.moderation.is_moderator(sig_pk) {
            Role::Moderator
        } else if self.moderation.is_observer(enc_pk) {
            Role::Observer
        } else {
            Role::User
        }
    }

    /// Our own role.
    pub fn self_role(&self) -> Role {
        if self.is_founder() {
            return Role::Founder;
        }
        self.role_of(&self.keys.sig.public(), &self.keys.enc.public())
    }

    /// Role of a known peer.
    pub fn peer_role(&self, id: PeerId) -> Option<Role> {
        let peer = self.peers.get(id)?;
        Some(self.role_of(&peer.sig_pk, &peer.enc_pk))
    }

    /// Our current version vector.
    pub fn version_vector(&self) -> Ping {
        Ping {
            peer_list_checksum: self.peers.checksum(&self.keys.enc.public()),
            confirmed_peer_count: self.peers.confirmed_count(),
            shared_state_version: self.shared_state.version,
            sanctions_version: self.moderation.creds().version,
            topic_version: self.topic.version,
            self_addr: None,
        }
    }

    // ------------------------------------------------------------------
    // Outgoing plumbing
    // ------------------------------------------------------------------

    /// Enqueue and seal one lossless packet to one peer.
    ///
    /// Returns false if the peer has no session yet or its window is full.
    pub fn send_lossless<E: Environment<Instant = I>>(
        &mut self,
        env: &E,
        peer_id: PeerId,
        kind: GroupPacketKind,
        payload: &[u8],
        now: I,
        fx: &mut Effects,
    ) -> bool {
        let self_pk = self.keys.enc.public();
        let chat_hash = self.chat_id_hash;

        let Some(peer) = self.peers.get_mut(peer_id) else {
            return false;
        };
        if peer.link.session_key().is_none() {
            return false;
        }
        let Some(message_id) = peer.link.send.enqueue(kind, payload.to_vec(), now) else {
            debug!(peer = %peer_id, "send window full");
            return false;
        };

        let Some(key) = peer.link.session_key() else { return false };
        if let Some(frame) = seal_frame(
            env,
            chat_hash,
            &self_pk,
            key,
            PacketBody::Lossless { kind, message_id, payload },
        ) {
            fx.send(peer.addr.clone(), frame);
        }
        true
    }

    /// Seal one lossy packet to one peer.
    pub fn send_lossy<E: Environment<Instant = I>>(
        &mut self,
        env: &E,
        peer_id: PeerId,
        kind: GroupPacketKind,
        payload: &[u8],
        fx: &mut Effects,
    ) {
        let self_pk = self.keys.enc.public();
        let chat_hash = self.chat_id_hash;

        let Some(peer) = self.peers.get_mut(peer_id) else { return };
        let Some(key) = peer.link.session_key() else { return };

        if let Some(frame) =
            seal_frame(env, chat_hash, &self_pk, key, PacketBody::Lossy { kind, payload })
        {
            fx.send(peer.addr.clone(), frame);
        }
    }

    /// Fan a lossless packet out to every confirmed peer, one sealed copy
    /// each.
    pub fn broadcast_lossless<E: Environment<Instant = I>>(
        &mut self,
        env: &E,
        kind: GroupPacketKind,
        payload: &[u8],
        now: I,
        fx: &mut Effects,
    ) {
        let confirmed: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, p)| p.is_confirmed())
            .map(|(id, _)| id)
            .collect();

        for peer_id in confirmed {
            self.send_lossless(env, peer_id, kind, payload, now, fx);
        }
    }

    /// Broadcast envelope helper.
    pub fn broadcast<E: Environment<Instant = I>>(
        &mut self,
        env: &E,
        kind: BroadcastKind,
        data: Vec<u8>,
        now: I,
        fx: &mut Effects,
    ) {
        let envelope = Broadcast { kind, timestamp: env.wall_clock_secs(), data }.pack();
        self.broadcast_lossless(env, GroupPacketKind::Broadcast, &envelope, now, fx);
    }

    // ------------------------------------------------------------------
    // Handshake
    // ------------------------------------------------------------------

    /// Initiate a handshake toward an announced peer.
    pub fn begin_handshake<E: Environment<Instant = I>>(
        &mut self,
        env: &E,
        announce: &PeerAnnounce,
        now: I,
        fx: &mut Effects,
    ) {
        if announce.public_key.enc == self.keys.enc.public() {
            return;
        }
        if self.peers.find_by_enc_pk(&announce.public_key.enc).is_some() {
            return;
        }

        let addr = PeerAddress { ip_port: announce.addr, relays: announce.relays.clone() };
        if addr.is_empty() {
            return;
        }

        let pair_key = derive_pair_key(&self.keys.enc, &announce.public_key.enc);
        let mut link = PeerLink::new_outgoing(pair_key, now);

        let ephemeral = EncSecretKey::from_bytes({
            let mut seed = [0u8; 32];
            env.random_bytes(&mut seed);
            seed
        });
        link.handshake_sent(ephemeral, now);

        let handshake = Handshake {
            kind: HandshakeKind::Request,
            session_pk: link.session_pk().unwrap_or(self.keys.enc.public()),
            sig_pk: self.keys.sig.public(),
            join: self.join_kind,
        }
        .pack();

        let frame = seal_frame(
            env,
            self.chat_id_hash,
            &self.keys.enc.public(),
            link.pair_key(),
            PacketBody::Handshake { payload: &handshake },
        );

        let peer = Peer {
            enc_pk: announce.public_key.enc,
            sig_pk: announce.public_key.sig,
            link,
            addr: addr.clone(),
            nick: Vec::new(),
            status: StatusKind::None,
            ignore: false,
        };
        self.peers.insert(peer);
        trace!(group = %self.id, "handshake initiated");

        if let Some(frame) = frame {
            fx.send(addr, frame);
        }
    }

    fn handle_handshake<E: Environment<Instant = I>>(
        &mut self,
        env: &E,
        sender: EncPublicKey,
        payload: &[u8],
        from: Option<WireAddr>,
        now: I,
        fx: &mut Effects,
    ) {
        let handshake = match Handshake::unpack(payload) {
            Ok(h) => h,
            Err(err) => {
                debug!(?err, "dropping malformed handshake");
                return;
            },
        };

        match handshake.kind {
            HandshakeKind::Request => {
                self.handle_handshake_request(env, sender, &handshake, from, now, fx);
            },

            HandshakeKind::Response => {
                let Some(peer_id) = self.peers.find_by_enc_pk(&sender) else {
                    debug!("handshake response from unknown peer");
                    return;
                };
                let Some(peer) = self.peers.get_mut(peer_id) else { return };

                if peer.link.state() != LinkState::HandshakeSent {
                    trace!("duplicate handshake response ignored");
                    return;
                }
                peer.sig_pk = handshake.sig_pk;
                if !peer.link.establish_session(&handshake.session_pk) {
                    return;
                }
                peer.link.touch(now);
                if let Some(addr) = from {
                    peer.addr.merge(&PeerAddress::direct(addr));
                }

                // First two lossless packets on the new session: the
                // response ack, then the invite request.
                self.send_lossless(env, peer_id, GroupPacketKind::HsResponseAck, &[], now, fx);

                let invite = InviteRequest {
                    name: self.shared_state.name.clone(),
                    password: self.join_password,
                }
                .pack();
                self.send_lossless(env, peer_id, GroupPacketKind::InviteRequest, &invite, now, fx);
            },
        }
    }

    /// Answer an incoming handshake request.
    ///
    /// The request is authenticated by the pair key (only the holder of
    /// the sender's permanent secret can seal it), so resetting state on
    /// its strength is safe. Cases:
    ///
    /// - unknown peer: create a record and respond
    /// - confirmed peer: it restarted; reset to a fresh session
    /// - simultaneous open (both sides initiated): the side with the
    ///   smaller permanent key stays initiator, the other yields
    /// - responder mid-flow: duplicate request, re-send the same response
    fn handle_handshake_request<E: Environment<Instant = I>>(
        &mut self,
        env: &E,
        sender: EncPublicKey,
        handshake: &Handshake,
        from: Option<WireAddr>,
        now: I,
        fx: &mut Effects,
    ) {
        let pair_key = derive_pair_key(&self.keys.enc, &sender);

        let peer_id = match self.peers.find_by_enc_pk(&sender) {
            None => self.peers.insert(Peer {
                enc_pk: sender,
                sig_pk: handshake.sig_pk,
                link: PeerLink::new_incoming(pair_key.clone(), now),
                addr: from.map(PeerAddress::direct).unwrap_or_default(),
                nick: Vec::new(),
                status: StatusKind::None,
                ignore: false,
            }),
            Some(id) => {
                let Some(peer) = self.peers.get_mut(id) else { return };

                if peer.is_confirmed() || peer.link.is_failed() {
                    // Rejoin: the peer rotated its session. Start over.
                    peer.link = PeerLink::new_incoming(pair_key.clone(), now);
                } else if peer.link.initiated {
                    if peer.link.state() == LinkState::HandshakeSent
                        && self.keys.enc.public().as_bytes() < sender.as_bytes()
                    {
                        // Simultaneous open; we keep the initiator role
                        // and let our own request win.
                        trace!(group = %self.id, "simultaneous handshake; staying initiator");
                        return;
                    }
                    peer.link = PeerLink::new_incoming(pair_key.clone(), now);
                } else if peer.link.session_pk().is_some() {
                    // Duplicate request while we are mid-flow responder:
                    // repeat the previous response, key material
                    // unchanged.
                    self.resend_handshake_response(env, id, fx);
                    return;
                }
                id
            },
        };

        let self_pk = self.keys.enc.public();
        let chat_hash = self.chat_id_hash;
        let self_sig = self.keys.sig.public();
        let join_kind = self.join_kind;

        let ephemeral = EncSecretKey::from_bytes({
            let mut seed = [0u8; 32];
            env.random_bytes(&mut seed);
            seed
        });

        let Some(peer) = self.peers.get_mut(peer_id) else { return };
        peer.sig_pk = handshake.sig_pk;
        if let Some(addr) = from {
            peer.addr.merge(&PeerAddress::direct(addr));
        }

        peer.link.handshake_sent(ephemeral, now);
        if !peer.link.establish_session(&handshake.session_pk) {
            debug!("handshake request without usable ephemeral state");
            return;
        }
        peer.link.touch(now);

        let reply = Handshake {
            kind: HandshakeKind::Response,
            session_pk: peer.link.session_pk().unwrap_or(self_pk),
            sig_pk: self_sig,
            join: join_kind,
        }
        .pack();

        let key = peer.link.pair_key();
        if let Some(frame) =
            seal_frame(env, chat_hash, &self_pk, key, PacketBody::Handshake { payload: &reply })
        {
            fx.send(peer.addr.clone(), frame);
        }
    }

    fn resend_handshake_response<E: Environment<Instant = I>>(
        &mut self,
        env: &E,
        peer_id: PeerId,
        fx: &mut Effects,
    ) {
        let self_pk = self.keys.enc.public();
        let chat_hash = self.chat_id_hash;
        let self_sig = self.keys.sig.public();
        let join_kind = self.join_kind;

        let Some(peer) = self.peers.get_mut(peer_id) else { return };
        let Some(session_pk) = peer.link.session_pk() else { return };

        let reply =
            Handshake { kind: HandshakeKind::Response, session_pk, sig_pk: self_sig, join: join_kind }
                .pack();

        let key = peer.link.pair_key();
        if let Some(frame) =
            seal_frame(env, chat_hash, &self_pk, key, PacketBody::Handshake { payload: &reply })
        {
            fx.send(peer.addr.clone(), frame);
        }
    }

    // ------------------------------------------------------------------
    // Incoming datagram entry point
    // ------------------------------------------------------------------

    /// Open and dispatch one datagram addressed to this group.
    pub fn handle_datagram<E: Environment<Instant = I>>(
        &mut self,
        env: &E,
        datagram: &[u8],
        from: Option<WireAddr>,
        now: I,
        fx: &mut Effects,
    ) {
        if !self.connected {
            return;
        }

        let Ok(header) = conclave_proto::peek_header(datagram) else {
            return;
        };
        let sender = header.sender();

        // Handshake frames use the pair key, derivable from the sender's
        // permanent key alone. Traffic frames need an established link.
        let key = match header.outer_type() {
            conclave_proto::OuterType::Handshake => derive_pair_key(&self.keys.enc, &sender),
            _ => {
                let Some(peer_id) = self.peers.find_by_enc_pk(&sender) else {
                    trace!(group = %self.id, "traffic from unknown peer dropped");
                    return;
                };
                let Some(key) = self.peers.get(peer_id).and_then(|p| p.link.session_key()) else {
                    trace!(group = %self.id, "traffic before session established");
                    return;
                };
                key.clone()
            },
        };

        let opened = match open(self.chat_id_hash, &key, datagram) {
            Ok(opened) => opened,
            Err(conclave_proto::CodecError::DecryptFailed) => {
                self.note_decrypt_failure(sender, now, fx);
                return;
            },
            Err(err) => {
                debug!(?err, "dropping undecodable packet");
                return;
            },
        };

        match opened {
            OpenedPacket::Handshake { payload, .. } => {
                self.handle_handshake(env, sender, &payload, from, now, fx);
            },
            OpenedPacket::Lossless { kind, message_id, payload, .. } => {
                self.handle_lossless(env, sender, kind, message_id, payload, now, fx);
            },
            OpenedPacket::Lossy { kind, payload, .. } => {
                self.handle_lossy(env, sender, kind, &payload, now, fx);
            },
        }
    }

    fn note_decrypt_failure(&mut self, sender: EncPublicKey, now: I, fx: &mut Effects) {
        let Some(peer_id) = self.peers.find_by_enc_pk(&sender) else { return };
        let Some(peer) = self.peers.get_mut(peer_id) else { return };

        warn!(group = %self.id, peer = %peer_id, "packet failed decryption");
        if peer.link.note_decrypt_failure() {
            self.drop_peer(peer_id, ExitReason::SyncError, Vec::new(), now, fx);
        }
    }

    // ------------------------------------------------------------------
    // Lossless channel
    // ------------------------------------------------------------------

    fn handle_lossless<E: Environment<Instant = I>>(
        &mut self,
        env: &E,
        sender: EncPublicKey,
        kind: GroupPacketKind,
        message_id: u64,
        payload: Vec<u8>,
        now: I,
        fx: &mut Effects,
    ) {
        let Some(peer_id) = self.peers.find_by_enc_pk(&sender) else { return };
        let Some(peer) = self.peers.get_mut(peer_id) else { return };
        peer.link.touch(now);

        match peer.link.recv.receive(message_id, kind, payload, now) {
            RecvOutcome::Deliver(ready) => {
                for (id, kind, payload) in ready {
                    self.ack(env, peer_id, id, AckKind::Received, fx);
                    self.handle_ordered_packet(env, peer_id, kind, &payload, now, fx);
                }
            },
            RecvOutcome::Buffered { request } => {
                if let Some(missing) = request {
                    self.ack(env, peer_id, missing, AckKind::Request, fx);
                }
            },
            RecvOutcome::Duplicate => {
                self.ack(env, peer_id, message_id, AckKind::Received, fx);
            },
            RecvOutcome::Rejected => {
                debug!(group = %self.id, peer = %peer_id, "receive buffer rejected packet");
            },
        }
    }

    fn ack<E: Environment<Instant = I>>(
        &mut self,
        env: &E,
        peer_id: PeerId,
        message_id: u64,
        kind: AckKind,
        fx: &mut Effects,
    ) {
        let payload = MessageAck { message_id, kind }.pack();
        self.send_lossy(env, peer_id, GroupPacketKind::MessageAck, &payload, fx);
    }

    /// Dispatch one in-order lossless packet.
    fn handle_ordered_packet<E: Environment<Instant = I>>(
        &mut self,
        env: &E,
        peer_id: PeerId,
        kind: GroupPacketKind,
        payload: &[u8],
        now: I,
        fx: &mut Effects,
    ) {
        match kind {
            GroupPacketKind::HsResponseAck => {
                // The initiator confirmed it derived the session key; the
                // invite request follows on the same channel.
                trace!(group = %self.id, peer = %peer_id, "handshake response acked");
            },
            GroupPacketKind::InviteRequest => {
                self.handle_invite_request(env, peer_id, payload, now, fx);
            },
            GroupPacketKind::InviteResponse => {
                self.handle_invite_response(env, peer_id, now, fx);
            },
            GroupPacketKind::PeerInfoRequest => {
                self.send_own_peer_info(env, peer_id, now, fx);
            },
            GroupPacketKind::PeerInfoResponse => {
                self.handle_peer_info(env, peer_id, payload, now, fx);
            },
            GroupPacketKind::Broadcast => {
                self.handle_broadcast(peer_id, payload, now, fx);
            },
            GroupPacketKind::Custom => {
                self.handle_custom(peer_id, payload, fx);
            },
            GroupPacketKind::Topic => {
                self.handle_topic(peer_id, payload, fx);
            },
            GroupPacketKind::SharedState => {
                self.handle_shared_state(peer_id, payload, fx);
            },
            GroupPacketKind::ModList => {
                self.handle_mod_list(peer_id, payload);
            },
            GroupPacketKind::SanctionsList => {
                self.handle_sanctions_list(peer_id, payload);
            },
            GroupPacketKind::SyncRequest => {
                self.handle_sync_request(env, peer_id, payload, now, fx);
            },
            GroupPacketKind::SyncResponse => {
                self.handle_sync_response(env, peer_id, payload, now, fx);
            },
            GroupPacketKind::TcpRelays => {
                self.handle_tcp_relays(peer_id, payload);
            },
            GroupPacketKind::FriendInvite => {
                self.handle_friend_invite(env, peer_id, payload, now, fx);
            },
            // Lossy kinds cannot appear here; the codec enforces the
            // channel split.
            GroupPacketKind::Ping
            | GroupPacketKind::MessageAck
            | GroupPacketKind::InviteReject => {
                debug!(group = %self.id, "lossy packet type on lossless path");
            },
        }
    }

    // ------------------------------------------------------------------
    // Invite flow
    // ------------------------------------------------------------------

    fn handle_invite_request<E: Environment<Instant = I>>(
        &mut self,
        env: &E,
        peer_id: PeerId,
        payload: &[u8],
        now: I,
        fx: &mut Effects,
    ) {
        let request = match InviteRequest::unpack(payload) {
            Ok(r) => r,
            Err(err) => {
                debug!(?err, "malformed invite request");
                return;
            },
        };

        let reject = self.invite_rejection(&request, peer_id);
        match reject {
            Some(reason) => {
                debug!(group = %self.id, peer = %peer_id, ?reason, "rejecting invite");
                let payload = InviteReject { reason }.pack();
                self.send_lossy(env, peer_id, GroupPacketKind::InviteReject, &payload, fx);
                self.fail_link(peer_id);
            },
            None => {
                if let Some(peer) = self.peers.get_mut(peer_id) {
                    peer.link.invite_accepted();
                }
                self.send_lossless(env, peer_id, GroupPacketKind::InviteResponse, &[], now, fx);
            },
        }
    }

    fn invite_rejection(&self, request: &InviteRequest, peer_id: PeerId) -> Option<RejectReason> {
        if !self.shared_state.password.is_empty()
            && !self.shared_state.password.matches_padded(request.password.padded())
        {
            return Some(RejectReason::InvalidPassword);
        }

        if self.shared_state.peer_limit != 0
            && u32::from(self.peers.confirmed_count()) + 1 >= self.shared_state.peer_limit
        {
            return Some(RejectReason::GroupFull);
        }

        let sanctioned = self
            .peers
            .get(peer_id)
            .is_some_and(|peer| self.moderation.is_observer(&peer.enc_pk));
        if sanctioned {
            // Sanctioned peers may rejoin only as observers; a peer whose
            // handshake claims otherwise is refused outright.
            return Some(RejectReason::InviteFailed);
        }

        if !request.name.is_empty() && request.name != self.shared_state.name {
            // Advisory only: chat-id joiners don't know the name yet.
            trace!(group = %self.id, "joiner presented a different group name");
        }

        None
    }

    fn handle_invite_response<E: Environment<Instant = I>>(
        &mut self,
        env: &E,
        peer_id: PeerId,
        now: I,
        fx: &mut Effects,
    ) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.link.invite_accepted();
        }
        self.send_lossless(env, peer_id, GroupPacketKind::PeerInfoRequest, &[], now, fx);
        self.send_own_peer_info(env, peer_id, now, fx);
    }

    fn send_own_peer_info<E: Environment<Instant = I>>(
        &mut self,
        env: &E,
        peer_id: PeerId,
        now: I,
        fx: &mut Effects,
    ) {
        let info = PeerInfo {
            password: self.join_password,
            nick: self.self_nick.clone(),
            status: self.self_status,
            role: self.self_role(),
        }
        .pack();
        self.send_lossless(env, peer_id, GroupPacketKind::PeerInfoResponse, &info, now, fx);
    }

    fn handle_peer_info<E: Environment<Instant = I>>(
        &mut self,
        env: &E,
        peer_id: PeerId,
        payload: &[u8],
        now: I,
        fx: &mut Effects,
    ) {
        let info = match PeerInfo::unpack(payload) {
            Ok(i) => i,
            Err(err) => {
                debug!(?err, "malformed peer info");
                return;
            },
        };

        let already_confirmed = self.peers.get(peer_id).is_some_and(Peer::is_confirmed);

        if !already_confirmed && (info.nick == self.self_nick || self.peers.nick_taken(&info.nick)) {
            let payload = InviteReject { reason: RejectReason::NickTaken }.pack();
            self.send_lossy(env, peer_id, GroupPacketKind::InviteReject, &payload, fx);
            self.fail_link(peer_id);
            return;
        }

        let Some(peer) = self.peers.get_mut(peer_id) else { return };
        peer.nick = info.nick;
        peer.status = info.status;

        let newly_confirmed = peer.link.confirm();
        let initiated = peer.link.initiated;
        if !newly_confirmed {
            return;
        }

        self.dirty = true;
        self.remember_peer_addr(peer_id);
        fx.event(GroupEvent::PeerJoin { group_id: self.id, peer_id });

        if !self.self_joined {
            self.self_joined = true;
            fx.event(GroupEvent::SelfJoin { group_id: self.id });

            if self.join_kind == JoinKind::FriendInvite && initiated {
                // Close the friend-invite loop: tell the inviter we made
                // it in so it can confirm to the friend layer.
                let notice = FriendInvite { kind: FriendInviteKind::Accepted }.pack();
                self.send_lossless(env, peer_id, GroupPacketKind::FriendInvite, &notice, now, fx);
            }
        }

        if !initiated {
            // We are the side that admitted the joiner: hand it the
            // replicated artifacts so it converges without waiting for a
            // sync round.
            self.send_state_bundle(env, peer_id, now, fx);
            let topic = self.topic.pack();
            self.send_lossless(env, peer_id, GroupPacketKind::Topic, &topic, now, fx);
        }
    }

    fn send_state_bundle<E: Environment<Instant = I>>(
        &mut self,
        env: &E,
        peer_id: PeerId,
        now: I,
        fx: &mut Effects,
    ) {
        // Order matters: receivers validate the mod list against the
        // already-accepted shared-state hash.
        let state = self.shared_state.pack();
        self.send_lossless(env, peer_id, GroupPacketKind::SharedState, &state, now, fx);

        let mods = self.moderation.mods().pack();
        self.send_lossless(env, peer_id, GroupPacketKind::ModList, &mods, now, fx);

        let sanctions = self.moderation.sanctions_list().pack();
        self.send_lossless(env, peer_id, GroupPacketKind::SanctionsList, &sanctions, now, fx);
    }

    fn remember_peer_addr(&mut self, peer_id: PeerId) {
        let Some(peer) = self.peers.get(peer_id) else { return };
        if peer.addr.is_empty() {
            return;
        }

        let announce = PeerAnnounce {
            public_key: conclave_crypto::ExtPublicKey { enc: peer.enc_pk, sig: peer.sig_pk },
            addr: peer.addr.ip_port,
            relays: peer.addr.relays.clone(),
        };

        self.known_addrs.retain(|a| a.public_key.enc != announce.public_key.enc);
        self.known_addrs.push(announce);
        if self.known_addrs.len() > MAX_SAVED_PEER_ADDRS {
            self.known_addrs.remove(0);
        }
    }

    // ------------------------------------------------------------------
    // Broadcast dispatch
    // ------------------------------------------------------------------

    fn handle_broadcast(
        &mut self,
        peer_id: PeerId,
        payload: &[u8],
        now: I,
        fx: &mut Effects,
    ) {
        let broadcast = match Broadcast::unpack(payload) {
            Ok(b) => b,
            Err(err) => {
                debug!(?err, "malformed broadcast");
                return;
            },
        };

        match broadcast.kind {
            BroadcastKind::PlainMessage | BroadcastKind::ActionMessage => {
                let kind = if broadcast.kind == BroadcastKind::PlainMessage {
                    MessageKind::Normal
                } else {
                    MessageKind::Action
                };
                self.deliver_message(peer_id, kind, broadcast.data, broadcast.timestamp, fx);
            },
            BroadcastKind::PrivateMessage => {
                self.deliver_private(peer_id, &broadcast.data, fx);
            },
            BroadcastKind::Status => {
                self.handle_status_change(peer_id, &broadcast.data, fx);
            },
            BroadcastKind::Nick => {
                self.handle_nick_change(peer_id, broadcast.data, fx);
            },
            BroadcastKind::PeerExit => {
                self.drop_peer(peer_id, ExitReason::Quit, broadcast.data, now, fx);
            },
            BroadcastKind::KickPeer => {
                self.handle_kick(peer_id, &broadcast.data, now, fx);
            },
            BroadcastKind::SetMod => {
                self.handle_set_mod(peer_id, &broadcast.data, fx);
            },
            BroadcastKind::SetObserver => {
                self.handle_set_observer(peer_id, &broadcast.data, fx);
            },
        }
    }

    fn deliver_message(
        &mut self,
        peer_id: PeerId,
        kind: MessageKind,
        data: Vec<u8>,
        timestamp: u64,
        fx: &mut Effects,
    ) {
        let Some(peer) = self.peers.get(peer_id) else { return };
        if peer.ignore || data.is_empty() {
            return;
        }
        if self.role_of(&peer.sig_pk, &peer.enc_pk) == Role::Observer {
            debug!(group = %self.id, peer = %peer_id, "dropping message from observer");
            return;
        }

        fx.event(GroupEvent::Message { group_id: self.id, peer_id, kind, data, timestamp });
    }

    fn deliver_private(&mut self, peer_id: PeerId, data: &[u8], fx: &mut Effects) {
        let Some(peer) = self.peers.get(peer_id) else { return };
        if peer.ignore || data.len() < 2 {
            return;
        }
        if self.role_of(&peer.sig_pk, &peer.enc_pk) == Role::Observer {
            return;
        }

        let kind = match data[0] {
            0 => MessageKind::Normal,
            1 => MessageKind::Action,
            _ => {
                debug!(group = %self.id, "unknown private message kind");
                return;
            },
        };

        fx.event(GroupEvent::PrivateMessage {
            group_id: self.id,
            peer_id,
            kind,
            data: data[1..].to_vec(),
        });
    }

    fn handle_custom(&mut self, peer_id: PeerId, payload: &[u8], fx: &mut Effects) {
        let Some(peer) = self.peers.get(peer_id) else { return };
        if peer.ignore || payload.is_empty() {
            return;
        }
        fx.event(GroupEvent::CustomPacket {
            group_id: self.id,
            peer_id,
            data: payload.to_vec(),
        });
    }

    fn handle_status_change(&mut self, peer_id: PeerId, data: &[u8], fx: &mut Effects) {
        let Some(&status_byte) = data.first() else { return };
        let Some(status) = StatusKind::from_u8(status_byte) else {
            debug!(group = %self.id, "unknown status byte");
            return;
        };

        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.status = status;
            fx.event(GroupEvent::StatusChange { group_id: self.id, peer_id, status });
        }
    }

    fn handle_nick_change(&mut self, peer_id: PeerId, nick: Vec<u8>, fx: &mut Effects) {
        if nick.is_empty() || nick.len() > conclave_proto::MAX_NICK_SIZE {
            debug!(group = %self.id, "dropping invalid nick change");
            return;
        }

        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.nick = nick.clone();
            fx.event(GroupEvent::NickChange { group_id: self.id, peer_id, nick });
        }
    }

    // ------------------------------------------------------------------
    // Moderation packets
    // ------------------------------------------------------------------

    fn handle_kick(&mut self, source: PeerId, data: &[u8], now: I, fx: &mut Effects) {
        let kick = match KickPeer::unpack(data) {
            Ok(k) => k,
            Err(err) => {
                debug!(?err, "malformed kick");
                return;
            },
        };

        let Some(source_peer) = self.peers.get(source) else { return };
        let source_role = self.role_of(&source_peer.sig_pk, &source_peer.enc_pk);
        if !source_role.at_least(Role::Moderator) {
            warn!(group = %self.id, "kick from non-moderator dropped");
            return;
        }

        if kick.target == self.keys.enc.public() {
            // We were kicked. Drop all peers and disconnect; the group
            // object survives so the application can rejoin or delete.
            fx.event(GroupEvent::Moderation {
                group_id: self.id,
                source: Some(source),
                target: None,
                event: ModEvent::Kick,
            });
            self.disconnect_internal(ExitReason::Kick, now, fx);
            return;
        }

        let Some(target_id) = self.peers.find_by_enc_pk(&kick.target) else { return };
        let target_role = self.peer_role(target_id).unwrap_or(Role::User);
        if !source_role.outranks(target_role) {
            warn!(group = %self.id, "kick does not outrank target; dropped");
            return;
        }

        fx.event(GroupEvent::Moderation {
            group_id: self.id,
            source: Some(source),
            target: Some(target_id),
            event: ModEvent::Kick,
        });
        self.drop_peer_silently(target_id);
    }

    fn handle_set_mod(&mut self, source: PeerId, data: &[u8], fx: &mut Effects) {
        let set_mod = match SetMod::unpack(data) {
            Ok(s) => s,
            Err(err) => {
                debug!(?err, "malformed set-mod");
                return;
            },
        };

        // Only the founder can change the moderator list: its hash is a
        // field of the founder-signed shared state.
        let Some(source_peer) = self.peers.get(source) else { return };
        if source_peer.sig_pk != self.shared_state.founder.sig {
            warn!(group = %self.id, "set-mod from non-founder dropped");
            return;
        }

        let mut candidate = self.moderation.mods().clone();
        if set_mod.promote {
            if !candidate.mods.contains(&set_mod.target) {
                candidate.mods.push(set_mod.target);
            }
        } else {
            candidate.mods.retain(|k| k != &set_mod.target);
        }

        if candidate.hash() != self.shared_state.mod_list_hash {
            // The matching shared state has not arrived yet (ordering is
            // sender-enforced, but packets may have been dropped on a
            // lossy rejoin path). Drop; sync will repair.
            debug!(group = %self.id, "set-mod hash mismatch; awaiting shared state");
            return;
        }

        self.moderation.set_mods(candidate);
        self.dirty = true;

        let target = self.peers.find_by_sig_pk(&set_mod.target);
        let event = if set_mod.promote { ModEvent::Moderator } else { ModEvent::User };
        fx.event(GroupEvent::Moderation { group_id: self.id, source: Some(source), target, event });
    }

    fn handle_set_observer(&mut self, source: PeerId, data: &[u8], fx: &mut Effects) {
        let set_observer = match SetObserver::unpack(data) {
            Ok(s) => s,
            Err(err) => {
                debug!(?err, "malformed set-observer");
                return;
            },
        };

        let Some(source_peer) = self.peers.get(source) else { return };
        if !self
            .moderation
            .is_authoritative(&source_peer.sig_pk, &self.shared_state.founder.sig)
        {
            warn!(group = %self.id, "set-observer from non-authoritative peer dropped");
            return;
        }

        let founder = self.shared_state.founder.sig;
        let result = if set_observer.set {
            let Some(sanction) = set_observer.sanction else {
                debug!(group = %self.id, "set-observer missing sanction entry");
                return;
            };
            self.moderation.accept_sanction(sanction, set_observer.creds, &founder)
        } else {
            self.moderation.accept_removal(&set_observer.target_enc, set_observer.creds, &founder)
        };

        if let Err(err) = result {
            debug!(group = %self.id, ?err, "set-observer rejected");
            return;
        }

        let target = self.peers.find_by_enc_pk(&set_observer.target_enc);
        let event = if set_observer.set { ModEvent::Observer } else { ModEvent::User };
        fx.event(GroupEvent::Moderation { group_id: self.id, source: Some(source), target, event });
    }

    // ------------------------------------------------------------------
    // Replicated artifacts
    // ------------------------------------------------------------------

    fn handle_topic(&mut self, peer_id: PeerId, payload: &[u8], fx: &mut Effects) {
        let candidate = match TopicInfo::unpack(payload) {
            Ok(t) => t,
            Err(err) => {
                debug!(?err, "malformed topic");
                return;
            },
        };

        let setter_is_observer = self
            .peers
            .find_by_sig_pk(&candidate.setter)
            .and_then(|id| self.peer_role(id))
            .is_some_and(|role| role == Role::Observer);

        if let Err(rejection) = validate_topic(
            &candidate,
            &self.topic,
            &self.moderation,
            &self.shared_state.founder.sig,
            self.shared_state.topic_lock,
            setter_is_observer,
        ) {
            debug!(group = %self.id, ?rejection, "topic rejected");
            return;
        }

        let setter_peer = self.peers.find_by_sig_pk(&candidate.setter);
        self.topic = candidate;
        self.dirty = true;
        fx.event(GroupEvent::TopicChange {
            group_id: self.id,
            peer_id: setter_peer,
            topic: self.topic.topic.clone(),
        });
    }

    fn handle_shared_state(&mut self, peer_id: PeerId, payload: &[u8], fx: &mut Effects) {
        let candidate = match SharedState::unpack(payload) {
            Ok(s) => s,
            Err(err) => {
                debug!(?err, "malformed shared state");
                return;
            },
        };

        if crate::shared_state::verify_shared_state(&candidate, &self.chat_id).is_err() {
            warn!(group = %self.id, peer = %peer_id, "shared state signature invalid");
            return;
        }
        if candidate.version <= self.shared_state.version {
            trace!(group = %self.id, "stale shared state ignored");
            return;
        }

        let old = std::mem::replace(&mut self.shared_state, candidate);
        self.join_password = self.shared_state.password;
        self.dirty = true;

        // Surface what actually changed.
        if old.password != self.shared_state.password {
            fx.event(GroupEvent::PasswordChange { group_id: self.id });
        }
        if old.privacy != self.shared_state.privacy {
            fx.event(GroupEvent::PrivacyChange {
                group_id: self.id,
                privacy: self.shared_state.privacy,
            });
        }
        if old.peer_limit != self.shared_state.peer_limit {
            fx.event(GroupEvent::PeerLimitChange {
                group_id: self.id,
                limit: self.shared_state.peer_limit,
            });
        }
    }

    fn handle_mod_list(&mut self, peer_id: PeerId, payload: &[u8]) {
        let candidate = match ModList::unpack(payload) {
            Ok(m) => m,
            Err(err) => {
                debug!(?err, "malformed mod list");
                return;
            },
        };

        if candidate.hash() != self.shared_state.mod_list_hash {
            warn!(group = %self.id, peer = %peer_id, "mod list does not match shared state hash");
            return;
        }

        self.moderation.set_mods(candidate);
        self.dirty = true;
    }

    fn handle_sanctions_list(&mut self, peer_id: PeerId, payload: &[u8]) {
        let candidate = match conclave_proto::payloads::SanctionsList::unpack(payload) {
            Ok(s) => s,
            Err(err) => {
                debug!(?err, "malformed sanctions list");
                return;
            },
        };

        if let Err(err) = self.moderation.accept_list(candidate, &self.shared_state.founder.sig) {
            debug!(group = %self.id, peer = %peer_id, ?err, "sanctions list rejected");
        }
    }

    // ------------------------------------------------------------------
    // Sync
    // ------------------------------------------------------------------

    fn handle_sync_request<E: Environment<Instant = I>>(
        &mut self,
        env: &E,
        peer_id: PeerId,
        payload: &[u8],
        now: I,
        fx: &mut Effects,
    ) {
        let request = match SyncRequest::unpack(payload) {
            Ok(r) => r,
            Err(err) => {
                debug!(?err, "malformed sync request");
                return;
            },
        };

        {
            let Some(peer) = self.peers.get_mut(peer_id) else { return };
            if !peer.link.sync_request_allowed(now) {
                trace!(group = %self.id, peer = %peer_id, "sync request rate-limited");
                return;
            }
        }

        if !self.shared_state.password.is_empty()
            && !self.shared_state.password.matches_padded(request.password.padded())
        {
            debug!(group = %self.id, "sync request with wrong password dropped");
            return;
        }

        if request.flags.state() {
            self.send_state_bundle(env, peer_id, now, fx);
        }
        if request.flags.topic() {
            let topic = self.topic.pack();
            self.send_lossless(env, peer_id, GroupPacketKind::Topic, &topic, now, fx);
        }
        if request.flags.peer_list() {
            let requester_pk = self.peers.get(peer_id).map(|p| p.enc_pk);
            let announces: Vec<Vec<u8>> = self
                .peers
                .iter()
                .filter(|(id, p)| {
                    *id != peer_id
                        && p.is_confirmed()
                        && Some(p.enc_pk) != requester_pk
                        && !p.addr.is_empty()
                })
                .map(|(_, p)| {
                    PeerAnnounce {
                        public_key: conclave_crypto::ExtPublicKey {
                            enc: p.enc_pk,
                            sig: p.sig_pk,
                        },
                        addr: p.addr.ip_port,
                        relays: p.addr.relays.clone(),
                    }
                    .pack()
                })
                .collect();

            for announce in announces {
                self.send_lossless(env, peer_id, GroupPacketKind::SyncResponse, &announce, now, fx);
            }
        }
    }

    fn handle_sync_response<E: Environment<Instant = I>>(
        &mut self,
        env: &E,
        peer_id: PeerId,
        payload: &[u8],
        now: I,
        fx: &mut Effects,
    ) {
        let announce = match PeerAnnounce::unpack(payload) {
            Ok(a) => a,
            Err(err) => {
                debug!(?err, "malformed peer announce");
                return;
            },
        };
        trace!(group = %self.id, peer = %peer_id, "peer announce received");

        self.known_addrs.retain(|a| a.public_key.enc != announce.public_key.enc);
        self.known_addrs.push(announce.clone());
        if self.known_addrs.len() > MAX_SAVED_PEER_ADDRS {
            self.known_addrs.remove(0);
        }

        self.begin_handshake(env, &announce, now, fx);
    }

    fn handle_friend_invite<E: Environment<Instant = I>>(
        &mut self,
        env: &E,
        peer_id: PeerId,
        payload: &[u8],
        now: I,
        fx: &mut Effects,
    ) {
        let notice = match FriendInvite::unpack(payload) {
            Ok(n) => n,
            Err(err) => {
                debug!(?err, "malformed friend invite notice");
                return;
            },
        };

        match notice.kind {
            FriendInviteKind::Accepted => {
                let reply = FriendInvite { kind: FriendInviteKind::Confirmation }.pack();
                self.send_lossless(env, peer_id, GroupPacketKind::FriendInvite, &reply, now, fx);
            },
            FriendInviteKind::Invite | FriendInviteKind::Confirmation => {
                trace!(group = %self.id, peer = %peer_id, "friend invite notice");
            },
        }
    }

    fn handle_tcp_relays(&mut self, peer_id: PeerId, payload: &[u8]) {
        let relays = match TcpRelays::unpack(payload) {
            Ok(r) => r,
            Err(err) => {
                debug!(?err, "malformed relay list");
                return;
            },
        };

        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.addr.merge(&PeerAddress { ip_port: None, relays: relays.relays });
        }
    }

    // ------------------------------------------------------------------
    // Lossy channel
    // ------------------------------------------------------------------

    fn handle_lossy<E: Environment<Instant = I>>(
        &mut self,
        env: &E,
        sender: EncPublicKey,
        kind: GroupPacketKind,
        payload: &[u8],
        now: I,
        fx: &mut Effects,
    ) {
        let Some(peer_id) = self.peers.find_by_enc_pk(&sender) else { return };
        let Some(peer) = self.peers.get_mut(peer_id) else { return };
        peer.link.touch(now);

        match kind {
            GroupPacketKind::Ping => self.handle_ping(env, peer_id, payload, now, fx),
            GroupPacketKind::MessageAck => self.handle_ack(env, peer_id, payload, now, fx),
            GroupPacketKind::InviteReject => self.handle_invite_reject(peer_id, payload, fx),
            _ => {
                debug!(group = %self.id, "lossless packet type on lossy path");
            },
        }
    }

    fn handle_ping<E: Environment<Instant = I>>(
        &mut self,
        env: &E,
        peer_id: PeerId,
        payload: &[u8],
        now: I,
        fx: &mut Effects,
    ) {
        let theirs = match Ping::unpack(payload) {
            Ok(p) => p,
            Err(err) => {
                debug!(?err, "malformed ping");
                return;
            },
        };

        // Pings only count between confirmed peers.
        if !self.peers.get(peer_id).is_some_and(Peer::is_confirmed) {
            return;
        }

        if let Some(addr) = theirs.self_addr {
            if let Some(peer) = self.peers.get_mut(peer_id) {
                peer.addr.merge(&PeerAddress::direct(addr));
            }
        }

        let ours = self.version_vector();
        let flags = out_of_sync_flags(&ours, &theirs);
        if flags.is_empty() {
            return;
        }

        debug!(group = %self.id, peer = %peer_id, flags = flags.bits(), "out of sync; requesting");
        let request = SyncRequest { flags, password: self.join_password }.pack();
        self.send_lossless(env, peer_id, GroupPacketKind::SyncRequest, &request, now, fx);
    }

    fn handle_ack<E: Environment<Instant = I>>(
        &mut self,
        env: &E,
        peer_id: PeerId,
        payload: &[u8],
        now: I,
        fx: &mut Effects,
    ) {
        let ack = match MessageAck::unpack(payload) {
            Ok(a) => a,
            Err(err) => {
                debug!(?err, "malformed ack");
                return;
            },
        };

        match ack.kind {
            AckKind::Received => {
                if let Some(peer) = self.peers.get_mut(peer_id) {
                    peer.link.send.ack(ack.message_id);
                }
            },
            AckKind::Request => {
                self.retransmit(env, peer_id, ack.message_id, now, fx);
            },
        }
    }

    fn retransmit<E: Environment<Instant = I>>(
        &mut self,
        env: &E,
        peer_id: PeerId,
        message_id: u64,
        now: I,
        fx: &mut Effects,
    ) {
        let self_pk = self.keys.enc.public();
        let chat_hash = self.chat_id_hash;

        let Some(peer) = self.peers.get_mut(peer_id) else { return };
        let Some(key) = peer.link.session_key().cloned() else { return };
        let addr = peer.addr.clone();

        let Some(entry) = peer.link.send.get(message_id) else {
            trace!(group = %self.id, "retransmit request for unknown id");
            return;
        };
        entry.last_send = now;
        entry.attempts += 1;

        let body = PacketBody::Lossless { kind: entry.kind, message_id, payload: &entry.payload };
        if let Some(frame) = seal_frame(env, chat_hash, &self_pk, &key, body) {
            fx.send(addr, frame);
        }
    }

    fn handle_invite_reject(&mut self, peer_id: PeerId, payload: &[u8], fx: &mut Effects) {
        let reject = match InviteReject::unpack(payload) {
            Ok(r) => r,
            Err(err) => {
                debug!(?err, "malformed invite reject");
                return;
            },
        };

        if self.self_joined {
            return;
        }

        let reason = match reject.reason {
            RejectReason::NickTaken => JoinFailReason::NickTaken,
            RejectReason::GroupFull => JoinFailReason::PeerLimit,
            RejectReason::InvalidPassword => JoinFailReason::InvalidPassword,
            RejectReason::InviteFailed => JoinFailReason::Unknown,
        };
        fx.event(GroupEvent::JoinFail { group_id: self.id, reason });
        self.fail_link(peer_id);
    }

    // ------------------------------------------------------------------
    // Peer lifecycle
    // ------------------------------------------------------------------

    /// Remove a peer without emitting an exit event (kicks that already
    /// emitted a moderation event, expired handshakes).
    pub fn drop_peer_silently(&mut self, peer_id: PeerId) {
        self.peers.remove(peer_id);
    }

    /// Mark a link dead; the timer loop reaps it.
    fn fail_link(&mut self, peer_id: PeerId) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.link.fail();
        }
    }

    /// Remove a peer and, if it was confirmed, tell the application.
    pub fn drop_peer(
        &mut self,
        peer_id: PeerId,
        reason: ExitReason,
        part_message: Vec<u8>,
        _now: I,
        fx: &mut Effects,
    ) {
        let Some(peer) = self.peers.remove(peer_id) else { return };
        if !peer.is_confirmed() {
            return;
        }

        fx.event(GroupEvent::PeerExit {
            group_id: self.id,
            peer_id,
            nick: peer.nick,
            reason,
            part_message,
        });
    }

    /// Drop every peer and mark the group disconnected.
    pub fn disconnect_internal(&mut self, reason: ExitReason, now: I, fx: &mut Effects) {
        let ids: Vec<PeerId> = self.peers.iter().map(|(id, _)| id).collect();
        for id in ids {
            self.drop_peer(id, reason, Vec::new(), now, fx);
        }
        self.connected = false;
        self.self_joined = self.is_founder();
        self.moderation.reset_sanctions();
    }

    // ------------------------------------------------------------------
    // Timer loop
    // ------------------------------------------------------------------

    /// One engine tick for this group.
    pub fn tick<E: Environment<Instant = I>>(&mut self, env: &E, now: I, fx: &mut Effects) {
        if !self.connected {
            return;
        }

        self.resend_handshakes(env, now, fx);
        self.send_due_pings(env, now, fx);
        self.resend_unacked(env, now, fx);
        self.evict_timed_out(now, fx);
        self.try_reconnect(env, now, fx);
    }

    fn resend_handshakes<E: Environment<Instant = I>>(&mut self, env: &E, now: I, fx: &mut Effects) {
        let self_pk = self.keys.enc.public();
        let chat_hash = self.chat_id_hash;
        let self_sig = self.keys.sig.public();
        let join_kind = self.join_kind;

        let due: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, p)| p.link.initiated && p.link.handshake_resend_due(now))
            .map(|(id, _)| id)
            .collect();

        for peer_id in due {
            let Some(peer) = self.peers.get_mut(peer_id) else { continue };
            let Some(session_pk) = peer.link.session_pk() else { continue };

            let handshake = Handshake {
                kind: HandshakeKind::Request,
                session_pk,
                sig_pk: self_sig,
                join: join_kind,
            }
            .pack();

            peer.link.handshake_resent(now);
            let key = peer.link.pair_key();
            if let Some(frame) = seal_frame(
                env,
                chat_hash,
                &self_pk,
                key,
                PacketBody::Handshake { payload: &handshake },
            ) {
                fx.send(peer.addr.clone(), frame);
            }
        }
    }

    fn send_due_pings<E: Environment<Instant = I>>(&mut self, env: &E, now: I, fx: &mut Effects) {
        let due: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, p)| p.link.ping_due(now))
            .map(|(id, _)| id)
            .collect();
        if due.is_empty() {
            return;
        }

        let mut ping = self.version_vector();
        ping.self_addr = self.self_addr;
        let payload = ping.pack();

        for peer_id in due {
            if let Some(peer) = self.peers.get_mut(peer_id) {
                peer.link.ping_sent(now);
            }
            self.send_lossy(env, peer_id, GroupPacketKind::Ping, &payload, fx);
        }
    }

    fn resend_unacked<E: Environment<Instant = I>>(&mut self, env: &E, now: I, fx: &mut Effects) {
        let ids: Vec<PeerId> = self.peers.iter().map(|(id, _)| id).collect();

        for peer_id in ids {
            let pass: ResendPass = {
                let Some(peer) = self.peers.get_mut(peer_id) else { continue };
                peer.link.send.tick(now, crate::link::CONFIRMED_PEER_TIMEOUT)
            };

            if pass.dead {
                self.drop_peer(peer_id, ExitReason::SyncError, Vec::new(), now, fx);
                continue;
            }

            for message_id in pass.resend {
                self.retransmit_raw(env, peer_id, message_id, fx);
            }
        }
    }

    /// Reseal and resend without touching attempt bookkeeping (the window
    /// tick already updated it).
    fn retransmit_raw<E: Environment<Instant = I>>(
        &mut self,
        env: &E,
        peer_id: PeerId,
        message_id: u64,
        fx: &mut Effects,
    ) {
        let self_pk = self.keys.enc.public();
        let chat_hash = self.chat_id_hash;

        let Some(peer) = self.peers.get_mut(peer_id) else { return };
        let Some(key) = peer.link.session_key().cloned() else { return };
        let addr = peer.addr.clone();
        let Some(entry) = peer.link.send.get(message_id) else { return };

        let body = PacketBody::Lossless { kind: entry.kind, message_id, payload: &entry.payload };
        if let Some(frame) = seal_frame(env, chat_hash, &self_pk, &key, body) {
            fx.send(addr, frame);
        }
    }

    fn evict_timed_out(&mut self, now: I, fx: &mut Effects) {
        for (peer_id, was_confirmed) in self.peers.timed_out(now) {
            debug!(group = %self.id, peer = %peer_id, was_confirmed, "evicting timed-out peer");
            if was_confirmed {
                self.drop_peer(peer_id, ExitReason::Timeout, Vec::new(), now, fx);
            } else {
                self.drop_peer_silently(peer_id);
            }
        }
    }

    fn try_reconnect<E: Environment<Instant = I>>(&mut self, env: &E, now: I, fx: &mut Effects) {
        if !self.peers.is_empty() || self.known_addrs.is_empty() {
            return;
        }
        if self
            .last_reconnect
            .is_some_and(|at| now - at < RECONNECT_INTERVAL)
        {
            return;
        }
        self.last_reconnect = Some(now);

        let addrs = self.known_addrs.clone();
        for announce in &addrs {
            self.begin_handshake(env, announce, now, fx);
        }
    }

    // ------------------------------------------------------------------
    // Public operations (invoked through the engine)
    // ------------------------------------------------------------------

    fn check_message(&self, data: &[u8]) -> Result<(), crate::error::SendError> {
        use crate::error::SendError;

        if data.is_empty() {
            return Err(SendError::Empty);
        }
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(SendError::TooLong);
        }
        if !self.connected || !self.self_joined {
            return Err(SendError::NotConnected);
        }
        Ok(())
    }

    /// Send a chat message to every confirmed peer.
    pub fn op_send_message<E: Environment<Instant = I>>(
        &mut self,
        env: &E,
        kind: MessageKind,
        data: &[u8],
        now: I,
        fx: &mut Effects,
    ) -> Result<(), crate::error::SendError> {
        self.check_message(data)?;
        if self.self_role() == Role::Observer {
            return Err(crate::error::SendError::PermissionDenied);
        }

        let broadcast_kind = match kind {
            MessageKind::Normal => BroadcastKind::PlainMessage,
            MessageKind::Action => BroadcastKind::ActionMessage,
        };
        self.broadcast(env, broadcast_kind, data.to_vec(), now, fx);
        Ok(())
    }

    /// Send a private message to a single peer.
    pub fn op_send_private<E: Environment<Instant = I>>(
        &mut self,
        env: &E,
        peer_id: PeerId,
        kind: MessageKind,
        data: &[u8],
        now: I,
        fx: &mut Effects,
    ) -> Result<(), crate::error::SendError> {
        use crate::error::SendError;

        self.check_message(data)?;
        if self.self_role() == Role::Observer {
            return Err(SendError::PermissionDenied);
        }
        if !self.peers.get(peer_id).is_some_and(Peer::is_confirmed) {
            return Err(SendError::PeerNotFound);
        }

        let mut inner = Vec::with_capacity(1 + data.len());
        inner.push(match kind {
            MessageKind::Normal => 0,
            MessageKind::Action => 1,
        });
        inner.extend_from_slice(data);

        let envelope =
            Broadcast { kind: BroadcastKind::PrivateMessage, timestamp: env.wall_clock_secs(), data: inner }
                .pack();
        if !self.send_lossless(env, peer_id, GroupPacketKind::Broadcast, &envelope, now, fx) {
            return Err(SendError::SendQueueFull);
        }
        Ok(())
    }

    /// Send an opaque custom packet to every confirmed peer.
    pub fn op_send_custom<E: Environment<Instant = I>>(
        &mut self,
        env: &E,
        reliable: bool,
        data: &[u8],
        now: I,
        fx: &mut Effects,
    ) -> Result<(), crate::error::SendError> {
        self.check_message(data)?;
        if self.self_role() == Role::Observer {
            return Err(crate::error::SendError::PermissionDenied);
        }

        if reliable {
            self.broadcast_lossless(env, GroupPacketKind::Custom, data, now, fx);
        } else {
            let confirmed: Vec<PeerId> = self
                .peers
                .iter()
                .filter(|(_, p)| p.is_confirmed())
                .map(|(id, _)| id)
                .collect();
            for peer_id in confirmed {
                self.send_lossy(env, peer_id, GroupPacketKind::Custom, data, fx);
            }
        }
        Ok(())
    }

    /// Set the topic, honoring the topic lock.
    pub fn op_set_topic<E: Environment<Instant = I>>(
        &mut self,
        env: &E,
        topic: &[u8],
        now: I,
        fx: &mut Effects,
    ) -> Result<(), crate::error::TopicError> {
        use crate::error::TopicError;

        if topic.len() > MAX_TOPIC_SIZE {
            return Err(TopicError::TooLong);
        }
        if !self.connected {
            return Err(TopicError::Disconnected);
        }

        let role = self.self_role();
        let permitted = if self.shared_state.topic_lock {
            role.at_least(Role::Moderator)
        } else {
            role.at_least(Role::User)
        };
        if !permitted {
            return Err(TopicError::PermissionDenied);
        }

        self.topic = make_topic(self.topic.version, topic.to_vec(), &self.keys.sig);
        self.dirty = true;

        let packed = self.topic.pack();
        self.broadcast_lossless(env, GroupPacketKind::Topic, &packed, now, fx);
        Ok(())
    }

    /// Change a peer's role.
    ///
    /// Moderator-list transitions are reserved to the founder because the
    /// list hash lives in the founder-signed shared state; observer
    /// transitions are open to moderators as well.
    pub fn op_set_role<E: Environment<Instant = I>>(
        &mut self,
        env: &E,
        target: PeerId,
        new_role: Role,
        now: I,
        fx: &mut Effects,
    ) -> Result<(), crate::error::RoleError> {
        use crate::error::RoleError;

        if new_role == Role::Founder {
            return Err(RoleError::InvalidRole);
        }

        let target_peer = self.peers.get(target).ok_or(RoleError::PeerNotFound)?;
        let (target_enc, target_sig) = (target_peer.enc_pk, target_peer.sig_pk);
        if target_sig == self.keys.sig.public() {
            return Err(RoleError::SelfTarget);
        }

        let caller = self.self_role();
        let target_role = self.role_of(&target_sig, &target_enc);
        if !caller.at_least(Role::Moderator)
            || !caller.outranks(target_role)
            || !caller.at_least(new_role)
        {
            return Err(RoleError::PermissionDenied);
        }
        if target_role == new_role {
            return Err(RoleError::InvalidRole);
        }

        if (new_role == Role::Moderator || target_role == Role::Moderator) && !self.is_founder() {
            return Err(RoleError::PermissionDenied);
        }

        // Leave the observer list first when coming out of it.
        if target_role == Role::Observer {
            self.lift_observer_and_broadcast(env, target_enc, target_sig, now, fx);
        }

        match new_role {
            Role::Moderator => self.promote_moderator(env, target_sig, now, fx)?,
            Role::Observer => {
                if target_role == Role::Moderator {
                    self.demote_moderator(env, target_sig, now, fx)?;
                }
                self.sanction_observer_and_broadcast(env, target_enc, target_sig, now, fx)?;
            },
            Role::User => {
                if target_role == Role::Moderator {
                    self.demote_moderator(env, target_sig, now, fx)?;
                }
            },
            Role::Founder => unreachable!("rejected above"),
        }

        self.dirty = true;
        Ok(())
    }

    fn promote_moderator<E: Environment<Instant = I>>(
        &mut self,
        env: &E,
        target_sig: SigPublicKey,
        now: I,
        fx: &mut Effects,
    ) -> Result<(), crate::error::RoleError> {
        let group_keys =
            self.group_keys.clone().ok_or(crate::error::RoleError::PermissionDenied)?;

        self.moderation.add_mod(target_sig).map_err(|_| crate::error::RoleError::Failed)?;
        let hash = self.moderation.mods().hash();
        crate::shared_state::mutate_and_resign(&mut self.shared_state, &group_keys, |s| {
            s.mod_list_hash = hash;
        });

        // Shared state first: receivers validate the mod-list change
        // against the hash they have already accepted.
        let state = self.shared_state.pack();
        self.broadcast_lossless(env, GroupPacketKind::SharedState, &state, now, fx);

        let data = SetMod { promote: true, target: target_sig }.pack();
        self.broadcast(env, BroadcastKind::SetMod, data, now, fx);
        Ok(())
    }

    fn demote_moderator<E: Environment<Instant = I>>(
        &mut self,
        env: &E,
        target_sig: SigPublicKey,
        now: I,
        fx: &mut Effects,
    ) -> Result<(), crate::error::RoleError> {
        let group_keys =
            self.group_keys.clone().ok_or(crate::error::RoleError::PermissionDenied)?;

        if !self.moderation.remove_mod(&target_sig) {
            return Err(crate::error::RoleError::Failed);
        }
        let hash = self.moderation.mods().hash();
        crate::shared_state::mutate_and_resign(&mut self.shared_state, &group_keys, |s| {
            s.mod_list_hash = hash;
        });

        let state = self.shared_state.pack();
        self.broadcast_lossless(env, GroupPacketKind::SharedState, &state, now, fx);

        let data = SetMod { promote: false, target: target_sig }.pack();
        self.broadcast(env, BroadcastKind::SetMod, data, now, fx);

        // Keep every sanctions entry signed by a currently authoritative
        // key: take over the demoted moderator's entries.
        if self.moderation.replace_setter_signatures(&target_sig, &self.keys.sig) > 0 {
            let list = self.moderation.sanctions_list().pack();
            self.broadcast_lossless(env, GroupPacketKind::SanctionsList, &list, now, fx);
        }

        // Same rule for the topic.
        if self.topic.setter == target_sig {
            self.topic = make_topic(self.topic.version, self.topic.topic.clone(), &self.keys.sig);
            let packed = self.topic.pack();
            self.broadcast_lossless(env, GroupPacketKind::Topic, &packed, now, fx);
        }

        Ok(())
    }

    fn sanction_observer_and_broadcast<E: Environment<Instant = I>>(
        &mut self,
        env: &E,
        target_enc: EncPublicKey,
        target_sig: SigPublicKey,
        now: I,
        fx: &mut Effects,
    ) -> Result<(), crate::error::RoleError> {
        let sanction = self
            .moderation
            .sanction_observer(&self.keys.sig, target_enc, env.wall_clock_secs())
            .map_err(|_| crate::error::RoleError::Failed)?;

        let data = SetObserver {
            set: true,
            target_enc,
            target_sig,
            sanction: Some(sanction),
            creds: *self.moderation.creds(),
        }
        .pack();
        self.broadcast(env, BroadcastKind::SetObserver, data, now, fx);
        Ok(())
    }

    fn lift_observer_and_broadcast<E: Environment<Instant = I>>(
        &mut self,
        env: &E,
        target_enc: EncPublicKey,
        target_sig: SigPublicKey,
        now: I,
        fx: &mut Effects,
    ) {
        if !self.moderation.lift_observer(&self.keys.sig, &target_enc) {
            return;
        }

        let data = SetObserver {
            set: false,
            target_enc,
            target_sig,
            sanction: None,
            creds: *self.moderation.creds(),
        }
        .pack();
        self.broadcast(env, BroadcastKind::SetObserver, data, now, fx);
    }

    /// Kick a peer: everyone removes it from their peer list.
    pub fn op_kick<E: Environment<Instant = I>>(
        &mut self,
        env: &E,
        target: PeerId,
        now: I,
        fx: &mut Effects,
    ) -> Result<(), crate::error::RoleError> {
        use crate::error::RoleError;

        let target_peer = self.peers.get(target).ok_or(RoleError::PeerNotFound)?;
        let (target_enc, target_sig) = (target_peer.enc_pk, target_peer.sig_pk);
        if target_sig == self.keys.sig.public() {
            return Err(RoleError::SelfTarget);
        }

        let caller = self.self_role();
        let target_role = self.role_of(&target_sig, &target_enc);
        if !caller.at_least(Role::Moderator) || !caller.outranks(target_role) {
            return Err(RoleError::PermissionDenied);
        }

        let data = KickPeer { target: target_enc }.pack();
        self.broadcast(env, BroadcastKind::KickPeer, data, now, fx);
        self.drop_peer_silently(target);
        Ok(())
    }

    /// Toggle message suppression for a peer.
    pub fn op_toggle_ignore(
        &mut self,
        target: PeerId,
        ignore: bool,
    ) -> Result<(), crate::error::IgnoreError> {
        use crate::error::IgnoreError;

        let peer = self.peers.get_mut(target).ok_or(IgnoreError::PeerNotFound)?;
        if peer.sig_pk == self.keys.sig.public() {
            return Err(IgnoreError::SelfTarget);
        }
        peer.ignore = ignore;
        Ok(())
    }

    /// Founder-only shared-state mutation, re-signed and broadcast.
    pub fn op_mutate_shared_state<E: Environment<Instant = I>>(
        &mut self,
        env: &E,
        mutate: impl FnOnce(&mut SharedState),
        now: I,
        fx: &mut Effects,
    ) -> Result<(), crate::error::FounderError> {
        use crate::error::FounderError;

        let group_keys = self.group_keys.clone().ok_or(FounderError::NotFounder)?;
        if !self.connected {
            return Err(FounderError::Disconnected);
        }

        crate::shared_state::mutate_and_resign(&mut self.shared_state, &group_keys, mutate);
        // The founder validates against its own state too.
        self.join_password = self.shared_state.password;
        self.dirty = true;

        let state = self.shared_state.pack();
        self.broadcast_lossless(env, GroupPacketKind::SharedState, &state, now, fx);
        Ok(())
    }

    /// Change our nickname.
    pub fn op_set_nick<E: Environment<Instant = I>>(
        &mut self,
        env: &E,
        nick: &[u8],
        now: I,
        fx: &mut Effects,
    ) -> Result<(), crate::error::NickError> {
        use crate::error::NickError;

        if nick.is_empty() {
            return Err(NickError::Empty);
        }
        if nick.len() > conclave_proto::MAX_NICK_SIZE {
            return Err(NickError::TooLong);
        }
        if self.peers.nick_taken(nick) {
            return Err(NickError::Taken);
        }

        self.self_nick = nick.to_vec();
        self.dirty = true;
        self.broadcast(env, BroadcastKind::Nick, nick.to_vec(), now, fx);
        Ok(())
    }

    /// Change our presence status.
    pub fn op_set_status<E: Environment<Instant = I>>(
        &mut self,
        env: &E,
        status: StatusKind,
        now: I,
        fx: &mut Effects,
    ) {
        self.self_status = status;
        self.broadcast(env, BroadcastKind::Status, vec![status.to_u8()], now, fx);
    }

    /// Announce departure. The engine deletes the group afterwards.
    pub fn op_leave<E: Environment<Instant = I>>(
        &mut self,
        env: &E,
        part_message: &[u8],
        now: I,
        fx: &mut Effects,
    ) -> Result<(), crate::error::LeaveError> {
        if part_message.len() > MAX_PART_MESSAGE_SIZE {
            return Err(crate::error::LeaveError::TooLong);
        }

        self.broadcast(env, BroadcastKind::PeerExit, part_message.to_vec(), now, fx);
        Ok(())
    }
}
