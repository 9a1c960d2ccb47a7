//! Packed control payloads.
//!
//! Every struct here has a fixed binary layout (network byte order) packed
//! with `bytes::BufMut` and unpacked through a bounds-checked reader.
//! Signed artifacts additionally expose `signed_bytes()`, the canonical
//! byte string their signature covers; packing and signing always agree
//! because both go through the same helper.

use bytes::BufMut;

use conclave_crypto::{
    ChatId, EncPublicKey, ExtPublicKey, SHA256_SIZE, SigPublicKey, Signature, sha256,
};

use crate::{
    MAX_ANNOUNCED_RELAYS, MAX_GROUP_NAME_SIZE, MAX_MODERATORS, MAX_NICK_SIZE, MAX_PASSWORD_SIZE,
    MAX_SANCTIONS, MAX_TOPIC_SIZE,
    error::CodecError,
    types::{
        AckKind, BroadcastKind, HandshakeKind, JoinKind, PrivacyState, RejectReason, Role,
        StatusKind, SyncFlags,
    },
};

/// Bounds-checked cursor over untrusted payload bytes.
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or(CodecError::Malformed("truncated payload"))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let b = self.take(N)?;
        let mut arr = [0u8; N];
        arr.copy_from_slice(b);
        Ok(arr)
    }

    fn finish(self) -> Result<(), CodecError> {
        if self.pos == self.bytes.len() {
            Ok(())
        } else {
            Err(CodecError::Malformed("trailing bytes after payload"))
        }
    }
}

/// A group password: up to 32 bytes, zero-padded on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Password {
    len: u16,
    bytes: [u8; MAX_PASSWORD_SIZE],
}

impl Password {
    /// An empty password (no protection).
    pub const EMPTY: Self = Self { len: 0, bytes: [0; MAX_PASSWORD_SIZE] };

    /// Construct from plaintext bytes.
    ///
    /// # Errors
    ///
    /// - `CodecError::Malformed` if longer than 32 bytes
    pub fn new(plain: &[u8]) -> Result<Self, CodecError> {
        if plain.len() > MAX_PASSWORD_SIZE {
            return Err(CodecError::Malformed("password too long"));
        }
        let mut bytes = [0u8; MAX_PASSWORD_SIZE];
        bytes[..plain.len()].copy_from_slice(plain);
        Ok(Self { len: plain.len() as u16, bytes })
    }

    /// The password bytes (without padding).
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// True if no password is set.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The zero-padded wire buffer.
    pub fn padded(&self) -> &[u8; MAX_PASSWORD_SIZE] {
        &self.bytes
    }

    /// Compare against a zero-padded candidate buffer.
    pub fn matches_padded(&self, candidate: &[u8; MAX_PASSWORD_SIZE]) -> bool {
        &self.bytes == candidate
    }

    fn pack_with_len(&self, out: &mut Vec<u8>) {
        out.put_u16(self.len);
        out.put_slice(&self.bytes);
    }

    fn unpack_with_len(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let len = r.u16()?;
        let bytes: [u8; MAX_PASSWORD_SIZE] = r.array()?;
        if len as usize > MAX_PASSWORD_SIZE {
            return Err(CodecError::Malformed("password length out of range"));
        }
        Ok(Self { len, bytes })
    }
}

/// IP and port as they travel inside pings and peer announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WireAddr {
    /// IP address (v4 or v6).
    pub ip: std::net::IpAddr,
    /// UDP port.
    pub port: u16,
}

impl WireAddr {
    /// Convert to a socket address.
    pub fn to_socket_addr(self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.ip, self.port)
    }

    /// Convert from a socket address.
    pub fn from_socket_addr(addr: std::net::SocketAddr) -> Self {
        Self { ip: addr.ip(), port: addr.port() }
    }

    fn pack(&self, out: &mut Vec<u8>) {
        match self.ip {
            std::net::IpAddr::V4(ip) => {
                out.put_u8(4);
                out.put_slice(&ip.octets());
            },
            std::net::IpAddr::V6(ip) => {
                out.put_u8(6);
                out.put_slice(&ip.octets());
            },
        }
        out.put_u16(self.port);
    }

    fn unpack(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let family = r.u8()?;
        let ip = match family {
            4 => std::net::IpAddr::V4(std::net::Ipv4Addr::from(r.array::<4>()?)),
            6 => std::net::IpAddr::V6(std::net::Ipv6Addr::from(r.array::<16>()?)),
            _ => return Err(CodecError::Malformed("unknown address family")),
        };
        Ok(Self { ip, port: r.u16()? })
    }

    fn pack_opt(addr: Option<&Self>, out: &mut Vec<u8>) {
        match addr {
            Some(addr) => addr.pack(out),
            None => out.put_u8(0),
        }
    }

    fn unpack_opt(r: &mut Reader<'_>) -> Result<Option<Self>, CodecError> {
        let family = r.u8()?;
        let ip = match family {
            0 => return Ok(None),
            4 => std::net::IpAddr::V4(std::net::Ipv4Addr::from(r.array::<4>()?)),
            6 => std::net::IpAddr::V6(std::net::Ipv6Addr::from(r.array::<16>()?)),
            _ => return Err(CodecError::Malformed("unknown address family")),
        };
        Ok(Some(Self { ip, port: r.u16()? }))
    }
}

/// A TCP relay usable to reach a peer behind a restrictive NAT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RelayNode {
    /// The relay's public key.
    pub public_key: EncPublicKey,
    /// The relay's address.
    pub addr: WireAddr,
}

impl RelayNode {
    fn pack(&self, out: &mut Vec<u8>) {
        out.put_slice(self.public_key.as_bytes());
        self.addr.pack(out);
    }

    fn unpack(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let public_key = EncPublicKey::from_bytes(r.array()?);
        let addr = WireAddr::unpack(r)?;
        Ok(Self { public_key, addr })
    }
}

fn pack_relays(relays: &[RelayNode], out: &mut Vec<u8>) {
    let count = relays.len().min(MAX_ANNOUNCED_RELAYS);
    out.put_u8(count as u8);
    for relay in &relays[..count] {
        relay.pack(out);
    }
}

fn unpack_relays(r: &mut Reader<'_>) -> Result<Vec<RelayNode>, CodecError> {
    let count = r.u8()? as usize;
    if count > MAX_ANNOUNCED_RELAYS {
        return Err(CodecError::Malformed("too many relays"));
    }
    (0..count).map(|_| RelayNode::unpack(r)).collect()
}

/// Handshake frame payload.
///
/// Sealed under the pair key; carries the ephemeral session key and the
/// sender's signature identity (the encryption identity is already in the
/// plaintext header).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    /// Request (initiator) or response (responder).
    pub kind: HandshakeKind,
    /// Fresh ephemeral public key for session key derivation.
    pub session_pk: EncPublicKey,
    /// Sender's permanent public signature key.
    pub sig_pk: SigPublicKey,
    /// How the initiator found the group.
    pub join: JoinKind,
}

impl Handshake {
    /// Pack to wire bytes. The leading byte is the nonzero handshake
    /// discriminator, as the codec's padding-skip requires.
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(66);
        out.put_u8(self.kind as u8);
        out.put_slice(self.session_pk.as_bytes());
        out.put_slice(self.sig_pk.as_bytes());
        out.put_u8(self.join as u8);
        out
    }

    /// Unpack from wire bytes.
    ///
    /// # Errors
    ///
    /// - `CodecError::Malformed` on truncation or unknown discriminators
    pub fn unpack(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(bytes);
        let kind = HandshakeKind::from_u8(r.u8()?)
            .ok_or(CodecError::Malformed("unknown handshake kind"))?;
        let session_pk = EncPublicKey::from_bytes(r.array()?);
        let sig_pk = SigPublicKey::from_bytes(r.array()?);
        let join = JoinKind::from_u8(r.u8()?).ok_or(CodecError::Malformed("unknown join kind"))?;
        r.finish()?;
        Ok(Self { kind, session_pk, sig_pk, join })
    }
}

/// Version-vector keepalive, sent periodically on every confirmed link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    /// Sender's peer-list checksum.
    pub peer_list_checksum: u16,
    /// Sender's confirmed peer count.
    pub confirmed_peer_count: u16,
    /// Sender's shared state version.
    pub shared_state_version: u32,
    /// Sender's sanctions credentials version.
    pub sanctions_version: u32,
    /// Sender's topic version.
    pub topic_version: u32,
    /// Sender's own address, if it knows one worth announcing.
    pub self_addr: Option<WireAddr>,
}

impl Ping {
    /// Pack to wire bytes.
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(35);
        out.put_u16(self.peer_list_checksum);
        out.put_u16(self.confirmed_peer_count);
        out.put_u32(self.shared_state_version);
        out.put_u32(self.sanctions_version);
        out.put_u32(self.topic_version);
        WireAddr::pack_opt(self.self_addr.as_ref(), &mut out);
        out
    }

    /// Unpack from wire bytes.
    ///
    /// # Errors
    ///
    /// - `CodecError::Malformed` on truncation
    pub fn unpack(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(bytes);
        let ping = Self {
            peer_list_checksum: r.u16()?,
            confirmed_peer_count: r.u16()?,
            shared_state_version: r.u32()?,
            sanctions_version: r.u32()?,
            topic_version: r.u32()?,
            self_addr: WireAddr::unpack_opt(&mut r)?,
        };
        r.finish()?;
        Ok(ping)
    }
}

/// Lossless delivery ack or retransmit request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageAck {
    /// The message id being acked or requested.
    pub message_id: u64,
    /// Received or request-retransmit.
    pub kind: AckKind,
}

impl MessageAck {
    /// Pack to wire bytes.
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(9);
        out.put_u64(self.message_id);
        out.put_u8(self.kind as u8);
        out
    }

    /// Unpack from wire bytes.
    ///
    /// # Errors
    ///
    /// - `CodecError::Malformed` on truncation or unknown ack kind
    pub fn unpack(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(bytes);
        let message_id = r.u64()?;
        let kind = AckKind::from_u8(r.u8()?).ok_or(CodecError::Malformed("unknown ack kind"))?;
        r.finish()?;
        Ok(Self { message_id, kind })
    }
}

/// Invite rejection, the only lossy packet in the handshake flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InviteReject {
    /// Why the join was refused.
    pub reason: RejectReason,
}

impl InviteReject {
    /// Pack to wire bytes.
    pub fn pack(&self) -> Vec<u8> {
        vec![self.reason as u8]
    }

    /// Unpack from wire bytes.
    ///
    /// # Errors
    ///
    /// - `CodecError::Malformed` on truncation or unknown reason
    pub fn unpack(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(bytes);
        let reason =
            RejectReason::from_u8(r.u8()?).ok_or(CodecError::Malformed("unknown reject reason"))?;
        r.finish()?;
        Ok(Self { reason })
    }
}

/// Invite request: the joiner presents the group name and password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InviteRequest {
    /// Group name as the joiner believes it to be.
    pub name: Vec<u8>,
    /// Group password (zero-padded).
    pub password: Password,
}

impl InviteRequest {
    /// Pack to wire bytes.
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.name.len() + MAX_PASSWORD_SIZE);
        out.put_u16(self.name.len() as u16);
        out.put_slice(&self.name);
        out.put_slice(self.password.padded());
        out
    }

    /// Unpack from wire bytes.
    ///
    /// # Errors
    ///
    /// - `CodecError::Malformed` on truncation or oversized name
    pub fn unpack(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(bytes);
        let name_len = r.u16()? as usize;
        if name_len > MAX_GROUP_NAME_SIZE {
            return Err(CodecError::Malformed("group name too long"));
        }
        let name = r.take(name_len)?.to_vec();
        let padded: [u8; MAX_PASSWORD_SIZE] = r.array()?;
        r.finish()?;

        let len = padded.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        Ok(Self { name, password: Password { len: len as u16, bytes: padded } })
    }
}

/// Peer info exchanged after a successful invite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Group password, echoed for re-validation.
    pub password: Password,
    /// Peer's nickname.
    pub nick: Vec<u8>,
    /// Peer's presence status.
    pub status: StatusKind,
    /// Peer's claimed role (advisory; roles are computed from the signed
    /// artifacts, never trusted from here).
    pub role: Role,
}

impl PeerInfo {
    /// Pack to wire bytes (fixed 164-byte layout).
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MAX_PASSWORD_SIZE + 2 + MAX_NICK_SIZE + 2);
        out.put_slice(self.password.padded());
        out.put_u16(self.nick.len() as u16);
        let mut nick_buf = [0u8; MAX_NICK_SIZE];
        nick_buf[..self.nick.len().min(MAX_NICK_SIZE)]
            .copy_from_slice(&self.nick[..self.nick.len().min(MAX_NICK_SIZE)]);
        out.put_slice(&nick_buf);
        out.put_u8(self.status.to_u8());
        out.put_u8(self.role.to_u8());
        out
    }

    /// Unpack from wire bytes.
    ///
    /// # Errors
    ///
    /// - `CodecError::Malformed` on truncation, oversized nick, or unknown
    ///   status/role bytes
    pub fn unpack(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(bytes);
        let padded: [u8; MAX_PASSWORD_SIZE] = r.array()?;
        let nick_len = r.u16()? as usize;
        if nick_len > MAX_NICK_SIZE {
            return Err(CodecError::Malformed("nick too long"));
        }
        let nick_buf: [u8; MAX_NICK_SIZE] = r.array()?;
        let status =
            StatusKind::from_u8(r.u8()?).ok_or(CodecError::Malformed("unknown status"))?;
        let role = Role::from_u8(r.u8()?).ok_or(CodecError::Malformed("unknown role"))?;
        r.finish()?;

        let len = padded.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        Ok(Self {
            password: Password { len: len as u16, bytes: padded },
            nick: nick_buf[..nick_len].to_vec(),
            status,
            role,
        })
    }
}

/// Request for out-of-date artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncRequest {
    /// Which artifacts the sender is behind on.
    pub flags: SyncFlags,
    /// Group password, re-validated before answering.
    pub password: Password,
}

impl SyncRequest {
    /// Pack to wire bytes.
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + MAX_PASSWORD_SIZE);
        out.put_u16(self.flags.bits());
        out.put_slice(self.password.padded());
        out
    }

    /// Unpack from wire bytes.
    ///
    /// # Errors
    ///
    /// - `CodecError::Malformed` on truncation
    pub fn unpack(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(bytes);
        let flags = SyncFlags::from_bits(r.u16()?);
        let padded: [u8; MAX_PASSWORD_SIZE] = r.array()?;
        r.finish()?;

        let len = padded.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        Ok(Self { flags, password: Password { len: len as u16, bytes: padded } })
    }
}

/// A packed peer announce, one per `SYNC_RESPONSE` frame.
///
/// Carries everything needed to initiate a handshake with a peer the
/// requester does not yet know. This is the single canonical announce type;
/// the legacy announce form was retired (see DESIGN.md).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAnnounce {
    /// The peer's permanent extended public key.
    pub public_key: ExtPublicKey,
    /// Direct UDP address, if known.
    pub addr: Option<WireAddr>,
    /// TCP relays the peer is reachable through.
    pub relays: Vec<RelayNode>,
}

impl PeerAnnounce {
    /// Pack to wire bytes.
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + 24 + MAX_ANNOUNCED_RELAYS * 56);
        out.put_slice(&self.public_key.to_bytes());
        WireAddr::pack_opt(self.addr.as_ref(), &mut out);
        pack_relays(&self.relays, &mut out);
        out
    }

    /// Unpack from wire bytes.
    ///
    /// # Errors
    ///
    /// - `CodecError::Malformed` on truncation or relay overflow
    pub fn unpack(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(bytes);
        let public_key = ExtPublicKey::from_bytes(&r.array()?);
        let addr = WireAddr::unpack_opt(&mut r)?;
        let relays = unpack_relays(&mut r)?;
        r.finish()?;
        Ok(Self { public_key, addr, relays })
    }
}

/// Packed relay list, shared when a peer learns new relays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpRelays {
    /// The sender's connected relays.
    pub relays: Vec<RelayNode>,
}

impl TcpRelays {
    /// Pack to wire bytes.
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::new();
        pack_relays(&self.relays, &mut out);
        out
    }

    /// Unpack from wire bytes.
    ///
    /// # Errors
    ///
    /// - `CodecError::Malformed` on truncation or relay overflow
    pub fn unpack(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(bytes);
        let relays = unpack_relays(&mut r)?;
        r.finish()?;
        Ok(Self { relays })
    }
}

/// Signed, versioned topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicInfo {
    /// Monotonic version.
    pub version: u32,
    /// Topic bytes (≤ 512).
    pub topic: Vec<u8>,
    /// Public signature key of the setter.
    pub setter: SigPublicKey,
    /// Setter's signature over [`TopicInfo::signed_bytes`].
    pub signature: Signature,
}

impl TopicInfo {
    /// The canonical byte string the signature covers.
    pub fn signed_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + 2 + self.topic.len() + 32);
        out.put_u32(self.version);
        out.put_u16(self.topic.len() as u16);
        out.put_slice(&self.topic);
        out.put_slice(self.setter.as_bytes());
        out
    }

    /// Pack to wire bytes.
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + 4 + 2 + self.topic.len() + 32);
        out.put_slice(self.signature.as_bytes());
        out.put_u32(self.version);
        out.put_u16(self.topic.len() as u16);
        out.put_slice(&self.topic);
        out.put_slice(self.setter.as_bytes());
        out
    }

    /// Unpack from wire bytes.
    ///
    /// # Errors
    ///
    /// - `CodecError::Malformed` on truncation or oversized topic
    pub fn unpack(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(bytes);
        let signature = Signature::from_bytes(r.array()?);
        let version = r.u32()?;
        let len = r.u16()? as usize;
        if len > MAX_TOPIC_SIZE {
            return Err(CodecError::Malformed("topic too long"));
        }
        let topic = r.take(len)?.to_vec();
        let setter = SigPublicKey::from_bytes(r.array()?);
        r.finish()?;
        Ok(Self { version, topic, setter, signature })
    }
}

/// Founder-signed group-wide state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedState {
    /// Monotonic version.
    pub version: u32,
    /// Founder's extended public key.
    pub founder: ExtPublicKey,
    /// Maximum confirmed peers.
    pub peer_limit: u32,
    /// Group name (immutable after creation, ≤ 48 bytes).
    pub name: Vec<u8>,
    /// Public or private.
    pub privacy: PrivacyState,
    /// Group password.
    pub password: Password,
    /// When set, only moderators and the founder may change the topic.
    pub topic_lock: bool,
    /// SHA-256 of the packed moderator list.
    pub mod_list_hash: [u8; SHA256_SIZE],
    /// Group-key signature over [`SharedState::signed_bytes`].
    pub signature: Signature,
}

impl SharedState {
    /// The canonical byte string the signature covers: every field above in
    /// declaration order, name zero-padded to its maximum so the encoding
    /// is a fixed 190 bytes.
    pub fn signed_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(190);
        out.put_u32(self.version);
        out.put_slice(&self.founder.to_bytes());
        out.put_u32(self.peer_limit);
        out.put_u16(self.name.len() as u16);
        let mut name_buf = [0u8; MAX_GROUP_NAME_SIZE];
        name_buf[..self.name.len().min(MAX_GROUP_NAME_SIZE)]
            .copy_from_slice(&self.name[..self.name.len().min(MAX_GROUP_NAME_SIZE)]);
        out.put_slice(&name_buf);
        out.put_u8(self.privacy as u8);
        self.password.pack_with_len(&mut out);
        out.put_u8(u8::from(self.topic_lock));
        out.put_slice(&self.mod_list_hash);
        out
    }

    /// Pack to wire bytes: canonical fields followed by the signature.
    pub fn pack(&self) -> Vec<u8> {
        let mut out = self.signed_bytes();
        out.put_slice(self.signature.as_bytes());
        out
    }

    /// Unpack from wire bytes.
    ///
    /// # Errors
    ///
    /// - `CodecError::Malformed` on truncation or out-of-range fields
    pub fn unpack(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(bytes);
        let version = r.u32()?;
        let founder = ExtPublicKey::from_bytes(&r.array()?);
        let peer_limit = r.u32()?;
        let name_len = r.u16()? as usize;
        if name_len > MAX_GROUP_NAME_SIZE {
            return Err(CodecError::Malformed("group name too long"));
        }
        let name_buf: [u8; MAX_GROUP_NAME_SIZE] = r.array()?;
        let privacy = PrivacyState::from_u8(r.u8()?)
            .ok_or(CodecError::Malformed("unknown privacy state"))?;
        let password = Password::unpack_with_len(&mut r)?;
        let topic_lock = match r.u8()? {
            0 => false,
            1 => true,
            _ => return Err(CodecError::Malformed("invalid topic lock flag")),
        };
        let mod_list_hash: [u8; SHA256_SIZE] = r.array()?;
        let signature = Signature::from_bytes(r.array()?);
        r.finish()?;

        Ok(Self {
            version,
            founder,
            peer_limit,
            name: name_buf[..name_len].to_vec(),
            privacy,
            password,
            topic_lock,
            mod_list_hash,
            signature,
        })
    }
}

/// The moderator list: ordered public signature keys.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ModList {
    /// Moderator signature keys, in promotion order.
    pub mods: Vec<SigPublicKey>,
}

impl ModList {
    /// Pack to wire bytes.
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.mods.len() * 32);
        out.put_u16(self.mods.len() as u16);
        for key in &self.mods {
            out.put_slice(key.as_bytes());
        }
        out
    }

    /// Unpack from wire bytes.
    ///
    /// # Errors
    ///
    /// - `CodecError::Malformed` on truncation or too many entries
    pub fn unpack(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(bytes);
        let count = r.u16()? as usize;
        if count > MAX_MODERATORS {
            return Err(CodecError::Malformed("too many moderators"));
        }
        let mods = (0..count)
            .map(|_| Ok(SigPublicKey::from_bytes(r.array()?)))
            .collect::<Result<Vec<_>, CodecError>>()?;
        r.finish()?;
        Ok(Self { mods })
    }

    /// SHA-256 over the packed entries (no count prefix). The empty list
    /// hashes to all zeroes, matching a freshly created group's shared
    /// state.
    pub fn hash(&self) -> [u8; SHA256_SIZE] {
        if self.mods.is_empty() {
            return [0u8; SHA256_SIZE];
        }
        let mut packed = Vec::with_capacity(self.mods.len() * 32);
        for key in &self.mods {
            packed.extend_from_slice(key.as_bytes());
        }
        sha256(&packed)
    }
}

/// Sanction type byte. Only observer sanctions exist today.
pub const SANCTION_OBSERVER: u8 = 0x00;

/// One signed sanctions entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sanction {
    /// Sanction type ([`SANCTION_OBSERVER`]).
    pub kind: u8,
    /// Signature key of the moderator or founder who set it.
    pub setter: SigPublicKey,
    /// Unix timestamp (seconds) when the sanction was made.
    pub timestamp: u64,
    /// Encryption key of the sanctioned peer.
    pub target: EncPublicKey,
    /// Setter's signature over [`Sanction::signed_bytes`].
    pub signature: Signature,
}

/// Packed size of one sanction entry.
pub const SANCTION_SIZE: usize = 1 + 32 + 8 + 32 + 64;

impl Sanction {
    /// The canonical byte string the signature covers.
    pub fn signed_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 32 + 8 + 32);
        out.put_u8(self.kind);
        out.put_slice(self.setter.as_bytes());
        out.put_u64(self.timestamp);
        out.put_slice(self.target.as_bytes());
        out
    }

    fn pack_into(&self, out: &mut Vec<u8>) {
        out.put_u8(self.kind);
        out.put_slice(self.setter.as_bytes());
        out.put_u64(self.timestamp);
        out.put_slice(self.target.as_bytes());
        out.put_slice(self.signature.as_bytes());
    }

    fn unpack(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let kind = r.u8()?;
        if kind != SANCTION_OBSERVER {
            return Err(CodecError::Malformed("unknown sanction type"));
        }
        Ok(Self {
            kind,
            setter: SigPublicKey::from_bytes(r.array()?),
            timestamp: r.u64()?,
            target: EncPublicKey::from_bytes(r.array()?),
            signature: Signature::from_bytes(r.array()?),
        })
    }
}

/// Credentials versioning the sanctions list as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SanctionsCreds {
    /// Monotonic version.
    pub version: u32,
    /// `sha256(packed entries ‖ version)`.
    pub hash: [u8; SHA256_SIZE],
    /// Signature key of the last modifier.
    pub sig_pk: SigPublicKey,
    /// Modifier's signature over `version ‖ hash`.
    pub signature: Signature,
}

/// Packed size of the sanctions credentials.
pub const SANCTIONS_CREDS_SIZE: usize = 4 + SHA256_SIZE + 32 + 64;

impl SanctionsCreds {
    /// The canonical byte string the signature covers.
    pub fn signed_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + SHA256_SIZE);
        out.put_u32(self.version);
        out.put_slice(&self.hash);
        out
    }

    /// Pack to wire bytes (132 bytes).
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SANCTIONS_CREDS_SIZE);
        out.put_u32(self.version);
        out.put_slice(&self.hash);
        out.put_slice(self.sig_pk.as_bytes());
        out.put_slice(self.signature.as_bytes());
        out
    }

    fn unpack(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            version: r.u32()?,
            hash: r.array()?,
            sig_pk: SigPublicKey::from_bytes(r.array()?),
            signature: Signature::from_bytes(r.array()?),
        })
    }

    /// Unpack from standalone wire bytes.
    ///
    /// # Errors
    ///
    /// - `CodecError::Malformed` on truncation
    pub fn unpack_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(bytes);
        let creds = Self::unpack(&mut r)?;
        r.finish()?;
        Ok(creds)
    }
}

/// The sanctions list with its credentials, as replicated in full.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanctionsList {
    /// All current sanctions.
    pub sanctions: Vec<Sanction>,
    /// Credentials covering the entries.
    pub creds: SanctionsCreds,
}

impl SanctionsList {
    /// Pack to wire bytes.
    pub fn pack(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(2 + self.sanctions.len() * SANCTION_SIZE + SANCTIONS_CREDS_SIZE);
        out.put_u16(self.sanctions.len() as u16);
        for sanction in &self.sanctions {
            sanction.pack_into(&mut out);
        }
        out.put_slice(&self.creds.pack());
        out
    }

    /// Unpack from wire bytes.
    ///
    /// # Errors
    ///
    /// - `CodecError::Malformed` on truncation or too many entries
    pub fn unpack(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(bytes);
        let count = r.u16()? as usize;
        if count > MAX_SANCTIONS {
            return Err(CodecError::Malformed("too many sanctions"));
        }
        let sanctions =
            (0..count).map(|_| Sanction::unpack(&mut r)).collect::<Result<Vec<_>, _>>()?;
        let creds = SanctionsCreds::unpack(&mut r)?;
        r.finish()?;
        Ok(Self { sanctions, creds })
    }
}

/// Broadcast envelope: subtype, send timestamp, opaque data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Broadcast {
    /// Subtype selecting the data interpretation.
    pub kind: BroadcastKind,
    /// Sender's wall-clock timestamp (seconds).
    pub timestamp: u64,
    /// Subtype-specific data.
    pub data: Vec<u8>,
}

impl Broadcast {
    /// Pack to wire bytes.
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(9 + self.data.len());
        out.put_u8(self.kind.to_u8());
        out.put_u64(self.timestamp);
        out.put_slice(&self.data);
        out
    }

    /// Unpack from wire bytes.
    ///
    /// # Errors
    ///
    /// - `CodecError::Malformed` on truncation or unknown subtype
    pub fn unpack(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(bytes);
        let kind = BroadcastKind::from_u8(r.u8()?)
            .ok_or(CodecError::Malformed("unknown broadcast kind"))?;
        let timestamp = r.u64()?;
        let data = r.take(bytes.len() - 9)?.to_vec();
        Ok(Self { kind, timestamp, data })
    }
}

/// `SET_MOD` broadcast data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetMod {
    /// True to promote, false to demote.
    pub promote: bool,
    /// The affected peer's signature key.
    pub target: SigPublicKey,
}

impl SetMod {
    /// Pack to wire bytes.
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(33);
        out.put_u8(u8::from(self.promote));
        out.put_slice(self.target.as_bytes());
        out
    }

    /// Unpack from wire bytes.
    ///
    /// # Errors
    ///
    /// - `CodecError::Malformed` on truncation or invalid flag
    pub fn unpack(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(bytes);
        let promote = match r.u8()? {
            0 => false,
            1 => true,
            _ => return Err(CodecError::Malformed("invalid set-mod flag")),
        };
        let target = SigPublicKey::from_bytes(r.array()?);
        r.finish()?;
        Ok(Self { promote, target })
    }
}

/// `SET_OBSERVER` broadcast data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetObserver {
    /// True to sanction, false to lift.
    pub set: bool,
    /// The affected peer's encryption key.
    pub target_enc: EncPublicKey,
    /// The affected peer's signature key.
    pub target_sig: SigPublicKey,
    /// The new sanction entry (present when setting).
    pub sanction: Option<Sanction>,
    /// Updated credentials, always present.
    pub creds: SanctionsCreds,
}

impl SetObserver {
    /// Pack to wire bytes.
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 64 + SANCTION_SIZE + SANCTIONS_CREDS_SIZE);
        out.put_u8(u8::from(self.set));
        out.put_slice(self.target_enc.as_bytes());
        out.put_slice(self.target_sig.as_bytes());
        if let Some(sanction) = &self.sanction {
            sanction.pack_into(&mut out);
        }
        out.put_slice(&self.creds.pack());
        out
    }

    /// Unpack from wire bytes.
    ///
    /// # Errors
    ///
    /// - `CodecError::Malformed` on truncation, invalid flag, or a set
    ///   operation missing its sanction entry
    pub fn unpack(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(bytes);
        let set = match r.u8()? {
            0 => false,
            1 => true,
            _ => return Err(CodecError::Malformed("invalid set-observer flag")),
        };
        let target_enc = EncPublicKey::from_bytes(r.array()?);
        let target_sig = SigPublicKey::from_bytes(r.array()?);
        let sanction = if set { Some(Sanction::unpack(&mut r)?) } else { None };
        let creds = SanctionsCreds::unpack(&mut r)?;
        r.finish()?;
        Ok(Self { set, target_enc, target_sig, sanction, creds })
    }
}

/// `KICK_PEER` broadcast data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KickPeer {
    /// The kicked peer's encryption key.
    pub target: EncPublicKey,
}

impl KickPeer {
    /// Pack to wire bytes.
    pub fn pack(&self) -> Vec<u8> {
        self.target.as_bytes().to_vec()
    }

    /// Unpack from wire bytes.
    ///
    /// # Errors
    ///
    /// - `CodecError::Malformed` on truncation
    pub fn unpack(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(bytes);
        let target = EncPublicKey::from_bytes(r.array()?);
        r.finish()?;
        Ok(Self { target })
    }
}

/// Friend-invite flow stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FriendInviteKind {
    /// Invite issued.
    Invite = 0,
    /// Invite accepted by the joiner.
    Accepted = 1,
    /// Acceptance confirmed by the inviter.
    Confirmation = 2,
}

/// `FRIEND_INVITE` lossless packet data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FriendInvite {
    /// Flow stage.
    pub kind: FriendInviteKind,
}

impl FriendInvite {
    /// Pack to wire bytes.
    pub fn pack(&self) -> Vec<u8> {
        vec![self.kind as u8]
    }

    /// Unpack from wire bytes.
    ///
    /// # Errors
    ///
    /// - `CodecError::Malformed` on truncation or unknown stage
    pub fn unpack(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(bytes);
        let kind = match r.u8()? {
            0 => FriendInviteKind::Invite,
            1 => FriendInviteKind::Accepted,
            2 => FriendInviteKind::Confirmation,
            _ => return Err(CodecError::Malformed("unknown friend invite kind")),
        };
        r.finish()?;
        Ok(Self { kind })
    }
}

/// Out-of-band invite cookie handed to a friend.
///
/// Never travels inside group frames; the surrounding application delivers
/// it over the friend channel, and `accept_invite` consumes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InviteCookie {
    /// The group being joined.
    pub chat_id: ChatId,
    /// The inviter's extended public key.
    pub inviter: ExtPublicKey,
    /// The inviter's direct address, if known.
    pub addr: Option<WireAddr>,
    /// Relays the inviter is reachable through.
    pub relays: Vec<RelayNode>,
}

impl InviteCookie {
    /// Pack to cookie bytes.
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + 64 + 24);
        out.put_slice(self.chat_id.as_bytes());
        out.put_slice(&self.inviter.to_bytes());
        WireAddr::pack_opt(self.addr.as_ref(), &mut out);
        pack_relays(&self.relays, &mut out);
        out
    }

    /// Unpack from cookie bytes.
    ///
    /// # Errors
    ///
    /// - `CodecError::Malformed` on truncation
    pub fn unpack(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(bytes);
        let chat_id = ChatId::from_bytes(r.array()?);
        let inviter = ExtPublicKey::from_bytes(&r.array()?);
        let addr = WireAddr::unpack_opt(&mut r)?;
        let relays = unpack_relays(&mut r)?;
        r.finish()?;
        Ok(Self { chat_id, inviter, addr, relays })
    }
}

#[cfg(test)]
mod tests {
    use conclave_crypto::ExtKeyPair;

    use super::*;

    fn sig_pk(seed: u8) -> SigPublicKey {
        ExtKeyPair::from_entropy(&[seed; 64]).sig.public()
    }

    fn enc_pk(seed: u8) -> EncPublicKey {
        ExtKeyPair::from_entropy(&[seed; 64]).enc.public()
    }

    #[test]
    fn ping_round_trip_with_and_without_addr() {
        let base = Ping {
            peer_list_checksum: 0xbeef,
            confirmed_peer_count: 3,
            shared_state_version: 7,
            sanctions_version: 2,
            topic_version: 9,
            self_addr: None,
        };
        assert_eq!(Ping::unpack(&base.pack()).unwrap(), base);

        let with_addr = Ping {
            self_addr: Some(WireAddr { ip: "203.0.113.9".parse().unwrap(), port: 33445 }),
            ..base
        };
        assert_eq!(Ping::unpack(&with_addr.pack()).unwrap(), with_addr);
    }

    #[test]
    fn handshake_round_trip() {
        let hs = Handshake {
            kind: HandshakeKind::Request,
            session_pk: enc_pk(3),
            sig_pk: sig_pk(4),
            join: JoinKind::Public,
        };
        assert_eq!(Handshake::unpack(&hs.pack()).unwrap(), hs);
        assert_ne!(hs.pack()[0], 0, "first byte must survive padding skip");
    }

    #[test]
    fn invite_request_recovers_password_length() {
        let req = InviteRequest {
            name: b"Utah Data Center".to_vec(),
            password: Password::new(b"hunter2").unwrap(),
        };
        let parsed = InviteRequest::unpack(&req.pack()).unwrap();
        assert_eq!(parsed.password.as_bytes(), b"hunter2");
        assert_eq!(parsed.name, req.name);
    }

    #[test]
    fn shared_state_round_trip_and_signed_bytes_are_stable() {
        let state = SharedState {
            version: 12,
            founder: ExtKeyPair::from_entropy(&[1; 64]).public(),
            peer_limit: 100,
            name: b"ops".to_vec(),
            privacy: PrivacyState::Private,
            password: Password::new(b"pw").unwrap(),
            topic_lock: true,
            mod_list_hash: [0xcd; SHA256_SIZE],
            signature: Signature::from_bytes([9; 64]),
        };

        let parsed = SharedState::unpack(&state.pack()).unwrap();
        assert_eq!(parsed, state);
        assert_eq!(parsed.signed_bytes(), state.signed_bytes());
        assert_eq!(state.signed_bytes().len(), 190);
    }

    #[test]
    fn mod_list_hash_covers_packed_entries() {
        let empty = ModList::default();
        assert_eq!(empty.hash(), [0u8; SHA256_SIZE]);

        let list = ModList { mods: vec![sig_pk(1), sig_pk(2)] };
        let mut packed = Vec::new();
        packed.extend_from_slice(list.mods[0].as_bytes());
        packed.extend_from_slice(list.mods[1].as_bytes());
        assert_eq!(list.hash(), sha256(&packed));

        assert_eq!(ModList::unpack(&list.pack()).unwrap(), list);
    }

    #[test]
    fn sanctions_list_round_trip() {
        let sanction = Sanction {
            kind: SANCTION_OBSERVER,
            setter: sig_pk(1),
            timestamp: 1_700_000_000,
            target: enc_pk(2),
            signature: Signature::from_bytes([3; 64]),
        };
        let creds = SanctionsCreds {
            version: 4,
            hash: [5; SHA256_SIZE],
            sig_pk: sig_pk(1),
            signature: Signature::from_bytes([6; 64]),
        };
        let list = SanctionsList { sanctions: vec![sanction], creds };
        assert_eq!(SanctionsList::unpack(&list.pack()).unwrap(), list);
        assert_eq!(creds.pack().len(), SANCTIONS_CREDS_SIZE);
    }

    #[test]
    fn set_observer_round_trip_both_directions() {
        let creds = SanctionsCreds {
            version: 1,
            hash: [0; SHA256_SIZE],
            sig_pk: sig_pk(1),
            signature: Signature::from_bytes([1; 64]),
        };

        let lift = SetObserver {
            set: false,
            target_enc: enc_pk(2),
            target_sig: sig_pk(2),
            sanction: None,
            creds,
        };
        assert_eq!(SetObserver::unpack(&lift.pack()).unwrap(), lift);

        let set = SetObserver {
            set: true,
            sanction: Some(Sanction {
                kind: SANCTION_OBSERVER,
                setter: sig_pk(1),
                timestamp: 99,
                target: enc_pk(2),
                signature: Signature::from_bytes([2; 64]),
            }),
            ..lift
        };
        assert_eq!(SetObserver::unpack(&set.pack()).unwrap(), set);
    }

    #[test]
    fn topic_round_trip() {
        let topic = TopicInfo {
            version: 3,
            topic: b"winter maintenance".to_vec(),
            setter: sig_pk(7),
            signature: Signature::from_bytes([0xaa; 64]),
        };
        assert_eq!(TopicInfo::unpack(&topic.pack()).unwrap(), topic);
    }

    #[test]
    fn peer_announce_round_trip() {
        let announce = PeerAnnounce {
            public_key: ExtKeyPair::from_entropy(&[8; 64]).public(),
            addr: Some(WireAddr { ip: "2001:db8::1".parse().unwrap(), port: 443 }),
            relays: vec![RelayNode {
                public_key: enc_pk(9),
                addr: WireAddr { ip: "198.51.100.4".parse().unwrap(), port: 3389 },
            }],
        };
        assert_eq!(PeerAnnounce::unpack(&announce.pack()).unwrap(), announce);
    }

    #[test]
    fn invite_cookie_round_trip() {
        let cookie = InviteCookie {
            chat_id: ChatId::from_bytes([0x11; 32]),
            inviter: ExtKeyPair::from_entropy(&[5; 64]).public(),
            addr: None,
            relays: vec![],
        };
        assert_eq!(InviteCookie::unpack(&cookie.pack()).unwrap(), cookie);
    }

    #[test]
    fn truncated_payloads_are_rejected() {
        let ack = MessageAck { message_id: 1, kind: AckKind::Received };
        let packed = ack.pack();
        assert!(MessageAck::unpack(&packed[..packed.len() - 1]).is_err());

        assert!(SharedState::unpack(&[0u8; 10]).is_err());
        assert!(TopicInfo::unpack(&[0u8; 63]).is_err());
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut packed = InviteReject { reason: RejectReason::GroupFull }.pack();
        packed.push(0);
        assert!(InviteReject::unpack(&packed).is_err());
    }
}
