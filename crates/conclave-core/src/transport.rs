//! The boundary to the datagram layer.
//!
//! The DHT, onion announce, and TCP relay machinery live outside this
//! crate. All the engine needs is a way to push a datagram toward a peer
//! address; incoming datagrams are fed back by the embedder through
//! `GroupEngine::handle_packet`.

use thiserror::Error;

use conclave_proto::payloads::{RelayNode, WireAddr};

/// Where a peer can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PeerAddress {
    /// Direct UDP address, if known.
    pub ip_port: Option<WireAddr>,
    /// TCP relays the peer is reachable through.
    pub relays: Vec<RelayNode>,
}

impl PeerAddress {
    /// Address consisting of a single direct endpoint.
    pub fn direct(addr: WireAddr) -> Self {
        Self { ip_port: Some(addr), relays: Vec::new() }
    }

    /// True if no route to the peer is known.
    pub fn is_empty(&self) -> bool {
        self.ip_port.is_none() && self.relays.is_empty()
    }

    /// Merge newly learned routing information, preferring fresh data.
    pub fn merge(&mut self, other: &PeerAddress) {
        if other.ip_port.is_some() {
            self.ip_port = other.ip_port;
        }
        for relay in &other.relays {
            if !self.relays.contains(relay) {
                self.relays.push(*relay);
            }
        }
        self.relays.truncate(conclave_proto::MAX_ANNOUNCED_RELAYS);
    }
}

/// Errors surfaced by a transport implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No usable route to the peer.
    #[error("no route to peer")]
    NoRoute,

    /// The transport's outgoing queue is full.
    #[error("send queue full")]
    QueueFull,

    /// Underlying I/O failure.
    #[error("transport I/O error: {0}")]
    Io(String),
}

/// Best-effort datagram sender.
///
/// Implementations decide how to route: direct UDP when an address is
/// known, a TCP relay otherwise. Sends are fire-and-forget; reliability is
/// the lossless channel's job, not the transport's.
pub trait Transport {
    /// Send one datagram toward `to`.
    ///
    /// # Errors
    ///
    /// - `TransportError` on routing or I/O failure. The engine logs and
    ///   moves on; retransmission logic recovers lost packets.
    fn send(&mut self, to: &PeerAddress, datagram: &[u8]) -> Result<(), TransportError>;
}
