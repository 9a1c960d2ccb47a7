//! Cluster driver: several engines stepped through virtual time together.

use std::time::Duration;

use conclave_core::{GroupEngine, GroupEvent, GroupId, PrivacyState};
use conclave_proto::payloads::WireAddr;

use crate::{sim_env::SimEnv, sim_net::{SimNet, SimTransport}};

/// Default engine tick, matching the production loop cadence.
pub const TICK: Duration = Duration::from_millis(40);

/// One simulated peer: an engine bound to an address.
pub struct SimPeer {
    /// The engine under test.
    pub engine: GroupEngine<SimEnv, SimTransport>,
    /// The peer's network address.
    pub addr: WireAddr,
}

/// A deterministic cluster of peers.
pub struct Sim {
    /// The shared environment (clock + RNG).
    pub env: SimEnv,
    /// The shared network fabric.
    pub net: SimNet,
    peers: Vec<SimPeer>,
}

impl Sim {
    /// Cluster seeded for a reproducible run.
    pub fn new(seed: u64) -> Self {
        Self { env: SimEnv::with_seed(seed), net: SimNet::new(seed), peers: Vec::new() }
    }

    /// Add a peer; returns its index.
    pub fn add_peer(&mut self) -> usize {
        let index = self.peers.len();
        let addr = WireAddr {
            ip: std::net::IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, index as u8 + 1)),
            port: 33445,
        };
        let engine = GroupEngine::new(self.env.clone(), self.net.endpoint(addr));
        self.peers.push(SimPeer { engine, addr });
        index
    }

    /// A peer's engine.
    pub fn engine(&mut self, index: usize) -> &mut GroupEngine<SimEnv, SimTransport> {
        &mut self.peers[index].engine
    }

    /// A peer's address.
    pub fn addr(&self, index: usize) -> WireAddr {
        self.peers[index].addr
    }

    /// Deliver queued datagrams until the network goes quiet.
    ///
    /// Handling a datagram can send more; the inner loop is capped so a
    /// protocol bug cannot hang the test.
    pub fn deliver(&mut self) {
        for _ in 0..64 {
            let batch = self.net.drain();
            if batch.is_empty() {
                return;
            }
            for datagram in batch {
                if let Some(peer) = self.peers.iter_mut().find(|p| p.addr == datagram.to) {
                    peer.engine.handle_packet(&datagram.bytes, Some(datagram.from));
                }
            }
        }
        panic!("network did not quiesce; packet storm?");
    }

    /// Advance the clock one step, tick every engine, deliver traffic.
    pub fn step(&mut self, duration: Duration) {
        self.env.advance(duration);
        for peer in &mut self.peers {
            peer.engine.iterate();
        }
        self.deliver();
    }

    /// Run for `total` virtual time in [`TICK`]-sized steps.
    pub fn run(&mut self, total: Duration) {
        let mut elapsed = Duration::ZERO;
        while elapsed < total {
            self.step(TICK);
            elapsed += TICK;
        }
    }

    /// Drain every pending event from one peer.
    pub fn drain_events(&mut self, index: usize) -> Vec<GroupEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.peers[index].engine.poll_event() {
            events.push(event);
        }
        events
    }

    /// Partition the cluster: no traffic between `left` and `right`.
    pub fn partition(&mut self, left: &[usize], right: &[usize]) {
        for &a in left {
            for &b in right {
                self.net.block(self.peers[a].addr, self.peers[b].addr);
            }
        }
    }

    /// Remove all partitions.
    pub fn heal(&mut self) {
        self.net.heal();
    }

    // ------------------------------------------------------------------
    // Scenario helpers
    // ------------------------------------------------------------------

    /// Create a group on one peer and register its address.
    pub fn create_group(
        &mut self,
        index: usize,
        privacy: PrivacyState,
        name: &[u8],
        nick: &[u8],
    ) -> GroupId {
        let addr = self.addr(index);
        let engine = self.engine(index);
        let group_id = engine.create_group(privacy, name, nick).expect("create_group");
        engine.set_self_addr(group_id, addr).expect("set_self_addr");
        group_id
    }

    /// Join `host`'s group from `joiner` via chat-id lookup, seeding the
    /// joiner with the host's announce (what the DHT layer would return).
    pub fn join_group(
        &mut self,
        joiner: usize,
        host: usize,
        host_group: GroupId,
        password: &[u8],
        nick: &[u8],
    ) -> GroupId {
        let chat_id = self.peers[host].engine.chat_id(host_group).expect("host group");
        let announce = self.peers[host].engine.self_announce(host_group).expect("host announce");

        let addr = self.addr(joiner);
        let engine = self.engine(joiner);
        let group_id = engine.join_by_chat_id(chat_id, password, nick).expect("join_by_chat_id");
        engine.set_self_addr(group_id, addr).expect("set_self_addr");
        engine.add_peer_announce(group_id, announce).expect("add_peer_announce");
        group_id
    }

    /// Run until the two peers see each other confirmed (or panic after
    /// `timeout` of virtual time).
    pub fn settle_pair(&mut self, a: usize, ga: GroupId, b: usize, gb: GroupId, timeout: Duration) {
        let mut elapsed = Duration::ZERO;
        while elapsed < timeout {
            self.step(TICK);
            elapsed += TICK;

            let a_sees = !self.peers[a].engine.confirmed_peers(ga).is_empty();
            let b_sees = !self.peers[b].engine.confirmed_peers(gb).is_empty();
            if a_sees && b_sees {
                return;
            }
        }
        panic!("peers failed to confirm each other within {timeout:?}");
    }
}
