//! In-memory datagram network with loss and partitions.

use std::{
    cell::RefCell,
    collections::{HashSet, VecDeque},
    rc::Rc,
};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

use conclave_core::{PeerAddress, Transport, TransportError};
use conclave_proto::payloads::WireAddr;

/// One datagram in flight.
#[derive(Debug, Clone)]
pub struct Datagram {
    /// Destination address.
    pub to: WireAddr,
    /// Source address.
    pub from: WireAddr,
    /// Frame bytes.
    pub bytes: Vec<u8>,
}

struct NetState {
    queue: VecDeque<Datagram>,
    blocked: HashSet<(WireAddr, WireAddr)>,
    loss_percent: u8,
    rng: ChaCha20Rng,
}

/// The shared network fabric. Cheap to clone; all clones are views of the
/// same queue.
#[derive(Clone)]
pub struct SimNet {
    state: Rc<RefCell<NetState>>,
}

impl SimNet {
    /// Network with its own loss RNG, independent of the crypto stream so
    /// changing the loss rate never shifts key material.
    pub fn new(seed: u64) -> Self {
        Self {
            state: Rc::new(RefCell::new(NetState {
                queue: VecDeque::new(),
                blocked: HashSet::new(),
                loss_percent: 0,
                rng: ChaCha20Rng::seed_from_u64(seed ^ 0x6e65_7477_6f72_6b00),
            })),
        }
    }

    /// A transport bound to one local address.
    pub fn endpoint(&self, addr: WireAddr) -> SimTransport {
        SimTransport { addr, state: Rc::clone(&self.state) }
    }

    /// Probability (percent) of silently dropping each datagram.
    pub fn set_loss(&self, percent: u8) {
        self.state.borrow_mut().loss_percent = percent.min(100);
    }

    /// Block traffic between two addresses, both directions.
    pub fn block(&self, a: WireAddr, b: WireAddr) {
        let mut state = self.state.borrow_mut();
        state.blocked.insert((a, b));
        state.blocked.insert((b, a));
    }

    /// Remove all partitions.
    pub fn heal(&self) {
        self.state.borrow_mut().blocked.clear();
    }

    /// Pull every queued datagram, applying loss and partitions.
    pub fn drain(&self) -> Vec<Datagram> {
        let mut state = self.state.borrow_mut();
        let mut delivered = Vec::with_capacity(state.queue.len());

        while let Some(datagram) = state.queue.pop_front() {
            if state.blocked.contains(&(datagram.from, datagram.to)) {
                continue;
            }
            let loss = state.loss_percent;
            if loss > 0 && state.rng.gen_range(0u8..100) < loss {
                continue;
            }
            delivered.push(datagram);
        }

        delivered
    }

    /// Number of queued datagrams (pre-filter).
    pub fn pending(&self) -> usize {
        self.state.borrow().queue.len()
    }
}

/// [`Transport`] implementation writing into the shared queue.
pub struct SimTransport {
    addr: WireAddr,
    state: Rc<RefCell<NetState>>,
}

impl Transport for SimTransport {
    fn send(&mut self, to: &PeerAddress, datagram: &[u8]) -> Result<(), TransportError> {
        let dest = to
            .ip_port
            .or_else(|| to.relays.first().map(|r| r.addr))
            .ok_or(TransportError::NoRoute)?;

        self.state.borrow_mut().queue.push_back(Datagram {
            to: dest,
            from: self.addr,
            bytes: datagram.to_vec(),
        });
        Ok(())
    }
}
