//! Deterministic simulation harness for Conclave protocol testing.
//!
//! Provides a virtual clock and seeded RNG (the `Environment`), an
//! in-memory lossy datagram network with partitions (the `Transport`),
//! and a cluster driver that steps any number of engines through
//! simulated time. Whole multi-peer scenarios replay byte-for-byte from a
//! seed: handshakes, key material, padding lengths, loss patterns, all of
//! it.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cluster;
pub mod sim_env;
pub mod sim_net;

pub use cluster::{Sim, SimPeer};
pub use sim_env::{SimEnv, SimInstant};
pub use sim_net::{Datagram, SimNet, SimTransport};

/// Install a stderr `tracing` subscriber honoring `RUST_LOG`.
///
/// Call at the top of a failing test to watch the protocol run. Safe to
/// call more than once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}
