//! Conclave core: the decentralized group-chat engine.
//!
//! A group is a self-governing mesh of peers identified only by keys.
//! There is no server and no relay authority: the founder's signature is
//! the only root of trust. This crate implements the engine that holds a
//! group together:
//!
//! - the per-pair link state machine (handshake, session keys, timeouts)
//! - reliable ordered delivery over best-effort datagrams
//! - the founder-signed shared state, moderator list, sanctions list, and
//!   topic, all linearized by signed versions
//! - gossip-style convergence through ping version vectors and sync
//!   requests
//! - the role lattice (founder > moderator > user > observer) and its
//!   enforcement
//!
//! The engine is a pure state machine over an injected [`env::Environment`]
//! (time + randomness) and [`transport::Transport`] (datagram out). It runs
//! single-threaded: feed packets in, call `iterate` on a timer, drain
//! events. Engines never share mutable state; run one per thread if you
//! need more than one.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod engine;
pub mod env;
pub mod error;
pub mod event;
mod group;
pub mod link;
pub mod lossless;
pub mod moderation;
pub mod peer;
pub mod persist;
pub mod shared_state;
pub mod sync;
pub mod topic;
pub mod transport;

pub use engine::GroupEngine;
pub use env::{Environment, SystemEnv};
pub use event::{ExitReason, GroupEvent, GroupId, JoinFailReason, MessageKind, ModEvent};
pub use peer::PeerId;
pub use persist::SavedGroup;
pub use transport::{PeerAddress, Transport, TransportError};

pub use conclave_proto::{PrivacyState, Role, StatusKind};
