//! Gossip convergence: the ping version vector and its comparison.
//!
//! Every confirmed link carries a periodic lossy ping with the sender's
//! artifact versions. The receiver compares componentwise and requests
//! whatever it is behind on. Checksum disagreement alone only triggers a
//! peer-list request when the other side knows at least as many peers,
//! which stops two partitions from endlessly requesting each other's
//! shrinking peer lists.

use conclave_proto::{SyncFlags, payloads::Ping};

/// Which artifacts `theirs` has newer than `ours`.
pub fn out_of_sync_flags(ours: &Ping, theirs: &Ping) -> SyncFlags {
    let mut flags = SyncFlags::default();

    if theirs.shared_state_version > ours.shared_state_version
        || theirs.sanctions_version > ours.sanctions_version
    {
        flags = flags.with_state();
    }

    if theirs.topic_version > ours.topic_version {
        flags = flags.with_topic();
    }

    if theirs.peer_list_checksum != ours.peer_list_checksum
        && theirs.confirmed_peer_count >= ours.confirmed_peer_count
    {
        flags = flags.with_peer_list();
    }

    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ping(checksum: u16, count: u16, state: u32, sanctions: u32, topic: u32) -> Ping {
        Ping {
            peer_list_checksum: checksum,
            confirmed_peer_count: count,
            shared_state_version: state,
            sanctions_version: sanctions,
            topic_version: topic,
            self_addr: None,
        }
    }

    #[test]
    fn identical_vectors_are_in_sync() {
        let p = ping(7, 2, 3, 1, 5);
        assert!(out_of_sync_flags(&p, &p).is_empty());
    }

    #[test]
    fn newer_state_or_sanctions_requests_state() {
        let ours = ping(7, 2, 3, 1, 5);
        assert!(out_of_sync_flags(&ours, &ping(7, 2, 4, 1, 5)).state());
        assert!(out_of_sync_flags(&ours, &ping(7, 2, 3, 2, 5)).state());
        // Being ahead ourselves requests nothing.
        assert!(out_of_sync_flags(&ours, &ping(7, 2, 2, 0, 5)).is_empty());
    }

    #[test]
    fn newer_topic_requests_topic() {
        let ours = ping(7, 2, 3, 1, 5);
        let flags = out_of_sync_flags(&ours, &ping(7, 2, 3, 1, 6));
        assert!(flags.topic() && !flags.state() && !flags.peer_list());
    }

    #[test]
    fn checksum_mismatch_defers_to_larger_side() {
        let ours = ping(7, 3, 1, 0, 0);

        // They know fewer peers: they should ask us, not vice versa.
        assert!(!out_of_sync_flags(&ours, &ping(9, 2, 1, 0, 0)).peer_list());

        // They know at least as many peers: we ask.
        assert!(out_of_sync_flags(&ours, &ping(9, 3, 1, 0, 0)).peer_list());
        assert!(out_of_sync_flags(&ours, &ping(9, 5, 1, 0, 0)).peer_list());
    }
}
