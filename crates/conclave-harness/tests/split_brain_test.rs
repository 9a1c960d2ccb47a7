//! Partition and reconvergence.

use std::time::Duration;

use conclave_core::{PrivacyState, Role};
use conclave_harness::Sim;

#[test]
fn partition_heals_to_identical_state() {
    conclave_harness::init_tracing();
    let mut sim = Sim::new(0x5b11);
    let a = sim.add_peer(); // founder
    let b = sim.add_peer();
    let c = sim.add_peer();

    let ga = sim.create_group(a, PrivacyState::Public, b"redundant", b"alice");
    let gb = sim.join_group(b, a, ga, b"", b"bob");
    sim.settle_pair(a, ga, b, gb, Duration::from_secs(10));
    let gc = sim.join_group(c, a, ga, b"", b"cleo");
    sim.settle_pair(a, ga, c, gc, Duration::from_secs(10));

    // Close the mesh (B and C discover each other through sync).
    sim.run(Duration::from_secs(30));
    assert_eq!(sim.engine(a).confirmed_peers(ga).len(), 2);
    assert_eq!(sim.engine(b).confirmed_peers(gb).len(), 2);
    assert_eq!(sim.engine(c).confirmed_peers(gc).len(), 2);

    // Split: A alone on one side, B and C on the other.
    sim.partition(&[a], &[b, c]);

    // The founder keeps governing its side of the split.
    sim.engine(a).set_peer_limit(ga, 50).unwrap();
    sim.engine(a).set_topic(ga, b"after the flood").unwrap();

    // Longer than the confirmed-peer timeout: both sides give up on the
    // unreachable peers.
    sim.run(Duration::from_secs(90));

    assert!(sim.engine(a).confirmed_peers(ga).is_empty(), "A lost both peers");
    assert_eq!(sim.engine(b).confirmed_peers(gb).len(), 1, "B still sees C");
    assert_eq!(sim.engine(c).confirmed_peers(gc).len(), 1, "C still sees B");

    // B and C never saw the founder's updates.
    assert_ne!(
        sim.engine(b).shared_state_version(gb),
        sim.engine(a).shared_state_version(ga)
    );

    // Heal. A redials from its saved addresses; pings disagree; sync
    // requests fire; everyone converges.
    sim.heal();
    sim.run(Duration::from_secs(60));

    let version = sim.engine(a).shared_state_version(ga).unwrap();
    assert_eq!(sim.engine(b).shared_state_version(gb), Some(version));
    assert_eq!(sim.engine(c).shared_state_version(gc), Some(version));

    assert_eq!(sim.engine(b).peer_limit(gb), Some(50));
    assert_eq!(sim.engine(c).peer_limit(gc), Some(50));

    assert_eq!(sim.engine(b).topic(gb).unwrap(), b"after the flood");
    assert_eq!(sim.engine(c).topic(gc).unwrap(), b"after the flood");

    let checksum = sim.engine(a).peer_list_checksum(ga).unwrap();
    assert_eq!(sim.engine(b).peer_list_checksum(gb), Some(checksum));
    assert_eq!(sim.engine(c).peer_list_checksum(gc), Some(checksum));

    assert_eq!(sim.engine(a).confirmed_peers(ga).len(), 2);
    assert_eq!(sim.engine(b).confirmed_peers(gb).len(), 2);
    assert_eq!(sim.engine(c).confirmed_peers(gc).len(), 2);
}

#[test]
fn moderation_state_survives_the_partition() {
    let mut sim = Sim::new(0x5b12);
    let a = sim.add_peer();
    let b = sim.add_peer();

    let ga = sim.create_group(a, PrivacyState::Public, b"mods", b"alice");
    let gb = sim.join_group(b, a, ga, b"", b"bob");
    sim.settle_pair(a, ga, b, gb, Duration::from_secs(10));

    // Partition, then promote B while it is unreachable.
    sim.partition(&[a], &[b]);
    let b_sig = sim.engine(b).self_sig_pk(gb).unwrap();
    let b_at_a = sim.engine(a).peer_by_sig_pk(ga, &b_sig).unwrap();
    sim.engine(a).set_role(ga, b_at_a, Role::Moderator).unwrap();

    sim.run(Duration::from_secs(90));
    assert_eq!(sim.engine(b).self_role(gb), Some(Role::User), "unreachable peer is unaware");

    sim.heal();
    sim.run(Duration::from_secs(60));

    // After the heal B has the founder-signed state and mod list.
    assert_eq!(sim.engine(b).self_role(gb), Some(Role::Moderator));
    assert_eq!(sim.engine(b).moderators(gb).unwrap(), vec![b_sig]);
}
