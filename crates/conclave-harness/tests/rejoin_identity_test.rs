//! Reconnecting preserves a peer's cryptographic identity and role.

use std::time::Duration;

use conclave_core::{GroupEvent, PrivacyState, Role};
use conclave_harness::Sim;

#[test]
fn rejoin_preserves_keys_role_and_checksum() {
    let mut sim = Sim::new(0x4e10);
    let a = sim.add_peer();
    let p = sim.add_peer();

    let ga = sim.create_group(a, PrivacyState::Public, b"persistent", b"alice");
    let gp = sim.join_group(p, a, ga, b"", b"pete");
    sim.settle_pair(a, ga, p, gp, Duration::from_secs(10));

    let p_sig = sim.engine(p).self_sig_pk(gp).unwrap();
    let p_at_a = sim.engine(a).peer_by_sig_pk(ga, &p_sig).unwrap();
    sim.engine(a).set_role(ga, p_at_a, Role::Moderator).unwrap();
    sim.run(Duration::from_secs(2));

    let checksum_before = sim.engine(a).peer_list_checksum(ga).unwrap();
    assert_eq!(
        sim.engine(p).peer_list_checksum(gp).unwrap(),
        checksum_before,
        "both sides agree before the disconnect"
    );

    // P drops off and comes back.
    sim.engine(p).disconnect(gp).unwrap();
    sim.run(Duration::from_secs(2));
    sim.engine(p).reconnect(gp).unwrap();
    sim.run(Duration::from_secs(15));
    sim.drain_events(a);

    let p_events = sim.drain_events(p);
    assert!(
        p_events.iter().any(|e| matches!(e, GroupEvent::SelfJoin { .. })),
        "rejoin completes with a fresh self-join"
    );

    // Same permanent signature key, same role, same checksum.
    let p_again = sim
        .engine(a)
        .peer_by_sig_pk(ga, &p_sig)
        .expect("P's permanent signature key is unchanged");
    assert_eq!(sim.engine(a).peer_role(ga, p_again), Some(Role::Moderator));
    assert_eq!(sim.engine(p).self_role(gp), Some(Role::Moderator));

    assert_eq!(sim.engine(a).peer_list_checksum(ga).unwrap(), checksum_before);
    assert_eq!(sim.engine(p).peer_list_checksum(gp).unwrap(), checksum_before);
}

#[test]
fn saved_group_restores_identity_across_restart() {
    let mut sim = Sim::new(0x4e11);
    let a = sim.add_peer();
    let p = sim.add_peer();

    let ga = sim.create_group(a, PrivacyState::Public, b"durable", b"alice");
    let gp = sim.join_group(p, a, ga, b"", b"pete");
    sim.settle_pair(a, ga, p, gp, Duration::from_secs(10));

    let p_sig = sim.engine(p).self_sig_pk(gp).unwrap();
    let record = sim.engine(p).save_group(gp).unwrap();
    assert!(!sim.engine(p).is_dirty(gp));

    // "Restart": a brand-new engine on the same address loads the record.
    let p2 = sim.add_peer();
    let p2_addr = sim.addr(p2);
    let gp2 = sim.engine(p2).load_group(&record).unwrap();
    sim.engine(p2).set_self_addr(gp2, p2_addr).unwrap();

    assert_eq!(sim.engine(p2).self_sig_pk(gp2), Some(p_sig));
    assert_eq!(sim.engine(p2).self_nick(gp2).unwrap(), b"pete");
    assert_eq!(sim.engine(p2).group_name(gp2).unwrap(), b"durable");

    // The old instance goes quiet; the restarted one reconnects with the
    // identical identity.
    sim.engine(p).disconnect(gp).unwrap();
    sim.run(Duration::from_secs(20));

    let restored_at_a = sim
        .engine(a)
        .peer_by_sig_pk(ga, &p_sig)
        .expect("restored peer reconnects under the same key");
    assert_eq!(sim.engine(a).peer_nick(ga, restored_at_a).unwrap(), b"pete");
}
