//! Concurrent topic updates converge deterministically.

use std::time::Duration;

use conclave_core::{PrivacyState, Role};
use conclave_harness::Sim;

#[test]
fn racing_moderators_converge_on_one_topic() {
    let mut sim = Sim::new(0x70b1);
    let a = sim.add_peer(); // founder
    let m1 = sim.add_peer();
    let m2 = sim.add_peer();

    let ga = sim.create_group(a, PrivacyState::Public, b"race", b"alice");
    let g1 = sim.join_group(m1, a, ga, b"", b"mira");
    sim.settle_pair(a, ga, m1, g1, Duration::from_secs(10));
    let g2 = sim.join_group(m2, a, ga, b"", b"moss");
    sim.settle_pair(a, ga, m2, g2, Duration::from_secs(10));
    sim.run(Duration::from_secs(30));

    // Promote both and lock the topic to moderators.
    let m1_sig = sim.engine(m1).self_sig_pk(g1).unwrap();
    let m2_sig = sim.engine(m2).self_sig_pk(g2).unwrap();
    let m1_at_a = sim.engine(a).peer_by_sig_pk(ga, &m1_sig).unwrap();
    let m2_at_a = sim.engine(a).peer_by_sig_pk(ga, &m2_sig).unwrap();
    sim.engine(a).set_role(ga, m1_at_a, Role::Moderator).unwrap();
    sim.run(Duration::from_secs(2));
    sim.engine(a).set_role(ga, m2_at_a, Role::Moderator).unwrap();
    sim.run(Duration::from_secs(2));
    sim.engine(a).set_topic_lock(ga, true).unwrap();
    sim.run(Duration::from_secs(2));

    // Both moderators set the topic in the same tick: both updates carry
    // the same version and race through the mesh.
    sim.engine(m1).set_topic(g1, b"winter is coming").unwrap();
    sim.engine(m2).set_topic(g2, b"winter is here").unwrap();
    sim.run(Duration::from_secs(5));

    let topic_a = sim.engine(a).topic(ga).unwrap();
    let topic_1 = sim.engine(m1).topic(g1).unwrap();
    let topic_2 = sim.engine(m2).topic(g2).unwrap();

    assert_eq!(topic_a, topic_1, "founder and first moderator must agree");
    assert_eq!(topic_a, topic_2, "founder and second moderator must agree");
    assert!(
        topic_a == b"winter is coming" || topic_a == b"winter is here",
        "the winner is one of the two candidates"
    );

    let v_a = sim.engine(a).topic_version(ga).unwrap();
    assert_eq!(sim.engine(m1).topic_version(g1).unwrap(), v_a);
    assert_eq!(sim.engine(m2).topic_version(g2).unwrap(), v_a);
}

#[test]
fn topic_lock_blocks_plain_users() {
    let mut sim = Sim::new(0x70b2);
    let a = sim.add_peer();
    let b = sim.add_peer();

    let ga = sim.create_group(a, PrivacyState::Public, b"locked", b"alice");
    let gb = sim.join_group(b, a, ga, b"", b"bob");
    sim.settle_pair(a, ga, b, gb, Duration::from_secs(10));

    // Unlocked: any user may set the topic.
    sim.engine(b).set_topic(gb, b"open floor").unwrap();
    sim.run(Duration::from_secs(2));
    assert_eq!(sim.engine(a).topic(ga).unwrap(), b"open floor");

    // Locked: the same user is refused locally.
    sim.engine(a).set_topic_lock(ga, true).unwrap();
    sim.run(Duration::from_secs(2));
    assert_eq!(
        sim.engine(b).set_topic(gb, b"hijack"),
        Err(conclave_core::error::TopicError::PermissionDenied)
    );

    // And a founder-set topic still flows.
    sim.engine(a).set_topic(ga, b"management only").unwrap();
    sim.run(Duration::from_secs(2));
    assert_eq!(sim.engine(b).topic(gb).unwrap(), b"management only");
}
