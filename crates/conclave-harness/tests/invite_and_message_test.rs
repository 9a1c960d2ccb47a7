//! Invite flow, messaging, ignore, private and custom packets, teardown.

use std::time::Duration;

use conclave_core::{GroupEvent, GroupId, MessageKind, PrivacyState};
use conclave_harness::Sim;

fn only_confirmed_peer(sim: &mut Sim, index: usize, group: GroupId) -> conclave_core::PeerId {
    let peers = sim.engine(index).confirmed_peers(group);
    assert_eq!(peers.len(), 1, "expected exactly one confirmed peer");
    peers[0]
}

#[test]
fn invite_message_ignore_private_custom_leave() {
    let mut sim = Sim::new(0xc0ffee);
    let a = sim.add_peer();
    let b = sim.add_peer();

    // A founds a private group; B joins through a friend invite.
    let ga = sim.create_group(a, PrivacyState::Private, b"Utah Data Center", b"Winslow");
    let cookie = sim.engine(a).invite_friend(ga).unwrap();

    let b_addr = sim.addr(b);
    let gb = sim.engine(b).accept_invite(&cookie, b"", b"Thomas").unwrap();
    sim.engine(b).set_self_addr(gb, b_addr).unwrap();

    sim.settle_pair(a, ga, b, gb, Duration::from_secs(10));

    let a_events = sim.drain_events(a);
    assert!(a_events.iter().any(|e| matches!(e, GroupEvent::PeerJoin { .. })));
    let b_events = sim.drain_events(b);
    assert!(b_events.iter().any(|e| matches!(e, GroupEvent::SelfJoin { .. })));

    let b_at_a = only_confirmed_peer(&mut sim, a, ga);
    let a_at_b = only_confirmed_peer(&mut sim, b, gb);

    assert_eq!(sim.engine(a).peer_nick(ga, b_at_a).unwrap(), b"Thomas");
    assert_eq!(sim.engine(b).peer_nick(gb, a_at_b).unwrap(), b"Winslow");
    assert_eq!(sim.engine(b).group_name(gb).unwrap(), b"Utah Data Center");

    // B speaks; A hears.
    let text = b"Where is it I've read...".to_vec();
    sim.engine(b).send_message(gb, MessageKind::Normal, &text).unwrap();
    sim.run(Duration::from_secs(1));

    let a_events = sim.drain_events(a);
    assert!(a_events.iter().any(|e| matches!(
        e,
        GroupEvent::Message { peer_id, kind: MessageKind::Normal, data, .. }
            if *peer_id == b_at_a && data == &text
    )));

    // Ignored peers are silenced.
    sim.engine(a).toggle_ignore(ga, b_at_a, true).unwrap();
    sim.engine(b).send_message(gb, MessageKind::Normal, b"Am I bothering you?").unwrap();
    sim.run(Duration::from_secs(1));
    assert!(
        !sim.drain_events(a).iter().any(|e| matches!(e, GroupEvent::Message { .. })),
        "ignored peer's message must not reach the application"
    );

    sim.engine(a).toggle_ignore(ga, b_at_a, false).unwrap();

    // Private action message.
    let private = b"Don't spill yer beans".to_vec();
    sim.engine(a).send_private(ga, b_at_a, MessageKind::Action, &private).unwrap();
    sim.run(Duration::from_secs(1));

    let b_events = sim.drain_events(b);
    assert!(b_events.iter().any(|e| matches!(
        e,
        GroupEvent::PrivateMessage { peer_id, kind: MessageKind::Action, data, .. }
            if *peer_id == a_at_b && data == &private
    )));

    // One reliable and one lossy custom packet, both delivered.
    let custom = b"Why'd ya spill yer beans?".to_vec();
    sim.engine(a).send_custom(ga, true, &custom).unwrap();
    sim.engine(a).send_custom(ga, false, &custom).unwrap();
    sim.run(Duration::from_secs(1));

    let customs: Vec<_> = sim
        .drain_events(b)
        .into_iter()
        .filter(|e| matches!(e, GroupEvent::CustomPacket { data, .. } if data == &custom))
        .collect();
    assert_eq!(customs.len(), 2, "reliable and lossy custom packets both arrive");

    // Clean teardown on both sides.
    sim.engine(b).leave(gb, b"so long").unwrap();
    sim.run(Duration::from_secs(1));

    let a_events = sim.drain_events(a);
    assert!(a_events.iter().any(|e| matches!(
        e,
        GroupEvent::PeerExit { reason: conclave_core::ExitReason::Quit, part_message, .. }
            if part_message == b"so long"
    )));

    sim.engine(a).leave(ga, b"").unwrap();
    assert_eq!(sim.engine(a).group_count(), 0);
    assert_eq!(sim.engine(b).group_count(), 0);
}

#[test]
fn wrong_password_join_fails() {
    let mut sim = Sim::new(7);
    let a = sim.add_peer();
    let b = sim.add_peer();

    let ga = sim.create_group(a, PrivacyState::Private, b"vault", b"alice");
    sim.engine(a).set_password(ga, b"right horse").unwrap();

    let gb = sim.join_group(b, a, ga, b"wrong battery", b"bob");
    sim.run(Duration::from_secs(5));

    let b_events = sim.drain_events(b);
    assert!(b_events.iter().any(|e| matches!(
        e,
        GroupEvent::JoinFail { reason: conclave_core::JoinFailReason::InvalidPassword, .. }
    )));
    assert!(sim.engine(b).confirmed_peers(gb).is_empty());
}

#[test]
fn duplicate_nick_is_rejected() {
    let mut sim = Sim::new(8);
    let a = sim.add_peer();
    let b = sim.add_peer();
    let c = sim.add_peer();

    let ga = sim.create_group(a, PrivacyState::Public, b"room", b"alice");
    let gb = sim.join_group(b, a, ga, b"", b"bob");
    sim.settle_pair(a, ga, b, gb, Duration::from_secs(10));
    sim.drain_events(a);

    // Second joiner presents an already-taken nickname.
    let gc = sim.join_group(c, a, ga, b"", b"bob");
    sim.run(Duration::from_secs(5));

    let c_events = sim.drain_events(c);
    assert!(c_events.iter().any(|e| matches!(
        e,
        GroupEvent::JoinFail { reason: conclave_core::JoinFailReason::NickTaken, .. }
    )));
    assert!(sim.engine(c).confirmed_peers(gc).is_empty());
}
