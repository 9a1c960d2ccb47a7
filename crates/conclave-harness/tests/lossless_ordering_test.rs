//! Lossless ordering under load and loss.

use std::time::Duration;

use conclave_core::{GroupEvent, MessageKind, PrivacyState};
use conclave_harness::Sim;

#[test]
fn thousand_messages_arrive_in_order() {
    let mut sim = Sim::new(0x5eed);
    let a = sim.add_peer();
    let b = sim.add_peer();

    let ga = sim.create_group(a, PrivacyState::Public, b"firehose", b"alice");
    let gb = sim.join_group(b, a, ga, b"", b"bob");
    sim.settle_pair(a, ga, b, gb, Duration::from_secs(10));
    sim.drain_events(b);

    // A sustained burst over a 10%-lossy link.
    sim.net.set_loss(10);
    for i in 0..=1000u32 {
        sim.engine(a)
            .send_message(ga, MessageKind::Normal, i.to_string().as_bytes())
            .unwrap();
    }

    // Give retransmission time to fill every gap.
    sim.run(Duration::from_secs(60));
    sim.net.set_loss(0);
    sim.run(Duration::from_secs(10));

    let received: Vec<u32> = sim
        .drain_events(b)
        .into_iter()
        .filter_map(|event| match event {
            GroupEvent::Message { data, .. } => {
                Some(String::from_utf8(data).unwrap().parse().unwrap())
            },
            _ => None,
        })
        .collect();

    assert_eq!(received.len(), 1001, "every message must be delivered exactly once");
    for (expected, got) in received.iter().enumerate() {
        assert_eq!(*got, expected as u32, "delivery must preserve send order");
    }
}

#[test]
fn ordering_survives_total_blackout_and_recovery() {
    let mut sim = Sim::new(0xb1ac);
    let a = sim.add_peer();
    let b = sim.add_peer();

    let ga = sim.create_group(a, PrivacyState::Public, b"tunnel", b"alice");
    let gb = sim.join_group(b, a, ga, b"", b"bob");
    sim.settle_pair(a, ga, b, gb, Duration::from_secs(10));
    sim.drain_events(b);

    // First half sent into a black hole.
    sim.net.set_loss(100);
    for i in 0..50u32 {
        sim.engine(a)
            .send_message(ga, MessageKind::Normal, i.to_string().as_bytes())
            .unwrap();
    }
    sim.run(Duration::from_secs(5));

    // Link recovers well before the dead-peer deadline; retransmission
    // must deliver the backlog in order, then the second half.
    sim.net.set_loss(0);
    for i in 50..100u32 {
        sim.engine(a)
            .send_message(ga, MessageKind::Normal, i.to_string().as_bytes())
            .unwrap();
    }
    sim.run(Duration::from_secs(30));

    let received: Vec<u32> = sim
        .drain_events(b)
        .into_iter()
        .filter_map(|event| match event {
            GroupEvent::Message { data, .. } => {
                Some(String::from_utf8(data).unwrap().parse().unwrap())
            },
            _ => None,
        })
        .collect();

    assert_eq!(received, (0..100).collect::<Vec<u32>>());
}
