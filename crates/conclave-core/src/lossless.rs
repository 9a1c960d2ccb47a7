//! Reliable ordered delivery on top of datagrams.
//!
//! Each link runs an independent send window and receive queue. Message
//! ids start at 1 and increase by one per lossless packet. The receiver
//! delivers strictly in id order, buffering anything that arrives early
//! and asking the sender to retransmit the gap. The sender retransmits
//! unacked packets on a power-of-two backoff until an ack arrives or the
//! link is declared dead.

use std::{
    collections::BTreeMap,
    ops::Sub,
    time::Duration,
};

use conclave_proto::GroupPacketKind;

/// First message id on a fresh link.
pub const FIRST_MESSAGE_ID: u64 = 1;

/// Maximum unacked packets per link before sends start failing.
pub const SEND_WINDOW_SIZE: usize = 8192;

/// Maximum buffered out-of-order packets per link.
pub const RECV_BUFFER_SIZE: usize = 8192;

/// Retransmission backoff ceiling.
pub const RESEND_BACKOFF_CAP: Duration = Duration::from_secs(16);

/// Retransmission attempts before the link is declared dead.
pub const MAX_RESEND_ATTEMPTS: u32 = 10;

/// Minimum interval between retransmit requests for the same missing id.
pub const ACK_REQUEST_INTERVAL: Duration = Duration::from_secs(1);

/// One packet waiting for an ack.
#[derive(Debug, Clone)]
pub struct SendEntry<I> {
    /// The inner packet type, needed to reseal on retransmit.
    pub kind: GroupPacketKind,
    /// Payload bytes.
    pub payload: Vec<u8>,
    /// When the packet was first enqueued.
    pub time_added: I,
    /// When the packet was last put on the wire.
    pub last_send: I,
    /// How many times it has been sent.
    pub attempts: u32,
}

/// Outcome of a send-window maintenance pass.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResendPass {
    /// Message ids due for retransmission, in id order.
    pub resend: Vec<u64>,
    /// True if some packet exhausted its attempts; the link is dead.
    pub dead: bool,
}

/// The sending half of a lossless channel.
#[derive(Debug, Clone)]
pub struct SendWindow<I> {
    next_id: u64,
    entries: BTreeMap<u64, SendEntry<I>>,
}

impl<I> SendWindow<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    /// Empty window with ids starting at [`FIRST_MESSAGE_ID`].
    pub fn new() -> Self {
        Self { next_id: FIRST_MESSAGE_ID, entries: BTreeMap::new() }
    }

    /// Number of unacked packets.
    pub fn in_flight(&self) -> usize {
        self.entries.len()
    }

    /// Enqueue a packet, assigning it the next message id.
    ///
    /// Returns `None` if the window is full; the caller surfaces
    /// `SendQueueFull`.
    pub fn enqueue(&mut self, kind: GroupPacketKind, payload: Vec<u8>, now: I) -> Option<u64> {
        if self.entries.len() >= SEND_WINDOW_SIZE {
            return None;
        }

        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            id,
            SendEntry { kind, payload, time_added: now, last_send: now, attempts: 1 },
        );
        Some(id)
    }

    /// Process an `ACK_RECV`: drop the packet from the window.
    ///
    /// Acks for unknown ids are ignored (duplicated acks arrive routinely
    /// on a lossy substrate).
    pub fn ack(&mut self, message_id: u64) {
        self.entries.remove(&message_id);
    }

    /// Look up a packet for an `ACK_REQ` retransmission.
    pub fn get(&mut self, message_id: u64) -> Option<&mut SendEntry<I>> {
        self.entries.get_mut(&message_id)
    }

    /// Timer maintenance: collect packets whose backoff expired.
    ///
    /// A packet is retransmitted when `2^(attempts-1)` seconds (capped at
    /// [`RESEND_BACKOFF_CAP`]) have passed since its last send. A packet
    /// that exhausts [`MAX_RESEND_ATTEMPTS`] or outlives `max_age` marks
    /// the whole link dead.
    pub fn tick(&mut self, now: I, max_age: Duration) -> ResendPass {
        let mut pass = ResendPass::default();

        for (&id, entry) in &mut self.entries {
            if entry.attempts >= MAX_RESEND_ATTEMPTS || now - entry.time_added >= max_age {
                pass.dead = true;
                return pass;
            }

            let backoff =
                Duration::from_secs(1u64 << (entry.attempts - 1).min(63)).min(RESEND_BACKOFF_CAP);
            if now - entry.last_send >= backoff {
                entry.last_send = now;
                entry.attempts += 1;
                pass.resend.push(id);
            }
        }

        pass
    }
}

impl<I> Default for SendWindow<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    fn default() -> Self {
        Self::new()
    }
}

/// What the receive queue decided about an incoming packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecvOutcome {
    /// In-order: process these packets now (the new one plus any drained
    /// successors), then ack each with `ACK_RECV`.
    Deliver(Vec<(u64, GroupPacketKind, Vec<u8>)>),

    /// Ahead of sequence: buffered. If `request` is set, send an
    /// `ACK_REQ` for that (missing) id.
    Buffered {
        /// Missing id to request, if the rate limit allows.
        request: Option<u64>,
    },

    /// Behind sequence or already buffered: re-ack with `ACK_RECV` and
    /// drop.
    Duplicate,

    /// Buffer overflow or slot conflict: drop without acking.
    Rejected,
}

/// The receiving half of a lossless channel.
#[derive(Debug, Clone)]
pub struct RecvQueue<I> {
    next_expected: u64,
    buffered: BTreeMap<u64, (GroupPacketKind, Vec<u8>)>,
    last_request: Option<(u64, I)>,
}

impl<I> RecvQueue<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    /// Empty queue expecting [`FIRST_MESSAGE_ID`].
    pub fn new() -> Self {
        Self { next_expected: FIRST_MESSAGE_ID, buffered: BTreeMap::new(), last_request: None }
    }

    /// The next message id the application has not yet seen.
    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    /// Classify and store an incoming lossless packet.
    pub fn receive(
        &mut self,
        message_id: u64,
        kind: GroupPacketKind,
        payload: Vec<u8>,
        now: I,
    ) -> RecvOutcome {
        if message_id < self.next_expected {
            return RecvOutcome::Duplicate;
        }

        if message_id > self.next_expected {
            if self.buffered.contains_key(&message_id) {
                return RecvOutcome::Duplicate;
            }
            if self.buffered.len() >= RECV_BUFFER_SIZE {
                return RecvOutcome::Rejected;
            }
            self.buffered.insert(message_id, (kind, payload));

            return RecvOutcome::Buffered { request: self.request_missing(now) };
        }

        // In sequence: deliver it plus any buffered successors.
        let mut ready = vec![(message_id, kind, payload)];
        self.next_expected += 1;

        while let Some((buffered_kind, buffered_payload)) = self.buffered.remove(&self.next_expected)
        {
            ready.push((self.next_expected, buffered_kind, buffered_payload));
            self.next_expected += 1;
        }

        if self
            .last_request
            .is_some_and(|(id, _)| id < self.next_expected)
        {
            self.last_request = None;
        }

        RecvOutcome::Deliver(ready)
    }

    /// The missing id to request, rate-limited to one request per id per
    /// [`ACK_REQUEST_INTERVAL`].
    fn request_missing(&mut self, now: I) -> Option<u64> {
        let wanted = self.next_expected;

        if let Some((id, at)) = self.last_request {
            if id == wanted && now - at < ACK_REQUEST_INTERVAL {
                return None;
            }
        }

        self.last_request = Some((wanted, now));
        Some(wanted)
    }
}

impl<I> Default for RecvQueue<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    type TestInstant = std::time::Instant;

    fn now() -> TestInstant {
        std::time::Instant::now()
    }

    #[test]
    fn ids_are_monotonic_from_one() {
        let t = now();
        let mut window: SendWindow<TestInstant> = SendWindow::new();
        assert_eq!(window.enqueue(GroupPacketKind::Broadcast, vec![1], t), Some(1));
        assert_eq!(window.enqueue(GroupPacketKind::Broadcast, vec![2], t), Some(2));
        assert_eq!(window.enqueue(GroupPacketKind::Custom, vec![3], t), Some(3));
    }

    #[test]
    fn ack_clears_entry() {
        let t = now();
        let mut window: SendWindow<TestInstant> = SendWindow::new();
        let id = window.enqueue(GroupPacketKind::Broadcast, vec![1], t).unwrap();
        assert_eq!(window.in_flight(), 1);

        window.ack(id);
        assert_eq!(window.in_flight(), 0);

        // Duplicate ack is a no-op.
        window.ack(id);
        assert_eq!(window.in_flight(), 0);
    }

    #[test]
    fn in_order_delivery_drains_buffer() {
        let t = now();
        let mut queue: RecvQueue<TestInstant> = RecvQueue::new();

        // 2 and 3 arrive before 1.
        assert!(matches!(
            queue.receive(2, GroupPacketKind::Broadcast, vec![2], t),
            RecvOutcome::Buffered { request: Some(1) }
        ));
        assert!(matches!(
            queue.receive(3, GroupPacketKind::Broadcast, vec![3], t),
            RecvOutcome::Buffered { request: None } // rate-limited
        ));

        let RecvOutcome::Deliver(ready) = queue.receive(1, GroupPacketKind::Broadcast, vec![1], t)
        else {
            panic!("expected delivery");
        };
        let ids: Vec<u64> = ready.iter().map(|(id, _, _)| *id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(queue.next_expected(), 4);
    }

    #[test]
    fn old_ids_are_duplicates() {
        let t = now();
        let mut queue: RecvQueue<TestInstant> = RecvQueue::new();
        let _ = queue.receive(1, GroupPacketKind::Broadcast, vec![1], t);
        assert_eq!(queue.receive(1, GroupPacketKind::Broadcast, vec![1], t), RecvOutcome::Duplicate);
    }

    #[test]
    fn buffered_duplicate_is_reported() {
        let t = now();
        let mut queue: RecvQueue<TestInstant> = RecvQueue::new();
        let _ = queue.receive(5, GroupPacketKind::Broadcast, vec![5], t);
        assert_eq!(queue.receive(5, GroupPacketKind::Broadcast, vec![5], t), RecvOutcome::Duplicate);
    }

    #[test]
    fn resend_backoff_doubles() {
        let t0 = now();
        let mut window: SendWindow<TestInstant> = SendWindow::new();
        let id = window.enqueue(GroupPacketKind::Broadcast, vec![1], t0).unwrap();

        // Before one second: nothing due.
        let pass = window.tick(t0 + Duration::from_millis(500), Duration::from_secs(72));
        assert!(pass.resend.is_empty() && !pass.dead);

        // After one second: first retransmit.
        let pass = window.tick(t0 + Duration::from_secs(1), Duration::from_secs(72));
        assert_eq!(pass.resend, vec![id]);

        // Backoff doubled: next retransmit only after two more seconds.
        let pass = window.tick(t0 + Duration::from_secs(2), Duration::from_secs(72));
        assert!(pass.resend.is_empty());
        let pass = window.tick(t0 + Duration::from_secs(3), Duration::from_secs(72));
        assert_eq!(pass.resend, vec![id]);
    }

    #[test]
    fn unacked_packet_eventually_kills_link() {
        let t0 = now();
        let mut window: SendWindow<TestInstant> = SendWindow::new();
        window.enqueue(GroupPacketKind::Broadcast, vec![1], t0).unwrap();

        let pass = window.tick(t0 + Duration::from_secs(100), Duration::from_secs(72));
        assert!(pass.dead);
    }

    proptest! {
        /// Whatever order packets arrive in, delivery is in id order.
        #[test]
        fn any_arrival_order_delivers_in_sequence(
            order in Just((1..=24u64).collect::<Vec<_>>()).prop_shuffle(),
        ) {
            let t = now();
            let mut queue: RecvQueue<TestInstant> = RecvQueue::new();
            let mut delivered = Vec::new();

            for id in order {
                if let RecvOutcome::Deliver(ready) =
                    queue.receive(id, GroupPacketKind::Broadcast, id.to_be_bytes().to_vec(), t)
                {
                    delivered.extend(ready.into_iter().map(|(id, _, _)| id));
                }
            }

            prop_assert_eq!(delivered, (1..=24u64).collect::<Vec<_>>());
        }
    }

    #[test]
    fn request_rate_limit_expires() {
        let t0 = now();
        let mut queue: RecvQueue<TestInstant> = RecvQueue::new();

        assert!(matches!(
            queue.receive(3, GroupPacketKind::Broadcast, vec![], t0),
            RecvOutcome::Buffered { request: Some(1) }
        ));
        // Same missing id, inside the rate window.
        assert!(matches!(
            queue.receive(4, GroupPacketKind::Broadcast, vec![], t0),
            RecvOutcome::Buffered { request: None }
        ));
        // After the interval the request fires again.
        assert!(matches!(
            queue.receive(5, GroupPacketKind::Broadcast, vec![], t0 + Duration::from_secs(2)),
            RecvOutcome::Buffered { request: Some(1) }
        ));
    }
}
