//! Property tests for the packet codec.

use conclave_crypto::{ExtKeyPair, derive_session_key};
use conclave_proto::{GroupPacketKind, OpenedPacket, PacketBody, open, peek_header, seal};
use proptest::prelude::*;

fn session_key() -> conclave_crypto::SessionKey {
    let a = ExtKeyPair::from_entropy(&[0x61; 64]);
    let b = ExtKeyPair::from_entropy(&[0x62; 64]);
    derive_session_key(&a.enc, &b.enc.public())
}

proptest! {
    #[test]
    fn lossless_frames_round_trip(
        payload in prop::collection::vec(any::<u8>(), 0..1200),
        message_id in 1u64..u64::MAX,
        padding in 0usize..=8,
        nonce in prop::array::uniform24(any::<u8>()),
    ) {
        let key = session_key();
        let sender = ExtKeyPair::from_entropy(&[0x61; 64]).enc.public();

        let frame = seal(
            0xabcd_0123,
            &sender,
            &key,
            nonce,
            padding,
            PacketBody::Lossless { kind: GroupPacketKind::Custom, message_id, payload: &payload },
        )
        .unwrap();

        let header = peek_header(&frame).unwrap();
        prop_assert_eq!(header.chat_id_hash(), 0xabcd_0123);
        prop_assert_eq!(header.sender(), sender);

        match open(0xabcd_0123, &key, &frame).unwrap() {
            OpenedPacket::Lossless { kind, message_id: id, payload: got, .. } => {
                prop_assert_eq!(kind, GroupPacketKind::Custom);
                prop_assert_eq!(id, message_id);
                prop_assert_eq!(got, payload);
            },
            other => prop_assert!(false, "unexpected packet: {other:?}"),
        }
    }

    #[test]
    fn garbage_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..1500)) {
        let key = session_key();
        // Opening arbitrary bytes must fail cleanly, never panic.
        let _ = open(0, &key, &bytes);
        let _ = peek_header(&bytes);
    }
}
