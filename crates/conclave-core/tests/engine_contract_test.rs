//! Contract tests for the engine's public operations.
//!
//! Single-engine checks: input validation, state errors, accessors, and
//! the save/restore round trip. Cross-peer behaviour lives in the
//! simulation harness.

use std::{cell::RefCell, rc::Rc};

use conclave_core::{
    GroupEngine, PeerAddress, PrivacyState, Role, SystemEnv, Transport, TransportError,
    error::{CreateError, FounderError, GroupError, JoinError, LeaveError, SendError},
};
use conclave_crypto::ChatId;

/// Transport that records datagrams and never fails.
#[derive(Clone, Default)]
struct NullTransport {
    sent: Rc<RefCell<Vec<Vec<u8>>>>,
}

impl Transport for NullTransport {
    fn send(&mut self, _to: &PeerAddress, datagram: &[u8]) -> Result<(), TransportError> {
        self.sent.borrow_mut().push(datagram.to_vec());
        Ok(())
    }
}

fn engine() -> GroupEngine<SystemEnv, NullTransport> {
    GroupEngine::new(SystemEnv, NullTransport::default())
}

#[test]
fn create_group_validates_inputs() {
    let mut engine = engine();

    assert_eq!(
        engine.create_group(PrivacyState::Public, b"", b"nick"),
        Err(CreateError::NameEmpty)
    );
    assert_eq!(
        engine.create_group(PrivacyState::Public, &[b'x'; 49], b"nick"),
        Err(CreateError::NameTooLong)
    );
    assert_eq!(
        engine.create_group(PrivacyState::Public, b"name", b""),
        Err(CreateError::NickEmpty)
    );
    assert_eq!(
        engine.create_group(PrivacyState::Public, b"name", &[b'x'; 129]),
        Err(CreateError::NickTooLong)
    );
    assert_eq!(engine.group_count(), 0);
}

#[test]
fn founder_owns_a_fresh_group() {
    let mut engine = engine();
    let id = engine.create_group(PrivacyState::Private, b"war room", b"general").unwrap();

    assert_eq!(engine.group_count(), 1);
    assert_eq!(engine.group_name(id).unwrap(), b"war room");
    assert_eq!(engine.privacy(id), Some(PrivacyState::Private));
    assert_eq!(engine.self_role(id), Some(Role::Founder));
    assert_eq!(engine.self_nick(id).unwrap(), b"general");
    assert_eq!(engine.shared_state_version(id), Some(1));
    assert!(engine.topic(id).unwrap().is_empty());
    assert!(engine.confirmed_peers(id).is_empty());
    assert!(engine.chat_id(id).is_some());
}

#[test]
fn duplicate_joins_are_rejected() {
    let mut engine = engine();
    let chat_id = ChatId::from_bytes([7; 32]);

    engine.join_by_chat_id(chat_id, b"", b"me").unwrap();
    assert_eq!(engine.join_by_chat_id(chat_id, b"", b"me"), Err(JoinError::Duplicate));
    assert_eq!(
        engine.join_by_chat_id(ChatId::from_bytes([8; 32]), &[b'p'; 33], b"me"),
        Err(JoinError::PasswordTooLong)
    );
    assert_eq!(engine.accept_invite(b"garbage", b"", b"me"), Err(JoinError::BadInvite));
}

#[test]
fn send_errors_are_specific() {
    let mut engine = engine();

    // A stale id: the group existed once and was left.
    let bogus = engine.create_group(PrivacyState::Public, b"gone", b"me").unwrap();
    engine.leave(bogus, b"").unwrap();

    let id = engine.create_group(PrivacyState::Public, b"room", b"me").unwrap();

    assert_eq!(
        engine.send_message(bogus, conclave_core::MessageKind::Normal, b"hi"),
        Err(SendError::GroupNotFound)
    );
    assert_eq!(
        engine.send_message(id, conclave_core::MessageKind::Normal, b""),
        Err(SendError::Empty)
    );
    assert_eq!(
        engine.send_message(id, conclave_core::MessageKind::Normal, &[0u8; 2000]),
        Err(SendError::TooLong)
    );

    // A founder alone in a group can "send": fan-out to zero peers.
    assert!(engine.send_message(id, conclave_core::MessageKind::Normal, b"echo").is_ok());
}

#[test]
fn founder_only_operations_check_roles() {
    let mut engine = engine();
    let joined = engine.join_by_chat_id(ChatId::from_bytes([9; 32]), b"", b"me").unwrap();
    assert_eq!(engine.set_password(joined, b"pw"), Err(FounderError::NotFounder));
    assert_eq!(engine.set_peer_limit(joined, 5), Err(FounderError::NotFounder));

    let owned = engine.create_group(PrivacyState::Public, b"mine", b"me").unwrap();
    engine.set_password(owned, b"pw").unwrap();
    engine.set_peer_limit(owned, 5).unwrap();
    engine.set_topic_lock(owned, true).unwrap();

    // Each mutation bumps and re-signs the shared state.
    assert_eq!(engine.shared_state_version(owned), Some(4));
    assert_eq!(engine.password(owned).unwrap(), b"pw");
    assert_eq!(engine.peer_limit(owned), Some(5));
}

#[test]
fn disconnect_and_reconnect_transitions() {
    let mut engine = engine();
    let id = engine.create_group(PrivacyState::Public, b"room", b"me").unwrap();

    engine.disconnect(id).unwrap();
    assert_eq!(engine.is_connected(id), Some(false));
    assert_eq!(engine.disconnect(id), Err(GroupError::AlreadyDisconnected));

    engine.reconnect(id).unwrap();
    assert_eq!(engine.is_connected(id), Some(true));

    engine.leave(id, b"").unwrap();
    assert_eq!(engine.reconnect(id), Err(GroupError::NotFound));
}

#[test]
fn leave_removes_the_group() {
    let mut engine = engine();
    let id = engine.create_group(PrivacyState::Public, b"room", b"me").unwrap();

    assert_eq!(engine.leave(id, &[b'x'; 129]), Err(LeaveError::TooLong));
    engine.leave(id, b"farewell").unwrap();
    assert_eq!(engine.group_count(), 0);
}

#[test]
fn save_and_load_preserve_founder_identity() {
    let mut engine = engine();
    let id = engine.create_group(PrivacyState::Private, b"durable", b"keeper").unwrap();
    engine.set_password(id, b"secret").unwrap();
    engine.set_topic(id, b"remember this").unwrap();

    let chat_id = engine.chat_id(id).unwrap();
    let sig_pk = engine.self_sig_pk(id).unwrap();
    let version = engine.shared_state_version(id).unwrap();

    assert!(engine.is_dirty(id));
    let record = engine.save_group(id).unwrap();
    assert!(!engine.is_dirty(id));

    // Restore into a fresh engine, as after a process restart.
    let mut restored = self::engine();
    let rid = restored.load_group(&record).unwrap();

    assert_eq!(restored.chat_id(rid), Some(chat_id));
    assert_eq!(restored.self_sig_pk(rid), Some(sig_pk));
    assert_eq!(restored.self_role(rid), Some(Role::Founder), "group keys must persist");
    assert_eq!(restored.shared_state_version(rid), Some(version));
    assert_eq!(restored.group_name(rid).unwrap(), b"durable");
    assert_eq!(restored.password(rid).unwrap(), b"secret");
    assert_eq!(restored.topic(rid).unwrap(), b"remember this");
    assert_eq!(restored.self_nick(rid).unwrap(), b"keeper");

    // The restored founder can keep governing: version advances under
    // the same chat id.
    restored.set_peer_limit(rid, 7).unwrap();
    assert_eq!(restored.shared_state_version(rid), Some(version + 1));
}
