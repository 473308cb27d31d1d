#![forbid(unsafe_code)]

use std::collections::HashMap;

use chatspace_domain::{ConnectionId, Identity, UserId};
use proptest::prelude::*;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::server::registry::{ConnectionRegistry, Delivery, RegistryError};

fn uid(s: &str) -> UserId {
	UserId::new(s).expect("valid UserId")
}

fn ident(user: &str, name: &str) -> Identity {
	Identity::new(uid(user), name)
}

fn add(reg: &ConnectionRegistry, id: u64, capacity: usize) -> mpsc::Receiver<Message> {
	let (tx, rx) = mpsc::channel(capacity);
	reg.register(ConnectionId(id), tx).expect("fresh connection id");
	rx
}

#[test]
fn register_rejects_duplicate_ids() {
	let reg = ConnectionRegistry::new();
	let _rx = add(&reg, 1, 4);

	let (tx, _rx2) = mpsc::channel(4);
	assert!(matches!(
		reg.register(ConnectionId(1), tx),
		Err(RegistryError::DuplicateConnection(ConnectionId(1)))
	));
	assert_eq!(reg.len(), 1);
}

#[test]
fn bind_on_unknown_connection_fails() {
	let reg = ConnectionRegistry::new();
	let err = reg.bind_identity(ConnectionId(9), ident("alice", "Alice")).unwrap_err();
	assert_eq!(err, RegistryError::UnknownConnection(ConnectionId(9)));
}

#[test]
fn multiple_connections_per_user_are_tracked() {
	let reg = ConnectionRegistry::new();
	let _a = add(&reg, 1, 4);
	let _b = add(&reg, 2, 4);
	let _c = add(&reg, 3, 4);

	reg.bind_identity(ConnectionId(2), ident("alice", "Alice")).unwrap();
	reg.bind_identity(ConnectionId(1), ident("alice", "Alice")).unwrap();
	reg.bind_identity(ConnectionId(3), ident("bob", "Bob")).unwrap();

	assert_eq!(
		reg.connections_for_user(&uid("alice")),
		vec![ConnectionId(1), ConnectionId(2)]
	);
	assert_eq!(reg.connections_for_user(&uid("bob")), vec![ConnectionId(3)]);
	assert!(reg.connections_for_user(&uid("carol")).is_empty());

	let removal = reg.unregister(ConnectionId(1)).expect("registered");
	assert_eq!(removal.remaining_for_user, 1);
	assert!(!removal.was_last_for_user());

	let removal = reg.unregister(ConnectionId(2)).expect("registered");
	assert!(removal.was_last_for_user());
	assert!(reg.connections_for_user(&uid("alice")).is_empty());
}

#[test]
fn unregister_is_idempotent() {
	let reg = ConnectionRegistry::new();
	let _rx = add(&reg, 1, 4);

	assert!(reg.unregister(ConnectionId(1)).is_some());
	assert!(reg.unregister(ConnectionId(1)).is_none());
	assert!(reg.is_empty());
}

#[test]
fn anonymous_removal_is_never_last_for_user() {
	let reg = ConnectionRegistry::new();
	let _rx = add(&reg, 1, 4);

	let removal = reg.unregister(ConnectionId(1)).expect("registered");
	assert!(removal.entry.identity.is_none());
	assert!(!removal.was_last_for_user());
}

#[test]
fn rebinding_to_another_user_moves_the_connection() {
	let reg = ConnectionRegistry::new();
	let _rx = add(&reg, 1, 4);

	reg.bind_identity(ConnectionId(1), ident("alice", "Alice")).unwrap();
	let binding = reg.bind_identity(ConnectionId(1), ident("bob", "Bob")).unwrap();

	assert_eq!(binding.previous, Some(ident("alice", "Alice")));
	assert_eq!(binding.previous_remaining, 0);
	assert!(reg.connections_for_user(&uid("alice")).is_empty());
	assert_eq!(reg.connections_for_user(&uid("bob")), vec![ConnectionId(1)]);
	assert_eq!(reg.identity_of(ConnectionId(1)), Some(ident("bob", "Bob")));
}

#[test]
fn active_identities_are_ordered_by_first_login_with_latest_name() {
	let reg = ConnectionRegistry::new();
	let _a = add(&reg, 1, 4);
	let _b = add(&reg, 2, 4);
	let _c = add(&reg, 3, 4);

	reg.bind_identity(ConnectionId(2), ident("bob", "Bob")).unwrap();
	reg.bind_identity(ConnectionId(1), ident("alice", "Alice")).unwrap();
	reg.bind_identity(ConnectionId(3), ident("bob", "Bobby")).unwrap();

	let active = reg.active_identities();
	assert_eq!(active, vec![ident("bob", "Bobby"), ident("alice", "Alice")]);

	// Same-user re-login renames without changing position.
	reg.bind_identity(ConnectionId(2), ident("bob", "Robert")).unwrap();
	let active = reg.active_identities();
	assert_eq!(active, vec![ident("bob", "Robert"), ident("alice", "Alice")]);
}

#[test]
fn delivery_reports_full_and_closed_queues() {
	let reg = ConnectionRegistry::new();
	let mut healthy = add(&reg, 1, 4);
	let _full = add(&reg, 2, 1);
	let closed = add(&reg, 3, 4);
	drop(closed);

	let frame = Message::Text(String::from("hello").into());
	assert_eq!(reg.deliver(ConnectionId(2), &frame), Delivery::Delivered);

	let report = reg.deliver_all(&frame);
	assert_eq!(report.delivered, 1);
	assert_eq!(report.dropped, 1);
	assert_eq!(report.closed, 1);
	assert_eq!(report.attempted(), 3);

	assert_eq!(healthy.try_recv().ok(), Some(frame.clone()));

	let report = reg.deliver_many(&[ConnectionId(1), ConnectionId(42)], &frame);
	assert_eq!(report.delivered, 1);
	assert_eq!(report.unknown, 1);
}

#[tokio::test]
async fn full_queue_raises_overflow_for_that_connection_only() {
	let reg = ConnectionRegistry::new();
	let (tx, _slow_rx) = mpsc::channel(1);
	let slow = reg.register(ConnectionId(1), tx).expect("fresh connection id");
	let (tx, mut fast_rx) = mpsc::channel(8);
	let fast = reg.register(ConnectionId(2), tx).expect("fresh connection id");

	let frame = Message::Text(String::from("hello").into());
	reg.deliver_all(&frame);
	let report = reg.deliver_all(&frame);
	assert_eq!(report.dropped, 1);
	assert_eq!(report.delivered, 1);

	tokio::time::timeout(std::time::Duration::from_secs(1), slow.raised())
		.await
		.expect("overflow raised for the full queue");
	assert!(
		tokio::time::timeout(std::time::Duration::from_millis(50), fast.raised())
			.await
			.is_err()
	);
	assert_eq!(fast_rx.try_recv().ok(), Some(frame));
}

#[derive(Debug, Clone)]
enum Op {
	Register(u64),
	Bind(u64, u8),
	Unregister(u64),
}

fn op_strategy() -> impl Strategy<Value = Op> {
	prop_oneof![
		(0u64..6).prop_map(Op::Register),
		(0u64..6, 0u8..3).prop_map(|(c, u)| Op::Bind(c, u)),
		(0u64..6).prop_map(Op::Unregister),
	]
}

proptest! {
	#[test]
	fn user_index_matches_bound_connections(ops in prop::collection::vec(op_strategy(), 0..64)) {
		let reg = ConnectionRegistry::new();
		let mut model: HashMap<u64, Option<u8>> = HashMap::new();
		let mut receivers = Vec::new();

		for op in ops {
			match op {
				Op::Register(c) => {
					let (tx, rx) = mpsc::channel(1);
					let res = reg.register(ConnectionId(c), tx);
					prop_assert_eq!(res.is_ok(), !model.contains_key(&c));
					if res.is_ok() {
						model.insert(c, None);
						receivers.push(rx);
					}
				}
				Op::Bind(c, u) => {
					let res = reg.bind_identity(ConnectionId(c), ident(&format!("u{u}"), "name"));
					prop_assert_eq!(res.is_ok(), model.contains_key(&c));
					if let Some(slot) = model.get_mut(&c) {
						let before = *slot;
						*slot = Some(u);
						let binding = res.expect("bound");
						let expected_remaining = match before {
							Some(prev) => model.values().filter(|v| **v == Some(prev)).count(),
							None => 0,
						};
						prop_assert_eq!(binding.previous_remaining, expected_remaining);
					}
				}
				Op::Unregister(c) => {
					let removal = reg.unregister(ConnectionId(c));
					match model.remove(&c) {
						Some(bound) => {
							let removal = removal.expect("model says registered");
							let remaining = bound.map_or(0, |u| model.values().filter(|v| **v == Some(u)).count());
							prop_assert_eq!(removal.remaining_for_user, remaining);
						}
						None => prop_assert!(removal.is_none()),
					}
				}
			}

			prop_assert_eq!(reg.len(), model.len());
			for u in 0u8..3 {
				let mut expected: Vec<ConnectionId> = model
					.iter()
					.filter(|(_, v)| **v == Some(u))
					.map(|(c, _)| ConnectionId(*c))
					.collect();
				expected.sort();
				prop_assert_eq!(reg.connections_for_user(&uid(&format!("u{u}"))), expected);
			}
			let online = model.values().filter_map(|v| *v).collect::<std::collections::BTreeSet<_>>();
			prop_assert_eq!(reg.active_identities().len(), online.len());
		}
	}
}
