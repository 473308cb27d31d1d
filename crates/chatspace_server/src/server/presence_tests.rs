#![forbid(unsafe_code)]

use chatspace_domain::{SYSTEM_SENDER_ID, UserId};
use chatspace_protocol::OutboundEvent;

use crate::server::presence::{Departure, LoginOutcome, SessionState};
use crate::server::state::RelayState;
use crate::server::test_support::{TestConn, ident, summarize};

#[test]
fn first_login_announces_join_then_system_message() {
	let state = RelayState::in_memory();
	let mut alice = TestConn::open(&state, 1);
	let mut watcher = TestConn::open(&state, 2);

	let outcome = state.presence.login(&mut alice.session, ident("alice", "Alice"));
	assert_eq!(outcome, LoginOutcome::Joined);
	assert_eq!(alice.session.state(), &SessionState::Authenticated(ident("alice", "Alice")));

	let expected = vec![
		"userLoggedIn:alice".to_string(),
		"newMessage:Alice joined the chat.".to_string(),
	];
	// Self-echo: the joining connection sees its own announcement.
	assert_eq!(summarize(&alice.drain()), expected);

	let events = watcher.drain();
	assert_eq!(summarize(&events), expected);
	match &events[0] {
		OutboundEvent::UserLoggedIn { name, .. } => assert_eq!(name, "Alice"),
		other => panic!("expected userLoggedIn, got {other:?}"),
	}
	match &events[1] {
		OutboundEvent::NewMessage(m) => {
			assert!(m.sender_id.is_system());
			assert_eq!(m.sender_name, SYSTEM_SENDER_ID);
			assert!(m.receiver_id.is_none());
		}
		other => panic!("expected newMessage, got {other:?}"),
	}
}

#[test]
fn system_messages_get_distinct_ids() {
	let state = RelayState::in_memory();
	let mut alice = TestConn::open(&state, 1);
	let mut bob = TestConn::open(&state, 2);

	state.presence.login(&mut alice.session, ident("alice", "Alice"));
	state.presence.login(&mut bob.session, ident("bob", "Bob"));

	let ids: Vec<String> = alice
		.drain()
		.iter()
		.filter_map(OutboundEvent::message)
		.map(|m| m.id.to_string())
		.collect();
	assert_eq!(ids.len(), 2);
	assert_ne!(ids[0], ids[1]);
}

#[test]
fn second_tab_joins_without_hiding_first_and_logout_waits_for_last_tab() {
	let state = RelayState::in_memory();
	let mut tab1 = TestConn::open(&state, 1);
	let mut tab2 = TestConn::open(&state, 2);
	let mut bob = TestConn::open(&state, 3);

	state.presence.login(&mut tab1.session, ident("alice", "Alice"));
	state.presence.login(&mut tab2.session, ident("alice", "Alice"));
	bob.drain();

	let departure = state.presence.disconnect(&mut tab1.session);
	assert_eq!(
		departure,
		Departure::Suppressed {
			identity: ident("alice", "Alice"),
			remaining: 1
		}
	);
	assert!(bob.drain().is_empty(), "closing one of two tabs must not announce departure");
	assert_eq!(state.registry.active_identities(), vec![ident("alice", "Alice")]);

	let departure = state.presence.disconnect(&mut tab2.session);
	assert_eq!(departure, Departure::Announced(ident("alice", "Alice")));
	assert_eq!(
		summarize(&bob.drain()),
		vec![
			"userLoggedOut:alice".to_string(),
			"newMessage:Alice left the chat.".to_string()
		]
	);
	assert!(state.registry.active_identities().is_empty());
}

#[test]
fn relogin_on_same_connection_is_silent() {
	let state = RelayState::in_memory();
	let mut alice = TestConn::open(&state, 1);
	let mut bob = TestConn::open(&state, 2);

	state.presence.login(&mut alice.session, ident("alice", "Alice"));
	bob.drain();

	let outcome = state.presence.login(&mut alice.session, ident("alice", "Alice B."));
	assert_eq!(outcome, LoginOutcome::Rebound);
	assert!(bob.drain().is_empty());
	assert_eq!(state.registry.identity_of(alice.id()), Some(ident("alice", "Alice B.")));
}

#[test]
fn switching_user_announces_departure_and_join() {
	let state = RelayState::in_memory();
	let mut conn = TestConn::open(&state, 1);
	let mut watcher = TestConn::open(&state, 2);

	state.presence.login(&mut conn.session, ident("alice", "Alice"));
	watcher.drain();

	let outcome = state.presence.login(&mut conn.session, ident("bob", "Bob"));
	assert_eq!(
		outcome,
		LoginOutcome::Switched {
			previous: ident("alice", "Alice")
		}
	);
	assert_eq!(
		summarize(&watcher.drain()),
		vec![
			"userLoggedOut:alice".to_string(),
			"newMessage:Alice left the chat.".to_string(),
			"userLoggedIn:bob".to_string(),
			"newMessage:Bob joined the chat.".to_string(),
		]
	);
	assert!(
		state
			.registry
			.connections_for_user(&UserId::new("alice").expect("valid UserId"))
			.is_empty()
	);
}

#[test]
fn logout_then_disconnect_announces_once() {
	let state = RelayState::in_memory();
	let mut alice = TestConn::open(&state, 1);
	let mut bob = TestConn::open(&state, 2);

	state.presence.login(&mut alice.session, ident("alice", "Alice"));
	bob.drain();

	assert_eq!(
		state.presence.logout(&mut alice.session),
		Departure::Announced(ident("alice", "Alice"))
	);
	assert!(alice.session.is_closed());
	assert_eq!(state.presence.disconnect(&mut alice.session), Departure::AlreadyRemoved);

	let events = bob.drain();
	assert_eq!(summarize(&events).len(), 2);
	assert!(state.registry.identity_of(alice.id()).is_none());
	assert_eq!(state.registry.len(), 1);
}

#[test]
fn anonymous_disconnect_is_silent() {
	let state = RelayState::in_memory();
	let mut anon = TestConn::open(&state, 1);
	let mut bob = TestConn::open(&state, 2);

	assert_eq!(state.presence.disconnect(&mut anon.session), Departure::Anonymous);
	assert!(bob.drain().is_empty());
}

#[test]
fn login_after_close_is_rejected() {
	let state = RelayState::in_memory();
	let mut conn = TestConn::open(&state, 1);
	state.presence.disconnect(&mut conn.session);

	let outcome = state.presence.login(&mut conn.session, ident("alice", "Alice"));
	assert_eq!(outcome, LoginOutcome::Rejected);
	assert!(state.registry.active_identities().is_empty());
}

#[test]
fn racing_last_tab_close_and_new_tab_login_leaves_user_online() {
	let alice = UserId::new("alice").expect("valid UserId");

	for round in 0..2_000 {
		let state = RelayState::in_memory();
		let mut watcher = TestConn::open(&state, 1);
		let mut tab1 = TestConn::open(&state, 2);
		let mut tab3 = TestConn::open(&state, 3);
		state.presence.login(&mut tab1.session, ident("alice", "Alice"));
		watcher.drain();

		let presence = &state.presence;
		let (closing, joining) = (&mut tab1.session, &mut tab3.session);
		std::thread::scope(|s| {
			s.spawn(move || presence.disconnect(closing));
			s.spawn(move || presence.login(joining, ident("alice", "Alice")));
		});

		assert_eq!(state.registry.connections_for_user(&alice), vec![tab3.id()]);

		let last_presence = watcher
			.drain()
			.into_iter()
			.rev()
			.find(|ev| matches!(ev, OutboundEvent::UserLoggedIn { .. } | OutboundEvent::UserLoggedOut { .. }));
		assert!(
			matches!(last_presence, Some(OutboundEvent::UserLoggedIn { ref user_id, .. }) if *user_id == alice),
			"round {round}: watcher last saw {last_presence:?} while alice is online"
		);
	}
}
