#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chatspace_domain::{ChatMessage, ConnectionId, Identity, MessageId, SYSTEM_SENDER_ID, joined_text, left_text};
use chatspace_protocol::OutboundEvent;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::server::dispatcher::BroadcastDispatcher;
use crate::server::registry::ConnectionRegistry;

/// Lifecycle of one connection as seen by presence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
	Unauthenticated,
	Authenticated(Identity),
	/// Terminal.
	Closed,
}

/// Presence state owned by a connection task.
#[derive(Debug)]
pub struct Session {
	conn_id: ConnectionId,
	state: SessionState,
}

impl Session {
	pub fn new(conn_id: ConnectionId) -> Self {
		Self {
			conn_id,
			state: SessionState::Unauthenticated,
		}
	}

	pub fn conn_id(&self) -> ConnectionId {
		self.conn_id
	}

	pub fn state(&self) -> &SessionState {
		&self.state
	}

	pub fn identity(&self) -> Option<&Identity> {
		match &self.state {
			SessionState::Authenticated(identity) => Some(identity),
			_ => None,
		}
	}

	pub fn is_closed(&self) -> bool {
		self.state == SessionState::Closed
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
	/// First login on this connection; join announced.
	Joined,
	/// Same user logged in again; display name refreshed, nothing announced.
	Rebound,
	/// A different user took over the connection.
	Switched { previous: Identity },
	/// Session closed or connection already gone.
	Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Departure {
	/// Last connection for the user; departure announced.
	Announced(Identity),
	/// Other connections for the user remain open.
	Suppressed { identity: Identity, remaining: usize },
	/// Connection never logged in.
	Anonymous,
	AlreadyRemoved,
}

/// Applies login/logout to the registry and derives presence broadcasts.
///
/// Each transition holds `transitions` from the registry change through its
/// broadcast, so every connection sees presence events in the order the
/// registry applied them.
#[derive(Debug, Clone)]
pub struct PresenceManager {
	registry: ConnectionRegistry,
	dispatcher: BroadcastDispatcher,
	system_sender_name: Arc<str>,
	system_seq: Arc<AtomicU64>,
	transitions: Arc<Mutex<()>>,
}

impl PresenceManager {
	pub fn new(registry: ConnectionRegistry, dispatcher: BroadcastDispatcher, system_sender_name: impl Into<String>) -> Self {
		let name: String = system_sender_name.into();
		let name = if name.trim().is_empty() {
			SYSTEM_SENDER_ID.to_string()
		} else {
			name
		};
		Self {
			registry,
			dispatcher,
			system_sender_name: Arc::from(name),
			system_seq: Arc::new(AtomicU64::new(1)),
			transitions: Arc::new(Mutex::new(())),
		}
	}

	pub fn login(&self, session: &mut Session, identity: Identity) -> LoginOutcome {
		if session.is_closed() {
			warn!(conn_id = %session.conn_id, "login on closed session ignored");
			return LoginOutcome::Rejected;
		}

		let _transition = self.transitions.lock();
		let binding = match self.registry.bind_identity(session.conn_id, identity.clone()) {
			Ok(binding) => binding,
			Err(e) => {
				debug!(conn_id = %session.conn_id, error = %e, "login raced with disconnect");
				return LoginOutcome::Rejected;
			}
		};

		session.state = SessionState::Authenticated(identity.clone());

		match binding.previous {
			Some(previous) if previous.user_id == identity.user_id => {
				debug!(
					conn_id = %session.conn_id,
					user_id = %identity.user_id,
					name = %identity.display_name,
					"re-login for same user; broadcast suppressed"
				);
				LoginOutcome::Rebound
			}
			Some(previous) => {
				info!(
					conn_id = %session.conn_id,
					from = %previous.user_id,
					to = %identity.user_id,
					"connection switched user"
				);
				if binding.previous_remaining == 0 {
					self.announce_departure(&previous);
				}
				self.announce_join(&identity);
				LoginOutcome::Switched { previous }
			}
			None => {
				info!(conn_id = %session.conn_id, user_id = %identity.user_id, name = %identity.display_name, "user logged in");
				self.announce_join(&identity);
				LoginOutcome::Joined
			}
		}
	}

	/// Explicit logout; the caller closes the socket afterwards.
	pub fn logout(&self, session: &mut Session) -> Departure {
		self.depart(session, "logout")
	}

	/// Socket closed or failed; safe to call after `logout`.
	pub fn disconnect(&self, session: &mut Session) -> Departure {
		self.depart(session, "disconnect")
	}

	fn depart(&self, session: &mut Session, reason: &'static str) -> Departure {
		session.state = SessionState::Closed;

		let _transition = self.transitions.lock();
		let Some(removal) = self.registry.unregister(session.conn_id) else {
			return Departure::AlreadyRemoved;
		};

		let Some(identity) = removal.entry.identity else {
			debug!(conn_id = %session.conn_id, reason, "anonymous connection removed");
			return Departure::Anonymous;
		};

		if removal.remaining_for_user > 0 {
			debug!(
				conn_id = %session.conn_id,
				user_id = %identity.user_id,
				remaining = removal.remaining_for_user,
				reason,
				"user still online on other connections"
			);
			return Departure::Suppressed {
				identity,
				remaining: removal.remaining_for_user,
			};
		}

		info!(conn_id = %session.conn_id, user_id = %identity.user_id, reason, "user went offline");
		self.announce_departure(&identity);
		Departure::Announced(identity)
	}

	fn announce_join(&self, identity: &Identity) {
		let now = Utc::now();
		self.dispatcher.dispatch_all(&OutboundEvent::UserLoggedIn {
			user_id: identity.user_id.clone(),
			name: identity.display_name.clone(),
			joined_at: now,
		});
		self.dispatcher.dispatch_all(&OutboundEvent::NewMessage(self.system_message(
			joined_text(&identity.display_name),
		)));
	}

	fn announce_departure(&self, identity: &Identity) {
		self.dispatcher.dispatch_all(&OutboundEvent::UserLoggedOut {
			user_id: identity.user_id.clone(),
			name: identity.display_name.clone(),
		});
		self.dispatcher.dispatch_all(&OutboundEvent::NewMessage(self.system_message(
			left_text(&identity.display_name),
		)));
	}

	fn system_message(&self, text: String) -> ChatMessage {
		let seq = self.system_seq.fetch_add(1, Ordering::Relaxed);
		ChatMessage::system(MessageId::system(seq), self.system_sender_name.as_ref(), text, Utc::now())
	}
}
