#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chatspace_domain::{ConnectionId, Identity, UserId};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::{Notify, mpsc};
use tokio_tungstenite::tungstenite::Message;

/// Sending half of a connection's outbound queue.
pub type FrameSender = mpsc::Sender<Message>;

/// Raised when a connection's outbound queue overflows; the connection task
/// closes the socket so the client reconnects and logs in again.
#[derive(Debug, Clone, Default)]
pub struct OverflowSignal(Arc<Notify>);

impl OverflowSignal {
	fn raise(&self) {
		self.0.notify_one();
	}

	/// Completes once the queue has overflowed, including before this call.
	pub async fn raised(&self) {
		self.0.notified().await;
	}
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
	#[error("connection {0} is already registered")]
	DuplicateConnection(ConnectionId),

	#[error("connection {0} is not registered")]
	UnknownConnection(ConnectionId),
}

/// Read-only view of a registered connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEntry {
	pub connection_id: ConnectionId,
	pub identity: Option<Identity>,
	pub connected_at: DateTime<Utc>,
}

impl ConnectionEntry {
	pub fn user_id(&self) -> Option<&UserId> {
		self.identity.as_ref().map(|i| &i.user_id)
	}
}

/// Result of binding an identity to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
	/// Identity the connection carried before this bind.
	pub previous: Option<Identity>,
	/// Connections still bound to the previous user after the bind.
	pub previous_remaining: usize,
}

/// Result of removing a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removal {
	pub entry: ConnectionEntry,
	/// Connections still bound to the same user after removal.
	pub remaining_for_user: usize,
}

impl Removal {
	/// True when the removed connection was the user's last one.
	pub fn was_last_for_user(&self) -> bool {
		self.entry.identity.is_some() && self.remaining_for_user == 0
	}
}

/// Outcome of handing a frame to one connection's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
	Delivered,
	/// Queue full; the frame was dropped and the connection told to close.
	Dropped,
	/// Writer already gone.
	Closed,
	Unknown,
}

/// Aggregate of a fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
	pub delivered: usize,
	pub dropped: usize,
	pub closed: usize,
	pub unknown: usize,
}

impl DeliveryReport {
	fn record(&mut self, outcome: Delivery) {
		match outcome {
			Delivery::Delivered => self.delivered += 1,
			Delivery::Dropped => self.dropped += 1,
			Delivery::Closed => self.closed += 1,
			Delivery::Unknown => self.unknown += 1,
		}
	}

	pub fn attempted(&self) -> usize {
		self.delivered + self.dropped + self.closed + self.unknown
	}
}

/// Live connections and the identities bound to them.
///
/// The registry owns every outbound queue sender and never hands one out.
/// All operations are synchronous and tolerate missing entries.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
	inner: Arc<RwLock<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
	slots: HashMap<ConnectionId, Slot>,
	by_user: HashMap<UserId, BTreeSet<ConnectionId>>,
	bind_seq: u64,
}

#[derive(Debug)]
struct Slot {
	tx: FrameSender,
	overflow: OverflowSignal,
	identity: Option<Identity>,
	connected_at: DateTime<Utc>,
	/// Sequence of the bind that attached the current user.
	bound_seq: u64,
	/// Sequence of the most recent bind, including same-user re-binds.
	named_seq: u64,
}

impl Slot {
	fn entry(&self, connection_id: ConnectionId) -> ConnectionEntry {
		ConnectionEntry {
			connection_id,
			identity: self.identity.clone(),
			connected_at: self.connected_at,
		}
	}
}

impl Inner {
	fn detach_user(&mut self, user_id: &UserId, conn_id: ConnectionId) -> usize {
		let Some(set) = self.by_user.get_mut(user_id) else {
			return 0;
		};
		set.remove(&conn_id);
		let remaining = set.len();
		if remaining == 0 {
			self.by_user.remove(user_id);
		}
		remaining
	}

	fn deliver(&self, conn_id: ConnectionId, frame: &Message) -> Delivery {
		let Some(slot) = self.slots.get(&conn_id) else {
			return Delivery::Unknown;
		};
		match slot.tx.try_send(frame.clone()) {
			Ok(()) => Delivery::Delivered,
			Err(mpsc::error::TrySendError::Full(_)) => {
				slot.overflow.raise();
				Delivery::Dropped
			}
			Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
		}
	}
}

impl ConnectionRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Add a connection in the pending-identity state.
	pub fn register(&self, conn_id: ConnectionId, tx: FrameSender) -> Result<OverflowSignal, RegistryError> {
		let mut inner = self.inner.write();
		if inner.slots.contains_key(&conn_id) {
			return Err(RegistryError::DuplicateConnection(conn_id));
		}
		let overflow = OverflowSignal::default();
		inner.slots.insert(
			conn_id,
			Slot {
				tx,
				overflow: overflow.clone(),
				identity: None,
				connected_at: Utc::now(),
				bound_seq: 0,
				named_seq: 0,
			},
		);
		Ok(overflow)
	}

	/// Bind (or re-bind) an identity to a registered connection.
	pub fn bind_identity(&self, conn_id: ConnectionId, identity: Identity) -> Result<Binding, RegistryError> {
		let mut guard = self.inner.write();
		let inner = &mut *guard;

		inner.bind_seq += 1;
		let seq = inner.bind_seq;

		let Some(slot) = inner.slots.get_mut(&conn_id) else {
			return Err(RegistryError::UnknownConnection(conn_id));
		};

		let previous = slot.identity.replace(identity.clone());
		let same_user = previous.as_ref().is_some_and(|p| p.user_id == identity.user_id);
		if !same_user {
			slot.bound_seq = seq;
		}
		slot.named_seq = seq;

		let previous_remaining = match previous.as_ref() {
			Some(prev) if !same_user => inner.detach_user(&prev.user_id, conn_id),
			Some(prev) => inner.by_user.get(&prev.user_id).map_or(0, BTreeSet::len),
			None => 0,
		};

		inner.by_user.entry(identity.user_id).or_default().insert(conn_id);

		Ok(Binding {
			previous,
			previous_remaining,
		})
	}

	/// Remove a connection; `None` if it was already gone.
	pub fn unregister(&self, conn_id: ConnectionId) -> Option<Removal> {
		let mut inner = self.inner.write();
		let slot = inner.slots.remove(&conn_id)?;

		let remaining_for_user = match slot.identity.as_ref() {
			Some(identity) => inner.detach_user(&identity.user_id, conn_id),
			None => 0,
		};

		Some(Removal {
			entry: slot.entry(conn_id),
			remaining_for_user,
		})
	}

	pub fn identity_of(&self, conn_id: ConnectionId) -> Option<Identity> {
		self.inner.read().slots.get(&conn_id).and_then(|s| s.identity.clone())
	}

	/// Every open connection bound to `user_id`, in ascending id order.
	pub fn connections_for_user(&self, user_id: &UserId) -> Vec<ConnectionId> {
		self.inner
			.read()
			.by_user
			.get(user_id)
			.map(|set| set.iter().copied().collect())
			.unwrap_or_default()
	}

	/// Snapshot of all connections, bound or not, in ascending id order.
	pub fn all_connections(&self) -> Vec<ConnectionEntry> {
		let inner = self.inner.read();
		let mut out: Vec<ConnectionEntry> = inner.slots.iter().map(|(id, slot)| slot.entry(*id)).collect();
		out.sort_by_key(|e| e.connection_id);
		out
	}

	pub fn len(&self) -> usize {
		self.inner.read().slots.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Distinct bound identities, ordered by when the user first came online.
	///
	/// The display name is the one from the user's most recent login.
	pub fn active_identities(&self) -> Vec<Identity> {
		let inner = self.inner.read();
		let mut users: Vec<(u64, Identity)> = Vec::with_capacity(inner.by_user.len());

		for conns in inner.by_user.values() {
			let slots = conns.iter().filter_map(|id| inner.slots.get(id));
			let mut first_seen = u64::MAX;
			let mut latest: Option<(u64, &Identity)> = None;
			for slot in slots {
				let Some(identity) = slot.identity.as_ref() else {
					continue;
				};
				first_seen = first_seen.min(slot.bound_seq);
				if latest.is_none_or(|(seq, _)| slot.named_seq >= seq) {
					latest = Some((slot.named_seq, identity));
				}
			}
			if let Some((_, identity)) = latest {
				users.push((first_seen, identity.clone()));
			}
		}

		users.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.user_id.cmp(&b.1.user_id)));
		users.into_iter().map(|(_, identity)| identity).collect()
	}

	/// Hand a frame to one connection's queue without waiting.
	pub fn deliver(&self, conn_id: ConnectionId, frame: &Message) -> Delivery {
		self.inner.read().deliver(conn_id, frame)
	}

	/// Hand a frame to each listed connection.
	pub fn deliver_many(&self, targets: &[ConnectionId], frame: &Message) -> DeliveryReport {
		let inner = self.inner.read();
		let mut report = DeliveryReport::default();
		for conn_id in targets {
			report.record(inner.deliver(*conn_id, frame));
		}
		report
	}

	/// Hand a frame to every connection registered at this instant.
	pub fn deliver_all(&self, frame: &Message) -> DeliveryReport {
		let inner = self.inner.read();
		let mut report = DeliveryReport::default();
		for conn_id in inner.slots.keys() {
			report.record(inner.deliver(*conn_id, frame));
		}
		report
	}
}
