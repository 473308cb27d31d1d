#![forbid(unsafe_code)]

use std::sync::Arc;

use chatspace_domain::{ChatMessage, ConnectionId, DELETED_MESSAGE_TEXT, Identity, MessageId, UserId};
use chatspace_protocol::OutboundEvent;
use thiserror::Error;
use tracing::debug;

use crate::server::dispatcher::{BroadcastDispatcher, Targets};
use crate::server::registry::ConnectionRegistry;
use crate::server::store::{MessageStore, NewMessage, StoreError};

#[derive(Debug, Error)]
pub enum RelayError {
	#[error("connection {0} has not logged in")]
	UnauthenticatedSender(ConnectionId),

	#[error(transparent)]
	Store(#[from] StoreError),
}

/// Persists message events, then fans them out.
#[derive(Clone)]
pub struct MessageRelay {
	registry: ConnectionRegistry,
	dispatcher: BroadcastDispatcher,
	store: Arc<dyn MessageStore>,
}

impl std::fmt::Debug for MessageRelay {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("MessageRelay").finish_non_exhaustive()
	}
}

impl MessageRelay {
	pub fn new(registry: ConnectionRegistry, dispatcher: BroadcastDispatcher, store: Arc<dyn MessageStore>) -> Self {
		Self {
			registry,
			dispatcher,
			store,
		}
	}

	pub fn store(&self) -> &Arc<dyn MessageStore> {
		&self.store
	}

	pub async fn submit_new(
		&self,
		sender: ConnectionId,
		text: String,
		receiver_id: Option<UserId>,
	) -> Result<ChatMessage, RelayError> {
		let identity = self.sender_identity(sender)?;

		let record = self
			.store
			.create_message(NewMessage {
				sender_id: identity.user_id,
				sender_name: identity.display_name,
				text,
				receiver_id,
			})
			.await?;

		self.fan_out(OutboundEvent::NewMessage(record.clone()), &record);
		Ok(record)
	}

	/// The store rejects edits from anyone but the original sender.
	pub async fn submit_edit(&self, sender: ConnectionId, id: MessageId, text: String) -> Result<ChatMessage, RelayError> {
		let identity = self.sender_identity(sender)?;

		let record = self.store.update_message(&id, &identity.user_id, &text).await?;
		self.fan_out(OutboundEvent::MessageEdit(record.clone()), &record);
		Ok(record)
	}

	/// Soft delete: the text is replaced and the record goes out as an edit.
	pub async fn submit_delete(&self, sender: ConnectionId, id: MessageId) -> Result<ChatMessage, RelayError> {
		self.submit_edit(sender, id, DELETED_MESSAGE_TEXT.to_string()).await
	}

	/// Private records go to both parties' connections, everything else to all.
	pub fn targets_for(&self, record: &ChatMessage) -> Targets {
		let Some(receiver) = record.receiver_id.as_ref() else {
			return Targets::All;
		};

		let mut ids = self.registry.connections_for_user(&record.sender_id);
		ids.extend(self.registry.connections_for_user(receiver));
		ids.sort_unstable();
		ids.dedup();
		Targets::Connections(ids)
	}

	fn sender_identity(&self, sender: ConnectionId) -> Result<Identity, RelayError> {
		self.registry
			.identity_of(sender)
			.ok_or(RelayError::UnauthenticatedSender(sender))
	}

	fn fan_out(&self, event: OutboundEvent, record: &ChatMessage) {
		let targets = self.targets_for(record);
		let report = self.dispatcher.dispatch(&targets, &event);
		metrics::counter!("chatspace_server_messages_relayed_total").increment(1);
		debug!(
			event = event.kind(),
			message_id = %record.id,
			private = record.is_private(),
			delivered = report.delivered,
			"relayed message"
		);
	}
}
