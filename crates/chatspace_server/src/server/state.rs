#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Context as _;

use crate::config::{PersistenceSettings, RelaySettings};
use crate::server::dispatcher::BroadcastDispatcher;
use crate::server::presence::PresenceManager;
use crate::server::registry::ConnectionRegistry;
use crate::server::relay::MessageRelay;
use crate::server::store::{InMemoryMessageStore, MessageStore, PersistentMessageStore};

/// Services shared by every connection task of one relay instance.
#[derive(Debug, Clone)]
pub struct RelayState {
	pub registry: ConnectionRegistry,
	pub dispatcher: BroadcastDispatcher,
	pub presence: PresenceManager,
	pub relay: MessageRelay,
}

impl RelayState {
	pub fn new(store: Arc<dyn MessageStore>, settings: &RelaySettings) -> Self {
		let registry = ConnectionRegistry::new();
		let dispatcher = BroadcastDispatcher::new(registry.clone()).with_debug_logs(settings.debug_logs);
		let presence = PresenceManager::new(registry.clone(), dispatcher.clone(), settings.system_sender_name.clone());
		let relay = MessageRelay::new(registry.clone(), dispatcher.clone(), store);

		Self {
			registry,
			dispatcher,
			presence,
			relay,
		}
	}

	/// Relay backed by the in-memory store.
	pub fn in_memory() -> Self {
		Self::new(Arc::new(InMemoryMessageStore::default()), &RelaySettings::default())
	}
}

/// Pick the message store backend from persistence settings.
pub async fn open_message_store(settings: &PersistenceSettings) -> anyhow::Result<Arc<dyn MessageStore>> {
	if !settings.enabled {
		return Ok(Arc::new(InMemoryMessageStore::default()));
	}

	let Some(database_url) = settings.database_url.as_deref() else {
		return Err(anyhow::anyhow!("persistence enabled but no database_url configured"));
	};

	let store = PersistentMessageStore::connect(database_url)
		.await
		.context("open message store")?;
	Ok(Arc::new(store))
}
