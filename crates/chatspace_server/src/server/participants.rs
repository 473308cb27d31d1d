#![forbid(unsafe_code)]

use chatspace_domain::UserId;
use serde::Serialize;

use crate::server::registry::ConnectionRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
	pub user_id: UserId,
	pub name: String,
	pub is_active: bool,
}

/// Source of the "who is online" list served to clients.
pub trait ParticipantDirectory: Send + Sync {
	fn list_active_participants(&self) -> Vec<Participant>;
}

impl ParticipantDirectory for ConnectionRegistry {
	fn list_active_participants(&self) -> Vec<Participant> {
		self.active_identities()
			.into_iter()
			.map(|identity| Participant {
				user_id: identity.user_id,
				name: identity.display_name,
				is_active: true,
			})
			.collect()
	}
}
