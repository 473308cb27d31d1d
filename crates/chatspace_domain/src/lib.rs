#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sender id used for relay-authored announcements.
pub const SYSTEM_SENDER_ID: &str = "system";

/// Text a soft-deleted message is replaced with.
pub const DELETED_MESSAGE_TEXT: &str = "This message was deleted";

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// External user identity bound to a connection at login.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
	/// Create a non-empty `UserId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	/// The synthetic sender used for join/leave announcements.
	pub fn system() -> Self {
		Self(SYSTEM_SENDER_ID.to_string())
	}

	pub fn is_system(&self) -> bool {
		self.0 == SYSTEM_SENDER_ID
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for UserId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		UserId::new(s.to_string())
	}
}

/// Server-assigned identifier of one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
	pub const fn get(self) -> u64 {
		self.0
	}
}

impl fmt::Display for ConnectionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "conn-{}", self.0)
	}
}

/// Store-assigned message identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
	/// Create a non-empty message id.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	/// Id for a relay-authored announcement (never persisted).
	pub fn system(seq: u64) -> Self {
		Self(format!("{SYSTEM_SENDER_ID}-{seq}"))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl From<i64> for MessageId {
	fn from(id: i64) -> Self {
		Self(id.to_string())
	}
}

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for MessageId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		MessageId::new(s.to_string())
	}
}

/// Identity cached on a connection after login.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
	pub user_id: UserId,
	pub display_name: String,
}

impl Identity {
	pub fn new(user_id: UserId, display_name: impl Into<String>) -> Self {
		Self {
			user_id,
			display_name: display_name.into(),
		}
	}
}

/// A chat message as recorded by the message store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
	pub id: MessageId,
	pub sender_id: UserId,
	pub sender_name: String,
	pub text: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub receiver_id: Option<UserId>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

impl ChatMessage {
	/// Relay-authored group announcement.
	pub fn system(id: MessageId, sender_name: impl Into<String>, text: impl Into<String>, at: DateTime<Utc>) -> Self {
		Self {
			id,
			sender_id: UserId::system(),
			sender_name: sender_name.into(),
			text: text.into(),
			receiver_id: None,
			created_at: at,
			updated_at: at,
		}
	}

	/// Private messages carry a receiver; group messages do not.
	pub fn is_private(&self) -> bool {
		self.receiver_id.is_some()
	}

	/// True once the message has been edited or soft-deleted.
	pub fn is_edited(&self) -> bool {
		self.updated_at > self.created_at
	}

	pub fn is_deleted(&self) -> bool {
		self.is_edited() && self.text == DELETED_MESSAGE_TEXT
	}
}

/// Announcement text for a user joining.
pub fn joined_text(display_name: &str) -> String {
	format!("{display_name} joined the chat.")
}

/// Announcement text for a user leaving.
pub fn left_text(display_name: &str) -> String {
	format!("{display_name} left the chat.")
}
