#![forbid(unsafe_code)]

use chatspace_domain::{ChatMessage, MessageId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::event_type;

/// Default maximum size of a single text frame.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024; // 64 KiB

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
	#[error("malformed json: {0}")]
	MalformedJson(String),

	#[error("frame has no string `type` field")]
	MissingType,

	#[error("unknown event type: {0}")]
	UnknownType(String),

	#[error("invalid `{event}` payload: {reason}")]
	InvalidPayload {
		event: String,
		reason: String,
	},
}

impl DecodeError {
	/// Short label used for metrics and logs.
	pub fn kind(&self) -> &'static str {
		match self {
			DecodeError::MalformedJson(_) => "malformed_json",
			DecodeError::MissingType => "missing_type",
			DecodeError::UnknownType(_) => "unknown_type",
			DecodeError::InvalidPayload { .. } => "invalid_payload",
		}
	}

	fn invalid(event: &str, reason: impl Into<String>) -> Self {
		DecodeError::InvalidPayload {
			event: event.to_string(),
			reason: reason.into(),
		}
	}
}

/// Events a client sends to the relay.
///
/// Sender fields on message events are informational: the relay attributes
/// messages to the identity bound on the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum InboundEvent {
	#[serde(rename = "login", rename_all = "camelCase")]
	Login {
		user_id: UserId,
		name: String,
		#[serde(skip_serializing_if = "Option::is_none")]
		created_at: Option<DateTime<Utc>>,
		#[serde(skip_serializing_if = "Option::is_none")]
		updated_at: Option<DateTime<Utc>>,
	},

	#[serde(rename = "message:new", rename_all = "camelCase")]
	NewMessage {
		#[serde(skip_serializing_if = "Option::is_none")]
		sender_id: Option<UserId>,
		#[serde(skip_serializing_if = "Option::is_none")]
		sender_name: Option<String>,
		text: String,
		#[serde(skip_serializing_if = "Option::is_none")]
		receiver_id: Option<UserId>,
	},

	#[serde(rename = "message:edit", rename_all = "camelCase")]
	EditMessage {
		id: MessageId,
		#[serde(skip_serializing_if = "Option::is_none")]
		sender_id: Option<UserId>,
		#[serde(skip_serializing_if = "Option::is_none")]
		sender_name: Option<String>,
		text: String,
		#[serde(skip_serializing_if = "Option::is_none")]
		created_at: Option<DateTime<Utc>>,
		#[serde(skip_serializing_if = "Option::is_none")]
		updated_at: Option<DateTime<Utc>>,
	},

	#[serde(rename = "message:delete", rename_all = "camelCase")]
	DeleteMessage {
		id: MessageId,
		#[serde(skip_serializing_if = "Option::is_none")]
		sender_id: Option<UserId>,
	},

	#[serde(rename = "logout", rename_all = "camelCase")]
	Logout {
		#[serde(skip_serializing_if = "Option::is_none")]
		user_id: Option<UserId>,
		#[serde(skip_serializing_if = "Option::is_none")]
		name: Option<String>,
	},
}

impl InboundEvent {
	pub fn kind(&self) -> &'static str {
		match self {
			InboundEvent::Login { .. } => event_type::LOGIN,
			InboundEvent::NewMessage { .. } => event_type::MESSAGE_NEW,
			InboundEvent::EditMessage { .. } => event_type::MESSAGE_EDIT,
			InboundEvent::DeleteMessage { .. } => event_type::MESSAGE_DELETE,
			InboundEvent::Logout { .. } => event_type::LOGOUT,
		}
	}
}

/// Events the relay fans out to connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutboundEvent {
	#[serde(rename = "userLoggedIn", rename_all = "camelCase")]
	UserLoggedIn {
		user_id: UserId,
		#[serde(alias = "userName")]
		name: String,
		joined_at: DateTime<Utc>,
	},

	#[serde(rename = "userLoggedOut", rename_all = "camelCase")]
	UserLoggedOut {
		user_id: UserId,
		#[serde(alias = "userName")]
		name: String,
	},

	#[serde(rename = "newMessage")]
	NewMessage(ChatMessage),

	/// Edits and soft deletes share this shape.
	#[serde(rename = "message:edit")]
	MessageEdit(ChatMessage),
}

impl OutboundEvent {
	pub fn kind(&self) -> &'static str {
		match self {
			OutboundEvent::UserLoggedIn { .. } => event_type::USER_LOGGED_IN,
			OutboundEvent::UserLoggedOut { .. } => event_type::USER_LOGGED_OUT,
			OutboundEvent::NewMessage(_) => event_type::NEW_MESSAGE,
			OutboundEvent::MessageEdit(_) => event_type::MESSAGE_EDIT,
		}
	}

	pub fn message(&self) -> Option<&ChatMessage> {
		match self {
			OutboundEvent::NewMessage(msg) | OutboundEvent::MessageEdit(msg) => Some(msg),
			_ => None,
		}
	}
}

/// Ids arrive as strings from most clients and as integers from database-backed ones.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireId {
	Text(String),
	Number(i64),
}

impl WireId {
	fn into_string(self) -> String {
		match self {
			WireId::Text(s) => s,
			WireId::Number(n) => n.to_string(),
		}
	}
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginWire {
	user_id: Option<WireId>,
	#[serde(alias = "userName")]
	name: Option<String>,
	#[serde(default)]
	created_at: Option<DateTime<Utc>>,
	#[serde(default)]
	updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewMessageWire {
	sender_id: Option<WireId>,
	#[serde(alias = "userName")]
	sender_name: Option<String>,
	text: Option<String>,
	receiver_id: Option<WireId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EditMessageWire {
	id: Option<WireId>,
	sender_id: Option<WireId>,
	#[serde(alias = "userName")]
	sender_name: Option<String>,
	text: Option<String>,
	#[serde(default)]
	created_at: Option<DateTime<Utc>>,
	#[serde(default)]
	updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteMessageWire {
	id: Option<WireId>,
	sender_id: Option<WireId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogoutWire {
	user_id: Option<WireId>,
	#[serde(alias = "userName")]
	name: Option<String>,
}

/// Decode a client frame. Fields may sit at the top level or inside a `data` object.
pub fn decode_inbound(raw: impl AsRef<[u8]>) -> Result<InboundEvent, DecodeError> {
	let (kind, payload) = split_envelope(raw.as_ref())?;

	match kind.as_str() {
		event_type::LOGIN => {
			let wire: LoginWire = payload_as(event_type::LOGIN, payload)?;
			let name = required_text(event_type::LOGIN, "name", wire.name)?;
			let user_id = required_user(event_type::LOGIN, "userId", wire.user_id)?;
			if user_id.is_system() {
				return Err(DecodeError::invalid(event_type::LOGIN, "`userId` is reserved"));
			}
			Ok(InboundEvent::Login {
				user_id,
				name,
				created_at: wire.created_at,
				updated_at: wire.updated_at,
			})
		}
		event_type::MESSAGE_NEW => {
			let wire: NewMessageWire = payload_as(event_type::MESSAGE_NEW, payload)?;
			Ok(InboundEvent::NewMessage {
				sender_id: optional_user(event_type::MESSAGE_NEW, "senderId", wire.sender_id)?,
				sender_name: wire.sender_name,
				text: wire
					.text
					.ok_or_else(|| DecodeError::invalid(event_type::MESSAGE_NEW, "missing field `text`"))?,
				receiver_id: optional_user(event_type::MESSAGE_NEW, "receiverId", wire.receiver_id)?,
			})
		}
		event_type::MESSAGE_EDIT => {
			let wire: EditMessageWire = payload_as(event_type::MESSAGE_EDIT, payload)?;
			Ok(InboundEvent::EditMessage {
				id: required_message_id(event_type::MESSAGE_EDIT, wire.id)?,
				sender_id: optional_user(event_type::MESSAGE_EDIT, "senderId", wire.sender_id)?,
				sender_name: wire.sender_name,
				text: wire
					.text
					.ok_or_else(|| DecodeError::invalid(event_type::MESSAGE_EDIT, "missing field `text`"))?,
				created_at: wire.created_at,
				updated_at: wire.updated_at,
			})
		}
		event_type::MESSAGE_DELETE => {
			let wire: DeleteMessageWire = payload_as(event_type::MESSAGE_DELETE, payload)?;
			Ok(InboundEvent::DeleteMessage {
				id: required_message_id(event_type::MESSAGE_DELETE, wire.id)?,
				sender_id: optional_user(event_type::MESSAGE_DELETE, "senderId", wire.sender_id)?,
			})
		}
		event_type::LOGOUT => {
			let wire: LogoutWire = payload_as(event_type::LOGOUT, payload)?;
			Ok(InboundEvent::Logout {
				user_id: optional_user(event_type::LOGOUT, "userId", wire.user_id)?,
				name: wire.name,
			})
		}
		other => Err(DecodeError::UnknownType(other.to_string())),
	}
}

/// Decode a relay frame on the client side.
pub fn decode_outbound(raw: impl AsRef<[u8]>) -> Result<OutboundEvent, DecodeError> {
	let value: Value = serde_json::from_slice(raw.as_ref()).map_err(|e| DecodeError::MalformedJson(e.to_string()))?;

	let kind = match value.get("type") {
		Some(Value::String(kind)) => kind.clone(),
		_ => return Err(DecodeError::MissingType),
	};
	if !event_type::OUTBOUND.contains(&kind.as_str()) {
		return Err(DecodeError::UnknownType(kind));
	}

	serde_json::from_value(value).map_err(|e| DecodeError::invalid(&kind, e.to_string()))
}

/// Serialize an outbound event with its fields at the top level.
pub fn encode_outbound(event: &OutboundEvent) -> String {
	serde_json::to_string(event).expect("outbound events always serialize")
}

/// Serialize a client event with its fields at the top level.
pub fn encode_inbound(event: &InboundEvent) -> String {
	serde_json::to_string(event).expect("inbound events always serialize")
}

/// Build a `{type, ...}` frame from an arbitrary payload.
///
/// Object payloads are flattened next to `type`; anything else is carried under `data`.
pub fn encode_envelope(kind: &str, payload: Value) -> String {
	let mut obj = Map::new();
	obj.insert("type".to_string(), Value::String(kind.to_string()));
	match payload {
		Value::Object(fields) => {
			for (k, v) in fields {
				if k != "type" {
					obj.insert(k, v);
				}
			}
		}
		Value::Null => {}
		other => {
			obj.insert("data".to_string(), other);
		}
	}
	Value::Object(obj).to_string()
}

fn split_envelope(raw: &[u8]) -> Result<(String, Value), DecodeError> {
	let value: Value = serde_json::from_slice(raw).map_err(|e| DecodeError::MalformedJson(e.to_string()))?;
	let Value::Object(mut obj) = value else {
		return Err(DecodeError::MissingType);
	};

	let kind = match obj.remove("type") {
		Some(Value::String(kind)) => kind,
		_ => return Err(DecodeError::MissingType),
	};

	let payload = match obj.remove("data") {
		Some(Value::Object(data)) => Value::Object(data),
		Some(other) => {
			obj.insert("data".to_string(), other);
			Value::Object(obj)
		}
		None => Value::Object(obj),
	};

	Ok((kind, payload))
}

fn payload_as<T: for<'de> Deserialize<'de>>(event: &str, payload: Value) -> Result<T, DecodeError> {
	serde_json::from_value(payload).map_err(|e| DecodeError::invalid(event, e.to_string()))
}

fn required_text(event: &str, field: &str, value: Option<String>) -> Result<String, DecodeError> {
	match value {
		Some(v) if !v.trim().is_empty() => Ok(v),
		Some(_) => Err(DecodeError::invalid(event, format!("empty field `{field}`"))),
		None => Err(DecodeError::invalid(event, format!("missing field `{field}`"))),
	}
}

fn required_user(event: &str, field: &str, value: Option<WireId>) -> Result<UserId, DecodeError> {
	optional_user(event, field, value)?.ok_or_else(|| DecodeError::invalid(event, format!("missing field `{field}`")))
}

fn optional_user(event: &str, field: &str, value: Option<WireId>) -> Result<Option<UserId>, DecodeError> {
	value
		.map(|id| UserId::new(id.into_string()).map_err(|e| DecodeError::invalid(event, format!("`{field}`: {e}"))))
		.transpose()
}

fn required_message_id(event: &str, value: Option<WireId>) -> Result<MessageId, DecodeError> {
	let id = value.ok_or_else(|| DecodeError::invalid(event, "missing field `id`"))?;
	MessageId::new(id.into_string()).map_err(|e| DecodeError::invalid(event, format!("`id`: {e}")))
}
