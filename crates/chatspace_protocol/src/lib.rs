#![forbid(unsafe_code)]

pub mod codec;

pub use codec::{
	DEFAULT_MAX_FRAME_BYTES, DecodeError, InboundEvent, OutboundEvent, decode_inbound, decode_outbound, encode_envelope,
	encode_inbound, encode_outbound,
};

/// Wire names of every event type the relay understands.
pub mod event_type {
	pub const LOGIN: &str = "login";
	pub const LOGOUT: &str = "logout";
	pub const MESSAGE_NEW: &str = "message:new";
	pub const MESSAGE_EDIT: &str = "message:edit";
	pub const MESSAGE_DELETE: &str = "message:delete";

	pub const USER_LOGGED_IN: &str = "userLoggedIn";
	pub const USER_LOGGED_OUT: &str = "userLoggedOut";
	pub const NEW_MESSAGE: &str = "newMessage";

	/// Types a client may send.
	pub const INBOUND: &[&str] = &[LOGIN, LOGOUT, MESSAGE_NEW, MESSAGE_EDIT, MESSAGE_DELETE];

	/// Types the relay emits.
	pub const OUTBOUND: &[&str] = &[USER_LOGGED_IN, USER_LOGGED_OUT, NEW_MESSAGE, MESSAGE_EDIT];
}
