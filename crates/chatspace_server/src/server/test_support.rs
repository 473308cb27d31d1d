#![forbid(unsafe_code)]

use chatspace_domain::{ConnectionId, Identity, UserId};
use chatspace_protocol::{OutboundEvent, decode_outbound};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::server::presence::Session;
use crate::server::state::RelayState;

pub(crate) fn ident(user: &str, name: &str) -> Identity {
	Identity::new(UserId::new(user).expect("valid UserId"), name)
}

/// A registered connection whose outbound frames can be inspected.
pub(crate) struct TestConn {
	pub session: Session,
	pub rx: mpsc::Receiver<Message>,
}

impl TestConn {
	pub fn open(state: &RelayState, id: u64) -> Self {
		let (tx, rx) = mpsc::channel(64);
		state.registry.register(ConnectionId(id), tx).expect("fresh connection id");
		Self {
			session: Session::new(ConnectionId(id)),
			rx,
		}
	}

	pub fn id(&self) -> ConnectionId {
		self.session.conn_id()
	}

	/// Everything queued so far, decoded.
	pub fn drain(&mut self) -> Vec<OutboundEvent> {
		let mut out = Vec::new();
		while let Ok(frame) = self.rx.try_recv() {
			match frame {
				Message::Text(text) => out.push(decode_outbound(text.as_bytes()).expect("server frames decode")),
				other => panic!("unexpected frame: {other:?}"),
			}
		}
		out
	}
}

/// Event kinds plus system message text, in order, for compact assertions.
pub(crate) fn summarize(events: &[OutboundEvent]) -> Vec<String> {
	events
		.iter()
		.map(|ev| match ev {
			OutboundEvent::UserLoggedIn { user_id, .. } => format!("userLoggedIn:{user_id}"),
			OutboundEvent::UserLoggedOut { user_id, .. } => format!("userLoggedOut:{user_id}"),
			OutboundEvent::NewMessage(m) => format!("newMessage:{}", m.text),
			OutboundEvent::MessageEdit(m) => format!("message:edit:{}", m.text),
		})
		.collect()
}
