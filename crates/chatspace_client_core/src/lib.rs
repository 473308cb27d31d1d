#![forbid(unsafe_code)]

use std::time::Duration;

use chatspace_domain::{Identity, UserId};
use chatspace_protocol::{DEFAULT_MAX_FRAME_BYTES, InboundEvent, OutboundEvent, decode_outbound};
use chatspace_util::endpoint::{EndpointError, WsEndpoint};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

pub mod reconnect;

pub use reconnect::ReconnectPolicy;

/// Default relay endpoint for local development.
pub const DEFAULT_SERVER_ENDPOINT_WS: &str = "ws://127.0.0.1:18300";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client session configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
	pub endpoint: WsEndpoint,

	/// Identity sent in `login` after every (re)connect.
	pub identity: Identity,

	pub max_frame_bytes: usize,

	/// Timeout for TCP connect + websocket handshake.
	pub connect_timeout: Duration,

	/// Capacity of the decoded event queue handed to the caller.
	pub event_queue_capacity: usize,

	/// `None` disables reconnecting; the session ends on first disconnect.
	pub reconnect: Option<ReconnectPolicy>,
}

impl ClientConfig {
	pub fn new(endpoint: WsEndpoint, identity: Identity) -> Self {
		Self {
			endpoint,
			identity,
			max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
			connect_timeout: Duration::from_secs(15),
			event_queue_capacity: 256,
			reconnect: Some(ReconnectPolicy::default()),
		}
	}

	/// Convenience: create a config from `ws://host:port`.
	pub fn from_ws_endpoint(endpoint: &str, identity: Identity) -> Result<Self, ClientCoreError> {
		Ok(Self::new(WsEndpoint::parse(endpoint)?, identity))
	}
}

/// Errors for client core operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientCoreError {
	#[error("invalid endpoint (expected ws://host:port): {0}")]
	Endpoint(#[from] EndpointError),

	/// Connection establishment failed.
	#[error("failed to connect: {0}")]
	Connect(String),

	/// The session driver has stopped.
	#[error("session closed")]
	Closed,
}

/// What the session reports to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
	/// Socket is up and `login` has been sent.
	Connected { attempt: u32 },

	/// Socket went away; `retry_in` is `None` when the session is over.
	Disconnected { reason: String, retry_in: Option<Duration> },

	Event(OutboundEvent),
}

#[derive(Debug)]
enum Command {
	Send(String),
	Login(Identity),
	Close,
}

/// Sending half of a session; dropping it closes the session.
#[derive(Debug)]
pub struct SessionHandle {
	commands: mpsc::Sender<Command>,
	task: JoinHandle<()>,
}

impl SessionHandle {
	/// Send a `{type, ...payload}` frame.
	///
	/// Frames submitted while the session is reconnecting are dropped.
	pub async fn send(&self, kind: &str, payload: serde_json::Value) -> Result<(), ClientCoreError> {
		self.command(Command::Send(chatspace_protocol::encode_envelope(kind, payload)))
			.await
	}

	pub async fn send_event(&self, event: &InboundEvent) -> Result<(), ClientCoreError> {
		self.command(Command::Send(chatspace_protocol::encode_inbound(event)))
			.await
	}

	/// Send `message:new`; sender fields come from the session identity on the relay.
	pub async fn send_message(&self, text: impl Into<String>, receiver_id: Option<UserId>) -> Result<(), ClientCoreError> {
		self.send_event(&InboundEvent::NewMessage {
			sender_id: None,
			sender_name: None,
			text: text.into(),
			receiver_id,
		})
		.await
	}

	/// Log in as `identity` now and on every reconnect.
	pub async fn login(&self, identity: Identity) -> Result<(), ClientCoreError> {
		self.command(Command::Login(identity)).await
	}

	/// Send `logout`, close the socket, and wait for the driver to stop.
	pub async fn close(self) -> Result<(), ClientCoreError> {
		let _ = self.commands.send(Command::Close).await;
		let _ = self.task.await;
		Ok(())
	}

	async fn command(&self, cmd: Command) -> Result<(), ClientCoreError> {
		self.commands.send(cmd).await.map_err(|_| ClientCoreError::Closed)
	}
}

/// True for `newMessage` events this user authored, which the relay echoes back.
pub fn is_own_echo(event: &OutboundEvent, user_id: &UserId) -> bool {
	matches!(event, OutboundEvent::NewMessage(m) if m.sender_id == *user_id)
}

/// Connect, log in, and keep the session alive in a background task.
///
/// The first connection attempt is made before returning so that an
/// unreachable relay is reported to the caller.
pub async fn connect(cfg: ClientConfig) -> Result<(SessionHandle, mpsc::Receiver<SessionEvent>), ClientCoreError> {
	let ws = connect_once(&cfg).await?;
	info!(endpoint = %cfg.endpoint, user_id = %cfg.identity.user_id, "connected");

	let (cmd_tx, cmd_rx) = mpsc::channel(64);
	let (event_tx, event_rx) = mpsc::channel(cfg.event_queue_capacity.max(1));

	let task = tokio::spawn(drive(cfg, ws, cmd_rx, event_tx));
	Ok((
		SessionHandle {
			commands: cmd_tx,
			task,
		},
		event_rx,
	))
}

async fn connect_once(cfg: &ClientConfig) -> Result<WsStream, ClientCoreError> {
	let mut ws_config = WebSocketConfig::default();
	ws_config.max_message_size = Some(cfg.max_frame_bytes);
	ws_config.max_frame_size = Some(cfg.max_frame_bytes);

	let url = cfg.endpoint.url();
	match tokio::time::timeout(
		cfg.connect_timeout,
		tokio_tungstenite::connect_async_with_config(url.as_str(), Some(ws_config), true),
	)
	.await
	{
		Ok(Ok((ws, _response))) => Ok(ws),
		Ok(Err(e)) => Err(ClientCoreError::Connect(format!("{url}: {e}"))),
		Err(_) => Err(ClientCoreError::Connect(format!(
			"{url}: timeout after {:?}",
			cfg.connect_timeout
		))),
	}
}

fn login_frame(identity: &Identity) -> Message {
	let event = InboundEvent::Login {
		user_id: identity.user_id.clone(),
		name: identity.display_name.clone(),
		created_at: None,
		updated_at: None,
	};
	Message::Text(chatspace_protocol::encode_inbound(&event).into())
}

fn logout_frame(identity: &Identity) -> Message {
	let event = InboundEvent::Logout {
		user_id: Some(identity.user_id.clone()),
		name: Some(identity.display_name.clone()),
	};
	Message::Text(chatspace_protocol::encode_inbound(&event).into())
}

enum SessionEnd {
	/// Owner asked to close, or dropped every handle and receiver.
	Finished,
	Lost(String),
}

async fn drive(
	mut cfg: ClientConfig,
	first: WsStream,
	mut commands: mpsc::Receiver<Command>,
	events: mpsc::Sender<SessionEvent>,
) {
	let mut ws = Some(first);
	let mut attempt: u32 = 0;

	loop {
		let Some(stream) = ws.take() else {
			return;
		};

		let started = Instant::now();
		let end = run_session(&mut cfg, stream, attempt, &mut commands, &events).await;

		let reason = match end {
			SessionEnd::Finished => return,
			SessionEnd::Lost(reason) => reason,
		};

		let Some(policy) = cfg.reconnect else {
			let _ = events
				.send(SessionEvent::Disconnected {
					reason,
					retry_in: None,
				})
				.await;
			return;
		};

		if started.elapsed() >= policy.reset_after {
			attempt = 0;
		}

		let mut reason = reason;
		loop {
			attempt = attempt.saturating_add(1);
			if policy.exhausted(attempt) {
				warn!(attempts = attempt - 1, "giving up reconnecting");
				let _ = events
					.send(SessionEvent::Disconnected {
						reason,
						retry_in: None,
					})
					.await;
				return;
			}

			let delay = policy.delay_for(attempt);
			info!(attempt, delay_ms = delay.as_millis() as u64, reason = %reason, "reconnecting");
			if events
				.send(SessionEvent::Disconnected {
					reason: reason.clone(),
					retry_in: Some(delay),
				})
				.await
				.is_err()
			{
				return;
			}

			if !wait_for_retry(delay, &mut cfg, &mut commands).await {
				return;
			}

			match connect_once(&cfg).await {
				Ok(stream) => {
					ws = Some(stream);
					break;
				}
				Err(e) => {
					debug!(attempt, error = %e, "reconnect attempt failed");
					reason = e.to_string();
				}
			}
		}
	}
}

/// Sleep out a backoff delay; returns false if the owner closed the session meanwhile.
async fn wait_for_retry(delay: Duration, cfg: &mut ClientConfig, commands: &mut mpsc::Receiver<Command>) -> bool {
	let deadline = tokio::time::sleep(delay);
	tokio::pin!(deadline);

	loop {
		tokio::select! {
			_ = &mut deadline => return true,
			cmd = commands.recv() => match cmd {
				None | Some(Command::Close) => return false,
				Some(Command::Login(identity)) => cfg.identity = identity,
				Some(Command::Send(_)) => warn!("not connected; dropping outbound frame"),
			},
		}
	}
}

async fn run_session(
	cfg: &mut ClientConfig,
	mut ws: WsStream,
	attempt: u32,
	commands: &mut mpsc::Receiver<Command>,
	events: &mpsc::Sender<SessionEvent>,
) -> SessionEnd {
	if let Err(e) = ws.send(login_frame(&cfg.identity)).await {
		return SessionEnd::Lost(format!("login send failed: {e}"));
	}
	if events.send(SessionEvent::Connected { attempt }).await.is_err() {
		let _ = ws.close(None).await;
		return SessionEnd::Finished;
	}

	loop {
		tokio::select! {
			frame = ws.next() => {
				let msg = match frame {
					Some(Ok(msg)) => msg,
					Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
					None => return SessionEnd::Lost("connection closed".to_string()),
				};

				let decoded = match &msg {
					Message::Text(text) => decode_outbound(text.as_bytes()),
					Message::Binary(data) => decode_outbound(&data[..]),
					Message::Close(frame) => {
						let reason = frame.as_ref().map(|f| f.reason.as_str().to_string()).unwrap_or_default();
						return SessionEnd::Lost(format!("server closed: {reason}"));
					}
					_ => continue,
				};

				match decoded {
					Ok(event) => {
						if events.send(SessionEvent::Event(event)).await.is_err() {
							let _ = ws.send(logout_frame(&cfg.identity)).await;
							let _ = ws.close(None).await;
							return SessionEnd::Finished;
						}
					}
					Err(e) => warn!(error = %e, kind = e.kind(), "dropping undecodable server frame"),
				}
			}
			cmd = commands.recv() => match cmd {
				Some(Command::Send(text)) => {
					if let Err(e) = ws.send(Message::Text(text.into())).await {
						return SessionEnd::Lost(format!("send failed: {e}"));
					}
				}
				Some(Command::Login(identity)) => {
					cfg.identity = identity;
					if let Err(e) = ws.send(login_frame(&cfg.identity)).await {
						return SessionEnd::Lost(format!("login send failed: {e}"));
					}
				}
				Some(Command::Close) | None => {
					let _ = ws.send(logout_frame(&cfg.identity)).await;
					let _ = ws.close(None).await;
					return SessionEnd::Finished;
				}
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use chatspace_domain::{ChatMessage, MessageId};
	use chatspace_protocol::decode_inbound;
	use tokio::net::TcpListener;
	use tokio::time::timeout;

	use super::*;

	fn identity(user: &str, name: &str) -> Identity {
		Identity::new(UserId::new(user).expect("valid UserId"), name)
	}

	async fn next_inbound(ws: &mut WebSocketStream<TcpStream>) -> InboundEvent {
		loop {
			let msg = timeout(Duration::from_secs(2), ws.next())
				.await
				.expect("frame within timeout")
				.expect("stream open")
				.expect("frame ok");
			if let Message::Text(text) = msg {
				return decode_inbound(text.as_bytes()).expect("client frames decode");
			}
		}
	}

	async fn next_session_event(rx: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
		timeout(Duration::from_secs(2), rx.recv())
			.await
			.expect("event within timeout")
			.expect("session open")
	}

	fn fast_reconnect() -> ReconnectPolicy {
		ReconnectPolicy {
			base: Duration::from_millis(10),
			max: Duration::from_millis(50),
			..ReconnectPolicy::default()
		}
	}

	#[test]
	fn own_echo_matches_sender_only() {
		let alice = UserId::new("alice").expect("valid UserId");
		let bob = UserId::new("bob").expect("valid UserId");
		let msg = ChatMessage {
			id: MessageId::from(1_i64),
			sender_id: alice.clone(),
			sender_name: "Alice".to_string(),
			text: "hi".to_string(),
			receiver_id: None,
			created_at: Default::default(),
			updated_at: Default::default(),
		};

		assert!(is_own_echo(&OutboundEvent::NewMessage(msg.clone()), &alice));
		assert!(!is_own_echo(&OutboundEvent::NewMessage(msg.clone()), &bob));
		assert!(!is_own_echo(&OutboundEvent::MessageEdit(msg), &alice));
	}

	#[tokio::test]
	async fn login_is_resent_after_reconnect() {
		let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
		let addr = listener.local_addr().expect("local addr");

		let server = tokio::spawn(async move {
			let mut logins = Vec::new();
			for _ in 0..2 {
				let (stream, _) = listener.accept().await.expect("accept");
				let mut ws = tokio_tungstenite::accept_async(stream).await.expect("handshake");
				logins.push(next_inbound(&mut ws).await);
				// Drop the socket to force a reconnect.
			}
			logins
		});

		let mut cfg = ClientConfig::from_ws_endpoint(&format!("ws://{addr}"), identity("alice", "Alice"))
			.expect("valid endpoint");
		cfg.reconnect = Some(fast_reconnect());

		let (handle, mut events) = connect(cfg).await.expect("connect");
		assert_eq!(next_session_event(&mut events).await, SessionEvent::Connected { attempt: 0 });

		loop {
			match next_session_event(&mut events).await {
				SessionEvent::Connected { attempt } => {
					assert!(attempt >= 1);
					break;
				}
				SessionEvent::Disconnected { retry_in, .. } => assert!(retry_in.is_some()),
				SessionEvent::Event(ev) => panic!("unexpected event {ev:?}"),
			}
		}

		let logins = timeout(Duration::from_secs(2), server)
			.await
			.expect("server done")
			.expect("server task");
		let expected = InboundEvent::Login {
			user_id: UserId::new("alice").expect("valid UserId"),
			name: "Alice".to_string(),
			created_at: None,
			updated_at: None,
		};
		assert_eq!(logins, vec![expected.clone(), expected]);

		drop(handle);
	}

	#[tokio::test]
	async fn send_frames_and_decode_server_events() {
		let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
		let addr = listener.local_addr().expect("local addr");

		let server = tokio::spawn(async move {
			let (stream, _) = listener.accept().await.expect("accept");
			let mut ws = tokio_tungstenite::accept_async(stream).await.expect("handshake");
			let login = next_inbound(&mut ws).await;

			let joined = OutboundEvent::UserLoggedIn {
				user_id: UserId::new("alice").expect("valid UserId"),
				name: "Alice".to_string(),
				joined_at: Default::default(),
			};
			ws.send(Message::Text(chatspace_protocol::encode_outbound(&joined).into()))
				.await
				.expect("send");
			ws.send(Message::Text(String::from("{\"type\":\"bogus\"}").into()))
				.await
				.expect("send");

			let sent = next_inbound(&mut ws).await;
			let custom = next_inbound(&mut ws).await;
			let logout = next_inbound(&mut ws).await;
			(login, sent, custom, logout)
		});

		let mut cfg = ClientConfig::from_ws_endpoint(&format!("ws://{addr}"), identity("alice", "Alice"))
			.expect("valid endpoint");
		cfg.reconnect = None;

		let (handle, mut events) = connect(cfg).await.expect("connect");
		assert!(matches!(next_session_event(&mut events).await, SessionEvent::Connected { .. }));
		match next_session_event(&mut events).await {
			SessionEvent::Event(OutboundEvent::UserLoggedIn { name, .. }) => assert_eq!(name, "Alice"),
			other => panic!("expected userLoggedIn, got {other:?}"),
		}

		handle.send_message("hi", None).await.expect("send");
		handle
			.send(
				"message:delete",
				serde_json::json!({ "id": "7", "senderId": "alice" }),
			)
			.await
			.expect("send");
		handle.close().await.expect("close");

		let (login, sent, custom, logout) = timeout(Duration::from_secs(2), server)
			.await
			.expect("server done")
			.expect("server task");
		assert!(matches!(login, InboundEvent::Login { .. }));
		assert!(matches!(sent, InboundEvent::NewMessage { ref text, receiver_id: None, .. } if text == "hi"));
		assert!(matches!(custom, InboundEvent::DeleteMessage { .. }));
		assert!(matches!(logout, InboundEvent::Logout { .. }));
	}

	#[tokio::test]
	async fn unreachable_relay_is_reported() {
		let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
		let addr = listener.local_addr().expect("local addr");
		drop(listener);

		let mut cfg = ClientConfig::from_ws_endpoint(&format!("ws://{addr}"), identity("alice", "Alice"))
			.expect("valid endpoint");
		cfg.connect_timeout = Duration::from_secs(2);

		let err = connect(cfg).await.unwrap_err();
		assert!(matches!(err, ClientCoreError::Connect(_)));
	}
}
