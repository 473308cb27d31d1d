#![forbid(unsafe_code)]

use std::time::Duration;

use bytes::Bytes;
use chatspace_domain::{ConnectionId, Identity, UserId};
use chatspace_protocol::{DEFAULT_MAX_FRAME_BYTES, InboundEvent, decode_inbound};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

use crate::config::{DEFAULT_OUTBOUND_QUEUE_CAPACITY, DEFAULT_PING_INTERVAL_SECS, ServerSettings};
use crate::server::presence::Session;
use crate::server::registry::OverflowSignal;
use crate::server::relay::RelayError;
use crate::server::state::RelayState;
use crate::server::store::StoreError;

/// How long a closing connection waits for its writer to flush.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub max_frame_bytes: usize,

	pub outbound_queue_capacity: usize,

	/// Keepalive ping period; a connection silent for two periods is closed.
	pub ping_interval: Option<Duration>,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
			outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
			ping_interval: Some(Duration::from_secs(DEFAULT_PING_INTERVAL_SECS)),
		}
	}
}

impl From<&ServerSettings> for ConnectionSettings {
	fn from(s: &ServerSettings) -> Self {
		Self {
			max_frame_bytes: s.max_frame_bytes,
			outbound_queue_capacity: s.outbound_queue_capacity,
			ping_interval: s.ping_interval,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
	Continue,
	Close,
}

/// Drive one accepted websocket until it closes, logs out, or idles out.
pub async fn handle_connection<S>(
	conn_id: ConnectionId,
	ws: WebSocketStream<S>,
	state: RelayState,
	settings: ConnectionSettings,
) -> anyhow::Result<()>
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("chatspace_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("chatspace_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let (sink, mut stream) = ws.split();
	let (tx, rx) = mpsc::channel::<Message>(settings.outbound_queue_capacity.max(1));

	let overflow = match state.registry.register(conn_id, tx) {
		Ok(overflow) => overflow,
		Err(e) => {
			warn!(%conn_id, error = %e, "refusing connection");
			return Ok(());
		}
	};

	let mut writer = tokio::spawn(writer_task(conn_id, sink, rx, settings.ping_interval));

	let mut session = Session::new(conn_id);
	let idle_limit = settings.ping_interval.map(|p| p * 2);

	read_loop(&state, &mut session, &mut stream, &overflow, idle_limit).await;

	// Dropping the registry entry closes the queue, which lets the writer finish.
	state.presence.disconnect(&mut session);

	match timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await {
		Ok(Ok(Ok(()))) => {}
		Ok(Ok(Err(e))) => debug!(%conn_id, error = %e, "writer stopped with transport error"),
		Ok(Err(e)) => warn!(%conn_id, error = %e, "writer task failed"),
		Err(_) => {
			debug!(%conn_id, "writer did not drain in time");
			writer.abort();
		}
	}

	info!(%conn_id, "connection closed");
	Ok(())
}

async fn read_loop<S>(
	state: &RelayState,
	session: &mut Session,
	stream: &mut SplitStream<WebSocketStream<S>>,
	overflow: &OverflowSignal,
	idle_limit: Option<Duration>,
) where
	S: AsyncRead + AsyncWrite + Unpin,
{
	let conn_id = session.conn_id();

	loop {
		// Overflow is only checked between frames so an event is never half handled.
		let next = tokio::select! {
			biased;
			() = overflow.raised() => {
				warn!(%conn_id, "outbound queue overflowed; closing so the client resyncs");
				return;
			}
			next = next_frame(stream, idle_limit) => next,
		};

		let next = match next {
			Ok(next) => next,
			Err(limit) => {
				info!(%conn_id, idle_ms = limit.as_millis() as u64, "closing idle connection");
				return;
			}
		};

		let msg = match next {
			Some(Ok(msg)) => msg,
			Some(Err(e)) => {
				debug!(%conn_id, error = %e, "websocket receive error");
				return;
			}
			None => return,
		};

		let event = match &msg {
			Message::Text(text) => decode_inbound(text.as_bytes()),
			Message::Binary(data) => decode_inbound(&data[..]),
			Message::Close(frame) => {
				debug!(%conn_id, reason = ?frame, "client initiated close");
				return;
			}
			_ => continue,
		};

		metrics::counter!("chatspace_server_frames_in_total").increment(1);

		let event = match event {
			Ok(event) => event,
			Err(e) => {
				metrics::counter!("chatspace_server_decode_errors_total", "kind" => e.kind()).increment(1);
				warn!(%conn_id, error = %e, "dropping undecodable frame");
				continue;
			}
		};

		if handle_event(state, session, event).await == Flow::Close {
			return;
		}
	}
}

/// Next websocket item, or `Err(limit)` when nothing arrived within the idle limit.
async fn next_frame<S>(
	stream: &mut SplitStream<WebSocketStream<S>>,
	idle_limit: Option<Duration>,
) -> Result<Option<Result<Message, tungstenite::Error>>, Duration>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	match idle_limit {
		Some(limit) => timeout(limit, stream.next()).await.map_err(|_| limit),
		None => Ok(stream.next().await),
	}
}

async fn handle_event(state: &RelayState, session: &mut Session, event: InboundEvent) -> Flow {
	let conn_id = session.conn_id();

	match event {
		InboundEvent::Login { user_id, name, .. } => {
			let outcome = state.presence.login(session, Identity::new(user_id, name));
			debug!(%conn_id, ?outcome, "login handled");
		}
		InboundEvent::NewMessage {
			sender_id,
			text,
			receiver_id,
			..
		} => {
			note_sender_mismatch(session, sender_id.as_ref());
			let result = state.relay.submit_new(conn_id, text, receiver_id).await;
			log_relay_result(conn_id, "message:new", result);
		}
		InboundEvent::EditMessage { id, sender_id, text, .. } => {
			note_sender_mismatch(session, sender_id.as_ref());
			let result = state.relay.submit_edit(conn_id, id, text).await;
			log_relay_result(conn_id, "message:edit", result);
		}
		InboundEvent::DeleteMessage { id, sender_id } => {
			note_sender_mismatch(session, sender_id.as_ref());
			let result = state.relay.submit_delete(conn_id, id).await;
			log_relay_result(conn_id, "message:delete", result);
		}
		InboundEvent::Logout { .. } => {
			let departure = state.presence.logout(session);
			debug!(%conn_id, ?departure, "logout handled");
			return Flow::Close;
		}
	}

	Flow::Continue
}

/// Messages are attributed to the bound identity; a differing claim is only logged.
fn note_sender_mismatch(session: &Session, claimed: Option<&UserId>) {
	if let (Some(claimed), Some(identity)) = (claimed, session.identity())
		&& *claimed != identity.user_id
	{
		warn!(
			conn_id = %session.conn_id(),
			claimed = %claimed,
			bound = %identity.user_id,
			"sender id does not match logged-in user; using bound identity"
		);
	}
}

fn log_relay_result<T>(conn_id: ConnectionId, event: &'static str, result: Result<T, RelayError>) {
	match result {
		Ok(_) => {}
		Err(RelayError::UnauthenticatedSender(_)) => {
			warn!(%conn_id, event, "dropping message event from connection that has not logged in");
		}
		Err(RelayError::Store(e @ StoreError::NotAuthor { .. })) => {
			warn!(%conn_id, event, error = %e, "rejecting change to another user's message");
		}
		Err(RelayError::Store(e)) => {
			warn!(%conn_id, event, error = %e, "dropping message event after store failure");
		}
	}
}

async fn writer_task<S>(
	conn_id: ConnectionId,
	mut sink: SplitSink<WebSocketStream<S>, Message>,
	mut rx: mpsc::Receiver<Message>,
	ping_interval: Option<Duration>,
) -> Result<(), tungstenite::Error>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	let mut ping = ping_interval.map(|period| {
		let mut ticker = interval_at(Instant::now() + period, period);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
		ticker
	});

	loop {
		let next = match ping.as_mut() {
			Some(ticker) => tokio::select! {
				frame = rx.recv() => frame,
				_ = ticker.tick() => Some(Message::Ping(Bytes::new())),
			},
			None => rx.recv().await,
		};

		let Some(frame) = next else {
			break;
		};
		sink.send(frame).await?;
	}

	debug!(%conn_id, "outbound queue closed; closing socket");
	let _ = sink.close().await;
	Ok(())
}
