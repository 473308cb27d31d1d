#![forbid(unsafe_code)]

use chatspace_domain::ConnectionId;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, info, warn};

use crate::server::connection::{ConnectionSettings, handle_connection};
use crate::server::state::RelayState;

/// Accept websocket clients forever, one task per connection.
pub async fn serve(listener: TcpListener, state: RelayState, settings: ConnectionSettings) -> anyhow::Result<()> {
	let local = listener.local_addr()?;
	info!(%local, "chatspace relay listening");

	let mut next_conn_id: u64 = 1;

	loop {
		let (stream, remote) = match listener.accept().await {
			Ok(accepted) => accepted,
			Err(e) => {
				warn!(error = %e, "accept failed");
				continue;
			}
		};

		let conn_id = ConnectionId(next_conn_id);
		next_conn_id += 1;
		metrics::counter!("chatspace_server_connections_total").increment(1);

		let state = state.clone();
		let settings = settings.clone();
		tokio::spawn(async move {
			let _ = stream.set_nodelay(true);

			let mut ws_config = WebSocketConfig::default();
			ws_config.max_message_size = Some(settings.max_frame_bytes);
			ws_config.max_frame_size = Some(settings.max_frame_bytes);

			match tokio_tungstenite::accept_async_with_config(stream, Some(ws_config)).await {
				Ok(ws) => {
					info!(%conn_id, %remote, "accepted connection");
					if let Err(e) = handle_connection(conn_id, ws, state, settings).await {
						warn!(%conn_id, error = %e, "connection handler exited with error");
					}
				}
				Err(e) => {
					debug!(%conn_id, %remote, error = %e, "websocket handshake failed");
				}
			}
		});
	}
}
