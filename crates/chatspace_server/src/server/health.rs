#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::warn;

use crate::server::participants::ParticipantDirectory;
use crate::server::store::MessageStore;

/// `/messages` page size when no `limit` is given.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;
pub const MAX_HISTORY_LIMIT: usize = 500;

/// Shared state behind `/healthz`, `/readyz`, `/participants` and `/messages`.
#[derive(Clone)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
	participants: Arc<dyn ParticipantDirectory>,
	store: Arc<dyn MessageStore>,
}

impl HealthState {
	pub fn new(participants: Arc<dyn ParticipantDirectory>, store: Arc<dyn MessageStore>) -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
			participants,
			store,
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

/// Bind and serve in the background; returns the bound address.
pub async fn spawn_health_server(bind: SocketAddr, state: HealthState) -> anyhow::Result<SocketAddr> {
	let listener = TcpListener::bind(bind).await?;
	let addr = listener.local_addr()?;
	tokio::spawn(async move {
		if let Err(err) = run_health_server(listener, state).await {
			warn!(error = %err, "health server stopped");
		}
	});
	Ok(addr)
}

async fn run_health_server(listener: TcpListener, state: HealthState) -> anyhow::Result<()> {
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_health(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "health connection error");
			}
		});
	}
}

fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(body.into()));
	*resp.status_mut() = status;
	resp
}

fn respond_json<T: serde::Serialize + ?Sized>(what: &'static str, value: &T) -> Response<Full<Bytes>> {
	match serde_json::to_vec(value) {
		Ok(body) => {
			let mut resp = respond(StatusCode::OK, body);
			resp.headers_mut()
				.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
			resp
		}
		Err(e) => {
			warn!(error = %e, what, "failed to serialize response");
			respond(StatusCode::INTERNAL_SERVER_ERROR, Bytes::new())
		}
	}
}

/// `limit` from a query string, clamped to `MAX_HISTORY_LIMIT`; `None` if malformed.
fn history_limit(query: Option<&str>) -> Option<usize> {
	let Some(raw) = query
		.into_iter()
		.flat_map(|q| q.split('&'))
		.find_map(|pair| pair.strip_prefix("limit="))
	else {
		return Some(DEFAULT_HISTORY_LIMIT);
	};
	raw.parse::<usize>().ok().map(|n| n.min(MAX_HISTORY_LIMIT))
}

/// Recent group messages, oldest first. Private messages are never served here.
async fn recent_history(state: &HealthState, query: Option<&str>) -> Response<Full<Bytes>> {
	let Some(limit) = history_limit(query) else {
		return respond(StatusCode::BAD_REQUEST, Bytes::from_static(b"invalid limit"));
	};

	match state.store.recent_messages(limit).await {
		Ok(messages) => {
			let public: Vec<_> = messages.into_iter().filter(|m| !m.is_private()).collect();
			respond_json("messages", &public)
		}
		Err(e) => {
			warn!(error = %e, "failed to load message history");
			respond(StatusCode::INTERNAL_SERVER_ERROR, Bytes::new())
		}
	}
}

async fn handle_health(req: Request<Incoming>, state: HealthState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	if req.method() != Method::GET {
		return Ok(respond(StatusCode::METHOD_NOT_ALLOWED, Bytes::new()));
	}

	let path = req.uri().path().to_owned();
	let query = req.uri().query().map(str::to_owned);

	let resp = match path.as_str() {
		"/healthz" => respond(StatusCode::OK, Bytes::from_static(b"ok")),
		"/readyz" if state.is_ready() => respond(StatusCode::OK, Bytes::from_static(b"ready")),
		"/readyz" => respond(StatusCode::SERVICE_UNAVAILABLE, Bytes::from_static(b"not-ready")),
		"/participants" => respond_json("participants", &state.participants.list_active_participants()),
		"/messages" => recent_history(&state, query.as_deref()).await,
		_ => respond(StatusCode::NOT_FOUND, Bytes::new()),
	};

	Ok(resp)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn history_limit_parsing() {
		assert_eq!(history_limit(None), Some(DEFAULT_HISTORY_LIMIT));
		assert_eq!(history_limit(Some("before=3")), Some(DEFAULT_HISTORY_LIMIT));
		assert_eq!(history_limit(Some("limit=2")), Some(2));
		assert_eq!(history_limit(Some("x=1&limit=0")), Some(0));
		assert_eq!(history_limit(Some("limit=100000")), Some(MAX_HISTORY_LIMIT));
		assert_eq!(history_limit(Some("limit=-1")), None);
		assert_eq!(history_limit(Some("limit=")), None);
	}
}
