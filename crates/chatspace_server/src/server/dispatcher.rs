#![forbid(unsafe_code)]

use chatspace_domain::ConnectionId;
use chatspace_protocol::{OutboundEvent, encode_outbound};
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::server::registry::{ConnectionRegistry, DeliveryReport};

/// Who a fan-out is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Targets {
	/// Every connection registered when the frame is handed off.
	All,
	Connections(Vec<ConnectionId>),
}

/// Encodes an event once and hands the frame to each target's queue.
///
/// Never waits on a slow client: a full queue drops the frame for that
/// connection and a closed one is skipped.
#[derive(Debug, Clone)]
pub struct BroadcastDispatcher {
	registry: ConnectionRegistry,
	debug_logs: bool,
}

impl BroadcastDispatcher {
	pub fn new(registry: ConnectionRegistry) -> Self {
		Self {
			registry,
			debug_logs: false,
		}
	}

	pub fn with_debug_logs(mut self, enabled: bool) -> Self {
		self.debug_logs = enabled;
		self
	}

	pub fn dispatch(&self, targets: &Targets, event: &OutboundEvent) -> DeliveryReport {
		let frame = Message::Text(encode_outbound(event).into());

		let report = match targets {
			Targets::All => self.registry.deliver_all(&frame),
			Targets::Connections(ids) => self.registry.deliver_many(ids, &frame),
		};

		if report.dropped > 0 {
			metrics::counter!("chatspace_server_dispatch_dropped_total").increment(report.dropped as u64);
		}

		if self.debug_logs || report.dropped > 0 {
			debug!(
				event = event.kind(),
				delivered = report.delivered,
				dropped = report.dropped,
				closed = report.closed,
				unknown = report.unknown,
				"dispatcher: fan-out complete"
			);
		}

		report
	}

	pub fn dispatch_all(&self, event: &OutboundEvent) -> DeliveryReport {
		self.dispatch(&Targets::All, event)
	}
}
