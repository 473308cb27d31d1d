#![forbid(unsafe_code)]

use std::time::Duration;

use rand::Rng;

/// Capped exponential backoff with +/-10% jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
	pub base: Duration,
	pub max: Duration,
	/// A session that stayed up this long resets the attempt counter.
	pub reset_after: Duration,
	/// `None` retries forever.
	pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
	fn default() -> Self {
		Self {
			base: Duration::from_millis(500),
			max: Duration::from_secs(30),
			reset_after: Duration::from_secs(60 * 5),
			max_attempts: None,
		}
	}
}

impl ReconnectPolicy {
	/// Delay before reconnect attempt `attempt` (1-based).
	pub fn delay_for(&self, attempt: u32) -> Duration {
		let base_ms = self.base.as_millis() as u64;
		let max_ms = self.max.as_millis() as u64;
		let pow = 2u64.saturating_pow(attempt.saturating_sub(1).min(6));
		let delay_ms = base_ms.saturating_mul(pow).min(max_ms);
		let jitter_window = (delay_ms / 10).max(1);
		let jitter_offset = rand::rng().random_range(0..=(jitter_window * 2));
		let final_ms = delay_ms.saturating_sub(jitter_window).saturating_add(jitter_offset);
		Duration::from_millis(final_ms)
	}

	pub fn exhausted(&self, attempt: u32) -> bool {
		self.max_attempts.is_some_and(|max| attempt > max)
	}
}
