#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use chatspace_domain::SYSTEM_SENDER_ID;
use chatspace_protocol::DEFAULT_MAX_FRAME_BYTES;
use chatspace_util::endpoint::WsEndpoint;
use serde::Deserialize;
use tracing::{info, warn};

pub const DEFAULT_BIND: &str = "ws://127.0.0.1:18300";
pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_PING_INTERVAL_SECS: u64 = 30;

/// Default config path: `~/.chatspace/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".chatspace").join("config.toml"))
}

/// Load the server config from TOML, then apply `CHATSPACE_*` env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg)?;

	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());

	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub relay: RelaySettings,
	pub persistence: PersistenceSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Websocket listen endpoint; the host must be an IP literal.
	pub bind: WsEndpoint,
	/// Optional health/participants HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	pub max_frame_bytes: usize,
	/// Per-connection outbound queue depth.
	pub outbound_queue_capacity: usize,
	/// `None` disables keepalive pings and the idle timeout.
	pub ping_interval: Option<Duration>,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			bind: default_bind(),
			health_bind: None,
			metrics_bind: None,
			max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
			outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
			ping_interval: Some(Duration::from_secs(DEFAULT_PING_INTERVAL_SECS)),
		}
	}
}

#[derive(Debug, Clone)]
pub struct RelaySettings {
	/// Display name on join/leave announcements.
	pub system_sender_name: String,
	/// Log every fan-out, not only ones that dropped frames.
	pub debug_logs: bool,
}

impl Default for RelaySettings {
	fn default() -> Self {
		Self {
			system_sender_name: SYSTEM_SENDER_ID.to_string(),
			debug_logs: false,
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	pub enabled: bool,
	/// Database URL (sqlite: or postgres:).
	pub database_url: Option<String>,
}

fn default_bind() -> WsEndpoint {
	WsEndpoint {
		scheme: chatspace_util::endpoint::Scheme::Ws,
		host: "127.0.0.1".to_string(),
		port: 18300,
		path: "/".to_string(),
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	relay: FileRelaySettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	bind: Option<String>,
	health_bind: Option<String>,
	metrics_bind: Option<String>,
	max_frame_bytes: Option<usize>,
	outbound_queue_capacity: Option<usize>,
	ping_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileRelaySettings {
	system_sender_name: Option<String>,
	debug_logs: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> anyhow::Result<Self> {
		let bind = match file.server.bind.filter(|s| !s.trim().is_empty()) {
			Some(raw) => WsEndpoint::parse(&raw).with_context(|| format!("server.bind = {raw:?}"))?,
			None => default_bind(),
		};

		Ok(Self {
			server: ServerSettings {
				bind,
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				max_frame_bytes: file
					.server
					.max_frame_bytes
					.filter(|v| *v > 0)
					.unwrap_or(DEFAULT_MAX_FRAME_BYTES),
				outbound_queue_capacity: file
					.server
					.outbound_queue_capacity
					.filter(|v| *v > 0)
					.unwrap_or(DEFAULT_OUTBOUND_QUEUE_CAPACITY),
				ping_interval: ping_interval(file.server.ping_interval_secs.unwrap_or(DEFAULT_PING_INTERVAL_SECS)),
			},
			relay: RelaySettings {
				system_sender_name: file
					.relay
					.system_sender_name
					.filter(|s| !s.trim().is_empty())
					.unwrap_or_else(|| SYSTEM_SENDER_ID.to_string()),
				debug_logs: file.relay.debug_logs.unwrap_or(false),
			},
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
			},
		})
	}
}

fn ping_interval(secs: u64) -> Option<Duration> {
	(secs > 0).then(|| Duration::from_secs(secs))
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

/// Apply overrides read through `lookup` (the process environment in production).
fn apply_env_overrides(cfg: &mut ServerConfig, lookup: impl Fn(&str) -> Option<String>) {
	let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = var("CHATSPACE_SERVER_BIND") {
		match WsEndpoint::parse(&v) {
			Ok(bind) => {
				info!(bind = %bind, "server config: bind overridden by env");
				cfg.server.bind = bind;
			}
			Err(e) => warn!(error = %e, "server config: ignoring invalid CHATSPACE_SERVER_BIND"),
		}
	}

	if let Some(v) = var("CHATSPACE_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(v) = var("CHATSPACE_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = var("CHATSPACE_MAX_FRAME_BYTES")
		&& let Ok(bytes) = v.parse::<usize>()
		&& bytes > 0
	{
		cfg.server.max_frame_bytes = bytes;
		info!(bytes, "server config: max_frame_bytes overridden by env");
	}

	if let Some(v) = var("CHATSPACE_OUTBOUND_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.parse::<usize>()
		&& capacity > 0
	{
		cfg.server.outbound_queue_capacity = capacity;
		info!(capacity, "server config: outbound_queue_capacity overridden by env");
	}

	if let Some(v) = var("CHATSPACE_PING_INTERVAL_SECS")
		&& let Ok(secs) = v.parse::<u64>()
	{
		cfg.server.ping_interval = ping_interval(secs);
		info!(secs, "server config: ping_interval overridden by env");
	}

	if let Some(v) = var("CHATSPACE_SYSTEM_SENDER_NAME") {
		cfg.relay.system_sender_name = v;
		info!("relay config: system_sender_name overridden by env");
	}

	if let Some(v) = var("CHATSPACE_RELAY_DEBUG_LOGS")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.relay.debug_logs = enabled;
		info!(enabled, "relay config: debug_logs overridden by env");
	}

	if let Some(v) = var("CHATSPACE_PERSISTENCE_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.persistence.enabled = enabled;
		info!(enabled, "persistence: enabled overridden by env");
	}

	if let Some(v) = var("CHATSPACE_PERSISTENCE_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}
}
