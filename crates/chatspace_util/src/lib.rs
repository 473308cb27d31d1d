#![forbid(unsafe_code)]

pub mod endpoint {
	use std::fmt;
	use std::net::SocketAddr;

	use thiserror::Error;

	#[derive(Debug, Error, Clone, PartialEq, Eq)]
	pub enum EndpointError {
		#[error("endpoint must be non-empty (expected ws://host:port)")]
		Empty,
		#[error("unsupported scheme in {0} (expected ws:// or wss://)")]
		Scheme(String),
		#[error("missing :port in {0}")]
		MissingPort(String),
		#[error("invalid port in {0} (expected 1..=65535)")]
		Port(String),
		#[error("invalid host in {0}")]
		Host(String),
		#[error("IPv6 hosts must be bracketed like ws://[::1]:18300: {0}")]
		UnbracketedIpv6(String),
		#[error("query and fragment are not supported: {0}")]
		QueryOrFragment(String),
		#[error("host must be an IP literal to bind: {0}")]
		NotIpLiteral(String),
	}

	#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
	pub enum Scheme {
		Ws,
		Wss,
	}

	impl Scheme {
		pub fn as_str(self) -> &'static str {
			match self {
				Scheme::Ws => "ws",
				Scheme::Wss => "wss",
			}
		}
	}

	/// Parsed `ws://host:port[/path]` endpoint.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct WsEndpoint {
		pub scheme: Scheme,
		pub host: String,
		pub port: u16,
		/// Always starts with `/`.
		pub path: String,
	}

	impl WsEndpoint {
		pub fn parse(s: &str) -> Result<Self, EndpointError> {
			let s = s.trim();
			if s.is_empty() {
				return Err(EndpointError::Empty);
			}

			let (scheme, rest) = if let Some(rest) = s.strip_prefix("ws://") {
				(Scheme::Ws, rest)
			} else if let Some(rest) = s.strip_prefix("wss://") {
				(Scheme::Wss, rest)
			} else {
				return Err(EndpointError::Scheme(s.to_string()));
			};

			if rest.contains('?') || rest.contains('#') {
				return Err(EndpointError::QueryOrFragment(s.to_string()));
			}

			let (authority, path) = match rest.find('/') {
				Some(idx) => (&rest[..idx], &rest[idx..]),
				None => (rest, "/"),
			};

			let (host, port_str) = authority
				.rsplit_once(':')
				.ok_or_else(|| EndpointError::MissingPort(s.to_string()))?;

			if host.is_empty() || host.chars().any(char::is_whitespace) {
				return Err(EndpointError::Host(s.to_string()));
			}
			if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
				return Err(EndpointError::UnbracketedIpv6(s.to_string()));
			}

			let port = match port_str.parse::<u16>() {
				Ok(0) | Err(_) => return Err(EndpointError::Port(s.to_string())),
				Ok(p) => p,
			};

			Ok(Self {
				scheme,
				host: host.to_string(),
				port,
				path: path.to_string(),
			})
		}

		/// `host:port`, IPv6 stays bracketed.
		pub fn hostport(&self) -> String {
			format!("{}:{}", self.host, self.port)
		}

		/// Full URL suitable for a websocket client handshake.
		pub fn url(&self) -> String {
			format!("{}://{}{}", self.scheme.as_str(), self.hostport(), self.path)
		}

		/// Bind address; DNS names are rejected.
		pub fn to_socket_addr_if_ip_literal(&self) -> Result<SocketAddr, EndpointError> {
			self.hostport()
				.parse()
				.map_err(|_| EndpointError::NotIpLiteral(self.host.clone()))
		}
	}

	impl fmt::Display for WsEndpoint {
		fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
			f.write_str(&self.url())
		}
	}

	impl std::str::FromStr for WsEndpoint {
		type Err = EndpointError;

		fn from_str(s: &str) -> Result<Self, Self::Err> {
			WsEndpoint::parse(s)
		}
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn parses_default_bind() {
			let e = WsEndpoint::parse("ws://127.0.0.1:18300").unwrap();
			assert_eq!(e.scheme, Scheme::Ws);
			assert_eq!(e.hostport(), "127.0.0.1:18300");
			assert_eq!(e.path, "/");
			assert_eq!(e.url(), "ws://127.0.0.1:18300/");
		}

		#[test]
		fn keeps_path_and_tls_scheme() {
			let e = WsEndpoint::parse("wss://chat.example.com:443/relay").unwrap();
			assert_eq!(e.scheme, Scheme::Wss);
			assert_eq!(e.host, "chat.example.com");
			assert_eq!(e.url(), "wss://chat.example.com:443/relay");
			assert!(matches!(e.to_socket_addr_if_ip_literal(), Err(EndpointError::NotIpLiteral(_))));
		}

		#[test]
		fn bracketed_ipv6_binds() {
			let e = WsEndpoint::parse("ws://[::1]:18300").unwrap();
			assert_eq!(e.to_socket_addr_if_ip_literal().unwrap().to_string(), "[::1]:18300");
			assert!(matches!(
				WsEndpoint::parse("ws://::1:18300"),
				Err(EndpointError::UnbracketedIpv6(_))
			));
		}

		#[test]
		fn rejects_bad_inputs() {
			assert_eq!(WsEndpoint::parse("  "), Err(EndpointError::Empty));
			assert!(matches!(WsEndpoint::parse("http://a:1"), Err(EndpointError::Scheme(_))));
			assert!(matches!(WsEndpoint::parse("ws://a"), Err(EndpointError::MissingPort(_))));
			assert!(matches!(WsEndpoint::parse("ws://a:0"), Err(EndpointError::Port(_))));
			assert!(matches!(WsEndpoint::parse("ws://a:1?x=y"), Err(EndpointError::QueryOrFragment(_))));
			assert!(matches!(WsEndpoint::parse("ws://:1"), Err(EndpointError::Host(_))));
		}
	}
}
