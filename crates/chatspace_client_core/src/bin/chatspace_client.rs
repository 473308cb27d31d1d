#![forbid(unsafe_code)]

use chatspace_client_core::{ClientConfig, DEFAULT_SERVER_ENDPOINT_WS, SessionEvent, connect, is_own_echo};
use chatspace_domain::{Identity, UserId};
use chatspace_protocol::OutboundEvent;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: chatspace_client [--connect ws://host:port] --user-id <id> --name <name> [--to <userId>]\n\
\n\
Options:\n\
	--connect   Relay endpoint (alias: --endpoint) (default: {DEFAULT_SERVER_ENDPOINT_WS})\n\
	            Format: ws://host:port\n\
	--user-id   Your user id\n\
	--name      Display name shown to other participants\n\
	--to        Send every line as a private message to this user\n\
	--help      Show this help\n\
\n\
Each stdin line is sent as a chat message. Your own echoes are not printed.\n\
\n\
Examples:\n\
	chatspace_client --user-id 1 --name Alice\n\
	chatspace_client --connect ws://127.0.0.1:18300 --user-id 2 --name Bob --to 1\n"
	);
	std::process::exit(2)
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,chatspace_client_core=debug".to_string());
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_target(false)
		.with_writer(std::io::stderr)
		.init();
}

struct Args {
	endpoint: String,
	identity: Identity,
	to: Option<UserId>,
}

fn parse_user_id(flag: &str, v: &str) -> UserId {
	UserId::new(v.trim()).unwrap_or_else(|e| {
		eprintln!("Invalid {flag} value: {v}\n{e}");
		usage_and_exit()
	})
}

fn parse_args() -> Args {
	let mut endpoint: String = DEFAULT_SERVER_ENDPOINT_WS.to_string();
	let mut user_id: Option<UserId> = None;
	let mut name: Option<String> = None;
	let mut to: Option<UserId> = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--connect" | "--endpoint" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--connect must be non-empty (expected ws://host:port)");
					usage_and_exit();
				}
				endpoint = v;
			}
			"--user-id" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				user_id = Some(parse_user_id("--user-id", &v));
			}
			"--name" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--name must be non-empty");
					usage_and_exit();
				}
				name = Some(v);
			}
			"--to" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				to = Some(parse_user_id("--to", &v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let (Some(user_id), Some(name)) = (user_id, name) else {
		eprintln!("--user-id and --name are required");
		usage_and_exit();
	};

	Args {
		endpoint,
		identity: Identity::new(user_id, name),
		to,
	}
}

fn print_event(ev: &OutboundEvent) {
	match ev {
		OutboundEvent::UserLoggedIn { user_id, name, .. } => println!("* {name} ({user_id}) is online"),
		OutboundEvent::UserLoggedOut { user_id, name } => println!("* {name} ({user_id}) went offline"),
		OutboundEvent::NewMessage(m) if m.sender_id.is_system() => println!("-- {}", m.text),
		OutboundEvent::NewMessage(m) if m.is_private() => println!("[{} -> you #{}] {}", m.sender_name, m.id, m.text),
		OutboundEvent::NewMessage(m) => println!("[{} #{}] {}", m.sender_name, m.id, m.text),
		OutboundEvent::MessageEdit(m) if m.is_deleted() => println!("[#{} deleted]", m.id),
		OutboundEvent::MessageEdit(m) => println!("[{} #{} edited] {}", m.sender_name, m.id, m.text),
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();
	let args = parse_args();

	let cfg = ClientConfig::from_ws_endpoint(&args.endpoint, args.identity.clone()).unwrap_or_else(|e| {
		eprintln!("Invalid --connect value: {}\n{e}", args.endpoint);
		usage_and_exit();
	});

	info!(endpoint = %cfg.endpoint, user_id = %args.identity.user_id, "connecting");
	let (session, mut events) = connect(cfg).await?;

	let mut lines = BufReader::new(tokio::io::stdin()).lines();

	loop {
		tokio::select! {
			ev = events.recv() => match ev {
				Some(SessionEvent::Event(ev)) => {
					if !is_own_echo(&ev, &args.identity.user_id) {
						print_event(&ev);
					}
				}
				Some(SessionEvent::Connected { attempt }) => info!(attempt, "logged in"),
				Some(SessionEvent::Disconnected { reason, retry_in: Some(delay) }) => {
					warn!(%reason, delay_ms = delay.as_millis() as u64, "disconnected; retrying");
				}
				Some(SessionEvent::Disconnected { reason, retry_in: None }) => {
					warn!(%reason, "disconnected");
					break;
				}
				None => break,
			},
			line = lines.next_line() => match line? {
				Some(line) => {
					let text = line.trim();
					if text.is_empty() {
						continue;
					}
					session.send_message(text, args.to.clone()).await?;
				}
				None => {
					session.close().await?;
					break;
				}
			},
		}
	}

	Ok(())
}
