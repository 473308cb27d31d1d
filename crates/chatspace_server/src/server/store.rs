#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::str::FromStr;

use chatspace_domain::{ChatMessage, MessageId, UserId};
use chrono::{DateTime, TimeDelta, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("message {0} not found")]
	NotFound(MessageId),

	#[error("user {editor} is not the author of message {id}")]
	NotAuthor { id: MessageId, editor: UserId },

	#[error("unsupported database_url (use sqlite: or postgres:): {0}")]
	UnsupportedUrl(String),

	#[error("invalid stored row: {0}")]
	InvalidRow(String),

	#[error("database error: {0}")]
	Database(#[from] sqlx::Error),

	#[error("migration error: {0}")]
	Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Fields supplied by the relay when creating a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
	pub sender_id: UserId,
	pub sender_name: String,
	pub text: String,
	pub receiver_id: Option<UserId>,
}

/// Message persistence. The store assigns ids and timestamps.
#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
	async fn create_message(&self, msg: NewMessage) -> Result<ChatMessage, StoreError>;

	/// Replace the text of a message; used for both edits and soft deletes.
	///
	/// Only the original sender may update a message. The returned record has
	/// `updated_at` strictly after `created_at`.
	async fn update_message(&self, id: &MessageId, editor: &UserId, text: &str) -> Result<ChatMessage, StoreError>;

	/// Up to `limit` most recent messages, oldest first.
	async fn recent_messages(&self, limit: usize) -> Result<Vec<ChatMessage>, StoreError>;
}

fn check_author(id: &MessageId, author: &str, editor: &UserId) -> Result<(), StoreError> {
	if author == editor.as_str() {
		Ok(())
	} else {
		Err(StoreError::NotAuthor {
			id: id.clone(),
			editor: editor.clone(),
		})
	}
}

/// Update timestamp that is always later than anything already recorded.
fn next_update_time(now: DateTime<Utc>, created_at: DateTime<Utc>, updated_at: DateTime<Utc>) -> DateTime<Utc> {
	let floor = created_at.max(updated_at) + TimeDelta::milliseconds(1);
	now.max(floor)
}

#[derive(Debug, Clone)]
pub struct InMemoryStoreConfig {
	/// Oldest messages are evicted past this count.
	pub capacity: usize,
}

impl Default for InMemoryStoreConfig {
	fn default() -> Self {
		Self { capacity: 10_000 }
	}
}

#[derive(Debug)]
pub struct InMemoryMessageStore {
	inner: Mutex<MemoryInner>,
	cfg: InMemoryStoreConfig,
}

#[derive(Debug, Default)]
struct MemoryInner {
	next_id: i64,
	messages: BTreeMap<i64, ChatMessage>,
}

impl InMemoryMessageStore {
	pub fn new(cfg: InMemoryStoreConfig) -> Self {
		Self {
			inner: Mutex::new(MemoryInner {
				next_id: 1,
				messages: BTreeMap::new(),
			}),
			cfg,
		}
	}
}

impl Default for InMemoryMessageStore {
	fn default() -> Self {
		Self::new(InMemoryStoreConfig::default())
	}
}

#[async_trait::async_trait]
impl MessageStore for InMemoryMessageStore {
	async fn create_message(&self, msg: NewMessage) -> Result<ChatMessage, StoreError> {
		let mut inner = self.inner.lock().await;
		let id = inner.next_id;
		inner.next_id += 1;

		let now = Utc::now();
		let record = ChatMessage {
			id: MessageId::from(id),
			sender_id: msg.sender_id,
			sender_name: msg.sender_name,
			text: msg.text,
			receiver_id: msg.receiver_id,
			created_at: now,
			updated_at: now,
		};
		inner.messages.insert(id, record.clone());

		while inner.messages.len() > self.cfg.capacity {
			inner.messages.pop_first();
		}

		Ok(record)
	}

	async fn update_message(&self, id: &MessageId, editor: &UserId, text: &str) -> Result<ChatMessage, StoreError> {
		let key: i64 = id.as_str().parse().map_err(|_| StoreError::NotFound(id.clone()))?;
		let mut inner = self.inner.lock().await;
		let record = inner.messages.get_mut(&key).ok_or_else(|| StoreError::NotFound(id.clone()))?;
		check_author(id, record.sender_id.as_str(), editor)?;

		record.text = text.to_string();
		record.updated_at = next_update_time(Utc::now(), record.created_at, record.updated_at);
		Ok(record.clone())
	}

	async fn recent_messages(&self, limit: usize) -> Result<Vec<ChatMessage>, StoreError> {
		let inner = self.inner.lock().await;
		let mut out: Vec<ChatMessage> = inner.messages.values().rev().take(limit).cloned().collect();
		out.reverse();
		Ok(out)
	}
}

/// `id, text, sender_id, sender_name, receiver_id, created_at, updated_at` (ms since epoch).
type MessageRow = (i64, String, String, String, Option<String>, i64, i64);

const SELECT_COLUMNS: &str = "id, text, sender_id, sender_name, receiver_id, created_at, updated_at";

fn ms_to_time(ms: i64) -> Result<DateTime<Utc>, StoreError> {
	DateTime::from_timestamp_millis(ms).ok_or_else(|| StoreError::InvalidRow(format!("timestamp out of range: {ms}")))
}

fn row_to_message(row: MessageRow) -> Result<ChatMessage, StoreError> {
	let (id, text, sender_id, sender_name, receiver_id, created_at, updated_at) = row;
	let sender_id = UserId::new(sender_id).map_err(|e| StoreError::InvalidRow(format!("sender_id: {e}")))?;
	let receiver_id = receiver_id
		.filter(|r| !r.trim().is_empty())
		.map(UserId::new)
		.transpose()
		.map_err(|e| StoreError::InvalidRow(format!("receiver_id: {e}")))?;

	Ok(ChatMessage {
		id: MessageId::from(id),
		sender_id,
		sender_name,
		text,
		receiver_id,
		created_at: ms_to_time(created_at)?,
		updated_at: ms_to_time(updated_at)?,
	})
}

/// SQL-backed store for `sqlite:` and `postgres:` URLs.
#[derive(Clone)]
pub struct PersistentMessageStore {
	backend: PersistentBackend,
}

#[derive(Clone)]
enum PersistentBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

impl PersistentMessageStore {
	/// Connect and run migrations.
	pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
		if database_url.starts_with("sqlite:") {
			let opts = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
			let mut pool_opts = SqlitePoolOptions::new();
			if database_url.contains(":memory:") {
				pool_opts = pool_opts.max_connections(1);
			}
			let pool = pool_opts.connect_with(opts).await?;
			sqlx::migrate!("migrations/sqlite").run(&pool).await?;

			Ok(Self {
				backend: PersistentBackend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await?;
			sqlx::migrate!("migrations/postgres").run(&pool).await?;

			Ok(Self {
				backend: PersistentBackend::Postgres(pool),
			})
		} else {
			Err(StoreError::UnsupportedUrl(database_url.to_string()))
		}
	}
}

#[async_trait::async_trait]
impl MessageStore for PersistentMessageStore {
	async fn create_message(&self, msg: NewMessage) -> Result<ChatMessage, StoreError> {
		let now = Utc::now();
		let now_ms = now.timestamp_millis();
		let receiver = msg.receiver_id.as_ref().map(|r| r.as_str().to_string());

		let (id,): (i64,) = match &self.backend {
			PersistentBackend::Sqlite(pool) => {
				sqlx::query_as(
					"INSERT INTO messages (text, sender_id, sender_name, receiver_id, created_at, updated_at) \
					VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
				)
				.bind(&msg.text)
				.bind(msg.sender_id.as_str())
				.bind(&msg.sender_name)
				.bind(receiver)
				.bind(now_ms)
				.bind(now_ms)
				.fetch_one(pool)
				.await?
			}
			PersistentBackend::Postgres(pool) => {
				sqlx::query_as(
					"INSERT INTO messages (text, sender_id, sender_name, receiver_id, created_at, updated_at) \
					VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
				)
				.bind(&msg.text)
				.bind(msg.sender_id.as_str())
				.bind(&msg.sender_name)
				.bind(receiver)
				.bind(now_ms)
				.bind(now_ms)
				.fetch_one(pool)
				.await?
			}
		};

		let at = ms_to_time(now_ms)?;
		Ok(ChatMessage {
			id: MessageId::from(id),
			sender_id: msg.sender_id,
			sender_name: msg.sender_name,
			text: msg.text,
			receiver_id: msg.receiver_id,
			created_at: at,
			updated_at: at,
		})
	}

	async fn update_message(&self, id: &MessageId, editor: &UserId, text: &str) -> Result<ChatMessage, StoreError> {
		let key: i64 = id.as_str().parse().map_err(|_| StoreError::NotFound(id.clone()))?;

		let row: MessageRow = match &self.backend {
			PersistentBackend::Sqlite(pool) => {
				let mut tx = pool.begin().await?;
				let row: Option<MessageRow> =
					sqlx::query_as(&format!("SELECT {SELECT_COLUMNS} FROM messages WHERE id = ?"))
						.bind(key)
						.fetch_optional(&mut *tx)
						.await?;
				let Some(mut row) = row else {
					return Err(StoreError::NotFound(id.clone()));
				};
				check_author(id, &row.2, editor)?;

				let updated = next_update_time(Utc::now(), ms_to_time(row.5)?, ms_to_time(row.6)?).timestamp_millis();
				sqlx::query("UPDATE messages SET text = ?, updated_at = ? WHERE id = ?")
					.bind(text)
					.bind(updated)
					.bind(key)
					.execute(&mut *tx)
					.await?;
				tx.commit().await?;

				row.1 = text.to_string();
				row.6 = updated;
				row
			}
			PersistentBackend::Postgres(pool) => {
				let mut tx = pool.begin().await?;
				let row: Option<MessageRow> =
					sqlx::query_as(&format!("SELECT {SELECT_COLUMNS} FROM messages WHERE id = $1 FOR UPDATE"))
						.bind(key)
						.fetch_optional(&mut *tx)
						.await?;
				let Some(mut row) = row else {
					return Err(StoreError::NotFound(id.clone()));
				};
				check_author(id, &row.2, editor)?;

				let updated = next_update_time(Utc::now(), ms_to_time(row.5)?, ms_to_time(row.6)?).timestamp_millis();
				sqlx::query("UPDATE messages SET text = $1, updated_at = $2 WHERE id = $3")
					.bind(text)
					.bind(updated)
					.bind(key)
					.execute(&mut *tx)
					.await?;
				tx.commit().await?;

				row.1 = text.to_string();
				row.6 = updated;
				row
			}
		};

		row_to_message(row)
	}

	async fn recent_messages(&self, limit: usize) -> Result<Vec<ChatMessage>, StoreError> {
		let limit = i64::try_from(limit).unwrap_or(i64::MAX);

		let rows: Vec<MessageRow> = match &self.backend {
			PersistentBackend::Sqlite(pool) => {
				sqlx::query_as(&format!("SELECT {SELECT_COLUMNS} FROM messages ORDER BY id DESC LIMIT ?"))
					.bind(limit)
					.fetch_all(pool)
					.await?
			}
			PersistentBackend::Postgres(pool) => {
				sqlx::query_as(&format!("SELECT {SELECT_COLUMNS} FROM messages ORDER BY id DESC LIMIT $1"))
					.bind(limit)
					.fetch_all(pool)
					.await?
			}
		};

		let mut out = rows.into_iter().map(row_to_message).collect::<Result<Vec<_>, _>>()?;
		out.reverse();
		Ok(out)
	}
}
