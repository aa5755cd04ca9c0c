use std::sync::Arc;

use anyhow::anyhow;
use quorum_core::{MessageKind, Room, UserId};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use tokio::sync::{OnceCell, RwLock};
use ulid::Ulid;

use super::core::AppConfig;

const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        user_id TEXT PRIMARY KEY,
        display_name TEXT NOT NULL,
        is_privileged BOOLEAN NOT NULL DEFAULT FALSE
    )",
    "CREATE TABLE IF NOT EXISTS sessions (
        session_id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL REFERENCES users (user_id),
        token_hash TEXT NOT NULL,
        expires_at_unix BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS messages (
        seq BIGSERIAL PRIMARY KEY,
        message_id TEXT UNIQUE NOT NULL,
        user_id TEXT NOT NULL,
        author_name TEXT NOT NULL,
        room TEXT NOT NULL,
        content TEXT NOT NULL,
        kind TEXT NOT NULL,
        created_at_unix BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS rate_buckets (
        user_id TEXT NOT NULL,
        window_start_unix BIGINT NOT NULL,
        count INTEGER NOT NULL,
        PRIMARY KEY (user_id, window_start_unix)
    )",
];

#[derive(Debug, thiserror::Error)]
pub(crate) enum StoreError {
    #[error("message store query failed")]
    Query,
}

/// One persisted chat message. Immutable once appended; `created_at_unix`
/// is assigned by the store and never decreases in insertion order.
#[derive(Debug, Clone)]
pub(crate) struct StoredMessage {
    pub(crate) id: String,
    pub(crate) user_id: String,
    pub(crate) author_name: String,
    pub(crate) room: Room,
    pub(crate) content: String,
    pub(crate) kind: MessageKind,
    pub(crate) created_at_unix: i64,
}

#[derive(Default)]
struct MemoryLog {
    messages: Vec<StoredMessage>,
    last_created_at_unix: i64,
}

/// Append-only durable message log. Runs against Postgres when a
/// `database_url` is configured, otherwise against a process-local log
/// with the same ordering guarantees (single-instance deployments, tests).
#[derive(Clone)]
pub(crate) struct MessageStore {
    pool: Option<PgPool>,
    schema_ready: Arc<OnceCell<()>>,
    memory: Arc<RwLock<MemoryLog>>,
}

impl MessageStore {
    pub(crate) fn new(pool: Option<PgPool>) -> Self {
        Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
            memory: Arc::new(RwLock::new(MemoryLog::default())),
        }
    }

    pub(crate) async fn ensure_schema(&self) -> Result<(), StoreError> {
        let Some(pool) = &self.pool else {
            return Ok(());
        };
        self.schema_ready
            .get_or_try_init(|| async {
                for statement in SCHEMA_STATEMENTS {
                    sqlx::query(statement)
                        .execute(pool)
                        .await
                        .map_err(|_| StoreError::Query)?;
                }
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Append a message, assigning its id and timestamp. The timestamp is
    /// clamped so `created_at_unix` never decreases in insertion order.
    pub(crate) async fn append(
        &self,
        user_id: UserId,
        author_name: &str,
        room: Room,
        content: &str,
        kind: MessageKind,
        now_unix: i64,
    ) -> Result<StoredMessage, StoreError> {
        let message_id = Ulid::new().to_string();

        if let Some(pool) = &self.pool {
            self.ensure_schema().await?;
            let row = sqlx::query(
                "INSERT INTO messages (message_id, user_id, author_name, room, content, kind, created_at_unix)
                 VALUES ($1, $2, $3, $4, $5, $6,
                         GREATEST($7, COALESCE((SELECT MAX(created_at_unix) FROM messages), 0)))
                 RETURNING created_at_unix",
            )
            .bind(&message_id)
            .bind(user_id.to_string())
            .bind(author_name)
            .bind(room.as_str())
            .bind(content)
            .bind(kind.as_str())
            .bind(now_unix)
            .fetch_one(pool)
            .await
            .map_err(|_| StoreError::Query)?;
            let created_at_unix: i64 = row
                .try_get("created_at_unix")
                .map_err(|_| StoreError::Query)?;

            return Ok(StoredMessage {
                id: message_id,
                user_id: user_id.to_string(),
                author_name: author_name.to_owned(),
                room,
                content: content.to_owned(),
                kind,
                created_at_unix,
            });
        }

        let mut memory = self.memory.write().await;
        let created_at_unix = now_unix.max(memory.last_created_at_unix);
        memory.last_created_at_unix = created_at_unix;
        let record = StoredMessage {
            id: message_id,
            user_id: user_id.to_string(),
            author_name: author_name.to_owned(),
            room,
            content: content.to_owned(),
            kind,
            created_at_unix,
        };
        memory.messages.push(record.clone());
        Ok(record)
    }

    /// Newest-first page of a room's log: `limit` rows starting `offset`
    /// rows in. Reading past the end yields an empty page, not an error.
    pub(crate) async fn history(
        &self,
        room: Room,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        if let Some(pool) = &self.pool {
            self.ensure_schema().await?;
            let limit_i64 = i64::try_from(limit).map_err(|_| StoreError::Query)?;
            let offset_i64 = i64::try_from(offset).map_err(|_| StoreError::Query)?;
            let rows = sqlx::query(
                "SELECT message_id, user_id, author_name, content, kind, created_at_unix
                 FROM messages
                 WHERE room = $1
                 ORDER BY created_at_unix DESC, seq DESC
                 LIMIT $2 OFFSET $3",
            )
            .bind(room.as_str())
            .bind(limit_i64)
            .bind(offset_i64)
            .fetch_all(pool)
            .await
            .map_err(|_| StoreError::Query)?;

            let mut messages = Vec::with_capacity(rows.len());
            for row in rows {
                let kind: String = row.try_get("kind").map_err(|_| StoreError::Query)?;
                messages.push(StoredMessage {
                    id: row.try_get("message_id").map_err(|_| StoreError::Query)?,
                    user_id: row.try_get("user_id").map_err(|_| StoreError::Query)?,
                    author_name: row.try_get("author_name").map_err(|_| StoreError::Query)?,
                    room,
                    content: row.try_get("content").map_err(|_| StoreError::Query)?,
                    kind: MessageKind::try_from(kind).map_err(|_| StoreError::Query)?,
                    created_at_unix: row
                        .try_get("created_at_unix")
                        .map_err(|_| StoreError::Query)?,
                });
            }
            return Ok(messages);
        }

        let memory = self.memory.read().await;
        Ok(memory
            .messages
            .iter()
            .rev()
            .filter(|message| message.room == room)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    /// Count of persisted rows for a room. Test and diagnostics helper.
    #[cfg(test)]
    pub(crate) async fn room_len(&self, room: Room) -> usize {
        let memory = self.memory.read().await;
        memory
            .messages
            .iter()
            .filter(|message| message.room == room)
            .count()
    }
}

/// Startup store check: connect, apply schema, round-trip a query.
/// A failure here is fatal by design — the process must not serve
/// traffic without its durable log.
///
/// # Errors
/// Returns an error when the configured database cannot be reached or
/// the schema cannot be applied. No-op without a configured database.
pub async fn verify_store(config: &AppConfig) -> anyhow::Result<()> {
    let Some(database_url) = &config.database_url else {
        return Ok(());
    };

    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(database_url)
        .await
        .map_err(|e| anyhow!("message store is unreachable: {e}"))?;
    for statement in SCHEMA_STATEMENTS {
        sqlx::query(statement)
            .execute(&pool)
            .await
            .map_err(|e| anyhow!("message store schema init failed: {e}"))?;
    }
    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .map_err(|e| anyhow!("message store ping failed: {e}"))?;
    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use quorum_core::{MessageKind, Room, UserId};

    use super::MessageStore;

    #[tokio::test]
    async fn append_assigns_non_decreasing_timestamps() {
        let store = MessageStore::new(None);
        let user = UserId::new();

        let first = store
            .append(user, "Alice", Room::Global, "m1", MessageKind::User, 100)
            .await
            .unwrap();
        // A clock that stepped backwards must not reorder the log.
        let second = store
            .append(user, "Alice", Room::Global, "m2", MessageKind::User, 90)
            .await
            .unwrap();
        let third = store
            .append(user, "Alice", Room::Global, "m3", MessageKind::User, 105)
            .await
            .unwrap();

        assert!(second.created_at_unix >= first.created_at_unix);
        assert!(third.created_at_unix >= second.created_at_unix);
    }

    #[tokio::test]
    async fn history_pages_newest_first_with_offset() {
        let store = MessageStore::new(None);
        let user = UserId::new();
        for index in 0..5 {
            store
                .append(
                    user,
                    "Alice",
                    Room::Global,
                    &format!("m{index}"),
                    MessageKind::User,
                    1000 + index,
                )
                .await
                .unwrap();
        }

        let first_page = store.history(Room::Global, 2, 0).await.unwrap();
        assert_eq!(first_page.len(), 2);
        assert_eq!(first_page[0].content, "m4");
        assert_eq!(first_page[1].content, "m3");

        let second_page = store.history(Room::Global, 2, 2).await.unwrap();
        assert_eq!(second_page[0].content, "m2");

        let past_end = store.history(Room::Global, 2, 50).await.unwrap();
        assert!(past_end.is_empty());
    }

    #[tokio::test]
    async fn history_is_scoped_by_room() {
        let store = MessageStore::new(None);
        let user = UserId::new();
        store
            .append(user, "Alice", Room::Global, "public", MessageKind::User, 1)
            .await
            .unwrap();
        store
            .append(user, "Alice", Room::Members, "private", MessageKind::User, 2)
            .await
            .unwrap();

        let members_page = store.history(Room::Members, 10, 0).await.unwrap();
        assert_eq!(members_page.len(), 1);
        assert_eq!(members_page[0].content, "private");
    }
}
