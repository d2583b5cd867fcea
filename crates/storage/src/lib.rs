use anyhow::{Context, Result};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::warn;

use shared::domain::{Message, MessageId, MessageStatus, RoomId};

/// Durable per-room message store. Pure read/write primitives, no business
/// logic: the sync controller owns ordering and the send state machine.
///
/// Every public operation is room-scoped and degrades rather than fails:
/// load errors read as an empty room, write errors are logged and become
/// no-ops. The caller's in-memory state may run temporarily ahead of durable
/// state; the next successful save reconciles.
#[derive(Clone)]
pub struct MessageStore {
    pool: Pool<Sqlite>,
}

impl MessageStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Loads every message for the room, ordered by `created_at` ascending
    /// with insertion order as the tiebreak. Missing or corrupt data reads
    /// as an empty room.
    pub async fn load(&self, room_id: &RoomId) -> Vec<Message> {
        match self.try_load(room_id).await {
            Ok(messages) => messages,
            Err(err) => {
                warn!(room_id = %room_id, "message load failed, treating room as empty: {err:#}");
                Vec::new()
            }
        }
    }

    /// Replaces the room's message set wholesale. Atomic from the caller's
    /// perspective; a failure leaves the previous contents untouched.
    pub async fn save(&self, room_id: &RoomId, messages: &[Message]) {
        if let Err(err) = self.try_save(room_id, messages).await {
            warn!(room_id = %room_id, count = messages.len(), "message save failed: {err:#}");
        }
    }

    /// Inserts the message if its id is absent, otherwise shallow-merges its
    /// fields over the stored record.
    pub async fn upsert(&self, room_id: &RoomId, message: &Message) {
        if let Err(err) = self.try_upsert(room_id, message).await {
            warn!(room_id = %room_id, message_id = %message.id, "message upsert failed: {err:#}");
        }
    }

    pub async fn remove(&self, room_id: &RoomId, message_id: &MessageId) {
        let result = sqlx::query("DELETE FROM room_messages WHERE room_id = ? AND message_id = ?")
            .bind(room_id.as_str())
            .bind(message_id.as_str())
            .execute(&self.pool)
            .await;
        if let Err(err) = result {
            warn!(room_id = %room_id, message_id = %message_id, "message remove failed: {err}");
        }
    }

    pub async fn update_status(
        &self,
        room_id: &RoomId,
        message_id: &MessageId,
        status: MessageStatus,
    ) {
        if let Err(err) = self.try_update_status(room_id, message_id, status).await {
            warn!(room_id = %room_id, message_id = %message_id, "status update failed: {err:#}");
        }
    }

    /// Applies a pure transform to every message in the room and persists
    /// the result.
    pub async fn bulk_update<F>(&self, room_id: &RoomId, transform: F)
    where
        F: Fn(&mut Message),
    {
        let mut messages = self.load(room_id).await;
        for message in &mut messages {
            transform(message);
        }
        self.save(room_id, &messages).await;
    }

    async fn try_load(&self, room_id: &RoomId) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT message_id, body FROM room_messages
             WHERE room_id = ?
             ORDER BY created_at ASC, rowid ASC",
        )
        .bind(room_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let body = row.get::<String, _>(1);
            match serde_json::from_str::<Message>(&body) {
                Ok(message) => messages.push(message),
                Err(err) => {
                    // Skip the corrupt row instead of failing the whole room.
                    let message_id = row.get::<String, _>(0);
                    warn!(room_id = %room_id, message_id, "skipping corrupt message row: {err}");
                }
            }
        }
        Ok(messages)
    }

    async fn try_save(&self, room_id: &RoomId, messages: &[Message]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM room_messages WHERE room_id = ?")
            .bind(room_id.as_str())
            .execute(&mut *tx)
            .await?;

        for message in messages {
            let body = serde_json::to_string(message)
                .with_context(|| format!("failed to encode message {}", message.id))?;
            sqlx::query(
                "INSERT INTO room_messages (room_id, message_id, client_id, created_at, status, body)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(room_id.as_str())
            .bind(message.id.as_str())
            .bind(message.client_id.as_str())
            .bind(message.created_at)
            .bind(status_label(message.status))
            .bind(body)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn try_upsert(&self, room_id: &RoomId, message: &Message) -> Result<()> {
        let existing =
            sqlx::query("SELECT body FROM room_messages WHERE room_id = ? AND message_id = ?")
                .bind(room_id.as_str())
                .bind(message.id.as_str())
                .fetch_optional(&self.pool)
                .await?;

        let body = match existing {
            Some(row) => {
                let merged = shallow_merge(&row.get::<String, _>(0), message)?;
                serde_json::to_string(&merged)?
            }
            None => serde_json::to_string(message)?,
        };

        sqlx::query(
            "INSERT INTO room_messages (room_id, message_id, client_id, created_at, status, body)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(room_id, message_id) DO UPDATE SET
                client_id = excluded.client_id,
                created_at = excluded.created_at,
                status = excluded.status,
                body = excluded.body",
        )
        .bind(room_id.as_str())
        .bind(message.id.as_str())
        .bind(message.client_id.as_str())
        .bind(message.created_at)
        .bind(status_label(message.status))
        .bind(body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn try_update_status(
        &self,
        room_id: &RoomId,
        message_id: &MessageId,
        status: MessageStatus,
    ) -> Result<()> {
        let row = sqlx::query("SELECT body FROM room_messages WHERE room_id = ? AND message_id = ?")
            .bind(room_id.as_str())
            .bind(message_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(());
        };

        let mut message: Message = serde_json::from_str(&row.get::<String, _>(0))
            .with_context(|| format!("corrupt stored body for message {message_id}"))?;
        message.status = status;
        let body = serde_json::to_string(&message)?;

        sqlx::query(
            "UPDATE room_messages SET status = ?, body = ? WHERE room_id = ? AND message_id = ?",
        )
        .bind(status_label(status))
        .bind(body)
        .bind(room_id.as_str())
        .bind(message_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Overlays the incoming message's JSON fields onto the stored record.
/// Fields the incoming message omits (skipped optionals) survive from the
/// stored copy, which is what shallow merge means here.
fn shallow_merge(stored_body: &str, incoming: &Message) -> Result<Message> {
    let mut stored: serde_json::Value =
        serde_json::from_str(stored_body).context("corrupt stored body")?;
    let incoming_value = serde_json::to_value(incoming)?;

    if let (Some(stored_map), Some(incoming_map)) =
        (stored.as_object_mut(), incoming_value.as_object())
    {
        for (key, value) in incoming_map {
            stored_map.insert(key.clone(), value.clone());
        }
    } else {
        return Ok(incoming.clone());
    }

    serde_json::from_value(stored).context("merged body did not decode")
}

fn status_label(status: MessageStatus) -> &'static str {
    match status {
        MessageStatus::LocalOnly => "local_only",
        MessageStatus::Pending => "pending",
        MessageStatus::Sending => "sending",
        MessageStatus::Sent => "sent",
        MessageStatus::Delivered => "delivered",
        MessageStatus::Read => "read",
        MessageStatus::Failed => "failed",
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
