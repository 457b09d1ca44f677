//! Deleted-message history
//!
//! Deleted messages are captured from the gateway cache and persisted so the
//! snipe command can recall them. Retention is bounded per channel.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

/// One captured deleted message
#[derive(Debug, Clone)]
pub struct DeletedMessage {
    pub message_id: u64,
    pub channel_id: u64,
    pub guild_id: Option<u64>,
    pub author_id: u64,
    pub author_tag: String,
    pub content: String,
    pub deleted_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct DeletedMessageRecord {
    message_id: i64,
    channel_id: i64,
    guild_id: Option<i64>,
    author_id: i64,
    author_tag: String,
    content: String,
    deleted_at: DateTime<Utc>,
}

impl From<DeletedMessageRecord> for DeletedMessage {
    fn from(record: DeletedMessageRecord) -> Self {
        Self {
            message_id: record.message_id as u64,
            channel_id: record.channel_id as u64,
            guild_id: record.guild_id.map(|id| id as u64),
            author_id: record.author_id as u64,
            author_tag: record.author_tag,
            content: record.content,
            deleted_at: record.deleted_at,
        }
    }
}

/// Store for deleted-message history (`deleted_messages` table)
#[derive(Clone)]
pub struct SnipeStore {
    pool: SqlitePool,
}

impl SnipeStore {
    /// Create a new snipe store on top of an existing pool
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record a deleted message, then trim the channel's history down to
    /// `retention` entries (oldest first).
    pub async fn record(&self, message: &DeletedMessage, retention: u32) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO deleted_messages \
             (message_id, channel_id, guild_id, author_id, author_tag, content, deleted_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(message.message_id as i64)
        .bind(message.channel_id as i64)
        .bind(message.guild_id.map(|id| id as i64))
        .bind(message.author_id as i64)
        .bind(&message.author_tag)
        .bind(&message.content)
        .bind(message.deleted_at)
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "DELETE FROM deleted_messages WHERE channel_id = ? AND id NOT IN \
             (SELECT id FROM deleted_messages WHERE channel_id = ? ORDER BY id DESC LIMIT ?)",
        )
        .bind(message.channel_id as i64)
        .bind(message.channel_id as i64)
        .bind(i64::from(retention))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Most recent deleted messages in a channel, newest first
    pub async fn latest(
        &self,
        channel_id: u64,
        limit: u32,
    ) -> Result<Vec<DeletedMessage>, sqlx::Error> {
        let records: Vec<DeletedMessageRecord> = sqlx::query_as(
            "SELECT message_id, channel_id, guild_id, author_id, author_tag, content, deleted_at \
             FROM deleted_messages WHERE channel_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(channel_id as i64)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(records.into_iter().map(Into::into).collect())
    }

    /// Total entries across all channels
    pub async fn count(&self) -> Result<i64, sqlx::Error> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM deleted_messages")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(message_id: u64, channel_id: u64, content: &str) -> DeletedMessage {
        DeletedMessage {
            message_id,
            channel_id,
            guild_id: Some(1),
            author_id: 42,
            author_tag: "someone#0".to_string(),
            content: content.to_string(),
            deleted_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_record_and_latest() {
        let pool = crate::db::memory_pool().await;
        let store = SnipeStore::new(pool);

        store.record(&message(1, 100, "first"), 10).await.unwrap();
        store.record(&message(2, 100, "second"), 10).await.unwrap();
        store.record(&message(3, 200, "other channel"), 10).await.unwrap();

        let latest = store.latest(100, 5).await.unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].content, "second");
        assert_eq!(latest[1].content, "first");

        let other = store.latest(200, 5).await.unwrap();
        assert_eq!(other.len(), 1);
        assert_eq!(other[0].author_tag, "someone#0");
    }

    #[tokio::test]
    async fn test_retention_trims_oldest_entries() {
        let pool = crate::db::memory_pool().await;
        let store = SnipeStore::new(pool);

        for i in 1..=5 {
            store
                .record(&message(i, 100, &format!("message {i}")), 3)
                .await
                .unwrap();
        }

        let latest = store.latest(100, 10).await.unwrap();
        assert_eq!(latest.len(), 3);
        assert_eq!(latest[0].content, "message 5");
        assert_eq!(latest[2].content, "message 3");
        assert_eq!(store.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_retention_is_per_channel() {
        let pool = crate::db::memory_pool().await;
        let store = SnipeStore::new(pool);

        store.record(&message(1, 100, "keep me"), 1).await.unwrap();
        store.record(&message(2, 200, "me too"), 1).await.unwrap();

        assert_eq!(store.latest(100, 5).await.unwrap().len(), 1);
        assert_eq!(store.latest(200, 5).await.unwrap().len(), 1);
    }
}
