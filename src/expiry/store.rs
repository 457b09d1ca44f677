//! SQLite-backed punishment stores
//!
//! One store per punishment-type table. The tables are the single source of
//! truth: the scheduler's armed delay is only a cache of what the table
//! currently says is soonest.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::expiry::{ExpiryResult, PunishmentRow};

/// Store for active timed mutes (`muted_users` table)
#[derive(Clone)]
pub struct MuteStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct MuteRecord {
    user_id: i64,
    guild_id: i64,
    had_member_role: bool,
    expires_at: DateTime<Utc>,
}

impl From<MuteRecord> for PunishmentRow {
    fn from(record: MuteRecord) -> Self {
        Self {
            subject: record.user_id as u64,
            guild: record.guild_id as u64,
            expires_at: record.expires_at,
            restore_member_role: record.had_member_role,
        }
    }
}

impl MuteStore {
    /// Create a new mute store on top of an existing pool
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace the row for a subject.
    ///
    /// The primary key keeps the table at one row per subject; re-muting an
    /// already muted user simply moves the deadline.
    pub async fn insert(
        &self,
        subject: u64,
        guild: u64,
        had_member_role: bool,
        expires_at: DateTime<Utc>,
    ) -> ExpiryResult<()> {
        sqlx::query(
            "INSERT INTO muted_users (user_id, guild_id, had_member_role, expires_at) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(user_id) DO UPDATE SET \
             guild_id = excluded.guild_id, \
             had_member_role = excluded.had_member_role, \
             expires_at = excluded.expires_at",
        )
        .bind(subject as i64)
        .bind(guild as i64)
        .bind(had_member_role)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Get the row for a subject, if one exists
    pub async fn get(&self, subject: u64) -> ExpiryResult<Option<PunishmentRow>> {
        let record: Option<MuteRecord> = sqlx::query_as(
            "SELECT user_id, guild_id, had_member_role, expires_at \
             FROM muted_users WHERE user_id = ?",
        )
        .bind(subject as i64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record.map(Into::into))
    }

    /// Whether a row for this subject exists
    pub async fn contains(&self, subject: u64) -> ExpiryResult<bool> {
        Ok(self.get(subject).await?.is_some())
    }

    /// Delete the row for a subject. Returns whether a row existed.
    pub async fn delete(&self, subject: u64) -> ExpiryResult<bool> {
        let done = sqlx::query("DELETE FROM muted_users WHERE user_id = ?")
            .bind(subject as i64)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    /// Full table scan, in insertion order
    pub async fn all(&self) -> ExpiryResult<Vec<PunishmentRow>> {
        let records: Vec<MuteRecord> = sqlx::query_as(
            "SELECT user_id, guild_id, had_member_role, expires_at \
             FROM muted_users ORDER BY rowid",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records.into_iter().map(Into::into).collect())
    }

    /// Number of active mute rows
    pub async fn count(&self) -> ExpiryResult<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM muted_users")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

/// Store for active temporary bans (`temp_bans` table)
#[derive(Clone)]
pub struct BanStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct BanRecord {
    user_id: i64,
    guild_id: i64,
    expires_at: DateTime<Utc>,
}

impl From<BanRecord> for PunishmentRow {
    fn from(record: BanRecord) -> Self {
        Self {
            subject: record.user_id as u64,
            guild: record.guild_id as u64,
            expires_at: record.expires_at,
            restore_member_role: false,
        }
    }
}

impl BanStore {
    /// Create a new ban store on top of an existing pool
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace the row for a subject
    pub async fn insert(&self, subject: u64, guild: u64, expires_at: DateTime<Utc>) -> ExpiryResult<()> {
        sqlx::query(
            "INSERT INTO temp_bans (user_id, guild_id, expires_at) \
             VALUES (?, ?, ?) \
             ON CONFLICT(user_id) DO UPDATE SET \
             guild_id = excluded.guild_id, \
             expires_at = excluded.expires_at",
        )
        .bind(subject as i64)
        .bind(guild as i64)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Get the row for a subject, if one exists
    pub async fn get(&self, subject: u64) -> ExpiryResult<Option<PunishmentRow>> {
        let record: Option<BanRecord> =
            sqlx::query_as("SELECT user_id, guild_id, expires_at FROM temp_bans WHERE user_id = ?")
                .bind(subject as i64)
                .fetch_optional(&self.pool)
                .await?;
        Ok(record.map(Into::into))
    }

    /// Whether a row for this subject exists
    pub async fn contains(&self, subject: u64) -> ExpiryResult<bool> {
        Ok(self.get(subject).await?.is_some())
    }

    /// Delete the row for a subject. Returns whether a row existed.
    pub async fn delete(&self, subject: u64) -> ExpiryResult<bool> {
        let done = sqlx::query("DELETE FROM temp_bans WHERE user_id = ?")
            .bind(subject as i64)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    /// Full table scan, in insertion order
    pub async fn all(&self) -> ExpiryResult<Vec<PunishmentRow>> {
        let records: Vec<BanRecord> =
            sqlx::query_as("SELECT user_id, guild_id, expires_at FROM temp_bans ORDER BY rowid")
                .fetch_all(&self.pool)
                .await?;
        Ok(records.into_iter().map(Into::into).collect())
    }

    /// Number of active ban rows
    pub async fn count(&self) -> ExpiryResult<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM temp_bans")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_mute_insert_and_get() {
        let pool = crate::db::memory_pool().await;
        let store = MuteStore::new(pool);
        let expires_at = Utc::now() + Duration::minutes(10);

        store.insert(12345, 67890, true, expires_at).await.unwrap();

        let row = store.get(12345).await.unwrap().expect("row should exist");
        assert_eq!(row.subject, 12345);
        assert_eq!(row.guild, 67890);
        assert!(row.restore_member_role);
        // SQLite round-trips chrono timestamps at sub-second precision.
        assert!((row.expires_at - expires_at).num_milliseconds().abs() < 2);

        assert!(store.contains(12345).await.unwrap());
        assert!(!store.contains(99999).await.unwrap());
    }

    #[tokio::test]
    async fn test_mute_upsert_keeps_one_row_per_subject() {
        let pool = crate::db::memory_pool().await;
        let store = MuteStore::new(pool);
        let first = Utc::now() + Duration::minutes(5);
        let second = Utc::now() + Duration::minutes(30);

        store.insert(1, 10, false, first).await.unwrap();
        store.insert(1, 10, true, second).await.unwrap();

        let rows = store.all().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].restore_member_role);
        assert!((rows[0].expires_at - second).num_milliseconds().abs() < 2);
    }

    #[tokio::test]
    async fn test_mute_delete_reports_existence() {
        let pool = crate::db::memory_pool().await;
        let store = MuteStore::new(pool);

        store
            .insert(7, 10, false, Utc::now() + Duration::minutes(1))
            .await
            .unwrap();

        assert!(store.delete(7).await.unwrap());
        assert!(!store.delete(7).await.unwrap());
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ban_round_trip() {
        let pool = crate::db::memory_pool().await;
        let store = BanStore::new(pool);
        let expires_at = Utc::now() + Duration::hours(1);

        store.insert(555, 10, expires_at).await.unwrap();
        store.insert(777, 10, expires_at + Duration::hours(1)).await.unwrap();

        let rows = store.all().await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].subject, 555);
        assert!(!rows[0].restore_member_role);
        assert_eq!(store.count().await.unwrap(), 2);

        assert!(store.delete(555).await.unwrap());
        assert!(store.get(555).await.unwrap().is_none());
        assert!(store.get(777).await.unwrap().is_some());
    }
}
