//! SQLite pool construction and schema migration

use std::str::FromStr;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::info;

/// Open (and create if missing) the bot database
pub async fn connect(url: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Bring the schema up to date. All statements are idempotent.
pub async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS muted_users (\
         user_id INTEGER PRIMARY KEY, \
         guild_id INTEGER NOT NULL, \
         had_member_role INTEGER NOT NULL DEFAULT 0, \
         expires_at TEXT NOT NULL)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS temp_bans (\
         user_id INTEGER PRIMARY KEY, \
         guild_id INTEGER NOT NULL, \
         expires_at TEXT NOT NULL)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS deleted_messages (\
         id INTEGER PRIMARY KEY AUTOINCREMENT, \
         message_id INTEGER NOT NULL, \
         channel_id INTEGER NOT NULL, \
         guild_id INTEGER, \
         author_id INTEGER NOT NULL, \
         author_tag TEXT NOT NULL, \
         content TEXT NOT NULL, \
         deleted_at TEXT NOT NULL)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS deleted_messages_channel \
         ON deleted_messages (channel_id, id)",
    )
    .execute(pool)
    .await?;

    info!("database schema ready");
    Ok(())
}

/// Health probe used by the status command
pub async fn is_connected(pool: &SqlitePool) -> bool {
    sqlx::query("SELECT 1").execute(pool).await.is_ok()
}

/// Fresh in-memory database for tests. Single connection: every connection to
/// `sqlite::memory:` is its own database.
#[cfg(test)]
pub(crate) async fn memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory database should open");
    migrate(&pool).await.expect("migration should succeed");
    pool
}
