use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::SessionId;

/// Persistent tier of the client's session-id cache.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedSession {
    pub pair_key: String,
    pub session_id: SessionId,
    pub updated_at: DateTime<Utc>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid sqlite url '{database_url}'"))?
            .create_if_missing(true);
        // Every connection to `sqlite::memory:` is its own database, so keep exactly one alive.
        let in_memory = database_url.starts_with("sqlite::memory:");
        let mut pool_options = SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 5 });
        if in_memory {
            pool_options = pool_options
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }
        let pool = pool_options
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open session cache at '{database_url}'"))?;
        let storage = Self { pool };
        storage.ensure_session_cache_table().await?;
        Ok(storage)
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

    async fn ensure_session_cache_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS session_cache (
                pair_key   TEXT PRIMARY KEY NOT NULL,
                session_id TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure session_cache table exists")?;
        Ok(())
    }

    pub async fn cached_session(&self, pair_key: &str) -> Result<Option<SessionId>> {
        let row = sqlx::query("SELECT session_id FROM session_cache WHERE pair_key = ?")
            .bind(pair_key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to read cached session for '{pair_key}'"))?;
        Ok(row.map(|r| SessionId(r.get::<String, _>(0))))
    }

    /// Inserts or atomically replaces the entry for `pair_key`.
    pub async fn store_cached_session(&self, pair_key: &str, session_id: &SessionId) -> Result<()> {
        sqlx::query(
            "INSERT INTO session_cache (pair_key, session_id, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(pair_key) DO UPDATE SET
                session_id = excluded.session_id,
                updated_at = excluded.updated_at",
        )
        .bind(pair_key)
        .bind(session_id.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to store cached session for '{pair_key}'"))?;
        Ok(())
    }

    pub async fn evict_cached_session(&self, pair_key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM session_cache WHERE pair_key = ?")
            .bind(pair_key)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to evict cached session for '{pair_key}'"))?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_cached_sessions(&self) -> Result<Vec<CachedSession>> {
        let rows = sqlx::query(
            "SELECT pair_key, session_id, updated_at FROM session_cache ORDER BY updated_at DESC",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list cached sessions")?;

        rows.into_iter()
            .map(|row| -> Result<CachedSession> {
                Ok(CachedSession {
                    pair_key: row.try_get("pair_key")?,
                    session_id: SessionId(row.try_get("session_id")?),
                    updated_at: row.try_get("updated_at")?,
                })
            })
            .collect()
    }

    pub async fn clear_session_cache(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM session_cache")
            .execute(&self.pool)
            .await
            .context("failed to clear session cache")?;
        Ok(result.rows_affected())
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
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
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
