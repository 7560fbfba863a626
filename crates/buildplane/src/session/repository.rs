//! Session store trait and SQLite-backed implementation.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::SqlitePool;

use super::models::{Session, SessionStatus, now_millis};

/// Persistence capability for sessions.
///
/// Implementations must make every operation atomic per session key;
/// last-writer-wins between concurrent upserts is acceptable because the
/// backend status is re-derived on the next reconciliation anyway.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Look up a session by its ID.
    async fn get(&self, session_id: &str) -> Result<Option<Session>>;

    /// Insert or replace the session row, refreshing its heartbeat.
    async fn upsert(
        &self,
        user_id: &str,
        repo_hash: &str,
        session_id: &str,
        server_address: Option<&str>,
        status: SessionStatus,
    ) -> Result<()>;

    /// Refresh the heartbeat; silently does nothing for unknown sessions.
    async fn touch_heartbeat(&self, session_id: &str) -> Result<()>;

    /// Delete the session row, if present.
    async fn delete(&self, session_id: &str) -> Result<()>;

    /// Snapshot of sessions whose heartbeat is older than `max_age`.
    async fn list_stale(&self, max_age: Duration) -> Result<Vec<Session>>;
}

/// SQLite-backed session store.
#[derive(Debug, Clone)]
pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    /// Create a new store over an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn get(&self, session_id: &str) -> Result<Option<Session>> {
        let session = sqlx::query_as::<_, Session>(
            r#"
            SELECT user_id, repo_hash, session_id, server_address, status, last_heartbeat
            FROM sessions
            WHERE session_id = ?
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching session")?;

        Ok(session)
    }

    async fn upsert(
        &self,
        user_id: &str,
        repo_hash: &str,
        session_id: &str,
        server_address: Option<&str>,
        status: SessionStatus,
    ) -> Result<()> {
        // Single statement so the write is atomic per key.
        sqlx::query(
            r#"
            INSERT INTO sessions (user_id, repo_hash, session_id, server_address, status, last_heartbeat)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET
                user_id = excluded.user_id,
                repo_hash = excluded.repo_hash,
                server_address = excluded.server_address,
                status = excluded.status,
                last_heartbeat = excluded.last_heartbeat
            "#,
        )
        .bind(user_id)
        .bind(repo_hash)
        .bind(session_id)
        .bind(server_address)
        .bind(status.to_string())
        .bind(now_millis())
        .execute(&self.pool)
        .await
        .context("upserting session")?;

        Ok(())
    }

    async fn touch_heartbeat(&self, session_id: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET last_heartbeat = ? WHERE session_id = ?")
            .bind(now_millis())
            .bind(session_id)
            .execute(&self.pool)
            .await
            .context("refreshing session heartbeat")?;

        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .context("deleting session")?;

        Ok(())
    }

    async fn list_stale(&self, max_age: Duration) -> Result<Vec<Session>> {
        let cutoff = now_millis() - max_age.as_millis() as i64;
        let sessions = sqlx::query_as::<_, Session>(
            r#"
            SELECT user_id, repo_hash, session_id, server_address, status, last_heartbeat
            FROM sessions
            WHERE last_heartbeat < ?
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .context("listing stale sessions")?;

        Ok(sessions)
    }
}
