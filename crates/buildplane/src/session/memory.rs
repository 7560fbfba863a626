//! In-memory session store.
//!
//! Used for tests and for single-node deployments that do not need durable
//! session state; a restart simply forgets all sessions and the compute
//! backends are re-created on the next poll.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;

use super::models::{Session, SessionStatus, now_millis};
use super::repository::SessionStore;

/// Session store backed by a shared in-process map.
#[derive(Debug, Default, Clone)]
pub struct InMemorySessionStore {
    sessions: Arc<Mutex<HashMap<String, Session>>>,
}

impl InMemorySessionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, session_id: &str) -> Result<Option<Session>> {
        let sessions = self.sessions.lock().await;
        Ok(sessions.get(session_id).cloned())
    }

    async fn upsert(
        &self,
        user_id: &str,
        repo_hash: &str,
        session_id: &str,
        server_address: Option<&str>,
        status: SessionStatus,
    ) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        sessions.insert(
            session_id.to_string(),
            Session {
                user_id: user_id.to_string(),
                repo_hash: repo_hash.to_string(),
                session_id: session_id.to_string(),
                server_address: server_address.map(str::to_string),
                status,
                last_heartbeat: now_millis(),
            },
        );
        Ok(())
    }

    async fn touch_heartbeat(&self, session_id: &str) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get_mut(session_id) {
            session.last_heartbeat = now_millis();
        }
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        sessions.remove(session_id);
        Ok(())
    }

    async fn list_stale(&self, max_age: Duration) -> Result<Vec<Session>> {
        let now = now_millis();
        let max_age_ms = max_age.as_millis() as i64;
        let sessions = self.sessions.lock().await;
        Ok(sessions
            .values()
            .filter(|s| s.heartbeat_age(now) > max_age_ms)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upsert_and_get() {
        let store = InMemorySessionStore::new();
        store
            .upsert("u1", "r1", "s1", None, SessionStatus::Pending)
            .await
            .unwrap();

        let session = store.get("s1").await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Pending);
        assert!(session.last_heartbeat > 0);
    }

    #[tokio::test]
    async fn test_clone_shares_state() {
        let store = InMemorySessionStore::new();
        let view = store.clone();
        store
            .upsert("u1", "r1", "s1", Some("127.0.0.1:9011"), SessionStatus::Ready)
            .await
            .unwrap();

        let session = view.get("s1").await.unwrap().unwrap();
        assert_eq!(session.server_address.as_deref(), Some("127.0.0.1:9011"));
    }

    #[tokio::test]
    async fn test_touch_unknown_session_is_noop() {
        let store = InMemorySessionStore::new();
        store.touch_heartbeat("ghost").await.unwrap();
        assert!(store.get("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_stale_splits_on_age() {
        let store = InMemorySessionStore::new();
        store
            .upsert("u1", "r1", "old", None, SessionStatus::Ready)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        store
            .upsert("u1", "r1", "fresh", None, SessionStatus::Pending)
            .await
            .unwrap();

        let stale = store.list_stale(Duration::from_millis(50)).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].session_id, "old");

        // A touch rescues the old session from the next snapshot.
        store.touch_heartbeat("old").await.unwrap();
        assert!(store.list_stale(Duration::from_millis(50)).await.unwrap().is_empty());
    }
}
