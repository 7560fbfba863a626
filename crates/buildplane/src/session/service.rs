//! Orchestration core - the per-session request protocol.
//!
//! One state machine per session: implicit NEW (no row) -> PENDING -> READY,
//! with a terminal TERMINATED when the backend fails. Every successful
//! response refreshes the heartbeat; polling is what keeps a session alive
//! against the reaper.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};

use crate::compute::{ComputeBackend, WorkloadKey, WorkloadSpec, WorkloadState};

use super::models::{GetServerRequest, ServerInfo, Session, SessionStatus};
use super::repository::SessionStore;

/// Orchestration core configuration.
#[derive(Debug, Clone)]
pub struct SessionServiceConfig {
    /// Deadline for a single backend call made while handling a request, so
    /// one slow substrate call cannot stall the request-handling pool.
    pub backend_call_timeout: Duration,
}

impl Default for SessionServiceConfig {
    fn default() -> Self {
        Self {
            backend_call_timeout: Duration::from_secs(30),
        }
    }
}

/// Service implementing the get-server / heartbeat protocol.
#[derive(Clone)]
pub struct SessionService {
    store: Arc<dyn SessionStore>,
    compute: Arc<dyn ComputeBackend>,
    config: SessionServiceConfig,
}

impl SessionService {
    /// Create a new session service.
    pub fn new(
        store: Arc<dyn SessionStore>,
        compute: Arc<dyn ComputeBackend>,
        config: SessionServiceConfig,
    ) -> Self {
        Self {
            store,
            compute,
            config,
        }
    }

    /// Provision a build server on first contact, or reconcile and report on
    /// subsequent polls.
    pub async fn get_server(&self, req: GetServerRequest) -> Result<ServerInfo> {
        // Session identity is client-owned; without it the supersede logic
        // below is meaningless. Reject before touching store or backend.
        if req.session_id.is_empty() {
            anyhow::bail!("session_id is required");
        }

        info!(
            "GetServer for user {} repo {} (session {})",
            req.user_id, req.repo_hash, req.session_id
        );

        match self.store.get(&req.session_id).await? {
            Some(session) => self.reconcile(session).await,
            None => self.provision(&req).await,
        }
    }

    /// Pure liveness refresh; a no-op for unknown sessions.
    pub async fn heartbeat(&self, session_id: &str) -> Result<()> {
        self.store.touch_heartbeat(session_id).await
    }

    /// Stored row for a session, without reconciling or touching it.
    pub async fn lookup(&self, session_id: &str) -> Result<Option<Session>> {
        self.store.get(session_id).await
    }

    /// NEW session: create the backend, then record the row as PENDING.
    async fn provision(&self, req: &GetServerRequest) -> Result<ServerInfo> {
        let spec = WorkloadSpec {
            key: WorkloadKey::new(&req.user_id, &req.repo_hash, &req.session_id),
            source_path: req.source_path.clone(),
            startup_options: req.startup_options.clone(),
            region: req.region.clone(),
        };

        tokio::time::timeout(self.config.backend_call_timeout, self.compute.create(&spec))
            .await
            .context("backend create timed out")?
            .context("creating backend workload")?;

        self.store
            .upsert(
                &req.user_id,
                &req.repo_hash,
                &req.session_id,
                None,
                SessionStatus::Pending,
            )
            .await?;

        Ok(ServerInfo {
            status: SessionStatus::Pending,
            server_address: None,
        })
    }

    /// Known session: re-derive status from the backend for this exact tuple
    /// and refresh the stored row.
    async fn reconcile(&self, session: Session) -> Result<ServerInfo> {
        let key = WorkloadKey::new(&session.user_id, &session.repo_hash, &session.session_id);

        let observed =
            match tokio::time::timeout(self.config.backend_call_timeout, self.compute.status(&key))
                .await
            {
                Ok(Ok(observed)) => observed,
                Ok(Err(e)) => {
                    warn!(
                        "Backend status failed for session {}: {:?}",
                        session.session_id, e
                    );
                    return self.degrade_to_pending(&session).await;
                }
                Err(_) => {
                    warn!("Backend status timed out for session {}", session.session_id);
                    return self.degrade_to_pending(&session).await;
                }
            };

        let Some(state) = observed else {
            // Row without a backend. Keep the row; either a later create or
            // the reaper resolves the divergence.
            warn!("Backend missing for session {}", session.session_id);
            return self.degrade_to_pending(&session).await;
        };

        if state_differs(&session, &state) {
            self.store
                .upsert(
                    &session.user_id,
                    &session.repo_hash,
                    &session.session_id,
                    state.address.as_deref(),
                    state.status,
                )
                .await?;
        } else {
            self.store.touch_heartbeat(&session.session_id).await?;
        }

        Ok(ServerInfo {
            status: state.status,
            server_address: state.address,
        })
    }

    /// Degraded-but-safe response: the client cannot tell a provisioning
    /// backend from a momentarily unreachable one, and its retry loop is the
    /// recovery path. The response is still a successful interaction, so the
    /// heartbeat is refreshed.
    async fn degrade_to_pending(&self, session: &Session) -> Result<ServerInfo> {
        self.store.touch_heartbeat(&session.session_id).await?;
        Ok(ServerInfo {
            status: SessionStatus::Pending,
            server_address: None,
        })
    }
}

/// Whether the observed backend state diverges from the stored row.
fn state_differs(session: &Session, state: &WorkloadState) -> bool {
    state.status != session.status
        || (state.address.is_some() && state.address != session.server_address)
}
