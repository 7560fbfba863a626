//! Staleness reaper.
//!
//! A periodic sweep that reclaims sessions whose clients have stopped
//! polling: backend resource first, then the session row, so a deleted row
//! can never leave behind an undiscoverable backend. The reaper runs on its
//! own task with an explicit spawn/shutdown lifecycle.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{error, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::compute::{ComputeBackend, WorkloadKey};

use super::models::Session;
use super::repository::SessionStore;

/// Reaper configuration.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// How often the sweep runs.
    pub sweep_interval: Duration,
    /// Maximum heartbeat age before a session is reclaimed.
    pub stale_after: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(300),
        }
    }
}

/// Periodic task reclaiming stale sessions.
pub struct Reaper {
    store: Arc<dyn SessionStore>,
    compute: Arc<dyn ComputeBackend>,
    config: ReaperConfig,
}

/// Handle to a running reaper. Call [`ReaperHandle::shutdown`] during process
/// teardown to stop the task and wait for an in-flight sweep to finish.
pub struct ReaperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReaperHandle {
    /// Stop the reaper and wait for the in-flight sweep to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!("Reaper task ended abnormally: {:?}", e);
        }
    }
}

impl Reaper {
    /// Create a new reaper over the given store and backend.
    pub fn new(
        store: Arc<dyn SessionStore>,
        compute: Arc<dyn ComputeBackend>,
        config: ReaperConfig,
    ) -> Self {
        Self {
            store,
            compute,
            config,
        }
    }

    /// Start the periodic sweep on its own task.
    pub fn spawn(self) -> ReaperHandle {
        let (shutdown, mut rx) = watch::channel(false);
        info!(
            "Reaper started (interval: {:?}, stale after: {:?})",
            self.config.sweep_interval, self.config.stale_after
        );

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                    _ = rx.changed() => {
                        info!("Reaper stopping");
                        break;
                    }
                }
            }
        });

        ReaperHandle { shutdown, task }
    }

    /// One sweep over all stale sessions. Returns how many were reclaimed.
    ///
    /// A failure on one session is logged and skips only that session; the
    /// next sweep retries it.
    pub async fn sweep(&self) -> usize {
        let stale = match self.store.list_stale(self.config.stale_after).await {
            Ok(stale) => stale,
            Err(e) => {
                error!("Listing stale sessions failed: {:?}", e);
                return 0;
            }
        };

        let mut reaped = 0;
        for session in stale {
            match self.reap(&session).await {
                Ok(()) => reaped += 1,
                Err(e) => warn!("Failed to reap session {}: {:?}", session.session_id, e),
            }
        }
        reaped
    }

    /// Backend resource first, then the row.
    async fn reap(&self, session: &Session) -> Result<()> {
        info!(
            "Reaping stale session {} (user: {})",
            session.session_id, session.user_id
        );

        let key = WorkloadKey::new(&session.user_id, &session.repo_hash, &session.session_id);
        self.compute
            .delete(&key)
            .await
            .context("deleting backend workload")?;
        self.store
            .delete(&session.session_id)
            .await
            .context("deleting session row")?;

        Ok(())
    }
}
