//! Scripted compute backend for protocol tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::compute::{
    ComputeBackend, ComputeError, ComputeResult, WorkloadKey, WorkloadSpec, WorkloadState,
};

use super::models::SessionStatus;

/// In-memory backend whose observed state is set explicitly by the test.
#[derive(Debug, Default)]
pub(crate) struct ScriptedBackend {
    states: Mutex<HashMap<String, WorkloadState>>,
    created: Mutex<Vec<WorkloadKey>>,
    deleted: Mutex<Vec<WorkloadKey>>,
    fail_create: AtomicBool,
    fail_status: AtomicBool,
    fail_delete: AtomicBool,
    status_calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the observed state for a session's workload.
    pub async fn set_state(&self, session_id: &str, status: SessionStatus, address: Option<&str>) {
        self.states.lock().await.insert(
            session_id.to_string(),
            WorkloadState {
                status,
                address: address.map(str::to_string),
            },
        );
    }

    /// Make the workload disappear from the substrate's point of view.
    pub async fn clear_state(&self, session_id: &str) {
        self.states.lock().await.remove(session_id);
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_status(&self, fail: bool) {
        self.fail_status.store(fail, Ordering::SeqCst);
    }

    pub fn fail_delete(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }

    pub async fn created(&self) -> Vec<WorkloadKey> {
        self.created.lock().await.clone()
    }

    pub async fn deleted(&self) -> Vec<WorkloadKey> {
        self.deleted.lock().await.clone()
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ComputeBackend for ScriptedBackend {
    async fn create(&self, spec: &WorkloadSpec) -> ComputeResult<String> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ComputeError::CommandFailed {
                command: "create".to_string(),
                message: "scripted failure".to_string(),
            });
        }
        self.created.lock().await.push(spec.key.clone());
        Ok(format!("workload-{}", spec.key.session_id))
    }

    async fn delete(&self, key: &WorkloadKey) -> ComputeResult<()> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(ComputeError::CommandFailed {
                command: "delete".to_string(),
                message: "scripted failure".to_string(),
            });
        }
        self.deleted.lock().await.push(key.clone());
        self.states.lock().await.remove(&key.session_id);
        Ok(())
    }

    async fn status(&self, key: &WorkloadKey) -> ComputeResult<Option<WorkloadState>> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_status.load(Ordering::SeqCst) {
            return Err(ComputeError::CommandFailed {
                command: "status".to_string(),
                message: "scripted failure".to_string(),
            });
        }
        Ok(self.states.lock().await.get(&key.session_id).cloned())
    }
}
