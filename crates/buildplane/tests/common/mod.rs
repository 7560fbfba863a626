//! Test utilities and common setup.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use axum::Router;
use tokio::sync::Mutex;

use buildplane::api;
use buildplane::compute::{
    ComputeBackend, ComputeError, ComputeResult, WorkloadKey, WorkloadSpec, WorkloadState,
};
use buildplane::session::{
    InMemorySessionStore, SessionService, SessionServiceConfig, SessionStatus,
};

/// Compute backend whose observed state is scripted by the test.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    states: Mutex<HashMap<String, WorkloadState>>,
    created: Mutex<Vec<WorkloadKey>>,
    deleted: Mutex<Vec<WorkloadKey>>,
    fail_create: AtomicBool,
}

#[allow(dead_code)]
impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_state(&self, session_id: &str, status: SessionStatus, address: Option<&str>) {
        self.states.lock().await.insert(
            session_id.to_string(),
            WorkloadState {
                status,
                address: address.map(str::to_string),
            },
        );
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub async fn created(&self) -> Vec<WorkloadKey> {
        self.created.lock().await.clone()
    }

    pub async fn deleted(&self) -> Vec<WorkloadKey> {
        self.deleted.lock().await.clone()
    }
}

#[async_trait]
impl ComputeBackend for RecordingBackend {
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
        self.deleted.lock().await.push(key.clone());
        self.states.lock().await.remove(&key.session_id);
        Ok(())
    }

    async fn status(&self, key: &WorkloadKey) -> ComputeResult<Option<WorkloadState>> {
        Ok(self.states.lock().await.get(&key.session_id).cloned())
    }
}

/// Create a test application over the in-memory store and a scripted backend.
pub fn test_app() -> (Router, Arc<RecordingBackend>) {
    let store = Arc::new(InMemorySessionStore::new());
    let backend = Arc::new(RecordingBackend::new());

    let service = SessionService::new(
        store,
        backend.clone(),
        SessionServiceConfig::default(),
    );

    let state = api::AppState::new(service);
    (api::create_router(state), backend)
}
