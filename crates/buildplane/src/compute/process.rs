//! Local-process compute backend.
//!
//! Spawns the build agent as a native subprocess bound to a freshly chosen
//! ephemeral port. Meant for development and for environments without a
//! cluster substrate.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use super::error::{ComputeError, ComputeResult};
use super::{
    ComputeBackend, STARTUP_OPTIONS_ENV, WorkloadKey, WorkloadSpec, WorkloadState, join_options,
    validate_key,
};
use crate::session::SessionStatus;
use async_trait::async_trait;

/// Process backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Path to the build agent binary.
    pub agent_binary: String,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            agent_binary: "build-agent".to_string(),
        }
    }
}

/// One spawned agent process.
#[derive(Debug)]
struct AgentProcess {
    child: Child,
    port: u16,
}

impl AgentProcess {
    fn is_running(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(_)) => false,
            Err(_) => false,
        }
    }

    /// Kill the process and wait for it to be reaped, preventing zombies.
    async fn kill(&mut self) -> ComputeResult<()> {
        if let Err(e) = self.child.kill().await {
            // The process may already be gone.
            if self.is_running() {
                return Err(ComputeError::CommandFailed {
                    command: "kill".to_string(),
                    message: e.to_string(),
                });
            }
        }

        match tokio::time::timeout(Duration::from_secs(5), self.child.wait()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => {
                warn!("Error waiting for agent process: {:?}", e);
                Ok(())
            }
            Err(_) => {
                warn!("Timeout waiting for agent process to exit");
                Ok(())
            }
        }
    }
}

/// Compute backend that runs build agents as local subprocesses.
#[derive(Debug, Clone)]
pub struct ProcessBackend {
    config: ProcessConfig,
    agents: Arc<Mutex<HashMap<String, AgentProcess>>>,
}

impl ProcessBackend {
    /// Create a new process backend.
    pub fn new(config: ProcessConfig) -> Self {
        Self {
            config,
            agents: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn agent_id(key: &WorkloadKey) -> String {
        format!("proc-{}-{}-{}", key.user_id, key.repo_hash, key.session_id)
    }

    fn spawn_agent(&self, spec: &WorkloadSpec, port: u16) -> ComputeResult<Child> {
        let mut cmd = Command::new(&self.config.agent_binary);
        cmd.env("PORT", port.to_string())
            .env(STARTUP_OPTIONS_ENV, join_options(&spec.startup_options))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        if !spec.source_path.is_empty() {
            cmd.current_dir(Path::new(&spec.source_path));
        }

        Ok(cmd.spawn()?)
    }
}

#[async_trait]
impl ComputeBackend for ProcessBackend {
    async fn create(&self, spec: &WorkloadSpec) -> ComputeResult<String> {
        validate_key(&spec.key)?;
        let agent_id = Self::agent_id(&spec.key);

        let mut agents = self.agents.lock().await;
        if let Some(agent) = agents.get_mut(&agent_id)
            && agent.is_running()
        {
            debug!("Agent already running: {}", agent_id);
            return Ok(agent_id);
        }

        let port = find_free_port()?;
        info!(
            "Spawning agent for {} on port {} (source: {})",
            agent_id, port, spec.source_path
        );

        let child = self.spawn_agent(spec, port)?;
        let pid = child.id();
        agents.insert(agent_id.clone(), AgentProcess { child, port });
        info!("Agent spawned for {} (pid: {:?})", agent_id, pid);

        Ok(agent_id)
    }

    async fn delete(&self, key: &WorkloadKey) -> ComputeResult<()> {
        validate_key(key)?;
        let agent_id = Self::agent_id(key);

        let mut agents = self.agents.lock().await;
        match agents.remove(&agent_id) {
            Some(mut agent) => {
                info!("Killing agent for {}", agent_id);
                agent.kill().await
            }
            None => {
                debug!("No agent process for {}", agent_id);
                Ok(())
            }
        }
    }

    async fn status(&self, key: &WorkloadKey) -> ComputeResult<Option<WorkloadState>> {
        validate_key(key)?;
        let agent_id = Self::agent_id(key);

        let mut agents = self.agents.lock().await;
        match agents.get_mut(&agent_id) {
            Some(agent) => {
                if agent.is_running() {
                    Ok(Some(WorkloadState {
                        status: SessionStatus::Ready,
                        address: Some(format!("127.0.0.1:{}", agent.port)),
                    }))
                } else {
                    Ok(Some(WorkloadState {
                        status: SessionStatus::Terminated,
                        address: None,
                    }))
                }
            }
            None => Ok(None),
        }
    }
}

/// Ask the OS for a free ephemeral port.
fn find_free_port() -> ComputeResult<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}
