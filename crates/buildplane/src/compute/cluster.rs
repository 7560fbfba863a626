//! Cluster compute backend.
//!
//! Drives a Kubernetes-style cluster through the `kubectl` CLI. Each
//! `(user, repo, session)` tuple gets its own namespace holding a service
//! account and a single build-server pod, so teardown is a namespace delete
//! and a fresh session can never collide with a superseded one.

use std::process::Stdio;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::error::{ComputeError, ComputeResult};
use super::{
    ComputeBackend, STARTUP_OPTIONS_ENV, WorkloadKey, WorkloadSpec, WorkloadState, join_options,
    validate_key,
};
use crate::session::SessionStatus;
use async_trait::async_trait;

/// Fixed pod name; uniqueness comes from the per-tuple namespace.
const POD_NAME: &str = "build-server";

/// How long `delete` polls for confirmed namespace removal.
const DELETE_DEADLINE: Duration = Duration::from_secs(60);

/// Cluster backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Path to the kubectl binary.
    pub kubectl_binary: String,
    /// Image for the build-server pod.
    pub image: String,
    /// Image pull policy for the pod.
    pub image_pull_policy: String,
    /// Port the build agent listens on inside the pod.
    pub agent_port: u16,
    /// Per-invocation deadline for kubectl calls, in seconds.
    pub call_timeout_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            kubectl_binary: "kubectl".to_string(),
            image: "build-agent:latest".to_string(),
            image_pull_policy: "IfNotPresent".to_string(),
            agent_port: 9011,
            call_timeout_secs: 30,
        }
    }
}

/// Compute backend that provisions namespaced cluster workloads.
#[derive(Debug, Clone)]
pub struct ClusterBackend {
    config: ClusterConfig,
}

impl ClusterBackend {
    /// Create a new cluster backend.
    pub fn new(config: ClusterConfig) -> Self {
        Self { config }
    }

    /// Namespace owning all resources for this tuple.
    fn namespace_name(key: &WorkloadKey) -> String {
        let session_suffix = &key.session_id[..key.session_id.len().min(8)];
        format!(
            "{}-bp-{}-{}",
            sanitize_dns_label(&key.user_id),
            sanitize_dns_label(&key.repo_hash),
            session_suffix.to_lowercase()
        )
    }

    fn service_account_name(key: &WorkloadKey) -> String {
        format!("sa-{}", sanitize_dns_label(&key.user_id))
    }

    /// Run kubectl with the given args under the per-call deadline.
    async fn run_kubectl(&self, args: &[&str]) -> ComputeResult<std::process::Output> {
        debug!("kubectl {:?}", args);
        let fut = Command::new(&self.config.kubectl_binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output();

        let deadline = Duration::from_secs(self.config.call_timeout_secs);
        match tokio::time::timeout(deadline, fut).await {
            Ok(result) => result.map_err(|e| ComputeError::CommandFailed {
                command: args.first().unwrap_or(&"kubectl").to_string(),
                message: e.to_string(),
            }),
            Err(_) => Err(ComputeError::Timeout {
                command: args.first().unwrap_or(&"kubectl").to_string(),
                seconds: self.config.call_timeout_secs,
            }),
        }
    }

    /// Run kubectl, feeding `input` on stdin.
    async fn run_kubectl_with_stdin(
        &self,
        args: &[&str],
        input: &str,
    ) -> ComputeResult<std::process::Output> {
        debug!("kubectl {:?} (with manifest on stdin)", args);
        let deadline = Duration::from_secs(self.config.call_timeout_secs);
        let fut = async {
            let mut child = Command::new(&self.config.kubectl_binary)
                .args(args)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()?;

            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(input.as_bytes()).await?;
            }
            child.wait_with_output().await
        };

        match tokio::time::timeout(deadline, fut).await {
            Ok(result) => result.map_err(|e| ComputeError::CommandFailed {
                command: args.first().unwrap_or(&"kubectl").to_string(),
                message: e.to_string(),
            }),
            Err(_) => Err(ComputeError::Timeout {
                command: args.first().unwrap_or(&"kubectl").to_string(),
                seconds: self.config.call_timeout_secs,
            }),
        }
    }

    /// Whether a named resource exists (`kubectl get` succeeding).
    async fn resource_exists(&self, args: &[&str]) -> ComputeResult<bool> {
        let output = self.run_kubectl(args).await?;
        Ok(output.status.success())
    }

    async fn ensure_namespace(&self, namespace: &str) -> ComputeResult<()> {
        if self
            .resource_exists(&["get", "namespace", namespace])
            .await?
        {
            return Ok(());
        }

        info!("Creating namespace {}", namespace);
        let output = self
            .run_kubectl(&["create", "namespace", namespace])
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // A concurrent create for the same tuple may have won the race.
            if stderr.contains("AlreadyExists") {
                return Ok(());
            }
            return Err(ComputeError::CommandFailed {
                command: "create namespace".to_string(),
                message: stderr.to_string(),
            });
        }
        Ok(())
    }

    async fn ensure_service_account(&self, namespace: &str, name: &str) -> ComputeResult<()> {
        if self
            .resource_exists(&["-n", namespace, "get", "serviceaccount", name])
            .await?
        {
            return Ok(());
        }

        let output = self
            .run_kubectl(&["-n", namespace, "create", "serviceaccount", name])
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("AlreadyExists") {
                return Ok(());
            }
            return Err(ComputeError::CommandFailed {
                command: "create serviceaccount".to_string(),
                message: stderr.to_string(),
            });
        }
        Ok(())
    }

    /// Render the build-server pod manifest for this spec.
    fn pod_manifest(&self, spec: &WorkloadSpec, namespace: &str) -> serde_json::Value {
        let mut annotations = serde_json::Map::new();
        if let Some(ref region) = spec.region
            && !region.is_empty()
        {
            annotations.insert("buildplane.io/region".to_string(), json!(region));
        }

        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": POD_NAME,
                "namespace": namespace,
                "labels": {
                    "app": "build-server",
                    "user": spec.key.user_id,
                    "session": spec.key.session_id,
                },
                "annotations": annotations,
            },
            "spec": {
                "serviceAccountName": Self::service_account_name(&spec.key),
                "volumes": [{
                    "name": "workspace",
                    "hostPath": { "path": spec.source_path },
                }],
                "containers": [{
                    "name": POD_NAME,
                    "image": self.config.image,
                    "imagePullPolicy": self.config.image_pull_policy,
                    "volumeMounts": [{
                        "name": "workspace",
                        // Mounted at the same path the client sees on the host.
                        "mountPath": spec.source_path,
                    }],
                    "env": [
                        { "name": "PORT", "value": self.config.agent_port.to_string() },
                        { "name": STARTUP_OPTIONS_ENV, "value": join_options(&spec.startup_options) },
                    ],
                }],
            },
        })
    }
}

#[async_trait]
impl ComputeBackend for ClusterBackend {
    async fn create(&self, spec: &WorkloadSpec) -> ComputeResult<String> {
        validate_key(&spec.key)?;
        let namespace = Self::namespace_name(&spec.key);

        self.ensure_namespace(&namespace).await?;
        self.ensure_service_account(&namespace, &Self::service_account_name(&spec.key))
            .await?;

        // Idempotence: a live pod for this tuple is returned as-is.
        if self
            .resource_exists(&["-n", &namespace, "get", "pod", POD_NAME])
            .await?
        {
            debug!("Pod {}/{} already exists", namespace, POD_NAME);
            return Ok(POD_NAME.to_string());
        }

        info!(
            "Creating pod {}/{} (source: {}, region: {:?})",
            namespace, POD_NAME, spec.source_path, spec.region
        );
        let manifest = self.pod_manifest(spec, &namespace).to_string();
        let output = self
            .run_kubectl_with_stdin(&["-n", &namespace, "apply", "-f", "-"], &manifest)
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ComputeError::CommandFailed {
                command: "apply".to_string(),
                message: stderr.to_string(),
            });
        }

        Ok(POD_NAME.to_string())
    }

    async fn delete(&self, key: &WorkloadKey) -> ComputeResult<()> {
        validate_key(key)?;
        let namespace = Self::namespace_name(key);
        info!("Deleting namespace {}", namespace);

        let output = self
            .run_kubectl(&[
                "delete",
                "namespace",
                &namespace,
                "--wait=false",
                "--ignore-not-found",
            ])
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ComputeError::CommandFailed {
                command: "delete namespace".to_string(),
                message: stderr.to_string(),
            });
        }

        // Wait for confirmed removal so a subsequent create for a new session
        // cannot race the terminating namespace.
        let deadline = tokio::time::Instant::now() + DELETE_DEADLINE;
        while tokio::time::Instant::now() < deadline {
            if !self
                .resource_exists(&["get", "namespace", &namespace])
                .await?
            {
                info!("Namespace {} deleted", namespace);
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        warn!("Timed out waiting for namespace {} deletion", namespace);
        Ok(())
    }

    async fn status(&self, key: &WorkloadKey) -> ComputeResult<Option<WorkloadState>> {
        validate_key(key)?;
        let namespace = Self::namespace_name(key);

        let output = self
            .run_kubectl(&["-n", &namespace, "get", "pod", POD_NAME, "-o", "json"])
            .await?;
        if !output.status.success() {
            // Missing pod (or namespace) is not an error; the caller treats
            // it as an absent resource.
            return Ok(None);
        }

        let pod: serde_json::Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| ComputeError::ParseError(e.to_string()))?;

        let phase = pod["status"]["phase"].as_str().unwrap_or("Unknown");
        let pod_ip = pod["status"]["podIP"].as_str().filter(|ip| !ip.is_empty());

        Ok(Some(derive_state(phase, pod_ip)))
    }
}

/// Map a pod phase and IP onto the session status vocabulary.
fn derive_state(phase: &str, pod_ip: Option<&str>) -> WorkloadState {
    match phase {
        "Running" => match pod_ip {
            Some(ip) => WorkloadState {
                status: SessionStatus::Ready,
                address: Some(ip.to_string()),
            },
            None => WorkloadState {
                status: SessionStatus::Pending,
                address: None,
            },
        },
        "Succeeded" | "Failed" => WorkloadState {
            status: SessionStatus::Terminated,
            address: None,
        },
        _ => WorkloadState {
            status: SessionStatus::Pending,
            address: None,
        },
    }
}

/// Lowercase alphanumerics only, so the value is safe inside a DNS-1123 label.
fn sanitize_dns_label(value: &str) -> String {
    value
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_name_sanitizes_and_truncates() {
        let key = WorkloadKey::new("Alice.Dev", "abc123", "0123456789abcdef");
        assert_eq!(
            ClusterBackend::namespace_name(&key),
            "alicedev-bp-abc123-01234567"
        );

        let short = WorkloadKey::new("bob", "r1", "s1");
        assert_eq!(ClusterBackend::namespace_name(&short), "bob-bp-r1-s1");
    }

    #[test]
    fn test_derive_state_running_with_ip_is_ready() {
        let state = derive_state("Running", Some("10.0.0.5"));
        assert_eq!(state.status, SessionStatus::Ready);
        assert_eq!(state.address.as_deref(), Some("10.0.0.5"));
    }

    #[test]
    fn test_derive_state_running_without_ip_is_pending() {
        let state = derive_state("Running", None);
        assert_eq!(state.status, SessionStatus::Pending);
        assert!(state.address.is_none());
    }

    #[test]
    fn test_derive_state_terminal_phases() {
        assert_eq!(derive_state("Succeeded", None).status, SessionStatus::Terminated);
        assert_eq!(derive_state("Failed", None).status, SessionStatus::Terminated);
    }

    #[test]
    fn test_derive_state_other_phases_are_pending() {
        assert_eq!(derive_state("Pending", None).status, SessionStatus::Pending);
        assert_eq!(derive_state("Unknown", None).status, SessionStatus::Pending);
    }

    #[test]
    fn test_pod_manifest_shape() {
        let backend = ClusterBackend::new(ClusterConfig::default());
        let spec = WorkloadSpec {
            key: WorkloadKey::new("alice", "abc123", "sess-1"),
            source_path: "/src/project".to_string(),
            startup_options: vec!["--jobs=8".to_string(), "--cache".to_string()],
            region: Some("eu-west1".to_string()),
        };

        let manifest = backend.pod_manifest(&spec, "alice-bp-abc123-sess-1");
        assert_eq!(manifest["metadata"]["name"], POD_NAME);
        assert_eq!(manifest["metadata"]["labels"]["session"], "sess-1");
        assert_eq!(
            manifest["metadata"]["annotations"]["buildplane.io/region"],
            "eu-west1"
        );
        assert_eq!(
            manifest["spec"]["volumes"][0]["hostPath"]["path"],
            "/src/project"
        );

        let env = &manifest["spec"]["containers"][0]["env"];
        assert_eq!(env[1]["value"], "--jobs=8|||--cache");
    }

    #[test]
    fn test_pod_manifest_omits_empty_region() {
        let backend = ClusterBackend::new(ClusterConfig::default());
        let spec = WorkloadSpec {
            key: WorkloadKey::new("alice", "abc123", "sess-1"),
            source_path: "/src/project".to_string(),
            startup_options: vec![],
            region: None,
        };

        let manifest = backend.pod_manifest(&spec, "ns");
        assert!(
            manifest["metadata"]["annotations"]
                .as_object()
                .unwrap()
                .is_empty()
        );
    }
}
