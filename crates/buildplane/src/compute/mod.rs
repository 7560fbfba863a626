//! Compute backend abstraction.
//!
//! A compute backend owns the substrate-specific resource that actually runs
//! a build server: an isolated cluster workload or a local subprocess. The
//! orchestration core only sees the `{create, delete, status}` capability
//! surface; the substrate is chosen once at startup via configuration.

mod cluster;
mod error;
mod process;

pub use cluster::{ClusterBackend, ClusterConfig};
pub use error::{ComputeError, ComputeResult};
pub use process::{ProcessBackend, ProcessConfig};

use async_trait::async_trait;

use crate::session::SessionStatus;

/// Separator used when packing startup options into a single env var; the
/// build agent splits on the same token.
pub const OPTION_SEPARATOR: &str = "|||";

/// Env var carrying the packed startup options.
pub const STARTUP_OPTIONS_ENV: &str = "BUILD_STARTUP_OPTIONS";

/// Identity of one backend resource.
///
/// Keyed by the full `(user, repo, session)` tuple so a fresh session can
/// never observe a superseded session's leftover resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkloadKey {
    pub user_id: String,
    pub repo_hash: String,
    pub session_id: String,
}

impl WorkloadKey {
    pub fn new(
        user_id: impl Into<String>,
        repo_hash: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            repo_hash: repo_hash.into(),
            session_id: session_id.into(),
        }
    }
}

/// Everything needed to create a backend resource.
#[derive(Debug, Clone)]
pub struct WorkloadSpec {
    pub key: WorkloadKey,
    /// Source tree made available to the build server.
    pub source_path: String,
    /// Options passed through to the build agent at startup.
    pub startup_options: Vec<String>,
    /// Placement hint, recorded on the workload.
    pub region: Option<String>,
}

/// Observed state of a backend resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadState {
    pub status: SessionStatus,
    pub address: Option<String>,
}

/// Capability surface over the compute substrate.
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    /// Create the backend resource for this tuple and return its ID.
    ///
    /// Idempotent: a live resource for the same tuple is returned as-is,
    /// without creating a duplicate and without erroring.
    async fn create(&self, spec: &WorkloadSpec) -> ComputeResult<String>;

    /// Tear the resource down, best-effort.
    ///
    /// Implementations poll for confirmed removal up to a bounded deadline so
    /// a subsequent create cannot race a not-yet-freed resource; deadline
    /// expiry is logged, not fatal.
    async fn delete(&self, key: &WorkloadKey) -> ComputeResult<()>;

    /// Observed state of the resource, or `None` if it does not exist.
    async fn status(&self, key: &WorkloadKey) -> ComputeResult<Option<WorkloadState>>;
}

/// Validate the tuple components before handing them to a substrate.
///
/// Components end up in namespace names, process identifiers and CLI
/// arguments, so they are restricted to a conservative charset.
pub(crate) fn validate_key(key: &WorkloadKey) -> ComputeResult<()> {
    for (name, value) in [
        ("user_id", &key.user_id),
        ("repo_hash", &key.repo_hash),
        ("session_id", &key.session_id),
    ] {
        if value.is_empty() {
            return Err(ComputeError::InvalidInput(format!(
                "{} cannot be empty",
                name
            )));
        }
        if value.len() > 128 {
            return Err(ComputeError::InvalidInput(format!(
                "{} exceeds maximum length",
                name
            )));
        }
        let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.';
        if !value.chars().all(valid_chars) {
            return Err(ComputeError::InvalidInput(format!(
                "{} '{}' contains invalid characters",
                name, value
            )));
        }
    }
    Ok(())
}

/// Pack startup options into the single env var the agent expects.
pub(crate) fn join_options(options: &[String]) -> String {
    options.join(OPTION_SEPARATOR)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(user: &str, repo: &str, session: &str) -> WorkloadKey {
        WorkloadKey::new(user, repo, session)
    }

    #[test]
    fn test_validate_key_accepts_typical_tuples() {
        assert!(validate_key(&key("alice", "abc123", "sess-1")).is_ok());
        assert!(validate_key(&key("bob_2", "a.b", "0f3c-9d")).is_ok());
    }

    #[test]
    fn test_validate_key_rejects_empty_components() {
        assert!(validate_key(&key("", "r", "s")).is_err());
        assert!(validate_key(&key("u", "r", "")).is_err());
    }

    #[test]
    fn test_validate_key_rejects_shell_metacharacters() {
        assert!(validate_key(&key("alice;rm -rf", "r", "s")).is_err());
        assert!(validate_key(&key("u", "r", "s1 s2")).is_err());
    }

    #[test]
    fn test_join_options() {
        let opts = vec!["--jobs=8".to_string(), "--cache".to_string()];
        assert_eq!(join_options(&opts), "--jobs=8|||--cache");
        assert_eq!(join_options(&[]), "");
    }
}
