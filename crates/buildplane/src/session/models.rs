//! Session data models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle status of a build-server session.
///
/// The wire protocol uses the uppercase form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionStatus {
    /// Backend is being provisioned or is not yet reachable.
    Pending,
    /// Backend is running and has a reachable address.
    Ready,
    /// Backend reached a terminal state and will not come back.
    Terminated,
    /// Status could not be determined from the stored row.
    Unknown,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Pending => write!(f, "PENDING"),
            SessionStatus::Ready => write!(f, "READY"),
            SessionStatus::Terminated => write!(f, "TERMINATED"),
            SessionStatus::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(SessionStatus::Pending),
            "READY" => Ok(SessionStatus::Ready),
            "TERMINATED" => Ok(SessionStatus::Terminated),
            "UNKNOWN" => Ok(SessionStatus::Unknown),
            _ => Err(format!("unknown session status: {}", s)),
        }
    }
}

// Implement conversion from String for SQLx row decoding.
impl TryFrom<String> for SessionStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// One build-server session.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Session {
    /// Owner of the workload.
    pub user_id: String,
    /// Hash identifying the repository being built.
    pub repo_hash: String,
    /// Client-generated unique session ID (primary key).
    pub session_id: String,
    /// Network locator of the backend, once known.
    pub server_address: Option<String>,
    /// Last reconciled status.
    #[sqlx(try_from = "String")]
    pub status: SessionStatus,
    /// Epoch milliseconds of the last successful client interaction.
    pub last_heartbeat: i64,
}

impl Session {
    /// Whether the backend reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, SessionStatus::Terminated)
    }

    /// Age of the heartbeat relative to `now_ms`, in milliseconds.
    pub fn heartbeat_age(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.last_heartbeat)
    }
}

/// Request to provision or poll a build server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetServerRequest {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub repo_hash: String,
    /// Client-owned session identity; must not be empty.
    #[serde(default)]
    pub session_id: String,
    /// Source tree to expose to the build server.
    #[serde(default)]
    pub source_path: String,
    /// Startup options passed through to the build agent.
    #[serde(default)]
    pub startup_options: Vec<String>,
    /// Placement hint, recorded on the workload.
    #[serde(default)]
    pub region: Option<String>,
}

/// Response to a [`GetServerRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_address: Option<String>,
}

/// Current wall-clock time as epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
