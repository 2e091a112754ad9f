pub mod discovery;
pub mod manager;
pub mod store;

pub use manager::AgentManager;
pub use store::{Adoption, Store};

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable, monotonically assigned agent identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub u64);

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AgentId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(AgentId)
    }
}

/// Activity state of a supervised agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AgentStatus {
    /// Actively producing output
    Running,
    /// Blocked on a permission or confirmation prompt
    Waiting,
    /// At its input prompt with no pending work
    Idle,
    /// Process or session ended
    Done,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Running => "RUNNING",
            AgentStatus::Waiting => "WAITING",
            AgentStatus::Idle => "IDLE",
            AgentStatus::Done => "DONE",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentStatus::Done)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(AgentStatus::Running),
            "WAITING" => Ok(AgentStatus::Waiting),
            "IDLE" => Ok(AgentStatus::Idle),
            "DONE" => Ok(AgentStatus::Done),
            other => Err(format!("unknown agent status '{}'", other)),
        }
    }
}

/// A tracked unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub dir: PathBuf,
    pub status: AgentStatus,
    pub created_at: DateTime<Utc>,
    pub status_since: DateTime<Utc>,
    /// Empty until a session is bound
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session_name: String,
    /// Found by discovery rather than spawned here
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub discovered: bool,
    /// Backend id; older state files omit it
    #[serde(default)]
    pub backend: String,
}

impl Agent {
    pub fn has_session(&self) -> bool {
        !self.session_name.is_empty()
    }
}

/// A candidate found by a discovery scan, never persisted directly
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredAgent {
    pub name: String,
    pub dir: PathBuf,
    /// Empty for candidates found only through the process table
    pub session_name: String,
    pub pid: Option<u32>,
    /// Id of the backend that claimed the candidate
    pub backend: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_string_round_trip() {
        for status in [
            AgentStatus::Running,
            AgentStatus::Waiting,
            AgentStatus::Idle,
            AgentStatus::Done,
        ] {
            assert_eq!(status.as_str().parse::<AgentStatus>(), Ok(status));
        }
        assert!("BUSY".parse::<AgentStatus>().is_err());
    }

    #[test]
    fn test_status_serializes_uppercase() {
        let json = serde_json::to_string(&AgentStatus::Waiting).unwrap();
        assert_eq!(json, "\"WAITING\"");
    }

    #[test]
    fn test_legacy_record_without_backend_or_session() {
        let json = r#"{
            "id": 4,
            "name": "api",
            "dir": "/tmp/api",
            "status": "IDLE",
            "created_at": "2025-01-01T00:00:00Z",
            "status_since": "2025-01-01T00:00:00Z"
        }"#;
        let agent: Agent = serde_json::from_str(json).unwrap();
        assert_eq!(agent.id, AgentId(4));
        assert!(agent.backend.is_empty());
        assert!(!agent.has_session());
        assert!(!agent.discovered);
    }
}
