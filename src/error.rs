use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failures from a single tmux CLI invocation
#[derive(Debug, Error)]
pub enum TmuxError {
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` timed out after {after:?}")]
    Timeout { command: String, after: Duration },

    #[error("`{command}` failed: {stderr}")]
    Failed { command: String, stderr: String },
}

impl TmuxError {
    /// True when tmux reports that the target session (or the whole server) is gone
    pub fn is_missing_session(&self) -> bool {
        match self {
            TmuxError::Failed { stderr, .. } => {
                stderr.contains("can't find session")
                    || stderr.contains("no server running")
                    || stderr.contains("session not found")
                    || stderr.contains("error connecting to")
            }
            _ => false,
        }
    }
}

/// Failures from a Session Handle
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("could not create session {name}: {source}")]
    Create {
        name: String,
        #[source]
        source: Box<SessionError>,
    },

    #[error("could not attach keep-alive client to {name}: {reason}")]
    Attach { name: String, reason: String },

    #[error("session {name} no longer exists")]
    Gone { name: String },

    #[error(transparent)]
    Tmux(#[from] TmuxError),
}

/// Failures reading or writing the persisted agent registry
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse state file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("could not serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Failures installing hook scripts or registering them with an agent CLI
#[derive(Debug, Error)]
pub enum HookError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{path} has an unexpected layout: {reason}")]
    Layout { path: PathBuf, reason: String },
}

/// Failures building the runtime configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not determine the home directory")]
    NoHome,

    #[error("config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unknown backend '{0}'")]
    UnknownBackend(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_session_detection() {
        let gone = TmuxError::Failed {
            command: "tmux has-session".into(),
            stderr: "can't find session: agentdeck_3".into(),
        };
        assert!(gone.is_missing_session());

        let other = TmuxError::Failed {
            command: "tmux send-keys".into(),
            stderr: "unknown key".into(),
        };
        assert!(!other.is_missing_session());
    }
}
