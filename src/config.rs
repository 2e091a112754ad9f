use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;

/// Environment variable that relocates the agent-deck home directory
pub const HOME_ENV: &str = "AGENT_DECK_HOME";

const CONFIG_FILE: &str = "config.json";

/// Runtime configuration, built once at startup and passed down explicitly
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding state, hook scripts, status files and logs
    #[serde(skip)]
    pub home: PathBuf,
    /// User home used to locate the agent CLIs' own settings files
    #[serde(skip)]
    pub user_home: PathBuf,

    /// Backend used for spawns without an explicit backend and for legacy records
    pub default_backend: String,
    /// Prefix for sessions this program creates
    pub session_prefix: String,
    pub tmux_path: String,
    /// Upper bound for any single tmux invocation
    pub command_timeout_ms: u64,
    pub initial_cols: u16,
    pub initial_rows: u16,

    pub tick_interval_ms: u64,
    /// Discovery runs on every Nth status tick
    pub discover_every_ticks: u32,
    pub preview_lines: usize,

    pub hook_running_ttl_secs: u64,
    /// TTL for WAITING, IDLE and DONE hook records
    pub hook_settled_ttl_secs: u64,
    /// How long a discovered agent may sit in DONE before it is pruned
    pub discovered_grace_secs: u64,
    pub install_hooks: bool,

    /// Default directory offered when spawning
    pub spawn_root: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            home: PathBuf::from(".agent-deck"),
            user_home: PathBuf::from("."),
            default_backend: "claude".to_string(),
            session_prefix: "agentdeck_".to_string(),
            tmux_path: "tmux".to_string(),
            command_timeout_ms: 5_000,
            initial_cols: 200,
            initial_rows: 50,
            tick_interval_ms: 2_000,
            discover_every_ticks: 5,
            preview_lines: 5,
            hook_running_ttl_secs: 30,
            hook_settled_ttl_secs: 300,
            discovered_grace_secs: 30,
            install_hooks: true,
            spawn_root: None,
        }
    }
}

impl Config {
    /// Resolve the home directory and apply `config.json` overrides, if any
    pub fn load() -> Result<Self, ConfigError> {
        let user_home = dirs::home_dir().ok_or(ConfigError::NoHome)?;
        let home = match std::env::var_os(HOME_ENV) {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => user_home.join(".agent-deck"),
        };
        Self::load_from(home, user_home)
    }

    /// Load configuration rooted at explicit directories
    pub fn load_from(home: PathBuf, user_home: PathBuf) -> Result<Self, ConfigError> {
        let path = home.join(CONFIG_FILE);
        let mut config = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str::<Config>(&raw)
                .map_err(|source| ConfigError::Parse { path: path.clone(), source })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file, using defaults");
                Config::default()
            }
            Err(source) => return Err(ConfigError::Io { path, source }),
        };
        config.home = home;
        config.user_home = user_home;
        Ok(config)
    }

    /// Configuration rooted at the given directories with every default applied
    pub fn with_dirs(home: impl Into<PathBuf>, user_home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            user_home: user_home.into(),
            ..Self::default()
        }
    }

    /// Make sure the home and status directories exist
    pub fn ensure_dirs(&self) -> Result<(), ConfigError> {
        for dir in [self.home.as_path(), self.status_dir().as_path()] {
            std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        Ok(())
    }

    pub fn state_path(&self) -> PathBuf {
        self.home.join("state.json")
    }

    pub fn status_dir(&self) -> PathBuf {
        self.home.join("status")
    }

    pub fn log_path(&self) -> PathBuf {
        self.home.join("agent-deck.log")
    }

    pub fn spawn_root(&self) -> PathBuf {
        self.spawn_root
            .clone()
            .unwrap_or_else(|| self.user_home.join("dev"))
    }

    /// Expand a leading `~/` against the user home
    pub fn expand_tilde(&self, path: &str) -> PathBuf {
        match path.strip_prefix("~/") {
            Some(rest) => self.user_home.join(rest),
            None if path == "~" => self.user_home.clone(),
            None => PathBuf::from(path),
        }
    }

    /// Collapse the user home back to `~` for display
    pub fn collapse_tilde(&self, path: &Path) -> String {
        match path.strip_prefix(&self.user_home) {
            Ok(rest) if rest.as_os_str().is_empty() => "~".to_string(),
            Ok(rest) => format!("~/{}", rest.display()),
            Err(_) => path.display().to_string(),
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn discovered_grace(&self) -> Duration {
        Duration::from_secs(self.discovered_grace_secs)
    }
}
