//! Lifecycle-hook integration.
//!
//! Each agent CLI that supports hooks runs a small script on its lifecycle
//! events. The script writes `{"state": ..., "ts": ...}` to
//! `<home>/status/<agent id>.json`, which is read back here without spawning
//! a subprocess. Records go stale after a TTL and are then ignored.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::agent::{AgentId, AgentStatus};
use crate::config::Config;
use crate::error::HookError;

#[derive(Debug, Deserialize)]
struct HookRecord {
    state: String,
    ts: i64,
}

/// Reader for hook-written status files
#[derive(Debug, Clone)]
pub struct HookStatusDir {
    dir: PathBuf,
    running_ttl: Duration,
    settled_ttl: Duration,
}

impl HookStatusDir {
    pub fn new(dir: impl Into<PathBuf>, running_ttl: Duration, settled_ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            running_ttl,
            settled_ttl,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.status_dir(),
            Duration::from_secs(config.hook_running_ttl_secs),
            Duration::from_secs(config.hook_settled_ttl_secs),
        )
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn status_path(&self, id: AgentId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    /// Fresh hook status for `id`, or `None` when missing, unreadable or stale
    pub fn read(&self, id: AgentId) -> Option<AgentStatus> {
        self.read_at(id, Utc::now())
    }

    pub fn read_at(&self, id: AgentId, now: DateTime<Utc>) -> Option<AgentStatus> {
        let raw = std::fs::read_to_string(self.status_path(id)).ok()?;
        let record: HookRecord = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(e) => {
                debug!(agent_id = %id, error = %e, "ignoring malformed hook status");
                return None;
            }
        };
        let status: AgentStatus = record.state.parse().ok()?;

        let ttl = match status {
            AgentStatus::Running => self.running_ttl,
            _ => self.settled_ttl,
        };
        let age = now.timestamp() - record.ts;
        if age > ttl.as_secs() as i64 {
            return None;
        }
        Some(status)
    }

    /// Delete the status file for `id`, if any
    pub fn clean(&self, id: AgentId) {
        let path = self.status_path(id);
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(agent_id = %id, "removed hook status"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => debug!(path = %path.display(), error = %e, "could not remove hook status"),
        }
    }
}

/// Paths and naming shared by every backend's hook installer
#[derive(Debug, Clone)]
pub struct HookEnv {
    pub status: HookStatusDir,
    /// Sessions whose name starts with this prefix are ours; the remainder is the agent id
    pub session_prefix: String,
    pub script_dir: PathBuf,
    pub user_home: PathBuf,
}

impl HookEnv {
    pub fn from_config(config: &Config) -> Self {
        Self {
            status: HookStatusDir::from_config(config),
            session_prefix: config.session_prefix.clone(),
            script_dir: config.home.clone(),
            user_home: config.user_home.clone(),
        }
    }

    pub fn script_path(&self, file_name: &str) -> PathBuf {
        self.script_dir.join(file_name)
    }

    /// Fill the `@PREFIX@` and `@STATUS_DIR@` placeholders of a script template
    pub fn render(&self, template: &str) -> String {
        let status_dir = self.status.dir().to_string_lossy();
        template
            .replace("@PREFIX@", &shell_words::quote(&self.session_prefix))
            .replace("@STATUS_DIR@", &shell_words::quote(&status_dir))
    }
}

/// Shared head of every hook script: bail out unless running inside one of our sessions
pub const SCRIPT_PREAMBLE: &str = r#"#!/bin/bash
set -euo pipefail
PREFIX=@PREFIX@
STATUS_DIR=@STATUS_DIR@
SESS=$(tmux display-message -p '#{session_name}' 2>/dev/null || true)
[[ "$SESS" == "$PREFIX"* ]] || exit 0
AGENT_ID="${SESS#"$PREFIX"}"
mkdir -p "$STATUS_DIR"
"#;

/// Shared tail: write the record through a temp file so readers never see a partial one
pub const SCRIPT_WRITE: &str = r#"[ -z "$STATE" ] && exit 0
TMP=$(mktemp "$STATUS_DIR/.tmp.XXXXXX")
echo "{\"state\":\"$STATE\",\"ts\":$(date +%s)}" > "$TMP"
mv "$TMP" "$STATUS_DIR/${AGENT_ID}.json"
"#;

/// Write an executable hook script
pub fn install_script(path: &Path, contents: &str) -> Result<(), HookError> {
    let io_err = |source| HookError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    std::fs::write(path, contents).map_err(io_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).map_err(io_err)?;
    }
    Ok(())
}

fn read_json_settings(path: &Path) -> Result<Map<String, Value>, HookError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
        Err(source) => {
            return Err(HookError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    if raw.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str(&raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(HookError::Layout {
            path: path.to_path_buf(),
            reason: "top level is not an object".into(),
        }),
        Err(source) => Err(HookError::Parse {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// True if any `hooks.<event>[].hooks[].command` equals `script`
fn hooks_reference(hooks: &Map<String, Value>, script: &str) -> bool {
    hooks
        .values()
        .filter_map(Value::as_array)
        .flatten()
        .filter_map(|entry| entry.get("hooks").and_then(Value::as_array))
        .flatten()
        .any(|hook| hook.get("command").and_then(Value::as_str) == Some(script))
}

/// Register `script` for `events` in a JSON settings file with a
/// `{"hooks": {"<Event>": [entry, ...]}}` layout. Returns false when the
/// script is already registered.
pub fn register_json_hooks(
    settings_path: &Path,
    script: &Path,
    events: &[&str],
    entry: impl Fn(&str) -> Value,
) -> Result<bool, HookError> {
    let script = script.to_string_lossy();
    let mut settings = read_json_settings(settings_path)?;

    let hooks = settings
        .entry("hooks")
        .or_insert_with(|| Value::Object(Map::new()));
    let Value::Object(hooks) = hooks else {
        return Err(HookError::Layout {
            path: settings_path.to_path_buf(),
            reason: "\"hooks\" is not an object".into(),
        });
    };

    if hooks_reference(hooks, &script) {
        debug!(path = %settings_path.display(), "hooks already registered");
        return Ok(false);
    }

    for event in events {
        let slot = hooks.entry(event.to_string()).or_insert_with(|| json!([]));
        if !slot.is_array() {
            *slot = json!([]);
        }
        if let Value::Array(entries) = slot {
            entries.push(entry(&script));
        }
    }

    let io_err = |source| HookError::Io {
        path: settings_path.to_path_buf(),
        source,
    };
    if let Some(parent) = settings_path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let out = serde_json::to_string_pretty(&Value::Object(settings)).map_err(|source| {
        HookError::Parse {
            path: settings_path.to_path_buf(),
            source,
        }
    })?;
    std::fs::write(settings_path, out + "\n").map_err(io_err)?;

    info!(path = %settings_path.display(), "registered hooks");
    Ok(true)
}

/// Append `notify = ["<script>"]` to a TOML config unless the script or an
/// existing `notify` key is already present. Returns true when the file changed.
pub fn register_toml_notify(config_path: &Path, script: &Path) -> Result<bool, HookError> {
    let io_err = |source| HookError::Io {
        path: config_path.to_path_buf(),
        source,
    };
    let mut content = match std::fs::read_to_string(config_path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(source) => return Err(io_err(source)),
    };

    let script = script.to_string_lossy();
    if content.contains(script.as_ref()) {
        return Ok(false);
    }
    if content.contains("notify") {
        debug!(path = %config_path.display(), "leaving existing notify setting alone");
        return Ok(false);
    }

    // A JSON string literal is also a valid TOML basic string
    let quoted = serde_json::to_string(script.as_ref()).map_err(|source| HookError::Parse {
        path: config_path.to_path_buf(),
        source,
    })?;
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(&format!("\nnotify = [{}]\n", quoted));

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    std::fs::write(config_path, content).map_err(io_err)?;

    info!(path = %config_path.display(), "registered notify hook");
    Ok(true)
}
