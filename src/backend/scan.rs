//! Discovery snapshot shared by every backend.
//!
//! The tmux pane listing and the OS process table are gathered once per
//! discovery cycle. Pane captures are memoised so several backends asking
//! "does this session look like me" cost one `capture-pane` per session.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System, UpdateKind};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::agent::DiscoveredAgent;
use crate::tmux::{PaneEntry, TmuxClient};

/// One OS process as seen by the discovery scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub parent: Option<u32>,
    pub name: String,
    pub cmd: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl ProcessEntry {
    /// True if the executable, or the script a runtime was started with, is `binary`
    pub fn runs(&self, binary: &str) -> bool {
        let suffix = format!("/{}", binary);
        let is_path_to = |arg: &String| arg.to_lowercase().ends_with(&suffix);
        self.name.to_lowercase() == binary
            || self
                .cmd
                .first()
                .is_some_and(|a| a.to_lowercase() == binary || is_path_to(a))
            // node /usr/local/bin/codex
            || self.cmd.get(1).is_some_and(is_path_to)
    }
}

pub struct DiscoveryContext {
    tmux: TmuxClient,
    session_prefix: String,
    panes: Vec<PaneEntry>,
    processes: Vec<ProcessEntry>,
    captures: Mutex<HashMap<String, Option<String>>>,
}

impl DiscoveryContext {
    /// Snapshot tmux panes and OS processes
    pub async fn gather(tmux: &TmuxClient, session_prefix: &str) -> Self {
        let panes = match tmux.list_panes().await {
            Ok(panes) => panes,
            Err(e) => {
                warn!(error = %e, "could not list tmux panes");
                Vec::new()
            }
        };

        let processes = match tokio::task::spawn_blocking(snapshot_processes).await {
            Ok(processes) => processes,
            Err(e) => {
                warn!(error = %e, "process scan panicked");
                Vec::new()
            }
        };

        debug!(panes = panes.len(), processes = processes.len(), "discovery snapshot");
        Self::from_parts(tmux.clone(), session_prefix, panes, processes)
    }

    pub fn from_parts(
        tmux: TmuxClient,
        session_prefix: &str,
        panes: Vec<PaneEntry>,
        processes: Vec<ProcessEntry>,
    ) -> Self {
        Self {
            tmux,
            session_prefix: session_prefix.to_string(),
            panes,
            processes,
            captures: Mutex::new(HashMap::new()),
        }
    }

    /// Sessions this program created
    pub fn is_own_session(&self, name: &str) -> bool {
        name.starts_with(&self.session_prefix)
    }

    /// First pane of every session not created by this program
    pub fn foreign_panes(&self) -> Vec<&PaneEntry> {
        let mut seen = HashSet::new();
        self.panes
            .iter()
            .filter(|p| !self.is_own_session(&p.session_name))
            .filter(|p| seen.insert(p.session_name.as_str()))
            .collect()
    }

    /// Plain-text capture of a session's pane, cached for this cycle
    pub async fn capture(&self, session: &str) -> Option<String> {
        let mut captures = self.captures.lock().await;
        if let Some(cached) = captures.get(session) {
            return cached.clone();
        }
        let content = match self.tmux.capture_pane(session, false).await {
            Ok(content) => Some(content),
            Err(e) => {
                debug!(session, error = %e, "capture failed during discovery");
                None
            }
        };
        captures.insert(session.to_string(), content.clone());
        content
    }

    /// Processes running `binary` outside of any tmux pane, without sub-agents
    pub fn loose_processes(&self, binary: &str) -> Vec<&ProcessEntry> {
        let own_pid = std::process::id();
        let by_pid: HashMap<u32, &ProcessEntry> =
            self.processes.iter().map(|p| (p.pid, p)).collect();
        let pane_pids: HashSet<u32> = self.panes.iter().filter_map(|p| p.pid).collect();
        let matching: HashSet<u32> = self
            .processes
            .iter()
            .filter(|p| p.runs(binary))
            .map(|p| p.pid)
            .collect();

        let under_pane = |process: &ProcessEntry| {
            let mut current = Some(process.pid);
            // Bounded walk in case the table has a parent cycle
            for _ in 0..64 {
                let Some(pid) = current else { return false };
                if pane_pids.contains(&pid) {
                    return true;
                }
                current = by_pid.get(&pid).and_then(|p| p.parent);
            }
            false
        };

        let mut found: Vec<&ProcessEntry> = self
            .processes
            .iter()
            .filter(|p| matching.contains(&p.pid))
            .filter(|p| p.pid != own_pid)
            .filter(|p| !p.parent.is_some_and(|parent| matching.contains(&parent)))
            .filter(|p| !under_pane(p))
            .collect();
        found.sort_by_key(|p| p.pid);
        found
    }
}

fn snapshot_processes() -> Vec<ProcessEntry> {
    let refresh = ProcessRefreshKind::new()
        .with_cmd(UpdateKind::Always)
        .with_cwd(UpdateKind::Always);
    let mut system = System::new_with_specifics(RefreshKind::new().with_processes(refresh));
    system.refresh_processes_specifics(ProcessesToUpdate::All, refresh);

    system
        .processes()
        .iter()
        .map(|(pid, process)| ProcessEntry {
            pid: pid.as_u32(),
            parent: process.parent().map(Pid::as_u32),
            name: process.name().to_string_lossy().into_owned(),
            cmd: process
                .cmd()
                .iter()
                .map(|a| a.to_string_lossy().into_owned())
                .collect(),
            cwd: process.cwd().map(Path::to_path_buf),
        })
        .collect()
}

/// Foreign tmux sessions whose pane runs `binary` or whose screen passes `looks_like_me`
pub async fn discover_panes(
    ctx: &DiscoveryContext,
    backend: &str,
    binary: &str,
    looks_like_me: impl Fn(&str) -> bool,
) -> Vec<DiscoveredAgent> {
    let mut found = Vec::new();
    for pane in ctx.foreign_panes() {
        let claimed = if pane.command.to_lowercase().contains(binary) {
            true
        } else {
            match ctx.capture(&pane.session_name).await {
                Some(content) => looks_like_me(&content),
                None => false,
            }
        };
        if !claimed {
            continue;
        }

        found.push(DiscoveredAgent {
            name: derive_name_from_dir(&pane.path).await,
            dir: pane.path.clone(),
            session_name: pane.session_name.clone(),
            pid: pane.pid,
            backend: backend.to_string(),
        });
    }
    found
}

/// Processes running `binary` that no tmux pane accounts for. They carry no session.
pub fn discover_processes(ctx: &DiscoveryContext, backend: &str, binary: &str) -> Vec<DiscoveredAgent> {
    ctx.loose_processes(binary)
        .into_iter()
        .map(|p| DiscoveredAgent {
            name: format!("{}-{}", binary, p.pid),
            dir: p.cwd.clone().unwrap_or_else(|| PathBuf::from("unknown")),
            session_name: String::new(),
            pid: Some(p.pid),
            backend: backend.to_string(),
        })
        .collect()
}

/// The git top-level directory name, else the directory's own name, else "agent"
pub async fn derive_name_from_dir(dir: &Path) -> String {
    let toplevel = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(["rev-parse", "--show-toplevel"])
        .stdin(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true)
        .output();

    if let Ok(Ok(output)) = tokio::time::timeout(Duration::from_secs(2), toplevel).await {
        if output.status.success() {
            let root = String::from_utf8_lossy(&output.stdout);
            if let Some(name) = base_name(Path::new(root.trim())) {
                return name;
            }
        }
    }

    base_name(dir).unwrap_or_else(|| "agent".to_string())
}

fn base_name(path: &Path) -> Option<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pane(session: &str, command: &str, pid: u32) -> PaneEntry {
        PaneEntry {
            session_name: session.into(),
            path: PathBuf::from("/tmp"),
            command: command.into(),
            pid: Some(pid),
        }
    }

    fn process(pid: u32, parent: Option<u32>, cmd: &[&str]) -> ProcessEntry {
        ProcessEntry {
            pid,
            parent,
            name: cmd
                .first()
                .map(|c| c.rsplit('/').next().unwrap_or(c).to_string())
                .unwrap_or_default(),
            cmd: cmd.iter().map(|c| c.to_string()).collect(),
            cwd: Some(PathBuf::from("/home/elle/api")),
        }
    }

    fn ctx(panes: Vec<PaneEntry>, processes: Vec<ProcessEntry>) -> DiscoveryContext {
        let tmux = TmuxClient::new("/nonexistent/tmux-binary", Duration::from_secs(1));
        DiscoveryContext::from_parts(tmux, "agentdeck_", panes, processes)
    }

    #[test]
    fn test_process_runs_binary() {
        assert!(process(1, None, &["claude"]).runs("claude"));
        assert!(process(1, None, &["/usr/local/bin/claude", "--continue"]).runs("claude"));
        assert!(process(1, None, &["node", "/usr/lib/node_modules/.bin/codex"]).runs("codex"));
        assert!(!process(1, None, &["vim", "claude-notes.md"]).runs("claude"));
        assert!(!process(1, None, &["grep", "claude"]).runs("claude"));
    }

    #[test]
    fn test_foreign_panes_skip_own_and_duplicates() {
        let ctx = ctx(
            vec![
                pane("agentdeck_1", "claude", 10),
                pane("work", "claude", 20),
                pane("work", "zsh", 21),
                pane("notes", "vim", 30),
            ],
            Vec::new(),
        );
        let names: Vec<&str> = ctx
            .foreign_panes()
            .iter()
            .map(|p| p.session_name.as_str())
            .collect();
        assert_eq!(names, vec!["work", "notes"]);
    }

    #[test]
    fn test_loose_processes_exclude_panes_and_subagents() {
        let ctx = ctx(
            vec![pane("work", "zsh", 100)],
            vec![
                process(100, Some(1), &["zsh"]),
                // inside the "work" pane
                process(101, Some(100), &["claude"]),
                // standalone, with a sub-agent
                process(200, Some(1), &["claude"]),
                process(201, Some(200), &["claude"]),
                process(300, Some(1), &["codex"]),
            ],
        );
        let pids: Vec<u32> = ctx.loose_processes("claude").iter().map(|p| p.pid).collect();
        assert_eq!(pids, vec![200]);

        let found = discover_processes(&ctx, "claude", "claude");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "claude-200");
        assert!(found[0].session_name.is_empty());
        assert_eq!(found[0].dir, PathBuf::from("/home/elle/api"));
    }

    #[tokio::test]
    async fn test_discover_panes_by_command() {
        let ctx = ctx(
            vec![pane("agentdeck_1", "claude", 10), pane("work", "claude", 20)],
            Vec::new(),
        );
        // Capture fails (no tmux), so only the command match counts
        let found = discover_panes(&ctx, "claude", "claude", |_| true).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].session_name, "work");
        assert_eq!(found[0].backend, "claude");
        assert_eq!(found[0].pid, Some(20));
    }

    #[tokio::test]
    async fn test_derive_name_falls_back_to_basename() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("my-project");
        std::fs::create_dir(&project).unwrap();
        assert_eq!(derive_name_from_dir(&project).await, "my-project");
        assert_eq!(derive_name_from_dir(Path::new("/")).await, "agent");
    }
}
