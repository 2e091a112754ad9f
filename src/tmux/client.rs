use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use super::PaneEntry;
use crate::error::TmuxError;

/// Client for interacting with tmux via CLI.
///
/// Every invocation is bounded by `timeout`; a hung tmux server shows up as a
/// `TmuxError::Timeout` instead of stalling the caller.
#[derive(Debug, Clone)]
pub struct TmuxClient {
    /// Path to tmux binary
    tmux_path: String,
    timeout: Duration,
}

impl TmuxClient {
    pub fn new(tmux_path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            tmux_path: tmux_path.into(),
            timeout,
        }
    }

    /// Run tmux with `args`, returning stdout on success
    async fn run(&self, args: &[&str]) -> Result<String, TmuxError> {
        let command = format!("{} {}", self.tmux_path, args.first().copied().unwrap_or(""));
        let output = Command::new(&self.tmux_path)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, output).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => return Err(TmuxError::Spawn { command, source }),
            Err(_) => {
                return Err(TmuxError::Timeout {
                    command,
                    after: self.timeout,
                })
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(TmuxError::Failed { command, stderr });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Check whether a session exists
    pub async fn has_session(&self, name: &str) -> bool {
        if name.is_empty() {
            return false;
        }
        self.run(&["has-session", "-t", &exact_target(name)]).await.is_ok()
    }

    /// Start a detached session of the given size running `command` in `work_dir`
    pub async fn new_session(
        &self,
        name: &str,
        work_dir: &std::path::Path,
        cols: u16,
        rows: u16,
        command: &str,
    ) -> Result<(), TmuxError> {
        let cols = cols.to_string();
        let rows = rows.to_string();
        let dir = work_dir.to_string_lossy();
        self.run(&[
            "new-session", "-d", "-s", name, "-x", &cols, "-y", &rows, "-c", &dir, command,
        ])
        .await
        .map(|_| ())
    }

    pub async fn set_option(&self, name: &str, option: &str, value: &str) -> Result<(), TmuxError> {
        self.run(&["set-option", "-t", &exact_target(name), option, value])
            .await
            .map(|_| ())
    }

    pub async fn resize_window(&self, name: &str, cols: u16, rows: u16) -> Result<(), TmuxError> {
        let cols = cols.to_string();
        let rows = rows.to_string();
        self.run(&["resize-window", "-t", &pane_target(name), "-x", &cols, "-y", &rows])
            .await
            .map(|_| ())
    }

    /// Capture the visible pane with wrapped lines joined.
    /// `escapes` keeps colour and attribute sequences in the output.
    pub async fn capture_pane(&self, name: &str, escapes: bool) -> Result<String, TmuxError> {
        let target = pane_target(name);
        let mut args = vec!["capture-pane", "-p", "-J"];
        if escapes {
            args.push("-e");
        }
        args.extend(["-t", target.as_str()]);
        self.run(&args).await
    }

    /// Type `text` literally into the pane, then press Enter
    pub async fn send_keys(&self, name: &str, text: &str) -> Result<(), TmuxError> {
        let target = pane_target(name);
        if !text.is_empty() {
            self.run(&["send-keys", "-t", &target, "-l", text]).await?;
        }
        self.run(&["send-keys", "-t", &target, "Enter"]).await.map(|_| ())
    }

    /// Kill a session
    pub async fn kill_session(&self, name: &str) -> Result<(), TmuxError> {
        self.run(&["kill-session", "-t", &exact_target(name)])
            .await
            .map(|_| ())
    }

    /// Names of all tmux sessions; no server means no sessions
    pub async fn list_sessions(&self) -> Result<Vec<String>, TmuxError> {
        let stdout = match self.run(&["list-sessions", "-F", "#{session_name}"]).await {
            Ok(stdout) => stdout,
            Err(e) if e.is_missing_session() || no_sessions(&e) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// List every pane across all sessions with its working directory and command.
    /// Falls back to one row per session on tmux builds where `list-panes -a` fails.
    pub async fn list_panes(&self) -> Result<Vec<PaneEntry>, TmuxError> {
        const FORMAT: &str = "#{session_name}|#{pane_current_path}|#{pane_current_command}|#{pane_pid}";

        match self.run(&["list-panes", "-a", "-F", FORMAT]).await {
            Ok(stdout) => Ok(stdout.lines().filter_map(parse_pane_line).collect()),
            Err(e) if e.is_missing_session() || no_sessions(&e) => Ok(Vec::new()),
            Err(e) => {
                debug!(error = %e, "list-panes failed, falling back to list-sessions");
                let stdout = self
                    .run(&[
                        "list-sessions",
                        "-F",
                        "#{session_name}|#{session_path}|#{pane_current_command}|#{pane_pid}",
                    ])
                    .await?;
                Ok(stdout.lines().filter_map(parse_pane_line).collect())
            }
        }
    }

    /// Get the command to attach to a session (for external execution)
    pub fn attach_command(&self, name: &str) -> Vec<String> {
        vec![
            self.tmux_path.clone(),
            "attach-session".to_string(),
            "-t".to_string(),
            exact_target(name),
        ]
    }
}

/// `=name` makes tmux match the session name exactly instead of by prefix
pub fn exact_target(name: &str) -> String {
    format!("={}", name)
}

/// Exact session match for commands that take a pane or window target
pub fn pane_target(name: &str) -> String {
    format!("={}:", name)
}

fn no_sessions(e: &TmuxError) -> bool {
    matches!(e, TmuxError::Failed { stderr, .. } if stderr.contains("no sessions"))
}

fn parse_pane_line(line: &str) -> Option<PaneEntry> {
    let mut parts = line.splitn(4, '|');
    let session_name = parts.next()?.to_string();
    let path = parts.next()?;
    let command = parts.next()?.to_string();
    let pid = parts.next().and_then(|p| p.trim().parse().ok());
    if session_name.is_empty() {
        return None;
    }

    Some(PaneEntry {
        session_name,
        path: PathBuf::from(path),
        command,
        pid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pane_line() {
        let pane = parse_pane_line("work|/home/elle/api|node|4242").unwrap();
        assert_eq!(pane.session_name, "work");
        assert_eq!(pane.path, PathBuf::from("/home/elle/api"));
        assert_eq!(pane.command, "node");
        assert_eq!(pane.pid, Some(4242));

        let no_pid = parse_pane_line("work|/tmp|zsh").unwrap();
        assert_eq!(no_pid.pid, None);

        assert!(parse_pane_line("only|two").is_none());
        assert!(parse_pane_line("|/tmp|zsh|1").is_none());
    }

    #[test]
    fn test_attach_command_targets_exact_session() {
        let client = TmuxClient::new("tmux", Duration::from_secs(1));
        assert_eq!(
            client.attach_command("agentdeck_1"),
            vec!["tmux", "attach-session", "-t", "=agentdeck_1"]
        );
    }

    #[tokio::test]
    async fn test_missing_binary_is_a_spawn_error() {
        let client = TmuxClient::new("/nonexistent/tmux-binary", Duration::from_secs(1));
        assert!(!client.has_session("anything").await);
        assert!(matches!(
            client.list_sessions().await,
            Err(TmuxError::Spawn { .. })
        ));
    }
}
