//! Background tmux clients that keep a session rendering.
//!
//! tmux may stop updating a session nobody is attached to, which leaves
//! `capture-pane` with stale content. A keep-alive is a real `tmux
//! attach-session` running on a pseudo-terminal whose output is drained and
//! thrown away. Dropping it closes the client; the session keeps running.

use std::io::Read;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tracing::{debug, warn};

use super::client::exact_target;
use super::Geometry;
use crate::error::SessionError;

/// A live background client attached to one session. Detach by dropping.
pub trait KeepAlive: Send {
    fn resize(&mut self, size: Geometry) -> Result<(), SessionError>;
}

/// Opens keep-alive clients
pub trait Attacher: Send + Sync {
    fn attach(&self, session: &str, size: Geometry) -> Result<Box<dyn KeepAlive>, SessionError>;
}

/// Attaches through `portable-pty`
pub struct PtyAttacher {
    tmux_path: String,
    /// Variables removed from the client's environment
    strip_env: Vec<String>,
}

impl PtyAttacher {
    pub fn new(tmux_path: impl Into<String>, strip_env: Vec<String>) -> Self {
        let mut strip_env = strip_env;
        // tmux refuses to attach from inside another tmux client
        for var in ["TMUX", "TMUX_PANE"] {
            if !strip_env.iter().any(|v| v == var) {
                strip_env.push(var.to_string());
            }
        }
        Self {
            tmux_path: tmux_path.into(),
            strip_env,
        }
    }
}

fn pty_size(size: Geometry) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

impl Attacher for PtyAttacher {
    fn attach(&self, session: &str, size: Geometry) -> Result<Box<dyn KeepAlive>, SessionError> {
        let attach_err = |reason: String| SessionError::Attach {
            name: session.to_string(),
            reason,
        };

        let pair = native_pty_system()
            .openpty(pty_size(size))
            .map_err(|e| attach_err(format!("openpty: {}", e)))?;

        let target = exact_target(session);
        let mut cmd = CommandBuilder::new(&self.tmux_path);
        cmd.args(["attach-session", "-t", target.as_str()]);
        for (key, value) in std::env::vars() {
            if !self.strip_env.contains(&key) {
                cmd.env(key, value);
            }
        }
        for key in &self.strip_env {
            cmd.env_remove(key);
        }
        cmd.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| attach_err(format!("spawn tmux client: {}", e)))?;
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| attach_err(format!("clone pty reader: {}", e)))?;

        // Drain output so the client never blocks on a full pty buffer
        let thread_name = format!("keepalive-{}", session);
        std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let mut buf = [0u8; 8192];
                while matches!(reader.read(&mut buf), Ok(n) if n > 0) {}
            })
            .map_err(|e| attach_err(format!("spawn drain thread: {}", e)))?;

        debug!(session, "keep-alive client attached");
        Ok(Box::new(PtyKeepAlive {
            session: session.to_string(),
            master: pair.master,
            child,
        }))
    }
}

struct PtyKeepAlive {
    session: String,
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
}

impl KeepAlive for PtyKeepAlive {
    fn resize(&mut self, size: Geometry) -> Result<(), SessionError> {
        self.master
            .resize(pty_size(size))
            .map_err(|e| SessionError::Attach {
                name: self.session.clone(),
                reason: format!("resize pty: {}", e),
            })
    }
}

impl Drop for PtyKeepAlive {
    fn drop(&mut self) {
        if let Err(e) = self.child.kill() {
            warn!(session = %self.session, error = %e, "failed to stop keep-alive client");
            return;
        }
        let _ = self.child.wait();
        debug!(session = %self.session, "keep-alive client detached");
    }
}
