use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use super::{Attacher, Geometry, KeepAlive, TmuxClient};
use crate::error::SessionError;

/// Everything needed to start a fresh session
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub name: String,
    pub work_dir: PathBuf,
    /// Shell command line run as the session's only pane
    pub command: String,
    /// Variables removed from the agent's environment before launch
    pub unset_env: Vec<String>,
    pub geometry: Geometry,
}

impl LaunchSpec {
    /// The pane command with `env -u` prefixes for every stripped variable
    pub fn shell_command(&self) -> String {
        if self.unset_env.is_empty() {
            return self.command.clone();
        }
        let mut parts = vec!["env".to_string()];
        for var in &self.unset_env {
            parts.push("-u".to_string());
            parts.push(var.clone());
        }
        format!("{} {}", shell_words::join(parts), self.command)
    }
}

/// Owns one tmux session and its keep-alive client
pub struct TmuxSession {
    name: String,
    tmux: TmuxClient,
    attacher: Arc<dyn Attacher>,
    keepalive: Mutex<Option<Box<dyn KeepAlive>>>,
}

impl TmuxSession {
    /// Start a detached session and attach a keep-alive client to it.
    /// If the attach fails the half-created session is killed.
    pub async fn create(
        tmux: TmuxClient,
        attacher: Arc<dyn Attacher>,
        spec: &LaunchSpec,
    ) -> Result<Self, SessionError> {
        let command = spec.shell_command();
        debug!(session = %spec.name, %command, "creating session");

        tmux.new_session(
            &spec.name,
            &spec.work_dir,
            spec.geometry.cols,
            spec.geometry.rows,
            &command,
        )
        .await
        .map_err(|e| SessionError::Create {
            name: spec.name.clone(),
            source: Box::new(e.into()),
        })?;

        let session = Self::from_existing(tmux, attacher, &spec.name);
        if let Err(e) = session.attach(spec.geometry).await {
            if let Err(kill_err) = session.tmux.kill_session(&spec.name).await {
                warn!(session = %spec.name, error = %kill_err, "failed to clean up session after attach failure");
            }
            return Err(SessionError::Create {
                name: spec.name.clone(),
                source: Box::new(e),
            });
        }

        info!(session = %spec.name, "session created");
        Ok(session)
    }

    /// A handle for a session that already exists, with no client attached yet
    pub fn from_existing(tmux: TmuxClient, attacher: Arc<dyn Attacher>, name: &str) -> Self {
        Self {
            name: name.to_string(),
            tmux,
            attacher,
            keepalive: Mutex::new(None),
        }
    }

    fn keepalive(&self) -> MutexGuard<'_, Option<Box<dyn KeepAlive>>> {
        self.keepalive
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn is_attached(&self) -> bool {
        self.keepalive().is_some()
    }

    /// Attach (or replace) the keep-alive client and pin the window to `size`
    pub async fn attach(&self, size: Geometry) -> Result<(), SessionError> {
        // Without manual sizing tmux would shrink the window to the smallest client
        if let Err(e) = self.tmux.set_option(&self.name, "window-size", "manual").await {
            debug!(session = %self.name, error = %e, "could not set manual window size");
        }

        let client = self.attacher.attach(&self.name, size)?;
        *self.keepalive() = Some(client);

        if let Err(e) = self.tmux.resize_window(&self.name, size.cols, size.rows).await {
            debug!(session = %self.name, error = %e, "initial resize failed");
        }
        Ok(())
    }

    /// Drop the keep-alive client; the session keeps running
    pub fn detach(&self) {
        if self.keepalive().take().is_some() {
            debug!(session = %self.name, "detached keep-alive client");
        }
    }

    pub async fn is_alive(&self) -> bool {
        self.tmux.has_session(&self.name).await
    }

    /// Current pane text with colours kept and wrapped lines joined
    pub async fn capture_pane_content(&self) -> Result<String, SessionError> {
        Ok(self.tmux.capture_pane(&self.name, true).await?)
    }

    /// Type `text` into the pane and press Enter
    pub async fn send_keys(&self, text: &str) -> Result<(), SessionError> {
        Ok(self.tmux.send_keys(&self.name, text).await?)
    }

    /// Resize both the keep-alive pty and the tmux window
    pub async fn set_size(&self, size: Geometry) -> Result<(), SessionError> {
        if let Some(client) = self.keepalive().as_mut() {
            client.resize(size)?;
        }
        self.tmux.resize_window(&self.name, size.cols, size.rows).await?;
        Ok(())
    }

    /// Detach, then destroy the session. A session that is already gone is fine.
    pub async fn kill(&self) -> Result<(), SessionError> {
        self.detach();
        match self.tmux.kill_session(&self.name).await {
            Ok(()) => {
                info!(session = %self.name, "session killed");
                Ok(())
            }
            Err(e) if e.is_missing_session() => Ok(()),
            Err(e) => {
                if self.is_alive().await {
                    Err(e.into())
                } else {
                    Ok(())
                }
            }
        }
    }
}

impl std::fmt::Debug for TmuxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TmuxSession")
            .field("name", &self.name)
            .field("attached", &self.is_attached())
            .finish()
    }
}
