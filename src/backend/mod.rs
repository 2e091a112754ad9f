//! Per-CLI strategies.
//!
//! A [`Backend`] knows how to launch one agent CLI, classify its screen,
//! strip its UI chrome, recognise it in a foreign tmux session and wire up
//! its lifecycle hooks. Backends are stateless apart from the paths they are
//! built with and are selected per agent by id through [`BackendRegistry`].

mod claude;
mod codex;
mod gemini;
pub mod hooks;
pub mod scan;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

pub use claude::ClaudeBackend;
pub use codex::CodexBackend;
pub use gemini::GeminiBackend;
pub use scan::DiscoveryContext;

use crate::agent::{AgentId, AgentStatus, DiscoveredAgent};
use crate::config::Config;
use crate::error::{ConfigError, HookError};
use hooks::HookEnv;

/// Shell command line for a new session plus the variables to strip first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub command: String,
    pub unset_env: Vec<String>,
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Stable id stored on each agent
    fn id(&self) -> &'static str;

    /// Human readable name
    fn name(&self) -> &'static str;

    /// Executable launched in the session
    fn binary(&self) -> &'static str;

    /// Where the executable was found on `PATH`
    fn check_deps(&self) -> Option<PathBuf> {
        which::which(self.binary()).ok()
    }

    /// Variables whose presence makes the CLI refuse to start
    fn unset_env(&self) -> &'static [&'static str] {
        &[]
    }

    fn launch_command(&self, extra_args: &[String]) -> LaunchCommand {
        let words = std::iter::once(self.binary()).chain(extra_args.iter().map(String::as_str));
        LaunchCommand {
            command: shell_words::join(words),
            unset_env: self.unset_env().iter().map(|v| v.to_string()).collect(),
        }
    }

    /// Arguments that continue the previous conversation, if the CLI has such a flag
    fn resume_args(&self) -> Vec<String> {
        Vec::new()
    }

    /// Arguments that hand the CLI its first prompt
    fn prompt_args(&self, prompt: &str) -> Vec<String> {
        vec![prompt.to_string()]
    }

    fn detect_status(&self, content: &str) -> AgentStatus;

    /// Short mode tag such as "PLAN", when the CLI shows one
    fn detect_mode(&self, _content: &str) -> Option<&'static str> {
        None
    }

    /// Drop bottom-of-screen UI furniture before preview extraction
    fn strip_chrome<'a>(&self, lines: Vec<&'a str>, _waiting: bool) -> Vec<&'a str> {
        lines
    }

    /// Signature match for claiming a foreign session
    fn looks_like_me(&self, content: &str) -> bool;

    /// Candidates from the shared snapshot
    async fn discover(&self, ctx: &DiscoveryContext) -> Vec<DiscoveredAgent> {
        let mut found =
            scan::discover_panes(ctx, self.id(), self.binary(), |c| self.looks_like_me(c)).await;
        found.extend(scan::discover_processes(ctx, self.id(), self.binary()));
        found
    }

    /// Install the hook script and register it with the CLI. Returns true if anything changed.
    fn install_hooks(&self) -> Result<bool, HookError> {
        Ok(false)
    }

    fn read_hook_status(&self, _id: AgentId) -> Option<AgentStatus> {
        None
    }

    fn clean_hook_status(&self, _id: AgentId) {}
}

/// The active backend set with an explicitly chosen default
pub struct BackendRegistry {
    backends: Vec<Arc<dyn Backend>>,
    default: Arc<dyn Backend>,
}

impl BackendRegistry {
    /// Build a registry; `default_id` must name one of `backends`
    pub fn new(backends: Vec<Arc<dyn Backend>>, default_id: &str) -> Result<Self, ConfigError> {
        let default = backends
            .iter()
            .find(|b| b.id() == default_id)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownBackend(default_id.to_string()))?;
        Ok(Self { backends, default })
    }

    /// Claude, Codex and Gemini wired to the configured paths
    pub fn builtin(config: &Config) -> Result<Self, ConfigError> {
        let env = HookEnv::from_config(config);
        let backends: Vec<Arc<dyn Backend>> = vec![
            Arc::new(ClaudeBackend::new(env.clone())),
            Arc::new(CodexBackend::new(env.clone())),
            Arc::new(GeminiBackend::new(env)),
        ];
        Self::new(backends, &config.default_backend)
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Backend>> {
        self.backends.iter().find(|b| b.id() == id).cloned()
    }

    /// The backend for `id`, or the default when `id` is empty or unknown
    pub fn resolve(&self, id: &str) -> Arc<dyn Backend> {
        self.get(id).unwrap_or_else(|| self.default.clone())
    }

    pub fn default_backend(&self) -> &Arc<dyn Backend> {
        &self.default
    }

    pub fn all(&self) -> &[Arc<dyn Backend>] {
        &self.backends
    }

    pub fn ids(&self) -> Vec<&'static str> {
        self.backends.iter().map(|b| b.id()).collect()
    }

    /// Union of every backend's stripped variables
    pub fn unset_env(&self) -> Vec<String> {
        let mut vars: Vec<String> = Vec::new();
        for var in self.backends.iter().flat_map(|b| b.unset_env().iter()) {
            if !vars.iter().any(|v| v == var) {
                vars.push(var.to_string());
            }
        }
        vars
    }
}
