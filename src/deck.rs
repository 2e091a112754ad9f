//! Operator-facing facade over the store, the agent manager and the backends.
//!
//! The dashboard and the one-shot CLI commands both go through [`Deck`]. It
//! owns the driving-loop operations (status refresh, discovery) and the
//! explicit operator actions, whose failures come back as `anyhow` errors
//! ready to be shown as a status line.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

use crate::agent::discovery::{self, MergeReport};
use crate::agent::{Agent, AgentId, AgentManager, AgentStatus, DiscoveredAgent, Store};
use crate::backend::scan::derive_name_from_dir;
use crate::backend::{BackendRegistry, DiscoveryContext};
use crate::config::Config;
use crate::error::HookError;
use crate::tmux::{Attacher, Geometry, PtyAttacher, TmuxClient};

/// One agent as the board shows it
#[derive(Debug, Clone)]
pub struct AgentView {
    pub agent: Agent,
    pub preview: Vec<String>,
    pub mode: Option<&'static str>,
}

/// Result of one discovery pass
#[derive(Debug, Default)]
pub struct DiscoveryOutcome {
    /// Every candidate reported by the backends, including process-only ones
    pub candidates: Vec<DiscoveredAgent>,
    pub merged: MergeReport,
    /// Discovered agents whose session disappeared
    pub ended: Vec<AgentId>,
}

pub struct Deck {
    config: Config,
    store: Store,
    manager: AgentManager,
    registry: Arc<BackendRegistry>,
}

impl Deck {
    /// Open the deck rooted at `config.home` with the built-in backends
    pub fn open(config: Config) -> Result<Self> {
        config.ensure_dirs()?;
        let registry = Arc::new(BackendRegistry::builtin(&config)?);
        let attacher = Arc::new(PtyAttacher::new(config.tmux_path.clone(), registry.unset_env()));
        Self::with_parts(config, registry, attacher)
    }

    pub fn with_parts(
        config: Config,
        registry: Arc<BackendRegistry>,
        attacher: Arc<dyn Attacher>,
    ) -> Result<Self> {
        let store = Store::open(config.state_path(), &config.default_backend)
            .context("failed to load agent state")?;
        let tmux = TmuxClient::new(config.tmux_path.clone(), config.command_timeout());
        let manager = AgentManager::new(
            tmux,
            registry.clone(),
            attacher,
            config.session_prefix.clone(),
            Geometry::new(config.initial_cols, config.initial_rows),
        );
        Ok(Self {
            config,
            store,
            manager,
            registry,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    fn find(&self, target: &str) -> Result<Agent> {
        self.store
            .find(target)
            .with_context(|| format!("no agent with id or name '{}'", target))
    }

    /// Track a new agent and start its session.
    /// The agent is dropped again if the session cannot be created.
    pub async fn spawn_agent(
        &self,
        dir: &Path,
        name: Option<&str>,
        backend: Option<&str>,
        prompt: Option<&str>,
    ) -> Result<Agent> {
        if !dir.is_dir() {
            bail!("{} is not a directory", dir.display());
        }
        let backend = match backend {
            Some(id) => self
                .registry
                .get(id)
                .with_context(|| format!("unknown backend '{}' (known: {})", id, self.registry.ids().join(", ")))?,
            None => self.registry.default_backend().clone(),
        };

        let name = match name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => name.to_string(),
            None => derive_name_from_dir(dir).await,
        };
        let args = prompt
            .filter(|p| !p.trim().is_empty())
            .map(|p| backend.prompt_args(p))
            .unwrap_or_default();

        let mut agent = self.store.add(&name, dir, Some(backend.id()));
        if let Err(e) = self.manager.spawn(&mut agent, &args).await {
            self.store.remove(agent.id);
            return Err(e).with_context(|| format!("failed to spawn {}", name));
        }
        self.store.set_session_name(agent.id, &agent.session_name);
        Ok(agent)
    }

    /// Reattach to a surviving session, or start a new one that resumes the conversation
    pub async fn resume_agent(&self, target: &str) -> Result<Agent> {
        let mut agent = self.find(target)?;
        if agent.discovered {
            bail!("{} was not started here and cannot be resumed", agent.name);
        }

        let live = match self.manager.get_session(&agent).await {
            Some(session) => session.is_alive().await,
            None => false,
        };
        if live {
            info!(agent_id = %agent.id, "session still alive, reattached");
        } else {
            self.manager
                .respawn(&mut agent)
                .await
                .with_context(|| format!("failed to resume {}", agent.name))?;
            self.store.set_session_name(agent.id, &agent.session_name);
        }
        self.store.set_status(agent.id, AgentStatus::Running);
        agent.status = AgentStatus::Running;
        Ok(agent)
    }

    /// Kill the agent's session and stop tracking it
    pub async fn kill_agent(&self, target: &str) -> Result<Agent> {
        let agent = self.find(target)?;
        self.manager
            .kill(&agent)
            .await
            .with_context(|| format!("failed to kill {}", agent.name))?;
        self.store.remove(agent.id);
        Ok(agent)
    }

    pub async fn send_keys(&self, target: &str, text: &str) -> Result<()> {
        let agent = self.find(target)?;
        self.manager
            .send_keys(&agent, text)
            .await
            .with_context(|| format!("failed to send to {}", agent.name))
    }

    pub fn rename(&self, target: &str, name: &str) -> Result<Agent> {
        let name = name.trim();
        if name.is_empty() {
            bail!("name cannot be empty");
        }
        let agent = self.find(target)?;
        self.store.rename(agent.id, name);
        self.find(&agent.id.to_string())
    }

    /// Resize a spawned agent's session, e.g. to the operator's terminal before attaching
    pub async fn resize_agent(&self, target: &str, cols: u16, rows: u16) -> Result<()> {
        let agent = self.find(target)?;
        self.manager
            .resize(&agent, Geometry::new(cols, rows))
            .await
            .with_context(|| format!("failed to resize {}", agent.name))
    }

    /// Command line that attaches the operator's terminal to the agent's session
    pub fn attach_command(&self, target: &str) -> Result<Vec<String>> {
        let agent = self.find(target)?;
        if !agent.has_session() {
            bail!("{} has no session", agent.name);
        }
        Ok(self.manager.tmux().attach_command(&agent.session_name))
    }

    /// One status tick: classify every agent, then prune stale discovered agents.
    /// Returns how many statuses changed.
    pub async fn refresh_statuses(&self) -> usize {
        let mut changed = 0;
        for agent in self.store.list() {
            let status = self.manager.detect_status(&agent).await;
            if self.store.set_status(agent.id, status) {
                debug!(agent_id = %agent.id, from = %agent.status, to = %status, "status changed");
                changed += 1;
            }
        }
        discovery::prune(&self.store, self.config.discovered_grace());
        let tracked: HashSet<AgentId> = self.store.list().iter().map(|a| a.id).collect();
        self.manager.retain(&tracked);
        changed
    }

    /// Candidates from every backend, first claim on a session or pid wins
    pub async fn scan(&self) -> Vec<DiscoveredAgent> {
        let ctx = DiscoveryContext::gather(self.manager.tmux(), &self.config.session_prefix).await;
        let mut sessions = HashSet::new();
        let mut pids = HashSet::new();
        let mut candidates = Vec::new();

        for backend in self.registry.all() {
            for found in backend.discover(&ctx).await {
                let fresh = if found.session_name.is_empty() {
                    found.pid.map_or(true, |pid| pids.insert(pid))
                } else {
                    sessions.insert(found.session_name.clone())
                };
                if fresh {
                    candidates.push(found);
                }
            }
        }
        candidates
    }

    /// One discovery tick: scan, merge and reconcile
    pub async fn discover(&self) -> DiscoveryOutcome {
        let candidates = self.scan().await;
        let merged = discovery::merge_discovered(&self.store, &candidates);

        let ended = match self.manager.live_sessions().await {
            Ok(live) => discovery::reconcile(&self.store, &live),
            Err(e) => {
                warn!(error = %e, "could not list sessions, skipping reconciliation");
                Vec::new()
            }
        };

        if !merged.is_empty() || !ended.is_empty() {
            info!(
                added = merged.added.len(),
                revived = merged.revived.len(),
                ended = ended.len(),
                "discovery changed the agent list"
            );
        }
        DiscoveryOutcome {
            candidates,
            merged,
            ended,
        }
    }

    /// Every agent with its preview and mode, for rendering
    pub async fn views(&self, preview_lines: usize) -> Vec<AgentView> {
        let mut views = Vec::new();
        for agent in self.store.list() {
            let info = self.manager.pane_info(&agent, preview_lines).await;
            views.push(AgentView {
                agent,
                preview: info.preview,
                mode: info.mode,
            });
        }
        views
    }

    /// Forget every DONE agent and its hook status
    pub fn clear_done(&self) -> usize {
        for agent in self.store.list().iter().filter(|a| a.status == AgentStatus::Done) {
            self.registry.resolve(&agent.backend).clean_hook_status(agent.id);
        }
        self.store.clear_done()
    }

    /// Install every backend's hooks, reporting each result
    pub fn install_hooks(&self) -> Vec<(&'static str, Result<bool, HookError>)> {
        self.registry
            .all()
            .iter()
            .map(|backend| (backend.id(), backend.install_hooks()))
            .collect()
    }

    /// Release keep-alive clients; sessions keep running
    pub fn close(&self) {
        self.manager.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::tmux::session::tests::{fake_tmux_script, CountingAttacher};

    fn deck(dir: &Path) -> Deck {
        deck_with_tmux(dir, "/nonexistent/tmux-binary")
    }

    fn deck_with_tmux(dir: &Path, tmux_path: &str) -> Deck {
        let mut config = Config::with_dirs(dir.join("deck"), dir.join("home"));
        config.tmux_path = tmux_path.into();
        config.command_timeout_ms = 1_000;
        config.ensure_dirs().unwrap();
        let registry = Arc::new(BackendRegistry::builtin(&config).unwrap());
        Deck::with_parts(config, registry, Arc::new(CountingAttacher::default())).unwrap()
    }

    #[tokio::test]
    async fn test_failed_spawn_is_not_tracked() {
        let dir = tempfile::tempdir().unwrap();
        let deck = deck(dir.path());
        let result = deck
            .spawn_agent(dir.path(), Some("api"), None, Some("fix the tests"))
            .await;
        assert!(result.is_err());
        assert!(deck.store().list().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_rejects_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        let deck = deck(dir.path());
        let missing = dir.path().join("missing");
        assert!(deck.spawn_agent(&missing, None, None, None).await.is_err());

        let err = deck
            .spawn_agent(dir.path(), None, Some("copilot"), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown backend"));
        assert!(deck.store().list().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_marks_lost_sessions_done() {
        let dir = tempfile::tempdir().unwrap();
        let deck = deck(dir.path());
        let agent = deck.store().add("api", dir.path(), None);
        deck.store().set_session_name(agent.id, "agentdeck_1");

        assert_eq!(deck.refresh_statuses().await, 1);
        assert_eq!(deck.store().get(agent.id).unwrap().status, AgentStatus::Done);
        assert_eq!(deck.refresh_statuses().await, 0);
    }

    #[tokio::test]
    async fn test_kill_and_rename_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let deck = deck(dir.path());
        deck.store().add("api", dir.path(), None);

        let renamed = deck.rename("api", "backend-api").unwrap();
        assert_eq!(renamed.name, "backend-api");
        assert!(deck.rename("backend-api", "  ").is_err());

        let killed = deck.kill_agent("1").await.unwrap();
        assert_eq!(killed.name, "backend-api");
        assert!(deck.store().list().is_empty());
        assert!(deck.kill_agent("1").await.is_err());
    }

    #[tokio::test]
    async fn test_resume_refuses_discovered_agents() {
        let dir = tempfile::tempdir().unwrap();
        let deck = deck(dir.path());
        deck.store().add_discovered(&DiscoveredAgent {
            name: "work".into(),
            dir: dir.path().to_path_buf(),
            session_name: "work".into(),
            pid: None,
            backend: "claude".into(),
        });
        let err = deck.resume_agent("work").await.unwrap_err();
        assert!(err.to_string().contains("cannot be resumed"));
    }

    #[tokio::test]
    async fn test_discover_without_tmux_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let deck = deck(dir.path());
        let outcome = deck.discover().await;
        assert!(outcome.merged.is_empty());
        assert!(outcome.ended.is_empty());
        assert!(deck.store().list().is_empty());
    }

    #[tokio::test]
    async fn test_clear_done_and_views() {
        let dir = tempfile::tempdir().unwrap();
        let deck = deck(dir.path());
        let done = deck.store().add("old", dir.path(), None);
        deck.store().set_status(done.id, AgentStatus::Done);
        deck.store().add("new", dir.path(), None);

        assert_eq!(deck.clear_done(), 1);
        let views = deck.views(5).await;
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].agent.name, "new");
        assert!(views[0].preview.is_empty());
        assert_eq!(views[0].mode, None);
    }

    #[test]
    fn test_install_hooks_covers_every_backend() {
        let dir = tempfile::tempdir().unwrap();
        let deck = deck(dir.path());
        let results = deck.install_hooks();
        let ids: Vec<&str> = results.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec!["claude", "codex", "gemini"]);
        assert!(results.iter().all(|(_, r)| matches!(r, Ok(true))));
    }

    #[tokio::test]
    async fn test_refresh_drops_handles_of_removed_agents() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_tmux_script(dir.path(), "❯ \n");
        let deck = deck_with_tmux(dir.path(), &script.to_string_lossy());
        let agent = deck.store().add("api", dir.path(), None);
        deck.store().set_session_name(agent.id, "agentdeck_1");

        deck.refresh_statuses().await;
        let agent = deck.store().get(agent.id).unwrap();
        assert_eq!(agent.status, AgentStatus::Idle);
        let handle = deck.manager.get_session(&agent).await.unwrap();
        assert!(handle.is_attached());

        deck.store().remove(agent.id);
        deck.refresh_statuses().await;
        assert!(!handle.is_attached());
    }
}
