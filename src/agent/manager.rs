use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info, warn};

use super::{Agent, AgentId, AgentStatus};
use crate::backend::{Backend, BackendRegistry};
use crate::error::{SessionError, TmuxError};
use crate::tmux::heuristics::preview_lines;
use crate::tmux::{Attacher, Geometry, LaunchSpec, TmuxClient, TmuxSession};

/// Preview text and mode tag derived from one capture
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaneInfo {
    pub preview: Vec<String>,
    pub mode: Option<&'static str>,
}

/// Owns the live Session Handles, keyed by agent.
///
/// The map lock only guards the map itself. Handles are cloned out before any
/// tmux call so slow subprocesses never block other readers.
pub struct AgentManager {
    tmux: TmuxClient,
    registry: Arc<BackendRegistry>,
    attacher: Arc<dyn Attacher>,
    geometry: Geometry,
    session_prefix: String,
    sessions: RwLock<HashMap<AgentId, Arc<TmuxSession>>>,
}

impl AgentManager {
    pub fn new(
        tmux: TmuxClient,
        registry: Arc<BackendRegistry>,
        attacher: Arc<dyn Attacher>,
        session_prefix: impl Into<String>,
        geometry: Geometry,
    ) -> Self {
        Self {
            tmux,
            registry,
            attacher,
            geometry,
            session_prefix: session_prefix.into(),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn tmux(&self) -> &TmuxClient {
        &self.tmux
    }

    pub fn session_name(&self, id: AgentId) -> String {
        format!("{}{}", self.session_prefix, id)
    }

    fn backend_for(&self, agent: &Agent) -> Arc<dyn Backend> {
        self.registry.resolve(&agent.backend)
    }

    fn cached(&self, id: AgentId) -> Option<Arc<TmuxSession>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Register a handle, keeping one that raced in first
    fn track(&self, id: AgentId, session: Arc<TmuxSession>) -> Arc<TmuxSession> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions.entry(id).or_insert(session).clone()
    }

    fn untrack(&self, id: AgentId) -> Option<Arc<TmuxSession>> {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    /// Start a session for `agent` and bind its name to the agent
    pub async fn spawn(&self, agent: &mut Agent, extra_args: &[String]) -> Result<(), SessionError> {
        let backend = self.backend_for(agent);
        let launch = backend.launch_command(extra_args);
        let spec = LaunchSpec {
            name: self.session_name(agent.id),
            work_dir: agent.dir.clone(),
            command: launch.command,
            unset_env: launch.unset_env,
            geometry: self.geometry,
        };

        let session = TmuxSession::create(self.tmux.clone(), self.attacher.clone(), &spec).await?;
        // A stale handle for the same id belongs to a session that is gone
        if let Some(old) = self.untrack(agent.id) {
            old.detach();
        }
        self.track(agent.id, Arc::new(session));

        agent.session_name = spec.name;
        info!(agent_id = %agent.id, session = %agent.session_name, backend = backend.id(), "agent spawned");
        Ok(())
    }

    /// Start a fresh session that continues the agent's previous conversation
    pub async fn respawn(&self, agent: &mut Agent) -> Result<(), SessionError> {
        let args = self.backend_for(agent).resume_args();
        self.spawn(agent, &args).await
    }

    /// The live handle for a spawned agent, reattaching after a restart if its session survived
    pub async fn get_session(&self, agent: &Agent) -> Option<Arc<TmuxSession>> {
        if let Some(session) = self.cached(agent.id) {
            return Some(session);
        }
        if !agent.has_session() || agent.discovered {
            return None;
        }
        if !self.tmux.has_session(&agent.session_name).await {
            return None;
        }

        let session = TmuxSession::from_existing(self.tmux.clone(), self.attacher.clone(), &agent.session_name);
        // Capture still works without a keep-alive client
        if let Err(e) = session.attach(self.geometry).await {
            warn!(agent_id = %agent.id, error = %e, "reattach failed");
        } else {
            info!(agent_id = %agent.id, session = %agent.session_name, "reattached to surviving session");
        }
        Some(self.track(agent.id, Arc::new(session)))
    }

    /// Hook record first, then a scrape of the pane. A missing session is DONE.
    pub async fn detect_status(&self, agent: &Agent) -> AgentStatus {
        if !agent.has_session() {
            return AgentStatus::Done;
        }
        let backend = self.backend_for(agent);

        if agent.discovered {
            if !self.tmux.has_session(&agent.session_name).await {
                return AgentStatus::Done;
            }
            return match self.tmux.capture_pane(&agent.session_name, false).await {
                Ok(content) => backend.detect_status(&content),
                Err(e) => {
                    debug!(agent_id = %agent.id, error = %e, "capture failed");
                    AgentStatus::Done
                }
            };
        }

        if let Some(status) = backend.read_hook_status(agent.id) {
            return status;
        }

        let Some(session) = self.get_session(agent).await else {
            return AgentStatus::Done;
        };
        if !session.is_alive().await {
            return AgentStatus::Done;
        }
        match session.capture_pane_content().await {
            Ok(content) => backend.detect_status(&content),
            Err(e) => {
                debug!(agent_id = %agent.id, error = %e, "capture failed");
                AgentStatus::Done
            }
        }
    }

    async fn capture(&self, agent: &Agent) -> Option<String> {
        if !agent.has_session() {
            return None;
        }
        let result = if agent.discovered {
            self.tmux
                .capture_pane(&agent.session_name, false)
                .await
                .map_err(SessionError::from)
        } else {
            match self.get_session(agent).await {
                Some(session) => session.capture_pane_content().await,
                None => return None,
            }
        };
        match result {
            Ok(content) => Some(content),
            Err(e) => {
                debug!(agent_id = %agent.id, error = %e, "preview capture failed");
                None
            }
        }
    }

    /// Last `n` preview lines with chrome removed, plus the mode tag, from a single capture
    pub async fn pane_info(&self, agent: &Agent, n: usize) -> PaneInfo {
        let Some(content) = self.capture(agent).await else {
            return PaneInfo::default();
        };
        let backend = self.backend_for(agent);

        let lines: Vec<&str> = content.lines().collect();
        let lines = backend.strip_chrome(lines, agent.status == AgentStatus::Waiting);
        PaneInfo {
            preview: preview_lines(lines.into_iter(), n),
            mode: backend.detect_mode(&content),
        }
    }

    pub async fn send_keys(&self, agent: &Agent, text: &str) -> Result<(), SessionError> {
        if !agent.has_session() {
            return Err(SessionError::Gone {
                name: agent.name.clone(),
            });
        }
        if agent.discovered {
            return Ok(self.tmux.send_keys(&agent.session_name, text).await?);
        }
        match self.get_session(agent).await {
            Some(session) => session.send_keys(text).await,
            None => Err(SessionError::Gone {
                name: agent.session_name.clone(),
            }),
        }
    }

    /// Resize a spawned agent's pty and window. Discovered sessions are left alone.
    pub async fn resize(&self, agent: &Agent, size: Geometry) -> Result<(), SessionError> {
        if agent.discovered {
            return Ok(());
        }
        match self.get_session(agent).await {
            Some(session) => session.set_size(size).await,
            None => Err(SessionError::Gone {
                name: agent.session_name.clone(),
            }),
        }
    }

    /// Tear down the agent's session and forget its hook status
    pub async fn kill(&self, agent: &Agent) -> Result<(), SessionError> {
        let result = match self.untrack(agent.id) {
            Some(session) => session.kill().await,
            None if agent.has_session() => self.kill_unmanaged(agent).await,
            None => Ok(()),
        };
        // A status tick may have reattached while the kill was in flight
        if let Some(late) = self.untrack(agent.id) {
            late.detach();
        }
        self.backend_for(agent).clean_hook_status(agent.id);
        if result.is_ok() {
            info!(agent_id = %agent.id, session = %agent.session_name, "agent killed");
        }
        result
    }

    /// Kill a session this manager holds no handle for
    async fn kill_unmanaged(&self, agent: &Agent) -> Result<(), SessionError> {
        let Err(e) = self.tmux.kill_session(&agent.session_name).await else {
            return Ok(());
        };
        if e.is_missing_session() || !self.tmux.has_session(&agent.session_name).await {
            debug!(agent_id = %agent.id, error = %e, "session already gone");
            return Ok(());
        }
        Err(e.into())
    }

    /// Names of every session tmux currently knows about
    pub async fn live_sessions(&self) -> Result<HashSet<String>, TmuxError> {
        Ok(self.tmux.list_sessions().await?.into_iter().collect())
    }

    /// Drop handles for agents no longer in `tracked`, detaching their clients
    pub fn retain(&self, tracked: &HashSet<AgentId>) -> usize {
        let stale: Vec<Arc<TmuxSession>> = {
            let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            let ids: Vec<AgentId> = sessions.keys().filter(|id| !tracked.contains(id)).copied().collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };
        for session in &stale {
            debug!(?session, "evicted handle of untracked agent");
            session.detach();
        }
        stale.len()
    }

    /// Detach every keep-alive client; the sessions keep running
    pub fn close_all(&self) {
        let sessions: Vec<Arc<TmuxSession>> = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, session)| session)
            .collect();
        for session in &sessions {
            session.detach();
        }
        debug!(count = sessions.len(), "closed all keep-alive clients");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Duration;

    use chrono::Utc;

    use std::sync::atomic::Ordering;

    use crate::backend::tests::registry;
    use crate::tmux::session::tests::{fake_tmux, tmux_calls, CountingAttacher};

    const IDLE_PANE: &str = "\
Edited src/main.rs
Added retry loop

────────────────────────────────────────
❯ 
────────────────────────────────────────
  ⏸ plan mode on (shift+tab to cycle)
";

    const PERMISSION_PANE: &str = "\
Edited src/main.rs
────────────────────────────────────────
 Do you want to proceed?
 ❯ 1. Yes
   2. No, and tell Claude what to do differently
────────────────────────────────────────
 Esc to cancel
";

    fn manager(dir: &Path) -> AgentManager {
        manager_with(
            dir,
            TmuxClient::new("/nonexistent/tmux-binary", Duration::from_secs(1)),
            Arc::new(CountingAttacher::default()),
        )
    }

    fn manager_with(dir: &Path, tmux: TmuxClient, attacher: Arc<CountingAttacher>) -> AgentManager {
        AgentManager::new(
            tmux,
            Arc::new(registry(dir)),
            attacher,
            "agentdeck_",
            Geometry::new(200, 50),
        )
    }

    fn agent(id: u64, session_name: &str) -> Agent {
        let now = Utc::now();
        Agent {
            id: AgentId(id),
            name: format!("agent-{}", id),
            dir: "/tmp".into(),
            status: AgentStatus::Running,
            created_at: now,
            status_since: now,
            session_name: session_name.into(),
            discovered: false,
            backend: "claude".into(),
        }
    }

    fn write_hook(dir: &Path, id: u64, state: &str) {
        let status_dir = dir.join("deck/status");
        std::fs::create_dir_all(&status_dir).unwrap();
        std::fs::write(
            status_dir.join(format!("{}.json", id)),
            format!(r#"{{"state":"{}","ts":{}}}"#, state, Utc::now().timestamp()),
        )
        .unwrap();
    }

    #[test]
    fn test_session_name_uses_prefix() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(manager(dir.path()).session_name(AgentId(7)), "agentdeck_7");
    }

    #[tokio::test]
    async fn test_agent_without_session_is_done() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        assert_eq!(manager.detect_status(&agent(1, "")).await, AgentStatus::Done);

        let mut discovered = agent(2, "");
        discovered.discovered = true;
        assert_eq!(manager.detect_status(&discovered).await, AgentStatus::Done);
    }

    #[tokio::test]
    async fn test_hook_record_wins_over_scrape() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        write_hook(dir.path(), 3, "WAITING");
        assert_eq!(manager.detect_status(&agent(3, "agentdeck_3")).await, AgentStatus::Waiting);
    }

    #[tokio::test]
    async fn test_hook_miss_with_vanished_session_is_done() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        assert_eq!(manager.detect_status(&agent(4, "agentdeck_4")).await, AgentStatus::Done);
        assert!(manager.get_session(&agent(4, "agentdeck_4")).await.is_none());
    }

    #[tokio::test]
    async fn test_discovered_agents_ignore_hooks() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        write_hook(dir.path(), 5, "IDLE");
        let mut found = agent(5, "work");
        found.discovered = true;
        assert_eq!(manager.detect_status(&found).await, AgentStatus::Done);
    }

    #[tokio::test]
    async fn test_pane_info_without_session_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        assert_eq!(manager.pane_info(&agent(6, ""), 5).await, PaneInfo::default());
        assert_eq!(manager.pane_info(&agent(6, "agentdeck_6"), 5).await, PaneInfo::default());
    }

    #[tokio::test]
    async fn test_send_keys_to_missing_session_fails() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let result = manager.send_keys(&agent(7, "agentdeck_7"), "hello").await;
        assert!(matches!(result, Err(SessionError::Gone { .. })));
    }

    #[tokio::test]
    async fn test_kill_cleans_hook_and_forgets_handle() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let target = agent(8, "agentdeck_8");
        write_hook(dir.path(), 8, "IDLE");

        let session = TmuxSession::from_existing(
            manager.tmux.clone(),
            manager.attacher.clone(),
            &target.session_name,
        );
        manager.track(target.id, Arc::new(session));
        assert!(manager.get_session(&target).await.is_some());

        manager.kill(&target).await.unwrap();
        assert!(manager.cached(target.id).is_none());
        assert!(!dir.path().join("deck/status/8.json").exists());
        // Killing again is fine
        manager.kill(&target).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_all_detaches_without_killing() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let session = Arc::new(TmuxSession::from_existing(
            manager.tmux.clone(),
            manager.attacher.clone(),
            "agentdeck_9",
        ));
        session.attach(Geometry::new(80, 24)).await.unwrap();
        manager.track(AgentId(9), session.clone());

        manager.close_all();
        assert!(!session.is_attached());
        assert!(manager.cached(AgentId(9)).is_none());
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_agent_unbound() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let mut fresh = agent(10, "");
        assert!(manager.spawn(&mut fresh, &[]).await.is_err());
        assert!(fresh.session_name.is_empty());
        assert!(manager.cached(fresh.id).is_none());
    }

    #[tokio::test]
    async fn test_scrape_reattaches_and_classifies_idle_pane() {
        let dir = tempfile::tempdir().unwrap();
        let (tmux, log) = fake_tmux(dir.path(), IDLE_PANE);
        let attacher = Arc::new(CountingAttacher::default());
        let manager = manager_with(dir.path(), tmux, attacher.clone());
        let target = agent(11, "agentdeck_11");

        assert_eq!(manager.detect_status(&target).await, AgentStatus::Idle);
        // The surviving session got a keep-alive client and a cached handle
        assert_eq!(attacher.attached.load(Ordering::SeqCst), 1);
        assert!(manager.cached(target.id).is_some());
        assert!(tmux_calls(&log).contains(&"capture-pane -p -J -e -t =agentdeck_11:".to_string()));

        let info = manager.pane_info(&target, 5).await;
        assert_eq!(info.preview, vec!["Edited src/main.rs", "Added retry loop"]);
        assert_eq!(info.mode, Some("PLAN"));
        // Second capture reuses the cached handle
        assert_eq!(attacher.attached.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_waiting_pane_keeps_the_question() {
        let dir = tempfile::tempdir().unwrap();
        let (tmux, _log) = fake_tmux(dir.path(), PERMISSION_PANE);
        let manager = manager_with(dir.path(), tmux, Arc::new(CountingAttacher::default()));
        let mut target = agent(12, "agentdeck_12");

        target.status = manager.detect_status(&target).await;
        assert_eq!(target.status, AgentStatus::Waiting);

        let info = manager.pane_info(&target, 3).await;
        assert_eq!(
            info.preview,
            vec![
                "Do you want to proceed?",
                "❯ 1. Yes",
                "2. No, and tell Claude what to do differently",
            ]
        );
        assert_eq!(info.mode, None);
    }

    #[tokio::test]
    async fn test_discovered_capture_never_attaches() {
        let dir = tempfile::tempdir().unwrap();
        let (tmux, log) = fake_tmux(dir.path(), IDLE_PANE);
        let attacher = Arc::new(CountingAttacher::default());
        let manager = manager_with(dir.path(), tmux, attacher.clone());
        let mut found = agent(13, "work");
        found.discovered = true;

        assert_eq!(manager.detect_status(&found).await, AgentStatus::Idle);
        let info = manager.pane_info(&found, 5).await;
        assert_eq!(info.preview, vec!["Edited src/main.rs", "Added retry loop"]);

        assert_eq!(attacher.attached.load(Ordering::SeqCst), 0);
        assert!(manager.cached(found.id).is_none());
        let calls = tmux_calls(&log);
        assert!(calls.contains(&"capture-pane -p -J -t =work:".to_string()));
        assert!(!calls.iter().any(|c| c.starts_with("set-option")));
    }

    #[tokio::test]
    async fn test_retain_evicts_handles_of_removed_agents() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        for id in [14, 15] {
            let session = TmuxSession::from_existing(
                manager.tmux.clone(),
                manager.attacher.clone(),
                &format!("agentdeck_{}", id),
            );
            session.attach(Geometry::new(80, 24)).await.unwrap();
            manager.track(AgentId(id), Arc::new(session));
        }
        let stale = manager.cached(AgentId(15)).unwrap();

        let tracked: HashSet<AgentId> = [AgentId(14)].into_iter().collect();
        assert_eq!(manager.retain(&tracked), 1);
        assert!(manager.cached(AgentId(14)).is_some());
        assert!(manager.cached(AgentId(15)).is_none());
        assert!(!stale.is_attached());
        assert_eq!(manager.retain(&tracked), 0);
    }
}
