use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{Agent, AgentId, AgentStatus, DiscoveredAgent};
use crate::error::StoreError;

/// On-disk layout of the state file
#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    agents: Vec<Agent>,
}

struct Inner {
    agents: Vec<Agent>,
    next_id: u64,
}

/// What [`Store::adopt`] did with a candidate
#[derive(Debug, Clone)]
pub enum Adoption {
    Added(Agent),
    Revived(AgentId),
    AlreadyTracked(AgentId),
}

/// Durable registry of tracked agents.
///
/// Every mutation rewrites the whole file through a temp file and rename. Write
/// failures after startup are logged and otherwise ignored; the next mutation
/// retries with the full in-memory state.
pub struct Store {
    path: PathBuf,
    default_backend: String,
    inner: Mutex<Inner>,
}

impl Store {
    /// Load the registry from `path`, starting empty if the file does not exist.
    /// Records without a backend tag are assigned `default_backend`.
    pub fn open(path: impl Into<PathBuf>, default_backend: &str) -> Result<Self, StoreError> {
        let path = path.into();
        let mut agents = match std::fs::read(&path) {
            Ok(raw) => {
                let file: StateFile = serde_json::from_slice(&raw).map_err(|source| {
                    StoreError::Parse {
                        path: path.clone(),
                        source,
                    }
                })?;
                file.agents
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no state file, starting fresh");
                Vec::new()
            }
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        for agent in agents.iter_mut().filter(|a| a.backend.is_empty()) {
            agent.backend = default_backend.to_string();
        }

        let next_id = agents.iter().map(|a| a.id.0).max().unwrap_or(0) + 1;

        Ok(Self {
            path,
            default_backend: default_backend.to_string(),
            inner: Mutex::new(Inner { agents, next_id }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a newly spawned agent (status RUNNING)
    pub fn add(&self, name: &str, dir: &Path, backend: Option<&str>) -> Agent {
        let mut inner = self.lock();
        let now = Utc::now();
        let agent = Agent {
            id: AgentId(inner.next_id),
            name: name.to_string(),
            dir: dir.to_path_buf(),
            status: AgentStatus::Running,
            created_at: now,
            status_since: now,
            session_name: String::new(),
            discovered: false,
            backend: backend.unwrap_or(&self.default_backend).to_string(),
        };
        inner.next_id += 1;
        inner.agents.push(agent.clone());
        self.persist(&inner);
        agent
    }

    /// Adopt a discovery candidate as a new discovered agent
    pub fn add_discovered(&self, found: &DiscoveredAgent) -> Agent {
        let mut inner = self.lock();
        let agent = self.push_discovered(&mut inner, found);
        self.persist(&inner);
        agent
    }

    /// Offer a discovery candidate, matched by session name under one lock.
    ///
    /// A terminal agent bound to the session is revived in place, a live one is
    /// left alone, and an unseen session becomes a new discovered agent.
    pub fn adopt(&self, found: &DiscoveredAgent) -> Adoption {
        let mut inner = self.lock();
        let bound = inner
            .agents
            .iter()
            .position(|a| !a.session_name.is_empty() && a.session_name == found.session_name);

        let adoption = match bound {
            Some(idx) if inner.agents[idx].status.is_terminal() => {
                let agent = &mut inner.agents[idx];
                agent.status = AgentStatus::Running;
                agent.status_since = Utc::now();
                agent.discovered = true;
                Adoption::Revived(agent.id)
            }
            Some(idx) => return Adoption::AlreadyTracked(inner.agents[idx].id),
            None => Adoption::Added(self.push_discovered(&mut inner, found)),
        };
        self.persist(&inner);
        adoption
    }

    fn push_discovered(&self, inner: &mut Inner, found: &DiscoveredAgent) -> Agent {
        let now = Utc::now();
        let backend = if found.backend.is_empty() {
            self.default_backend.clone()
        } else {
            found.backend.clone()
        };
        let agent = Agent {
            id: AgentId(inner.next_id),
            name: found.name.clone(),
            dir: found.dir.clone(),
            status: AgentStatus::Running,
            created_at: now,
            status_since: now,
            session_name: found.session_name.clone(),
            discovered: true,
            backend,
        };
        inner.next_id += 1;
        inner.agents.push(agent.clone());
        agent
    }

    pub fn remove(&self, id: AgentId) -> Option<Agent> {
        let mut inner = self.lock();
        let idx = inner.agents.iter().position(|a| a.id == id)?;
        let removed = inner.agents.remove(idx);
        self.persist(&inner);
        Some(removed)
    }

    /// Set an agent's status; `status_since` moves only on an actual transition.
    /// Returns true if the status changed.
    pub fn set_status(&self, id: AgentId, status: AgentStatus) -> bool {
        self.mutate(id, |agent| {
            if agent.status == status {
                return false;
            }
            agent.status = status;
            agent.status_since = Utc::now();
            true
        })
        .unwrap_or(false)
    }

    pub fn set_session_name(&self, id: AgentId, session_name: &str) -> bool {
        self.mutate(id, |agent| {
            if agent.session_name == session_name {
                return false;
            }
            agent.session_name = session_name.to_string();
            true
        })
        .is_some()
    }

    pub fn rename(&self, id: AgentId, name: &str) -> bool {
        self.mutate(id, |agent| {
            let changed = agent.name != name;
            agent.name = name.to_string();
            changed
        })
        .is_some()
    }

    /// Apply `f` to one agent, saving when it reports a change.
    /// Returns `None` when the agent is not tracked.
    fn mutate(&self, id: AgentId, f: impl FnOnce(&mut Agent) -> bool) -> Option<bool> {
        let mut inner = self.lock();
        let agent = inner.agents.iter_mut().find(|a| a.id == id)?;
        let changed = f(agent);
        if changed {
            self.persist(&inner);
        }
        Some(changed)
    }

    pub fn get(&self, id: AgentId) -> Option<Agent> {
        self.lock().agents.iter().find(|a| a.id == id).cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<Agent> {
        self.lock().agents.iter().find(|a| a.name == name).cloned()
    }

    pub fn get_by_session(&self, session_name: &str) -> Option<Agent> {
        if session_name.is_empty() {
            return None;
        }
        self.lock()
            .agents
            .iter()
            .find(|a| a.session_name == session_name)
            .cloned()
    }

    /// Look an agent up by numeric id, then by name
    pub fn find(&self, target: &str) -> Option<Agent> {
        target
            .parse::<AgentId>()
            .ok()
            .and_then(|id| self.get(id))
            .or_else(|| self.get_by_name(target))
    }

    /// Snapshot of all agents in insertion order
    pub fn list(&self) -> Vec<Agent> {
        self.lock().agents.clone()
    }

    /// Remove every DONE agent, returning how many were dropped
    pub fn clear_done(&self) -> usize {
        let mut inner = self.lock();
        let before = inner.agents.len();
        inner.agents.retain(|a| a.status != AgentStatus::Done);
        let removed = before - inner.agents.len();
        if removed > 0 {
            self.persist(&inner);
        }
        removed
    }

    /// Remove discovered agents that have been DONE for longer than `grace`.
    /// Spawned agents are never pruned.
    pub fn prune_discovered(&self, grace: Duration, now: DateTime<Utc>) -> Vec<Agent> {
        let grace =
            chrono::Duration::from_std(grace).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let mut inner = self.lock();
        let (pruned, kept): (Vec<Agent>, Vec<Agent>) =
            std::mem::take(&mut inner.agents).into_iter().partition(|a| {
                a.discovered && a.status == AgentStatus::Done && now - a.status_since > grace
            });
        inner.agents = kept;
        if !pruned.is_empty() {
            for agent in &pruned {
                info!(agent_id = %agent.id, session = %agent.session_name, "pruned finished discovered agent");
            }
            self.persist(&inner);
        }
        pruned
    }

    fn persist(&self, inner: &Inner) {
        if let Err(e) = self.save(&inner.agents) {
            warn!(path = %self.path.display(), error = %e, "failed to save state");
        }
    }

    fn save(&self, agents: &[Agent]) -> Result<(), StoreError> {
        #[derive(Serialize)]
        struct StateFileRef<'a> {
            agents: &'a [Agent],
        }

        let data = serde_json::to_vec_pretty(&StateFileRef { agents })?;
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };

        std::fs::create_dir_all(&dir).map_err(io_err)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(io_err)?;
        tmp.write_all(&data).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&self.path).map_err(|e| io_err(e.error))?;
        Ok(())
    }
}
