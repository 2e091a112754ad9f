//! Folding discovery results into the store.

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use super::{Adoption, Agent, AgentId, AgentStatus, DiscoveredAgent, Store};

/// What a merge changed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub added: Vec<AgentId>,
    pub revived: Vec<AgentId>,
}

impl MergeReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.revived.is_empty()
    }
}

/// Merge candidates keyed by session name.
///
/// An unseen session becomes a new discovered agent. A session bound to a DONE
/// agent revives that agent in place. A session bound to a live agent is left
/// alone. Candidates without a session cannot be tracked and are skipped.
pub fn merge_discovered(store: &Store, found: &[DiscoveredAgent]) -> MergeReport {
    let mut report = MergeReport::default();
    let mut seen = HashSet::new();

    for candidate in found {
        if candidate.session_name.is_empty() || !seen.insert(candidate.session_name.as_str()) {
            continue;
        }

        match store.adopt(candidate) {
            Adoption::Revived(id) => {
                info!(agent_id = %id, session = %candidate.session_name, "revived agent");
                report.revived.push(id);
            }
            Adoption::AlreadyTracked(_) => {}
            Adoption::Added(agent) => {
                info!(
                    agent_id = %agent.id,
                    session = %agent.session_name,
                    backend = %agent.backend,
                    "adopted discovered agent"
                );
                report.added.push(agent.id);
            }
        }
    }
    report
}

/// Mark discovered agents DONE when their session is no longer listed
pub fn reconcile(store: &Store, live_sessions: &HashSet<String>) -> Vec<AgentId> {
    let mut ended = Vec::new();
    for agent in store.list() {
        if !agent.discovered || agent.status.is_terminal() {
            continue;
        }
        if !live_sessions.contains(&agent.session_name) {
            store.set_status(agent.id, AgentStatus::Done);
            debug!(agent_id = %agent.id, session = %agent.session_name, "discovered session ended");
            ended.push(agent.id);
        }
    }
    ended
}

/// Drop discovered agents that have been DONE for longer than `grace`
pub fn prune(store: &Store, grace: Duration) -> Vec<Agent> {
    store.prune_discovered(grace, Utc::now())
}
