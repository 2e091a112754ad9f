use crossterm::event::KeyEvent;

use crate::agent::AgentId;
use crate::deck::AgentView;

/// Actions that can be dispatched through the application
#[derive(Debug, Clone)]
pub enum Action {
    /// A key was pressed
    KeyPress(KeyEvent),
    /// Fresh agent snapshot from the poller
    AgentsUpdated(Vec<AgentView>),
    /// One-line message for the footer
    Status(String),
    /// A failed operator action, shown in the footer
    Error(String),
    /// Hand the terminal to an agent's session
    AttachAgent(AgentId),
    /// Spawn an agent in a directory
    SpawnAgent(String),
    /// Type text into an agent's session
    SendKeys(AgentId, String),
    KillAgent(AgentId),
    ResumeAgent(AgentId),
    /// Run a discovery pass now
    Discover,
    /// Forget finished agents
    ClearDone,
}
