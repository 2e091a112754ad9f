mod client;
pub mod heuristics;
mod keepalive;
pub(crate) mod session;

pub use client::TmuxClient;
pub use heuristics::StateInferenceEngine;
pub use keepalive::{Attacher, KeepAlive, PtyAttacher};
pub use session::{LaunchSpec, TmuxSession};

use std::path::PathBuf;

/// One pane from `list-panes -a`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaneEntry {
    pub session_name: String,
    /// Current working directory of the pane
    pub path: PathBuf,
    /// Foreground command name
    pub command: String,
    /// Pid of the pane's initial process
    pub pid: Option<u32>,
}

/// Terminal dimensions in character cells
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub cols: u16,
    pub rows: u16,
}

impl Geometry {
    pub const fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}
