use anyhow::Result;
use chrono::Utc;
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph},
    Frame,
};

use crate::actions::Action;
use crate::agent::{AgentId, AgentStatus};
use crate::deck::AgentView;

/// Board colors
pub struct Theme {
    pub fg: Color,
    pub accent: Color,
    pub dim: Color,
    pub success: Color,
    pub warning: Color,
    pub error: Color,
}

impl Default for Theme {
    fn default() -> Self {
        Self {
            fg: Color::Rgb(220, 220, 220),
            accent: Color::Rgb(217, 119, 87),
            dim: Color::Rgb(100, 100, 100),
            success: Color::Rgb(80, 200, 120),
            warning: Color::Rgb(255, 193, 7),
            error: Color::Rgb(220, 53, 69),
        }
    }
}

impl Theme {
    fn status_color(&self, status: AgentStatus) -> Color {
        match status {
            AgentStatus::Running => self.warning,
            AgentStatus::Waiting => self.accent,
            AgentStatus::Idle => self.success,
            AgentStatus::Done => self.dim,
        }
    }
}

fn status_glyph(status: AgentStatus) -> &'static str {
    match status {
        AgentStatus::Running => "● ",
        AgentStatus::Waiting => "? ",
        AgentStatus::Idle => "○ ",
        AgentStatus::Done => "✓ ",
    }
}

/// Input mode for the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputMode {
    Normal,
    /// Typing a directory for a new agent
    Spawning,
    /// Typing text for the selected agent
    Sending,
    /// Confirming a kill
    Confirming,
}

/// Footer message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub text: String,
    pub is_error: bool,
}

/// Main application state
pub struct App {
    pub agents: Vec<AgentView>,
    pub list_state: ListState,
    pub notice: Option<Notice>,
    pub theme: Theme,
    pub input_mode: InputMode,
    pub input_buffer: String,
    /// Prefilled into the spawn dialog
    pub spawn_root: String,
    pub pending_actions: Vec<Action>,
}

impl App {
    pub fn new() -> Self {
        let mut list_state = ListState::default();
        list_state.select(Some(0));

        Self {
            agents: Vec::new(),
            list_state,
            notice: None,
            theme: Theme::default(),
            input_mode: InputMode::Normal,
            input_buffer: String::new(),
            spawn_root: String::new(),
            pending_actions: Vec::new(),
        }
    }

    pub fn selected_agent(&self) -> Option<&AgentView> {
        self.list_state.selected().and_then(|i| self.agents.get(i))
    }

    fn selected_id(&self) -> Option<AgentId> {
        self.selected_agent().map(|view| view.agent.id)
    }

    /// Take pending actions (drains the queue)
    pub fn take_pending_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.pending_actions)
    }

    pub fn info(&mut self, text: impl Into<String>) {
        self.notice = Some(Notice {
            text: text.into(),
            is_error: false,
        });
    }

    pub fn error(&mut self, text: impl Into<String>) {
        self.notice = Some(Notice {
            text: text.into(),
            is_error: true,
        });
    }

    /// Handle an action and return whether to quit
    pub fn handle_action(&mut self, action: Action) -> Result<bool> {
        match action {
            Action::KeyPress(key) => self.handle_key(key),
            Action::AgentsUpdated(agents) => {
                self.set_agents(agents);
                Ok(false)
            }
            Action::Status(msg) => {
                self.info(msg);
                Ok(false)
            }
            Action::Error(msg) => {
                self.error(msg);
                Ok(false)
            }
            _ => Ok(false),
        }
    }

    /// Replace the snapshot, keeping the cursor on the same agent when it survives
    fn set_agents(&mut self, agents: Vec<AgentView>) {
        let keep = self.selected_id();
        self.agents = agents;
        let index = keep
            .and_then(|id| self.agents.iter().position(|v| v.agent.id == id))
            .or_else(|| {
                self.list_state
                    .selected()
                    .map(|i| i.min(self.agents.len().saturating_sub(1)))
            })
            .unwrap_or(0);
        self.list_state.select(Some(index));
    }

    fn handle_key(&mut self, key: KeyEvent) -> Result<bool> {
        if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
            return Ok(true);
        }
        if self.notice.is_some() && self.input_mode == InputMode::Normal {
            self.notice = None;
        }

        match self.input_mode {
            InputMode::Normal => self.handle_normal_key(key),
            InputMode::Spawning | InputMode::Sending => {
                self.handle_text_key(key);
                Ok(false)
            }
            InputMode::Confirming => {
                self.handle_confirming_key(key);
                Ok(false)
            }
        }
    }

    fn handle_normal_key(&mut self, key: KeyEvent) -> Result<bool> {
        match key.code {
            KeyCode::Char('q') => return Ok(true),
            KeyCode::Char('j') | KeyCode::Down => self.next_agent(),
            KeyCode::Char('k') | KeyCode::Up => self.previous_agent(),
            KeyCode::Enter => {
                if let Some(id) = self.selected_id() {
                    self.pending_actions.push(Action::AttachAgent(id));
                }
            }
            KeyCode::Char('n') => {
                self.input_mode = InputMode::Spawning;
                self.input_buffer = self.spawn_root.clone();
            }
            KeyCode::Char('s') => {
                if self.selected_agent().is_some() {
                    self.input_mode = InputMode::Sending;
                    self.input_buffer.clear();
                }
            }
            KeyCode::Char('d') => {
                if self.selected_agent().is_some() {
                    self.input_mode = InputMode::Confirming;
                }
            }
            KeyCode::Char('r') => {
                if let Some(id) = self.selected_id() {
                    self.pending_actions.push(Action::ResumeAgent(id));
                }
            }
            KeyCode::Char('D') => self.pending_actions.push(Action::Discover),
            KeyCode::Char('c') => self.pending_actions.push(Action::ClearDone),
            _ => {}
        }
        Ok(false)
    }

    fn handle_text_key(&mut self, key: KeyEvent) {
        match key.code {
            KeyCode::Enter => {
                let text = std::mem::take(&mut self.input_buffer);
                if !text.trim().is_empty() {
                    let action = match self.input_mode {
                        InputMode::Spawning => Some(Action::SpawnAgent(text)),
                        _ => self.selected_id().map(|id| Action::SendKeys(id, text)),
                    };
                    self.pending_actions.extend(action);
                }
                self.input_mode = InputMode::Normal;
            }
            KeyCode::Esc => {
                self.input_buffer.clear();
                self.input_mode = InputMode::Normal;
            }
            KeyCode::Char(c) => self.input_buffer.push(c),
            KeyCode::Backspace => {
                self.input_buffer.pop();
            }
            _ => {}
        }
    }

    fn handle_confirming_key(&mut self, key: KeyEvent) {
        match key.code {
            KeyCode::Char('y') | KeyCode::Char('Y') => {
                if let Some(id) = self.selected_id() {
                    self.pending_actions.push(Action::KillAgent(id));
                }
                self.input_mode = InputMode::Normal;
            }
            KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => {
                self.input_mode = InputMode::Normal;
            }
            _ => {}
        }
    }

    fn next_agent(&mut self) {
        if self.agents.is_empty() {
            return;
        }
        let i = match self.list_state.selected() {
            Some(i) if i + 1 < self.agents.len() => i + 1,
            _ => 0,
        };
        self.list_state.select(Some(i));
    }

    fn previous_agent(&mut self) {
        if self.agents.is_empty() {
            return;
        }
        let i = match self.list_state.selected() {
            Some(0) | None => self.agents.len() - 1,
            Some(i) => i - 1,
        };
        self.list_state.select(Some(i));
    }

    pub fn render(&mut self, frame: &mut Frame) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(3), // Header
                Constraint::Min(0),    // Main content
                Constraint::Length(3), // Footer/status
            ])
            .split(frame.area());

        self.render_header(frame, chunks[0]);
        self.render_main(frame, chunks[1]);
        self.render_footer(frame, chunks[2]);

        match self.input_mode {
            InputMode::Spawning => self.render_input_dialog(
                frame,
                " Spawn Agent ",
                "Project directory:",
                "Press Enter to spawn, Esc to cancel",
            ),
            InputMode::Sending => self.render_input_dialog(
                frame,
                " Send to Agent ",
                "Text to type:",
                "Press Enter to send, Esc to cancel",
            ),
            InputMode::Confirming => self.render_confirm_dialog(frame),
            InputMode::Normal => {}
        }
    }

    fn render_header(&self, frame: &mut Frame, area: Rect) {
        let count = |status: AgentStatus| self.agents.iter().filter(|v| v.agent.status == status).count();
        let mut spans = vec![
            Span::styled(
                " agent-deck ",
                Style::default().fg(self.theme.accent).add_modifier(Modifier::BOLD),
            ),
            Span::styled("│ ", Style::default().fg(self.theme.dim)),
        ];
        for status in [
            AgentStatus::Running,
            AgentStatus::Waiting,
            AgentStatus::Idle,
            AgentStatus::Done,
        ] {
            spans.push(Span::styled(
                format!("{}{} ", status_glyph(status), count(status)),
                Style::default().fg(self.theme.status_color(status)),
            ));
        }

        let title = Paragraph::new(Line::from(spans)).block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(self.theme.dim)),
        );
        frame.render_widget(title, area);
    }

    fn render_main(&mut self, frame: &mut Frame, area: Rect) {
        let chunks = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([
                Constraint::Percentage(40), // Agent list
                Constraint::Percentage(60), // Detail pane
            ])
            .split(area);

        self.render_agent_list(frame, chunks[0]);
        self.render_detail_pane(frame, chunks[1]);
    }

    fn render_agent_list(&mut self, frame: &mut Frame, area: Rect) {
        let items: Vec<ListItem> = if self.agents.is_empty() {
            vec![ListItem::new(Line::from(Span::styled(
                "  No agents. Press 'n' to spawn one.",
                Style::default().fg(self.theme.dim),
            )))]
        } else {
            self.agents
                .iter()
                .map(|view| {
                    let agent = &view.agent;
                    let mut spans = vec![
                        Span::styled(
                            status_glyph(agent.status),
                            Style::default().fg(self.theme.status_color(agent.status)),
                        ),
                        Span::styled(agent.name.clone(), Style::default().fg(self.theme.fg)),
                        Span::styled(format!(" [{}]", agent.backend), Style::default().fg(self.theme.dim)),
                    ];
                    if agent.discovered {
                        spans.push(Span::styled(" ⌕", Style::default().fg(self.theme.dim)));
                    }
                    ListItem::new(Line::from(spans))
                })
                .collect()
        };

        let list = List::new(items)
            .block(
                Block::default()
                    .title(" Agents ")
                    .borders(Borders::ALL)
                    .border_style(Style::default().fg(self.theme.dim)),
            )
            .highlight_style(
                Style::default()
                    .bg(Color::Rgb(50, 50, 50))
                    .add_modifier(Modifier::BOLD),
            )
            .highlight_symbol("▶ ");

        frame.render_stateful_widget(list, area, &mut self.list_state);
    }

    fn field<'a>(&self, label: &'a str, value: String) -> Line<'a> {
        Line::from(vec![
            Span::styled(label, Style::default().fg(self.theme.dim)),
            Span::styled(value, Style::default().fg(self.theme.fg)),
        ])
    }

    fn render_detail_pane(&self, frame: &mut Frame, area: Rect) {
        let content = if let Some(view) = self.selected_agent() {
            let agent = &view.agent;
            let since = (Utc::now() - agent.status_since).num_seconds().max(0);
            let mut lines = vec![
                self.field("Name: ", agent.name.clone()),
                self.field("ID: ", agent.id.to_string()),
                self.field("Backend: ", agent.backend.clone()),
                self.field("Dir: ", agent.dir.display().to_string()),
                Line::from(vec![
                    Span::styled("Status: ", Style::default().fg(self.theme.dim)),
                    Span::styled(
                        agent.status.to_string(),
                        Style::default().fg(self.theme.status_color(agent.status)),
                    ),
                    Span::styled(format!(" for {}s", since), Style::default().fg(self.theme.dim)),
                ]),
                self.field(
                    "Session: ",
                    if agent.has_session() {
                        agent.session_name.clone()
                    } else {
                        "-".into()
                    },
                ),
            ];
            if agent.discovered {
                lines.push(self.field("Origin: ", "discovered".into()));
            }
            if let Some(mode) = view.mode {
                lines.push(Line::from(vec![
                    Span::styled("Mode: ", Style::default().fg(self.theme.dim)),
                    Span::styled(mode, Style::default().fg(self.theme.accent)),
                ]));
            }
            lines.push(Line::from(""));
            lines.extend(
                view.preview
                    .iter()
                    .map(|l| Line::from(Span::styled(l.clone(), Style::default().fg(self.theme.fg)))),
            );
            lines
        } else {
            vec![
                Line::from(Span::styled("No agent selected", Style::default().fg(self.theme.dim))),
                Line::from(""),
                Line::from(Span::styled(
                    "Press 'n' to spawn an agent, 'D' to discover running ones",
                    Style::default().fg(self.theme.dim),
                )),
            ]
        };

        let detail = Paragraph::new(content).block(
            Block::default()
                .title(" Details ")
                .borders(Borders::ALL)
                .border_style(Style::default().fg(self.theme.dim)),
        );
        frame.render_widget(detail, area);
    }

    fn render_footer(&self, frame: &mut Frame, area: Rect) {
        let help_text =
            " q: Quit │ j/k: Navigate │ Enter: Attach │ n: New │ s: Send │ r: Resume │ d: Kill │ D: Discover │ c: Clear done ";

        let content = match &self.notice {
            Some(notice) => {
                let color = if notice.is_error {
                    self.theme.error
                } else {
                    self.theme.success
                };
                Line::from(Span::styled(format!(" {} ", notice.text), Style::default().fg(color)))
            }
            None => Line::from(Span::styled(help_text, Style::default().fg(self.theme.dim))),
        };

        let footer = Paragraph::new(content).block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(self.theme.dim)),
        );
        frame.render_widget(footer, area);
    }

    fn render_input_dialog(&self, frame: &mut Frame, title: &str, prompt: &str, hint: &str) {
        let area = centered_rect(60, 20, frame.area());
        frame.render_widget(Clear, area);

        let block = Block::default()
            .title(title)
            .borders(Borders::ALL)
            .border_style(Style::default().fg(self.theme.accent));
        let inner = block.inner(area);
        frame.render_widget(block, area);

        let text = vec![
            Line::from(""),
            Line::from(Span::styled(prompt, Style::default().fg(self.theme.fg))),
            Line::from(""),
            Line::from(Span::styled(
                format!("▶ {}_", self.input_buffer),
                Style::default().fg(self.theme.accent).add_modifier(Modifier::BOLD),
            )),
            Line::from(""),
            Line::from(Span::styled(hint, Style::default().fg(self.theme.dim))),
        ];
        frame.render_widget(Paragraph::new(text), inner);
    }

    fn render_confirm_dialog(&self, frame: &mut Frame) {
        let area = centered_rect(50, 20, frame.area());
        frame.render_widget(Clear, area);

        let block = Block::default()
            .title(" Confirm Kill ")
            .borders(Borders::ALL)
            .border_style(Style::default().fg(self.theme.error));
        let inner = block.inner(area);
        frame.render_widget(block, area);

        let name = self
            .selected_agent()
            .map(|v| v.agent.name.as_str())
            .unwrap_or("unknown");

        let text = vec![
            Line::from(""),
            Line::from(Span::styled(
                format!("Kill agent '{}'?", name),
                Style::default().fg(self.theme.fg),
            )),
            Line::from(""),
            Line::from(Span::styled(
                "Its tmux session will be terminated.",
                Style::default().fg(self.theme.warning),
            )),
            Line::from(""),
            Line::from(Span::styled(
                "Press 'y' to confirm, 'n' or Esc to cancel",
                Style::default().fg(self.theme.dim),
            )),
        ];
        frame.render_widget(Paragraph::new(text), inner);
    }
}

/// Helper function to create a centered rectangle
fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use crate::agent::Agent;

    fn view(id: u64, name: &str) -> AgentView {
        AgentView {
            agent: Agent {
                id: AgentId(id),
                name: name.into(),
                dir: PathBuf::from("/tmp"),
                status: AgentStatus::Running,
                created_at: Utc::now(),
                status_since: Utc::now(),
                session_name: format!("agentdeck_{}", id),
                discovered: false,
                backend: "claude".into(),
            },
            preview: Vec::new(),
            mode: None,
        }
    }

    fn press(app: &mut App, code: KeyCode) -> bool {
        app.handle_action(Action::KeyPress(KeyEvent::new(code, KeyModifiers::NONE)))
            .unwrap()
    }

    fn app_with(names: &[&str]) -> App {
        let mut app = App::new();
        let views = names
            .iter()
            .enumerate()
            .map(|(i, n)| view(i as u64 + 1, n))
            .collect();
        app.handle_action(Action::AgentsUpdated(views)).unwrap();
        app
    }

    #[test]
    fn test_navigation_wraps() {
        let mut app = app_with(&["a", "b", "c"]);
        press(&mut app, KeyCode::Char('k'));
        assert_eq!(app.selected_agent().unwrap().agent.name, "c");
        press(&mut app, KeyCode::Char('j'));
        assert_eq!(app.selected_agent().unwrap().agent.name, "a");
    }

    #[test]
    fn test_selection_follows_agent_across_updates() {
        let mut app = app_with(&["a", "b", "c"]);
        press(&mut app, KeyCode::Down);
        assert_eq!(app.selected_id(), Some(AgentId(2)));

        // Agent 1 went away; the cursor stays on agent 2
        app.handle_action(Action::AgentsUpdated(vec![view(2, "b"), view(3, "c")]))
            .unwrap();
        assert_eq!(app.selected_id(), Some(AgentId(2)));

        app.handle_action(Action::AgentsUpdated(vec![view(3, "c")])).unwrap();
        assert_eq!(app.selected_id(), Some(AgentId(3)));
    }

    #[test]
    fn test_kill_needs_confirmation() {
        let mut app = app_with(&["a"]);
        press(&mut app, KeyCode::Char('d'));
        assert_eq!(app.input_mode, InputMode::Confirming);
        press(&mut app, KeyCode::Esc);
        assert!(app.take_pending_actions().is_empty());

        press(&mut app, KeyCode::Char('d'));
        press(&mut app, KeyCode::Char('y'));
        let actions = app.take_pending_actions();
        assert!(matches!(actions.as_slice(), [Action::KillAgent(AgentId(1))]));
        assert_eq!(app.input_mode, InputMode::Normal);
    }

    #[test]
    fn test_spawn_dialog_collects_path() {
        let mut app = App::new();
        app.spawn_root = "~/src/".into();
        press(&mut app, KeyCode::Char('n'));
        assert_eq!(app.input_buffer, "~/src/");
        for c in "api".chars() {
            press(&mut app, KeyCode::Char(c));
        }
        // 'q' is text here, not quit
        assert!(!press(&mut app, KeyCode::Char('q')));
        press(&mut app, KeyCode::Backspace);
        press(&mut app, KeyCode::Enter);

        let actions = app.take_pending_actions();
        assert!(matches!(actions.as_slice(), [Action::SpawnAgent(dir)] if dir == "~/src/api"));
    }

    #[test]
    fn test_send_targets_selected_agent() {
        let mut app = app_with(&["a", "b"]);
        press(&mut app, KeyCode::Down);
        press(&mut app, KeyCode::Char('s'));
        for c in "yes".chars() {
            press(&mut app, KeyCode::Char(c));
        }
        press(&mut app, KeyCode::Enter);
        let actions = app.take_pending_actions();
        assert!(matches!(actions.as_slice(), [Action::SendKeys(AgentId(2), text)] if text == "yes"));
    }

    #[test]
    fn test_empty_board_ignores_agent_keys() {
        let mut app = App::new();
        for code in [KeyCode::Enter, KeyCode::Char('s'), KeyCode::Char('d'), KeyCode::Char('r')] {
            press(&mut app, code);
        }
        assert_eq!(app.input_mode, InputMode::Normal);
        assert!(app.take_pending_actions().is_empty());

        press(&mut app, KeyCode::Char('D'));
        press(&mut app, KeyCode::Char('c'));
        assert_eq!(app.take_pending_actions().len(), 2);
        assert!(press(&mut app, KeyCode::Char('q')));
    }
}
