use serde_json::json;

use super::hooks::{self, HookEnv};
use super::Backend;
use crate::agent::{AgentId, AgentStatus};
use crate::error::HookError;
use crate::tmux::heuristics::{contains_any, is_done_line, strip_ansi, Rule, ScanLine, Scope};
use crate::tmux::StateInferenceEngine;

const WAITING_PHRASES: &[&str] = &[
    "approve",
    "deny",
    "allow",
    "yes/no",
    "y/n",
    "(y)es",
    "(n)o",
    "do you want to proceed",
    "shall i proceed",
    "should i proceed",
];

const IDLE_PHRASES: &[&str] = &[
    "type your message",
    "what would you like",
    "how can i help",
    "let me know what",
];

fn is_working(line: &ScanLine<'_>) -> bool {
    line.lower.contains("esc to cancel")
}

fn is_asking(line: &ScanLine<'_>) -> bool {
    contains_any(line.lower, WAITING_PHRASES)
}

fn is_at_prompt(line: &ScanLine<'_>) -> bool {
    contains_any(line.lower, IDLE_PHRASES)
}

// The "Type your message" box is always drawn, even after exit and while busy
static RULES: &[Rule] = &[
    Rule {
        status: AgentStatus::Done,
        scope: Scope::BottomLine,
        matches: is_done_line,
    },
    Rule {
        status: AgentStatus::Running,
        scope: Scope::Window,
        matches: is_working,
    },
    Rule {
        status: AgentStatus::Waiting,
        scope: Scope::Window,
        matches: is_asking,
    },
    Rule {
        status: AgentStatus::Idle,
        scope: Scope::Window,
        matches: is_at_prompt,
    },
];

static ENGINE: StateInferenceEngine = StateInferenceEngine::new(20, RULES);

const HOOK_SCRIPT: &str = "agent-deck-gemini-hook.sh";

const HOOK_EVENTS: &[&str] = &["BeforeAgent", "BeforeTool", "AfterAgent", "Notification", "SessionEnd"];

const HOOK_BODY: &str = r#"INPUT=$(cat)
EVENT=$(echo "$INPUT" | jq -r '.hook_event_name // empty')
STATE=""
case "$EVENT" in
  BeforeAgent|BeforeTool) STATE="RUNNING" ;;
  AfterAgent) STATE="IDLE" ;;
  Notification) STATE="WAITING" ;;
  SessionEnd) STATE="DONE" ;;
esac
"#;

/// Google Gemini CLI
pub struct GeminiBackend {
    hooks: HookEnv,
}

impl GeminiBackend {
    pub fn new(hooks: HookEnv) -> Self {
        Self { hooks }
    }
}

impl Backend for GeminiBackend {
    fn id(&self) -> &'static str {
        "gemini"
    }

    fn name(&self) -> &'static str {
        "Gemini"
    }

    fn binary(&self) -> &'static str {
        "gemini"
    }

    /// `-i` runs the prompt and stays interactive
    fn prompt_args(&self, prompt: &str) -> Vec<String> {
        vec!["-i".to_string(), prompt.to_string()]
    }

    fn detect_status(&self, content: &str) -> AgentStatus {
        ENGINE.analyze(content)
    }

    fn looks_like_me(&self, content: &str) -> bool {
        contains_any(&strip_ansi(content).to_lowercase(), &["gemini", "google"])
    }

    fn install_hooks(&self) -> Result<bool, HookError> {
        let script = self.hooks.script_path(HOOK_SCRIPT);
        let body = format!("{}{}{}", hooks::SCRIPT_PREAMBLE, HOOK_BODY, hooks::SCRIPT_WRITE);
        hooks::install_script(&script, &self.hooks.render(&body))?;

        let settings = self.hooks.user_home.join(".gemini").join("settings.json");
        hooks::register_json_hooks(&settings, &script, HOOK_EVENTS, |command| {
            json!({
                "matcher": "*",
                "hooks": [{ "name": "agent-deck", "type": "command", "command": command }]
            })
        })
    }

    fn read_hook_status(&self, id: AgentId) -> Option<AgentStatus> {
        self.hooks.status.read(id)
    }

    fn clean_hook_status(&self, id: AgentId) {
        self.hooks.status.clean(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Duration;

    use crate::backend::hooks::HookStatusDir;

    fn backend(dir: &Path) -> GeminiBackend {
        GeminiBackend::new(HookEnv {
            status: HookStatusDir::new(dir.join("status"), Duration::from_secs(30), Duration::from_secs(300)),
            session_prefix: "agentdeck_".into(),
            script_dir: dir.to_path_buf(),
            user_home: dir.join("home"),
        })
    }

    #[test]
    fn test_detect_status_table() {
        let dir = tempfile::tempdir().unwrap();
        let gemini = backend(dir.path());
        let cases = [
            ("⠏ Generating (esc to cancel, 4s)\n> Type your message", AgentStatus::Running),
            ("Apply this change?\n● Yes, allow once\n○ No", AgentStatus::Waiting),
            ("Here is the summary.\n> Type your message or @path/to/file", AgentStatus::Idle),
            ("Let me know what to do next", AgentStatus::Idle),
            ("> Type your message\nAgent powering down. Goodbye!", AgentStatus::Done),
            ("", AgentStatus::Running),
            ("reading README.md", AgentStatus::Running),
        ];
        for (pane, want) in cases {
            assert_eq!(gemini.detect_status(pane), want, "{:?}", pane);
        }
    }

    #[test]
    fn test_prompt_args() {
        let dir = tempfile::tempdir().unwrap();
        let gemini = backend(dir.path());
        assert_eq!(gemini.prompt_args("explain main.rs"), vec!["-i", "explain main.rs"]);
        assert_eq!(
            gemini.launch_command(&gemini.prompt_args("explain main.rs")).command,
            "gemini -i 'explain main.rs'"
        );
    }

    #[test]
    fn test_looks_like_me() {
        let dir = tempfile::tempdir().unwrap();
        let gemini = backend(dir.path());
        assert!(gemini.looks_like_me("Tips for getting started with Gemini CLI"));
        assert!(!gemini.looks_like_me("codex> "));
    }

    #[test]
    fn test_install_hooks_uses_matcher_entries() {
        let dir = tempfile::tempdir().unwrap();
        let gemini = backend(dir.path());

        assert!(gemini.install_hooks().unwrap());
        assert!(!gemini.install_hooks().unwrap());

        let raw = std::fs::read_to_string(dir.path().join("home/.gemini/settings.json")).unwrap();
        let settings: serde_json::Value = serde_json::from_str(&raw).unwrap();
        for event in HOOK_EVENTS {
            let entries = settings["hooks"][event].as_array().unwrap();
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0]["matcher"], "*");
        }
    }
}
