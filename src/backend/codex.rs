use super::hooks::{self, HookEnv};
use super::Backend;
use crate::agent::{AgentId, AgentStatus};
use crate::error::HookError;
use crate::tmux::heuristics::{contains_any, is_done_line, is_shell_prompt, strip_ansi, Rule, ScanLine, Scope};
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
    "permission",
    "/permissions",
];

const IDLE_PHRASES: &[&str] = &["tokens used", "what would you like", "how can i help"];

fn is_working(line: &ScanLine<'_>) -> bool {
    line.lower.contains("esc to interrupt")
}

fn is_asking(line: &ScanLine<'_>) -> bool {
    contains_any(line.lower, WAITING_PHRASES)
}

fn is_at_prompt(line: &ScanLine<'_>) -> bool {
    is_shell_prompt(line) || contains_any(line.lower, IDLE_PHRASES)
}

// The "tokens used" status bar survives exit, so the bottom line is checked for DONE first
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

const NOTIFY_SCRIPT: &str = "agent-deck-codex-notify.sh";

// Codex passes the event as a JSON argument rather than on stdin
const NOTIFY_BODY: &str = r#"EVENT_TYPE=$(echo "${1:-}" | jq -r '.type // empty')
STATE=""
case "$EVENT_TYPE" in
  agent-turn-complete) STATE="IDLE" ;;
esac
"#;

/// OpenAI Codex CLI
pub struct CodexBackend {
    hooks: HookEnv,
}

impl CodexBackend {
    pub fn new(hooks: HookEnv) -> Self {
        Self { hooks }
    }
}

impl Backend for CodexBackend {
    fn id(&self) -> &'static str {
        "codex"
    }

    fn name(&self) -> &'static str {
        "Codex"
    }

    fn binary(&self) -> &'static str {
        "codex"
    }

    fn detect_status(&self, content: &str) -> AgentStatus {
        ENGINE.analyze(content)
    }

    fn looks_like_me(&self, content: &str) -> bool {
        contains_any(&strip_ansi(content).to_lowercase(), &["codex", "openai"])
    }

    fn install_hooks(&self) -> Result<bool, HookError> {
        let script = self.hooks.script_path(NOTIFY_SCRIPT);
        let body = format!("{}{}{}", hooks::SCRIPT_PREAMBLE, NOTIFY_BODY, hooks::SCRIPT_WRITE);
        hooks::install_script(&script, &self.hooks.render(&body))?;

        let config = self.hooks.user_home.join(".codex").join("config.toml");
        hooks::register_toml_notify(&config, &script)
    }

    fn read_hook_status(&self, id: AgentId) -> Option<AgentStatus> {
        self.hooks.status.read(id)
    }

    fn clean_hook_status(&self, id: AgentId) {
        self.hooks.status.clean(id)
    }
}
