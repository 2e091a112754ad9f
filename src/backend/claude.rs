use serde_json::json;

use super::hooks::{self, HookEnv};
use super::Backend;
use crate::agent::{AgentId, AgentStatus};
use crate::error::HookError;
use crate::tmux::heuristics::{
    contains_any, has_dingbat, has_ellipsis, is_done_line, is_separator_line, is_shell_prompt,
    recent_lines, strip_ansi, Rule, ScanLine, Scope,
};
use crate::tmux::StateInferenceEngine;

const WAITING_PHRASES: &[&str] = &[
    "allow once",
    "allow always",
    "enter to select",
    "space to select",
    "yes/no/always allow",
    "do you want to proceed",
    "shall i proceed",
    "should i proceed",
    "approve",
    "deny",
    "reject",
    "(y)es",
    "(n)o",
    "y/n",
    "yes/no",
    "ctrl+g to edit",
];

const IDLE_PHRASES: &[&str] = &["? for shortcuts", "has completed", "anything else", "can i help"];

const SIGNATURES: &[&str] = &[
    "❯",
    "? for shortcuts",
    "esc to interrupt",
    "claude code",
    "anthropic",
    "allow once",
    "allow always",
];

fn is_working(line: &ScanLine<'_>) -> bool {
    line.lower.contains("esc to interrupt")
        || line.lower.contains("running…")
        || line.lower.contains("running...")
        // Spinner glyph next to "Thinking…"
        || (has_ellipsis(line.text) && has_dingbat(line.text))
}

fn is_asking(line: &ScanLine<'_>) -> bool {
    contains_any(line.lower, WAITING_PHRASES)
}

fn is_at_prompt(line: &ScanLine<'_>) -> bool {
    is_shell_prompt(line) || line.text.contains('❯') || contains_any(line.lower, IDLE_PHRASES)
}

// The input box stays on screen while Claude works, so RUNNING must be checked before IDLE
static RULES: &[Rule] = &[
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
    Rule {
        status: AgentStatus::Done,
        scope: Scope::BottomLine,
        matches: is_done_line,
    },
];

static ENGINE: StateInferenceEngine = StateInferenceEngine::new(15, RULES);

const HOOK_SCRIPT: &str = "agent-deck-claude-hook.sh";

const HOOK_EVENTS: &[&str] = &[
    "UserPromptSubmit",
    "PreToolUse",
    "Stop",
    "SessionEnd",
    "Notification",
];

const HOOK_BODY: &str = r#"INPUT=$(cat)
EVENT=$(echo "$INPUT" | jq -r '.hook_event_name // empty')
NTYPE=$(echo "$INPUT" | jq -r '.notification_type // empty')
STATE=""
case "$EVENT" in
  UserPromptSubmit|PreToolUse) STATE="RUNNING" ;;
  Stop) STATE="IDLE" ;;
  SessionEnd) STATE="DONE" ;;
  Notification)
    case "$NTYPE" in
      permission_prompt) STATE="WAITING" ;;
      idle_prompt) STATE="IDLE" ;;
    esac ;;
esac
"#;

/// Claude Code
pub struct ClaudeBackend {
    hooks: HookEnv,
}

impl ClaudeBackend {
    pub fn new(hooks: HookEnv) -> Self {
        Self { hooks }
    }
}

/// Cut everything from the separator above the last `❯` prompt downwards
fn strip_prompt_box(lines: Vec<&str>) -> Vec<&str> {
    let clean = |l: &str| strip_ansi(l).trim().to_string();
    let Some(prompt) = lines.iter().rposition(|l| clean(*l).starts_with('❯')) else {
        return lines;
    };
    let cut = lines[..prompt]
        .iter()
        .rposition(|l| is_separator_line(&clean(*l)))
        .unwrap_or(prompt);
    lines[..cut].to_vec()
}

/// Keep the selection UI but drop separators and the trailing hint line
fn strip_waiting_chrome(lines: Vec<&str>) -> Vec<&str> {
    let mut kept: Vec<&str> = lines
        .into_iter()
        .filter(|l| !is_separator_line(strip_ansi(l).trim()))
        .collect();
    if let Some(last) = kept.iter().rposition(|l| !strip_ansi(l).trim().is_empty()) {
        kept.remove(last);
    }
    kept
}

impl Backend for ClaudeBackend {
    fn id(&self) -> &'static str {
        "claude"
    }

    fn name(&self) -> &'static str {
        "Claude Code"
    }

    fn binary(&self) -> &'static str {
        "claude"
    }

    // Claude refuses to start inside another Claude session
    fn unset_env(&self) -> &'static [&'static str] {
        &["CLAUDECODE"]
    }

    fn resume_args(&self) -> Vec<String> {
        vec!["--continue".to_string()]
    }

    fn detect_status(&self, content: &str) -> AgentStatus {
        ENGINE.analyze(content)
    }

    fn detect_mode(&self, content: &str) -> Option<&'static str> {
        for line in recent_lines(content, 5) {
            let lower = line.to_lowercase();
            // "Exited plan mode" is history, not the current mode
            if lower.contains("exit") {
                continue;
            }
            if lower.contains("accept edits") || line.contains("⏵⏵") {
                return Some("EDITS");
            }
            if lower.contains("plan mode") || (line.contains('⏸') && lower.contains("plan")) {
                return Some("PLAN");
            }
        }
        None
    }

    fn strip_chrome<'a>(&self, lines: Vec<&'a str>, waiting: bool) -> Vec<&'a str> {
        if waiting {
            strip_waiting_chrome(lines)
        } else {
            strip_prompt_box(lines)
        }
    }

    fn looks_like_me(&self, content: &str) -> bool {
        contains_any(&strip_ansi(content).to_lowercase(), SIGNATURES)
    }

    fn install_hooks(&self) -> Result<bool, HookError> {
        let script = self.hooks.script_path(HOOK_SCRIPT);
        let body = format!("{}{}{}", hooks::SCRIPT_PREAMBLE, HOOK_BODY, hooks::SCRIPT_WRITE);
        hooks::install_script(&script, &self.hooks.render(&body))?;

        let settings = self.hooks.user_home.join(".claude").join("settings.json");
        hooks::register_json_hooks(&settings, &script, HOOK_EVENTS, |command| {
            json!({
                "hooks": [{ "type": "command", "command": command, "async": true }]
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

    fn backend(dir: &Path) -> ClaudeBackend {
        ClaudeBackend::new(HookEnv {
            status: HookStatusDir::new(dir.join("status"), Duration::from_secs(30), Duration::from_secs(300)),
            session_prefix: "agentdeck_".into(),
            script_dir: dir.to_path_buf(),
            user_home: dir.join("home"),
        })
    }

    #[test]
    fn test_detect_status_table() {
        let dir = tempfile::tempdir().unwrap();
        let claude = backend(dir.path());
        let cases = [
            ("Processing files...\nesc to interrupt", AgentStatus::Running),
            ("some output\n\u{2722} Thinking...", AgentStatus::Running),
            ("Tool output\nRunning...\n", AgentStatus::Running),
            ("Some output\nAllow once\nAllow always", AgentStatus::Waiting),
            ("Do something?\nyes/no", AgentStatus::Waiting),
            ("Done with task\n❯ ", AgentStatus::Idle),
            ("output\n? for shortcuts", AgentStatus::Idle),
            ("\x1b[38;5;208m❯\x1b[0m", AgentStatus::Idle),
            ("All done\nGoodbye!", AgentStatus::Done),
            ("work complete\nsession ended", AgentStatus::Done),
            ("", AgentStatus::Running),
            ("   \n   \n   ", AgentStatus::Running),
            ("compiling 40 crates", AgentStatus::Running),
        ];
        for (pane, want) in cases {
            assert_eq!(claude.detect_status(pane), want, "{:?}", pane);
        }
    }

    #[test]
    fn test_prompt_box_does_not_hide_work() {
        let dir = tempfile::tempdir().unwrap();
        let claude = backend(dir.path());
        let pane = "\u{2736} Reading files… (esc to interrupt)\n────────────\n❯ \n────────────\n? for shortcuts";
        assert_eq!(claude.detect_status(pane), AgentStatus::Running);
    }

    #[test]
    fn test_detect_mode() {
        let dir = tempfile::tempdir().unwrap();
        let claude = backend(dir.path());
        assert_eq!(claude.detect_mode("some output\naccept edits\nprompt"), Some("EDITS"));
        assert_eq!(claude.detect_mode("output\n⏵⏵ auto"), Some("EDITS"));
        assert_eq!(claude.detect_mode("output\nPlan Mode active\nprompt"), Some("PLAN"));
        assert_eq!(claude.detect_mode("output\n⏸ plan on"), Some("PLAN"));
        assert_eq!(claude.detect_mode("output\nExited Plan Mode\nprompt"), None);
        assert_eq!(claude.detect_mode("plain output"), None);
        // Outside the last five lines
        assert_eq!(claude.detect_mode("plan mode\n1\n2\n3\n4\n5"), None);
    }

    #[test]
    fn test_strip_prompt_box() {
        let dir = tempfile::tempdir().unwrap();
        let claude = backend(dir.path());
        let sep = "─".repeat(20);

        let lines = vec!["output", sep.as_str(), "❯ prompt", "status"];
        assert_eq!(claude.strip_chrome(lines, false), vec!["output"]);

        let no_separator = vec!["output", "more", "❯ prompt", "status"];
        assert_eq!(claude.strip_chrome(no_separator, false), vec!["output", "more"]);

        let no_prompt = vec!["line 1", "line 2", "line 3"];
        assert_eq!(claude.strip_chrome(no_prompt.clone(), false), no_prompt);
    }

    #[test]
    fn test_strip_waiting_chrome_keeps_choices() {
        let dir = tempfile::tempdir().unwrap();
        let claude = backend(dir.path());
        let sep = "─".repeat(20);
        let lines = vec!["Edit main.rs?", sep.as_str(), "❯ 1. Allow once", "2. Deny", "Esc to cancel", ""];
        assert_eq!(
            claude.strip_chrome(lines, true),
            vec!["Edit main.rs?", "❯ 1. Allow once", "2. Deny", ""]
        );
    }

    #[test]
    fn test_looks_like_me() {
        let dir = tempfile::tempdir().unwrap();
        let claude = backend(dir.path());
        assert!(claude.looks_like_me("some output\n❯ type here"));
        assert!(claude.looks_like_me("? for shortcuts\nprompt"));
        assert!(claude.looks_like_me("Welcome to Claude Code!"));
        assert!(claude.looks_like_me("output\n\x1b[38;5;208m❯\x1b[0m type here"));
        assert!(!claude.looks_like_me("$ ls -la\ntotal 0"));
        assert!(!claude.looks_like_me(""));
    }

    #[test]
    fn test_launch_and_resume() {
        let dir = tempfile::tempdir().unwrap();
        let claude = backend(dir.path());
        let launch = claude.launch_command(&[]);
        assert_eq!(launch.command, "claude");
        assert_eq!(launch.unset_env, vec!["CLAUDECODE"]);
        assert_eq!(claude.launch_command(&claude.resume_args()).command, "claude --continue");
    }

    #[test]
    fn test_install_hooks_registers_every_event_once() {
        let dir = tempfile::tempdir().unwrap();
        let claude = backend(dir.path());

        assert!(claude.install_hooks().unwrap());
        assert!(!claude.install_hooks().unwrap());

        let script = std::fs::read_to_string(dir.path().join(HOOK_SCRIPT)).unwrap();
        assert!(script.starts_with("#!/bin/bash"));
        assert!(script.contains("permission_prompt) STATE=\"WAITING\""));

        let raw = std::fs::read_to_string(dir.path().join("home/.claude/settings.json")).unwrap();
        let settings: serde_json::Value = serde_json::from_str(&raw).unwrap();
        for event in HOOK_EVENTS {
            let entries = settings["hooks"][event].as_array().unwrap();
            assert_eq!(entries.len(), 1, "{}", event);
            assert_eq!(entries[0]["hooks"][0]["async"], true);
        }
    }
}
