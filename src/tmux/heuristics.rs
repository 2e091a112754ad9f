use once_cell::sync::Lazy;
use regex::Regex;

use crate::agent::AgentStatus;

/// CSI and OSC escape sequences as emitted by `capture-pane -e`
static RE_ANSI: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[a-zA-Z]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)").expect("valid ANSI regex")
});

/// Remove terminal escape sequences from captured pane text
pub fn strip_ansi(s: &str) -> String {
    RE_ANSI.replace_all(s, "").into_owned()
}

/// True if the string contains a Unicode Dingbat (U+2700..U+27BF), the range
/// Claude Code rotates through for its spinner
pub fn has_dingbat(s: &str) -> bool {
    s.chars().any(|c| ('\u{2700}'..='\u{27BF}').contains(&c))
}

/// True if the string contains an ellipsis, typographic or ASCII
pub fn has_ellipsis(s: &str) -> bool {
    s.contains('…') || s.contains("...")
}

/// True for a horizontal rule made only of `─` or `-` (at least 10 bytes long)
pub fn is_separator_line(s: &str) -> bool {
    s.len() >= 10 && s.chars().all(|c| c == '─' || c == '-')
}

/// True if `haystack` contains any of `needles`
pub fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// The last `n` non-blank lines, ANSI-stripped and trimmed, bottommost first
pub fn recent_lines(content: &str, n: usize) -> Vec<String> {
    content
        .lines()
        .rev()
        .map(|line| strip_ansi(line).trim().to_string())
        .filter(|line| !line.is_empty())
        .take(n)
        .collect()
}

/// A single scanned line, with its lowercase form precomputed
pub struct ScanLine<'a> {
    pub text: &'a str,
    pub lower: &'a str,
}

/// Which lines of the scan window a rule is evaluated against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Any line of the window
    Window,
    /// Only the bottommost non-blank line
    BottomLine,
}

/// One (predicate, status) pair of the classification state machine
pub struct Rule {
    pub status: AgentStatus,
    pub scope: Scope,
    pub matches: fn(&ScanLine<'_>) -> bool,
}

/// Engine for inferring agent status from pane content.
///
/// Rules are evaluated in order; the first one that matches decides the status.
/// An empty pane, or one no rule recognises, is RUNNING.
pub struct StateInferenceEngine {
    window: usize,
    rules: &'static [Rule],
}

impl StateInferenceEngine {
    pub const fn new(window: usize, rules: &'static [Rule]) -> Self {
        Self { window, rules }
    }

    /// Analyze pane content and determine agent status
    pub fn analyze(&self, content: &str) -> AgentStatus {
        let recent = recent_lines(content, self.window);
        let lowered: Vec<String> = recent.iter().map(|l| l.to_lowercase()).collect();
        let lines: Vec<ScanLine<'_>> = recent
            .iter()
            .zip(&lowered)
            .map(|(text, lower)| ScanLine { text, lower })
            .collect();

        let Some(bottom) = lines.first() else {
            return AgentStatus::Running;
        };

        for rule in self.rules {
            let hit = match rule.scope {
                Scope::Window => lines.iter().any(rule.matches),
                Scope::BottomLine => (rule.matches)(bottom),
            };
            if hit {
                return rule.status;
            }
        }

        AgentStatus::Running
    }
}

/// Termination phrases shared by every backend
pub const DONE_PHRASES: &[&str] = &["exited", "goodbye", "session ended", "bye"];

pub fn is_done_line(line: &ScanLine<'_>) -> bool {
    contains_any(line.lower, DONE_PHRASES)
}

/// A bare shell-style prompt
pub fn is_shell_prompt(line: &ScanLine<'_>) -> bool {
    line.text == ">" || line.text == "$"
}

/// Keep the last `n` meaningful lines: ANSI-stripped, trimmed, longer than two chars
pub fn preview_lines<'a>(lines: impl DoubleEndedIterator<Item = &'a str>, n: usize) -> Vec<String> {
    let mut out: Vec<String> = lines
        .rev()
        .map(|line| strip_ansi(line).trim().to_string())
        .filter(|line| line.chars().count() > 2)
        .take(n)
        .collect();
    out.reverse();
    out
}
