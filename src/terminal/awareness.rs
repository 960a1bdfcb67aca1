//! Terminal state awareness.
//!
//! Classifies the terminal's current state from a snapshot of its recent
//! output. The classifier is deliberately conservative: when prompt
//! detection is unreliable (SSH sessions across unknown shells) it reports
//! `Running` and lets the engine lean on `check_terminal_status` instead of
//! assuming idleness.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::ShellKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalActivity {
    Idle,
    Running,
    WaitingInput,
    MayBeStuck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    Password,
    Confirmation,
    Selection,
    Pager,
    Editor,
    Prompt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Progress,
    Compilation,
    Test,
    LogStream,
    Error,
    Table,
}

/// Snapshot classification of a terminal.
///
/// Invariant: `activity == WaitingInput` implies `input_kind.is_some()`;
/// the classifier only produces the two together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalState {
    pub activity: TerminalActivity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_kind: Option<InputKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_kind: Option<OutputKind>,
    pub last_output_age_ms: u64,
    pub line_count: usize,
}

impl TerminalState {
    pub fn is_idle(&self) -> bool {
        self.activity == TerminalActivity::Idle
    }

    /// Whether a new command can be written without racing a foreground
    /// process. Waiting-for-input counts: the agent may be answering a
    /// prompt deliberately via send_input.
    pub fn can_execute(&self) -> bool {
        matches!(
            self.activity,
            TerminalActivity::Idle | TerminalActivity::WaitingInput
        )
    }
}

// Shell prompt on the last non-empty line means the terminal is idle.
static PROMPT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"^\[[^\]\n]+@[^\]\n]+[^\]]*\][$#]\s*$", // [user@host dir]$
        r"[^$#>]*[$#]\s*$",                      // generic sh/bash/zsh prompt
        r"^(?:PS\s)?[A-Za-z]:\\[^>]*>\s*$",      // cmd.exe / powershell
    ]
    .iter()
    .map(|p| Regex::new(p).expect("prompt pattern"))
    .collect()
});

static PASSWORD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password\s*(for\s+\S+)?\s*:\s*$|passphrase\b.*:\s*$)").expect("password")
});
static CONFIRM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\[y/n\]|\[y/N\]|\[Y/n\]|\(yes/no\)|\(y/n\)|continue\?)\s*:?\s*$")
        .expect("confirm")
});
static SELECTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*\d+[).]\s+\S+").expect("selection"));
static SELECTION_TAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(select|choose|enter\s+(a\s+)?number|选择).*:?\s*$").expect("selection tail")
});
static PAGER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(--More--|\(END\)|^:\s*$|lines \d+-\d+)").expect("pager"));
static EDITOR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(-- INSERT --|-- VISUAL --|"[^"]*" \d+L, \d+[BC]|\^G Get Help|GNU nano)"#)
        .expect("editor")
});

static PROGRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\[[=#>\-\s]+\]\s*\d{1,3}%|\d{1,3}%\s*(\||\])|eta\s+[\d:]+|ETA[:\s]+[\d:]+)")
        .expect("progress")
});
static COMPILATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(^|\s)(Compiling\s|warning:|error(\[\w+\])?:|cc1:|ld:|make\[\d+\]:)")
        .expect("compilation")
});
static TEST_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\bPASS(ED)?\b|\bFAIL(ED)?\b|\bok\b\s+\d+|\d+ passed|\d+ failed|running \d+ tests)")
        .expect("test")
});
static TIMESTAMP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*\[?\d{4}[-/]\d{2}[-/]\d{2}[T ]\d{2}:\d{2}:\d{2}").expect("timestamp")
});
static ERROR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\berror\b|\bfailed\b|\bfatal\b|panic|traceback|exception)").expect("error")
});

static ANSI_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b(\[[0-9;?]*[ -/]*[@-~]|\][^\x07\x1b]*(\x07|\x1b\\)|[@-Z\\-_])").expect("ansi")
});

/// Remove ANSI escape sequences so pattern matching sees plain text.
pub fn strip_ansi(line: &str) -> String {
    ANSI_RE.replace_all(line, "").to_string()
}

/// Classify a snapshot of the terminal's trailing output.
///
/// `snapshot` is the last N visible lines, oldest first. `age` is the time
/// since the terminal last produced output.
pub fn classify(
    snapshot: &[String],
    shell: ShellKind,
    age: Duration,
    stuck_after: Duration,
) -> TerminalState {
    let lines: Vec<String> = snapshot.iter().map(|l| strip_ansi(l)).collect();
    let line_count = lines.len();
    let age_ms = age.as_millis() as u64;

    let state = |activity, input_kind, output_kind| TerminalState {
        activity,
        input_kind,
        output_kind,
        last_output_age_ms: age_ms,
        line_count,
    };

    let last = lines
        .iter()
        .rev()
        .find(|l| !l.trim().is_empty())
        .map(|s| s.as_str())
        .unwrap_or("");

    // 1. Input requests take precedence over prompt detection: a sudo
    // password line also ends with ':' but is not an idle shell.
    if PASSWORD_RE.is_match(last) {
        return state(TerminalActivity::WaitingInput, Some(InputKind::Password), None);
    }
    if CONFIRM_RE.is_match(last) {
        return state(
            TerminalActivity::WaitingInput,
            Some(InputKind::Confirmation),
            None,
        );
    }
    if PAGER_RE.is_match(last) {
        return state(TerminalActivity::WaitingInput, Some(InputKind::Pager), None);
    }
    let tail = lines.iter().rev().take(12).cloned().collect::<Vec<_>>().join("\n");
    if EDITOR_RE.is_match(&tail) {
        return state(TerminalActivity::WaitingInput, Some(InputKind::Editor), None);
    }
    if SELECTION_TAIL_RE.is_match(last) && SELECTION_RE.is_match(&tail) {
        return state(
            TerminalActivity::WaitingInput,
            Some(InputKind::Selection),
            None,
        );
    }

    // 2. Shell prompt on the last line. SSH sessions skip this: prompt
    // shapes across remote shells are too varied to trust.
    if shell != ShellKind::Ssh {
        if last.trim() == ">" {
            return state(TerminalActivity::WaitingInput, Some(InputKind::Prompt), None);
        }
        if PROMPT_PATTERNS.iter().any(|re| re.is_match(last)) {
            return state(TerminalActivity::Idle, None, None);
        }
    }

    // 3. Output shape of the recent tail.
    let recent: Vec<&String> = lines.iter().rev().take(10).collect();
    let output_kind = detect_output_kind(&recent, &tail);

    // 4. Silence beyond the threshold with no prompt means possibly stuck.
    if age >= stuck_after {
        return state(TerminalActivity::MayBeStuck, None, output_kind);
    }

    state(TerminalActivity::Running, None, output_kind)
}

fn detect_output_kind(recent: &[&String], tail: &str) -> Option<OutputKind> {
    if recent.iter().any(|l| PROGRESS_RE.is_match(l)) {
        return Some(OutputKind::Progress);
    }
    if recent.iter().any(|l| COMPILATION_RE.is_match(l)) {
        return Some(OutputKind::Compilation);
    }
    if recent.iter().any(|l| TEST_RE.is_match(l)) {
        return Some(OutputKind::Test);
    }
    let timestamped = recent.iter().filter(|l| TIMESTAMP_RE.is_match(l)).count();
    if timestamped >= 3 {
        return Some(OutputKind::LogStream);
    }
    if is_table(recent) {
        return Some(OutputKind::Table);
    }
    if ERROR_RE.is_match(tail) {
        return Some(OutputKind::Error);
    }
    None
}

/// Column-aligned multi-row output: at least three non-empty rows that all
/// split into the same number (>1) of whitespace-separated fields.
fn is_table(recent: &[&String]) -> bool {
    let rows: Vec<usize> = recent
        .iter()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.split_whitespace().count())
        .collect();
    if rows.len() < 3 {
        return false;
    }
    let first = rows[0];
    first > 1 && rows.iter().all(|&c| c == first)
}
