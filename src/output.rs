//! Output Control Module
//!
//! Centralized console rendering based on CLI flags:
//! - `compact_mode`: Minimal output, no decorative chrome
//! - `verbose_mode`: Extra detail, show model thoughts and tool arguments

use colored::*;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::i18n::Catalog;

static COMPACT_MODE: AtomicBool = AtomicBool::new(false);
static VERBOSE_MODE: AtomicBool = AtomicBool::new(false);

/// Initialize output modes from CLI flags.
pub fn init(compact: bool, verbose: bool) {
    COMPACT_MODE.store(compact, Ordering::SeqCst);
    VERBOSE_MODE.store(verbose, Ordering::SeqCst);
}

pub fn is_compact() -> bool {
    COMPACT_MODE.load(Ordering::SeqCst)
}

pub fn is_verbose() -> bool {
    VERBOSE_MODE.load(Ordering::SeqCst)
}

/// Render a streamed fragment of the model's visible thought.
pub fn thought_delta(text: &str) {
    if !is_compact() {
        use std::io::Write;
        print!("{}", text.dimmed());
        std::io::stdout().flush().ok();
    }
}

pub fn tool_call(name: &str, args_preview: &str) {
    if is_compact() {
        println!("{} {}", "→".bright_blue(), name.bright_cyan());
    } else {
        println!(
            "\n{} {} {}",
            "→".bright_blue(),
            name.bright_cyan(),
            args_preview.dimmed()
        );
    }
}

pub fn tool_success(name: &str) {
    println!("{} {}", "✓".bright_green(), name);
}

pub fn tool_failure(name: &str, error: &str) {
    println!("{} {} {}", "✗".bright_red(), name, error.bright_red());
}

pub fn risk_notice(command: &str, level: &str) {
    println!(
        "{} {} {}",
        "⚠".bright_yellow(),
        level.bright_yellow(),
        command.bright_white()
    );
}

pub fn reflection_injected(issues: &str) {
    if !is_compact() {
        println!("{} {}", "↻".bright_magenta(), issues.dimmed());
    }
}

/// Concise end-of-run summary: task, status, answer or stop reason, and the
/// last error kind on failure.
pub fn run_summary(
    catalog: &Catalog,
    task: &str,
    status: &str,
    answer: &str,
    last_error: Option<&str>,
) {
    println!();
    println!("{}: {}", catalog.summary_task().bold(), task);
    println!("{}: {}", catalog.summary_status().bold(), status);
    if !answer.is_empty() {
        println!("{}: {}", catalog.summary_answer().bold(), answer);
    }
    if let Some(err) = last_error {
        println!("{}: {}", catalog.summary_last_error().bold(), err.red());
    }
}
