use std::fmt::Display;
use std::io::IsTerminal;
use std::sync::atomic::{AtomicBool, Ordering};

use console::{StyledObject, colors_enabled, style};

static VERBOSE: AtomicBool = AtomicBool::new(false);

/// Lines of a failed process's output shown in error reports.
const FAILURE_TAIL_LINES: usize = 20;

pub fn accent<D: Display>(value: D) -> StyledObject<D> {
    style(value).cyan()
}

pub fn dim<D: Display>(value: D) -> StyledObject<D> {
    style(value).dim()
}

pub fn set_verbose(verbose: bool) {
    VERBOSE.store(verbose, Ordering::Relaxed);
}

pub fn is_verbose() -> bool {
    VERBOSE.load(Ordering::Relaxed)
}

pub fn step(message: &str) {
    println!("{} {}", accent("•").bold(), message);
}

pub fn success(message: &str) {
    println!("{} {}", style("✓").green().bold(), message);
}

pub fn warning(message: &str) {
    eprintln!("{} {}", style("!").yellow().bold(), message);
}

pub fn error_stderr(message: &str) {
    eprintln!("{} {}", style("✗").red().bold(), message);
}

pub fn muted(message: &str) {
    println!("{}", dim(message));
}

pub fn emphasized(value: &str) -> String {
    if std::io::stdout().is_terminal() && colors_enabled() {
        format!("\x1b[3m{}\x1b[23m", value)
    } else {
        format!("'{}'", value)
    }
}

/// The last lines of captured output, indented for an error report.
pub fn output_tail(lines: &[String]) -> Option<String> {
    if lines.is_empty() {
        return None;
    }
    let start = lines.len().saturating_sub(FAILURE_TAIL_LINES);
    let tail: Vec<String> = lines[start..]
        .iter()
        .map(|line| format!("  {line}"))
        .collect();
    Some(tail.join("\n"))
}
