// Output format auto-detection for the CLI.
//
// TTY → human-readable text. Piped/redirected → structured JSON.
// `--json` flag forces JSON output regardless of terminal.

use crate::exit_code::ExitCode;

use serde::Serialize;
use std::io::{self, IsTerminal, Write};

const ANSI_RED: &str = "\x1b[31m";
const ANSI_YELLOW: &str = "\x1b[33m";
const ANSI_RESET: &str = "\x1b[0m";

/// Output format for CLI commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable text (tables, colors, etc.).
    Human,
    /// Machine-readable JSON (one object per response).
    Json,
}

impl OutputFormat {
    /// Auto-detect format: JSON if `--json` was passed or stdout is not a TTY.
    pub fn detect(json_flag: bool) -> Self {
        if json_flag {
            return Self::Json;
        }
        Self::detect_from_terminal(io::stdout().is_terminal())
    }

    /// Testable variant that takes an explicit `is_tty` flag.
    pub fn detect_from_terminal(is_tty: bool) -> Self {
        if is_tty {
            Self::Human
        } else {
            Self::Json
        }
    }
}

/// Write a value to stdout in the selected format.
pub fn print_output<T, F>(format: OutputFormat, value: &T, human_fn: F) -> io::Result<()>
where
    T: Serialize,
    F: FnOnce(&T) -> String,
{
    write_output(&mut io::stdout().lock(), format, value, human_fn)
}

/// Write a value to any writer. `human_fn` is only called in `Human` mode.
pub fn write_output<W, T, F>(
    writer: &mut W,
    format: OutputFormat,
    value: &T,
    human_fn: F,
) -> io::Result<()>
where
    W: Write,
    T: Serialize,
    F: FnOnce(&T) -> String,
{
    match format {
        OutputFormat::Human => writeln!(writer, "{}", human_fn(value)),
        OutputFormat::Json => {
            serde_json::to_writer(&mut *writer, value).map_err(io::Error::other)?;
            writeln!(writer)
        }
    }
}

/// Write an error to stderr in the selected format.
pub fn print_error(format: OutputFormat, code: &str, message: &str) {
    print_diagnostic(format, "error", ANSI_RED, code, message);
}

/// Write a warning to stderr in the selected format.
pub fn print_warning(format: OutputFormat, code: &str, message: &str) {
    print_diagnostic(format, "warning", ANSI_YELLOW, code, message);
}

fn print_diagnostic(format: OutputFormat, label: &str, color: &str, code: &str, message: &str) {
    let is_tty = io::stderr().is_terminal();
    let line = render_diagnostic(format, label, color, code, message, is_tty);
    let _ = writeln!(io::stderr().lock(), "{line}");
}

fn render_diagnostic(
    format: OutputFormat,
    label: &str,
    color: &str,
    code: &str,
    message: &str,
    is_tty: bool,
) -> String {
    match format {
        OutputFormat::Human => render_human_stderr_line(label, message, is_tty, color),
        OutputFormat::Json => {
            serde_json::json!({ label: { "code": code, "message": message } }).to_string()
        }
    }
}

/// Print a mapped, actionable error for a command failure.
pub fn print_anyhow_error(format: OutputFormat, error: &anyhow::Error) {
    let (code, message) = actionable_error(error);
    print_error(format, code, &message);
}

fn actionable_error(error: &anyhow::Error) -> (&'static str, String) {
    let message = format!("{error:#}");

    match ExitCode::from_error(error) {
        ExitCode::IndexUnavailable if message.contains("no annotation index") => (
            "INDEX_NOT_FOUND",
            format!("{message}. Open a document in a synced viewer first, or pass --index"),
        ),
        ExitCode::IndexUnavailable => ("INDEX_UNAVAILABLE", message),
        ExitCode::Config if message.contains("parse error") => (
            "CONFIG_PARSE_ERROR",
            format!("{message}. Fix the file or re-create it with: annosync config init --force"),
        ),
        ExitCode::Config => ("INVALID_CONFIG", message),
        ExitCode::Usage => ("USAGE", message),
        _ => ("COMMAND_ERROR", message),
    }
}

fn render_human_stderr_line(label: &str, message: &str, is_tty: bool, color: &str) -> String {
    if is_tty {
        format!("{color}{label}:{ANSI_RESET} {message}")
    } else {
        format!("{label}: {message}")
    }
}
