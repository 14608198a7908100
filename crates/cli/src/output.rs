// Rendering command results and failures.
//
// stdout on a TTY gets human text; anything else gets one JSON object per
// result. `--json` forces JSON.

use std::io::{self, IsTerminal, Write};

use serde::Serialize;

use crate::client::{DaemonUnavailable, RpcError};

const ANSI_RED: &str = "\x1b[31m";
const ANSI_DIM: &str = "\x1b[2m";
const ANSI_RESET: &str = "\x1b[0m";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Human,
    Json,
}

impl OutputFormat {
    pub fn detect(json_flag: bool) -> Self {
        Self::choose(json_flag, io::stdout().is_terminal())
    }

    fn choose(json_flag: bool, stdout_is_tty: bool) -> Self {
        if json_flag || !stdout_is_tty {
            Self::Json
        } else {
            Self::Human
        }
    }
}

pub fn print_output<T, F>(format: OutputFormat, value: &T, human_fn: F) -> io::Result<()>
where
    T: Serialize,
    F: FnOnce(&T) -> String,
{
    write_output(&mut io::stdout().lock(), format, value, human_fn)
}

/// Like [`print_output`] but into any writer.
pub fn write_output<W, T, F>(writer: &mut W, format: OutputFormat, value: &T, human_fn: F) -> io::Result<()>
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

/// A failure as the user sees it: a stable code, what went wrong, and
/// what to try next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ErrorReport {
    pub fn from_error(error: &anyhow::Error) -> Self {
        if error.chain().any(|cause| cause.is::<DaemonUnavailable>()) {
            return Self {
                code: "DAEMON_NOT_RUNNING".into(),
                message: "berthd is not running".into(),
                hint: Some("Start it with `berthd`, or run `berth open` to auto-start it".into()),
            };
        }

        if let Some(rpc) = error.chain().find_map(|cause| cause.downcast_ref::<RpcError>()) {
            return Self {
                code: rpc.code.clone(),
                message: rpc.message.clone(),
                hint: hint_for(&rpc.code).map(str::to_string),
            };
        }

        let message = format!("{error:#}");
        if error
            .chain()
            .any(|cause| cause.is::<tokio::time::error::Elapsed>())
            || message.contains("timed out")
        {
            return Self {
                code: "DAEMON_TIMEOUT".into(),
                message,
                hint: Some("berthd did not answer in time; check ~/.berth/berthd.log".into()),
            };
        }

        Self { code: "ERROR".into(), message, hint: None }
    }

    fn render_human(&self, color: bool) -> String {
        let (red, dim, reset) = if color { (ANSI_RED, ANSI_DIM, ANSI_RESET) } else { ("", "", "") };
        let mut text = format!("{red}error:{reset} {} [{}]", self.message, self.code);
        if let Some(hint) = &self.hint {
            text.push_str(&format!("\n{dim}hint:{reset} {hint}"));
        }
        text
    }
}

fn hint_for(code: &str) -> Option<&'static str> {
    match code {
        "UNKNOWN_TASK" => Some("`berth tasks list` shows the known tasks"),
        "NOT_CLAIMED" => Some("`berth status` shows who holds each session"),
        "MIGRATION_CONFLICT" => Some("retry with `--adopt-tab <tab>` to open the existing session"),
        "SINGLETON_CONFLICT" => Some("focus the tab that already has the session open"),
        "SPAWN_FAILED" => Some("check the [runtime] command in ~/.berth/config.toml"),
        "UNSUPPORTED_PROTOCOL" => Some("berth and berthd versions differ; restart berthd"),
        _ => None,
    }
}

/// Write `error` to stderr in the selected format.
pub fn print_anyhow_error(format: OutputFormat, error: &anyhow::Error) {
    let report = ErrorReport::from_error(error);
    let mut stderr = io::stderr().lock();
    let _ = match format {
        OutputFormat::Human => writeln!(stderr, "{}", report.render_human(io::stderr().is_terminal())),
        OutputFormat::Json => {
            writeln!(stderr, "{}", serde_json::json!({ "error": report }))
        }
    };
}
