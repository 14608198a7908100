// `berth open`: open a session in a tab.

use std::path::PathBuf;

use anyhow::{Context, Result};
use berth_common::protocol::rpc_methods;
use clap::Args;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::block_on;
use crate::client::DaemonClient;
use crate::daemon_launcher::ensure_daemon_running;
use crate::client::RpcError;
use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct OpenArgs {
    /// Tab (or other interactive owner) presenting the session
    #[arg(long)]
    tab: String,
    /// Session to open; a placeholder id is minted when omitted
    #[arg(long)]
    session: Option<String>,
    /// Workspace the agent runtime works in [default: current directory]
    #[arg(long)]
    workspace: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum OpenResult {
    Opened { session_id: String, port: u16, is_new: bool },
    Redirect { session_id: String, tab_id: String },
}

pub fn run(args: OpenArgs, format: OutputFormat) -> Result<()> {
    let workspace = match args.workspace {
        Some(path) => path,
        None => std::env::current_dir().context("failed to resolve current directory")?,
    };
    let workspace = workspace.canonicalize().unwrap_or(workspace);

    let result = block_on(call_open(workspace, args.session, args.tab))??;
    output::print_output(format, &result, format_human)?;

    if let OpenResult::Redirect { session_id, tab_id } = result {
        return Err(RpcError {
            code: "SINGLETON_CONFLICT".into(),
            message: format!("session {session_id} is already open in tab {tab_id}"),
        }
        .into());
    }
    Ok(())
}

async fn call_open(workspace: PathBuf, session: Option<String>, tab: String) -> Result<OpenResult> {
    ensure_daemon_running().await?;
    DaemonClient::default()
        .call(
            rpc_methods::SESSION_OPEN,
            json!({ "workspace_path": workspace, "session_id": session, "tab_id": tab }),
        )
        .await
}

fn format_human(result: &OpenResult) -> String {
    match result {
        OpenResult::Opened { session_id, port, is_new: true } => {
            format!("Opened {session_id} on port {port} (new agent runtime)")
        }
        OpenResult::Opened { session_id, port, is_new: false } => {
            format!("Opened {session_id} on port {port}")
        }
        OpenResult::Redirect { session_id, tab_id } => {
            format!("{session_id} is already open in tab {tab_id}; switch to that tab")
        }
    }
}
