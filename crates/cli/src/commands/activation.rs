// `berth activation`: where is a session open right now.

use anyhow::Result;
use berth_common::protocol::rpc_methods;
use berth_common::types::Activation;
use clap::Args;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::block_on;
use crate::client::DaemonClient;
use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct ActivationArgs {
    /// Session to look up
    session: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationResult {
    #[serde(default)]
    pub activation: Option<Activation>,
}

pub fn run(args: ActivationArgs, format: OutputFormat) -> Result<()> {
    let result: ActivationResult = block_on(
        DaemonClient::default()
            .call(rpc_methods::SESSION_ACTIVATION, json!({ "session_id": args.session })),
    )??;
    output::print_output(format, &result, |result| format_human(&args.session, result))?;
    Ok(())
}

fn format_human(session: &str, result: &ActivationResult) -> String {
    let Some(row) = &result.activation else {
        return format!("{session} is not open anywhere");
    };
    let mut lines = vec![format!("{} on port {}", row.session_id, row.port)];
    lines.push(format!("  workspace: {}", row.workspace_path.display()));
    lines.push(format!("  home tab:  {}", row.home_owner.as_deref().unwrap_or("-")));
    lines.push(format!("  task:      {}", row.task_owner.as_deref().unwrap_or("-")));
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use berth_common::types::SessionId;

    use super::*;

    #[test]
    fn human_format_shows_owners() {
        let result = ActivationResult {
            activation: Some(Activation {
                session_id: SessionId::from("s2"),
                home_owner: None,
                task_owner: Some("r1".into()),
                port: 31415,
                workspace_path: PathBuf::from("/work"),
            }),
        };
        let output = format_human("s2", &result);
        assert!(output.contains("s2 on port 31415"));
        assert!(output.contains("home tab:  -"));
        assert!(output.contains("task:      r1"));
    }

    #[test]
    fn human_format_inactive_session() {
        let output = format_human("s9", &ActivationResult { activation: None });
        assert_eq!(output, "s9 is not open anywhere");
    }
}
