// `berth release`: drop an owner's claim on a session.

use anyhow::Result;
use berth_common::protocol::rpc_methods;
use clap::{Args, ValueEnum};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::block_on;
use crate::client::DaemonClient;
use crate::output::{self, OutputFormat};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OwnerKindArg {
    Tab,
    Task,
    Guardian,
}

impl OwnerKindArg {
    fn wire_name(self) -> &'static str {
        match self {
            Self::Tab => "tab",
            Self::Task => "scheduled_task",
            Self::Guardian => "background_guardian",
        }
    }
}

#[derive(Debug, Args)]
pub struct ReleaseArgs {
    /// Session to release
    session: String,
    /// Id of the owner giving up its claim (tab id or task id)
    owner: String,
    /// Kind of owner
    #[arg(long, value_enum, default_value = "tab")]
    kind: OwnerKindArg,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseResult {
    pub stopped: bool,
}

pub fn run(args: ReleaseArgs, format: OutputFormat) -> Result<()> {
    let params = json!({
        "session_id": args.session,
        "owner_kind": args.kind.wire_name(),
        "owner_id": args.owner,
    });
    let result: ReleaseResult =
        block_on(DaemonClient::default().call(rpc_methods::SESSION_RELEASE, params))??;
    output::print_output(format, &result, format_human)?;
    Ok(())
}

fn format_human(result: &ReleaseResult) -> String {
    if result.stopped {
        "Released; the agent runtime is shutting down".to_string()
    } else {
        "Released; the agent runtime stays up for its remaining owners".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_kinds_use_daemon_names() {
        assert_eq!(OwnerKindArg::Tab.wire_name(), "tab");
        assert_eq!(OwnerKindArg::Task.wire_name(), "scheduled_task");
        assert_eq!(OwnerKindArg::Guardian.wire_name(), "background_guardian");
    }

    #[test]
    fn human_format_reports_teardown() {
        assert!(format_human(&ReleaseResult { stopped: true }).contains("shutting down"));
        assert!(format_human(&ReleaseResult { stopped: false }).contains("stays up"));
    }
}
