// `berth rekey`: confirm a placeholder session id.

use anyhow::Result;
use berth_common::protocol::rpc_methods;
use clap::Args;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::block_on;
use super::open::OpenResult;
use crate::client::DaemonClient;
use crate::client::RpcError;
use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct RekeyArgs {
    /// Placeholder id the session was opened under
    old: String,
    /// Confirmed id reported by the agent runtime
    new: String,
    /// When the confirmed id already exists, open it in this tab instead
    #[arg(long)]
    adopt_tab: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RekeyResult {
    Rekeyed { rekeyed: bool },
    Adopted(OpenResult),
}

pub fn run(args: RekeyArgs, format: OutputFormat) -> Result<()> {
    let result = block_on(call_rekey(args))??;
    output::print_output(format, &result, format_human)?;
    Ok(())
}

async fn call_rekey(args: RekeyArgs) -> Result<RekeyResult> {
    let client = DaemonClient::default();
    let rekeyed = client
        .call::<_, RekeyResult>(
            rpc_methods::SESSION_REKEY,
            json!({ "old_id": args.old, "new_id": args.new }),
        )
        .await;

    let Some(tab) = args.adopt_tab else {
        return rekeyed;
    };
    match rekeyed {
        Err(error) if is_migration_conflict(&error) => {
            let adopted: OpenResult = client
                .call(
                    rpc_methods::SESSION_ADOPT,
                    json!({ "placeholder_id": args.old, "session_id": args.new, "tab_id": tab }),
                )
                .await?;
            Ok(RekeyResult::Adopted(adopted))
        }
        other => other,
    }
}

fn is_migration_conflict(error: &anyhow::Error) -> bool {
    error.downcast_ref::<RpcError>().is_some_and(|rpc| rpc.code == "MIGRATION_CONFLICT")
}

fn format_human(result: &RekeyResult) -> String {
    match result {
        RekeyResult::Rekeyed { rekeyed: true } => "Session rekeyed".to_string(),
        RekeyResult::Rekeyed { rekeyed: false } => "Nothing referenced the old id".to_string(),
        RekeyResult::Adopted(OpenResult::Opened { session_id, port, .. }) => {
            format!("Adopted existing session {session_id} on port {port}")
        }
        RekeyResult::Adopted(OpenResult::Redirect { session_id, tab_id }) => {
            format!("Existing session {session_id} is open in tab {tab_id}; switch to that tab")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migration_conflict_is_detected_by_code() {
        let conflict = anyhow::Error::new(RpcError {
            code: "MIGRATION_CONFLICT".into(),
            message: "target has claims".into(),
        });
        assert!(is_migration_conflict(&conflict));
        assert!(!is_migration_conflict(&anyhow::anyhow!("MIGRATION_CONFLICT in text only")));
    }

    #[test]
    fn decodes_both_result_shapes() {
        let rekeyed: RekeyResult = serde_json::from_value(json!({ "rekeyed": false })).unwrap();
        assert_eq!(format_human(&rekeyed), "Nothing referenced the old id");

        let adopted = RekeyResult::Adopted(OpenResult::Opened {
            session_id: "s1".into(),
            port: 31416,
            is_new: false,
        });
        assert!(format_human(&adopted).contains("Adopted existing session s1"));
    }
}
