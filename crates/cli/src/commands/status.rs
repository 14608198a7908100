// `berth status`: agent runtimes, claims and armed tasks.

use clap::Args;
use serde::{Deserialize, Serialize};
use serde_json::json;

use berth_common::protocol::rpc_methods;
use berth_common::types::{Activation, ProcessState};

use super::block_on;
use crate::client::DaemonClient;
use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct StatusArgs {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResult {
    #[serde(default)]
    pub processes: Vec<ProcessRow>,
    #[serde(default)]
    pub activations: Vec<Activation>,
    #[serde(default)]
    pub sessions: usize,
    #[serde(default)]
    pub claims: usize,
    #[serde(default)]
    pub subscribers: usize,
    #[serde(default)]
    pub guardians: usize,
    #[serde(default)]
    pub armed_tasks: Vec<String>,
    #[serde(default)]
    pub reserved_ports: Vec<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRow {
    pub key: String,
    pub workspace_path: String,
    #[serde(default)]
    pub session_id: Option<String>,
    pub backend_id: String,
    pub port: u16,
    pub pid: u32,
    pub state: ProcessState,
    pub claims: usize,
}

pub fn run(_args: StatusArgs, format: OutputFormat) -> anyhow::Result<()> {
    let result: StatusResult =
        block_on(DaemonClient::default().call(rpc_methods::DAEMON_STATUS, json!({})))??;
    output::print_output(format, &result, format_human)?;
    Ok(())
}

fn state_label(state: ProcessState) -> &'static str {
    match state {
        ProcessState::Spawning => "spawning",
        ProcessState::Healthy => "healthy",
        ProcessState::Unhealthy => "unhealthy",
        ProcessState::Terminating => "terminating",
        ProcessState::Terminated => "terminated",
    }
}

fn format_human(result: &StatusResult) -> String {
    let mut lines = vec![format!(
        "{} sessions, {} claims, {} subscribers, {} guardians",
        result.sessions, result.claims, result.subscribers, result.guardians
    )];

    if result.processes.is_empty() {
        lines.push("  No agent runtimes.".into());
    } else {
        lines.push(format!("  Agent runtimes ({})", result.processes.len()));
        for p in &result.processes {
            lines.push(format!(
                "    :{} pid {} {} [{}] {} claim(s) {}",
                p.port,
                p.pid,
                p.session_id.as_deref().unwrap_or(&p.key),
                state_label(p.state),
                p.claims,
                p.workspace_path
            ));
        }
    }

    if !result.armed_tasks.is_empty() {
        lines.push(format!("  Armed tasks: {}", result.armed_tasks.join(", ")));
    }
    if !result.reserved_ports.is_empty() {
        let ports: Vec<String> = result.reserved_ports.iter().map(u16::to_string).collect();
        lines.push(format!("  Quarantined ports: {}", ports.join(", ")));
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_result() -> StatusResult {
        StatusResult {
            processes: vec![ProcessRow {
                key: "session:s1".into(),
                workspace_path: "/work/app".into(),
                session_id: Some("s1".into()),
                backend_id: "default".into(),
                port: 31415,
                pid: 4242,
                state: ProcessState::Healthy,
                claims: 2,
            }],
            activations: vec![],
            sessions: 1,
            claims: 2,
            subscribers: 1,
            guardians: 0,
            armed_tasks: vec!["r1".into()],
            reserved_ports: vec![31416],
        }
    }

    #[test]
    fn human_format_lists_runtimes_and_tasks() {
        let output = format_human(&sample_result());
        assert!(output.contains("1 sessions, 2 claims"));
        assert!(output.contains(":31415 pid 4242 s1 [healthy] 2 claim(s) /work/app"));
        assert!(output.contains("Armed tasks: r1"));
        assert!(output.contains("Quarantined ports: 31416"));
    }

    #[test]
    fn human_format_idle_daemon() {
        let output = format_human(&serde_json::from_value(json!({})).unwrap());
        assert!(output.contains("No agent runtimes"));
        assert!(!output.contains("Armed tasks"));
    }

    #[test]
    fn json_format_roundtrips() {
        let mut buf = Vec::new();
        output::write_output(&mut buf, OutputFormat::Json, &sample_result(), format_human).unwrap();
        let parsed: StatusResult = serde_json::from_slice(&buf).unwrap();
        assert_eq!(parsed.processes.len(), 1);
        assert_eq!(parsed.processes[0].state, ProcessState::Healthy);
    }
}
