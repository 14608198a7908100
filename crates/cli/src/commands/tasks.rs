// `berth tasks`: manage recurring scheduled tasks.

use std::path::PathBuf;

use anyhow::{Context, Result};
use berth_common::protocol::rpc_methods;
use berth_common::types::ScheduledTask;
use clap::Subcommand;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::block_on;
use crate::client::DaemonClient;
use crate::daemon_launcher::ensure_daemon_running;
use crate::output::{self, OutputFormat};

#[derive(Debug, Subcommand)]
pub enum TasksCommand {
    /// List every task the daemon knows about
    List,
    /// Create a task (it stays idle until started)
    Create {
        /// Prompt sent to the agent on every run
        prompt: String,
        /// Minutes between runs
        #[arg(long, default_value_t = 60, value_parser = clap::value_parser!(u32).range(1..))]
        every: u32,
        /// Session to run against; a placeholder is minted when omitted
        #[arg(long)]
        session: Option<String>,
        /// Tab the task belongs to
        #[arg(long)]
        tab: Option<String>,
        /// Workspace the agent runtime works in [default: current directory]
        #[arg(long)]
        workspace: Option<PathBuf>,
    },
    /// Arm a task and run it on its interval
    Start { task: String },
    /// Keep the agent runtime up but skip runs
    Pause { task: String },
    /// Resume a paused task
    Resume { task: String },
    /// Disarm a task and release its session
    Stop { task: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskListResult {
    #[serde(default)]
    pub tasks: Vec<ScheduledTask>,
}

pub fn run(command: TasksCommand, format: OutputFormat) -> Result<()> {
    match command {
        TasksCommand::List => {
            let result: TaskListResult =
                block_on(DaemonClient::default().call(rpc_methods::TASK_LIST, json!({})))??;
            output::print_output(format, &result, format_list)?;
        }
        TasksCommand::Create { prompt, every, session, tab, workspace } => {
            let workspace = match workspace {
                Some(path) => path,
                None => std::env::current_dir().context("failed to resolve current directory")?,
            };
            let params = json!({
                "session_id": session,
                "tab_id": tab,
                "workspace_path": workspace.canonicalize().unwrap_or(workspace),
                "interval_minutes": every,
                "prompt": prompt,
            });
            let task = block_on(call_with_daemon(rpc_methods::TASK_CREATE, params))??;
            output::print_output(format, &task, format_task)?;
        }
        TasksCommand::Start { task } => transition(rpc_methods::TASK_START, task, format)?,
        TasksCommand::Pause { task } => transition(rpc_methods::TASK_PAUSE, task, format)?,
        TasksCommand::Resume { task } => transition(rpc_methods::TASK_RESUME, task, format)?,
        TasksCommand::Stop { task } => transition(rpc_methods::TASK_STOP, task, format)?,
    }
    Ok(())
}

fn transition(method: &str, task_id: String, format: OutputFormat) -> Result<()> {
    let task = block_on(call_with_daemon(method, json!({ "task_id": task_id })))??;
    output::print_output(format, &task, format_task)?;
    Ok(())
}

async fn call_with_daemon(method: &str, params: serde_json::Value) -> Result<ScheduledTask> {
    ensure_daemon_running().await?;
    DaemonClient::default().call(method, params).await
}

fn format_task(task: &ScheduledTask) -> String {
    let mut line = format!(
        "{} [{}] every {}m on {} ({} run(s))",
        task.id,
        task.status.as_str(),
        task.interval_minutes,
        task.session_id,
        task.execution_count
    );
    if let Some(error) = &task.last_error {
        line.push_str(&format!("\n  last error: {error}"));
    }
    line
}

fn format_list(result: &TaskListResult) -> String {
    if result.tasks.is_empty() {
        return "No scheduled tasks.".to_string();
    }
    result.tasks.iter().map(format_task).collect::<Vec<_>>().join("\n")
}

#[cfg(test)]
mod tests {
    use berth_common::types::{SessionId, TaskStatus};
    use chrono::Utc;

    use super::*;

    fn sample_task() -> ScheduledTask {
        let now = Utc::now();
        ScheduledTask {
            id: "r1".into(),
            session_id: SessionId::from("s2"),
            tab_id: None,
            workspace_path: PathBuf::from("/work"),
            interval_minutes: 15,
            prompt: "check the build".into(),
            status: TaskStatus::Running,
            execution_count: 3,
            last_error: Some("agent runtime unreachable".into()),
            last_run_at: Some(now),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn human_format_shows_schedule_and_error() {
        let output = format_task(&sample_task());
        assert!(output.starts_with("r1 [running] every 15m on s2 (3 run(s))"));
        assert!(output.contains("last error: agent runtime unreachable"));
    }

    #[test]
    fn human_format_empty_list() {
        assert_eq!(format_list(&TaskListResult { tasks: vec![] }), "No scheduled tasks.");
    }

    #[test]
    fn json_list_roundtrips() {
        let result = TaskListResult { tasks: vec![sample_task()] };
        let mut buf = Vec::new();
        output::write_output(&mut buf, OutputFormat::Json, &result, format_list).unwrap();
        let parsed: TaskListResult = serde_json::from_slice(&buf).unwrap();
        assert_eq!(parsed.tasks, vec![sample_task()]);
    }
}
