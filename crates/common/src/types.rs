// Core domain types shared by the berth daemon and CLI.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix marking a session id the agent runtime has not confirmed yet.
pub const PLACEHOLDER_PREFIX: &str = "pending-";

/// Identifier of a logical conversation.
///
/// Sessions opened before the runtime assigns a permanent id live under a
/// placeholder (`pending-<uuid>`) until they are rekeyed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Fresh placeholder id for an optimistically opened session.
    pub fn placeholder() -> Self {
        Self(format!("{PLACEHOLDER_PREFIX}{}", Uuid::new_v4()))
    }

    pub fn is_placeholder(&self) -> bool {
        self.0.starts_with(PLACEHOLDER_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Kind of consumer holding a claim on a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerKind {
    Tab,
    ScheduledTask,
    BackgroundGuardian,
}

impl OwnerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tab => "tab",
            Self::ScheduledTask => "scheduled_task",
            Self::BackgroundGuardian => "background_guardian",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "tab" => Some(Self::Tab),
            "scheduled_task" => Some(Self::ScheduledTask),
            "background_guardian" => Some(Self::BackgroundGuardian),
            _ => None,
        }
    }
}

impl fmt::Display for OwnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A consumer identity: what kind of owner plus its id (tab id, task id, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Owner {
    pub kind: OwnerKind,
    pub id: String,
}

impl Owner {
    pub fn tab(id: impl Into<String>) -> Self {
        Self { kind: OwnerKind::Tab, id: id.into() }
    }

    pub fn scheduled_task(id: impl Into<String>) -> Self {
        Self { kind: OwnerKind::ScheduledTask, id: id.into() }
    }

    /// The guardian holds at most one claim per session, so its id is derived
    /// from the session it guards.
    pub fn guardian(session_id: &SessionId) -> Self {
        Self { kind: OwnerKind::BackgroundGuardian, id: format!("guardian:{session_id}") }
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Authoritative "where is this session open" row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activation {
    pub session_id: SessionId,
    /// Tab currently presenting the session, if any.
    pub home_owner: Option<String>,
    /// Scheduled task running against the session, if any.
    pub task_owner: Option<String>,
    pub port: u16,
    pub workspace_path: PathBuf,
}

impl Activation {
    pub fn is_empty(&self) -> bool {
        self.home_owner.is_none() && self.task_owner.is_none()
    }
}

/// Lifecycle of an agent runtime process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Spawning,
    Healthy,
    Unhealthy,
    Terminating,
    Terminated,
}

/// Per-consumer event stream state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Connecting,
    Connected,
    Degraded,
    Reconnecting,
    Closed,
}

/// Recurring task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Idle,
    Running,
    Paused,
    Stopped,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "idle" => Some(Self::Idle),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }

    /// Tasks in these states held a claim before shutdown and must get it back.
    pub fn needs_recovery(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

/// A persisted recurring job bound to a session and workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    pub session_id: SessionId,
    /// Tab the task was started from; `None` when running headless.
    pub tab_id: Option<String>,
    pub workspace_path: PathBuf,
    pub interval_minutes: u32,
    pub prompt: String,
    pub status: TaskStatus,
    pub execution_count: u32,
    pub last_error: Option<String>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_ids_are_recognized() {
        let id = SessionId::placeholder();
        assert!(id.is_placeholder());
        assert!(id.as_str().starts_with("pending-"));
        assert!(!SessionId::from("sess-42").is_placeholder());
    }

    #[test]
    fn placeholder_ids_are_unique() {
        assert_ne!(SessionId::placeholder(), SessionId::placeholder());
    }

    #[test]
    fn owner_kind_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&OwnerKind::BackgroundGuardian).unwrap(),
            "\"background_guardian\""
        );
        assert_eq!(OwnerKind::parse("scheduled_task"), Some(OwnerKind::ScheduledTask));
        assert_eq!(OwnerKind::parse("window"), None);
    }

    #[test]
    fn guardian_owner_id_is_derived_from_session() {
        let owner = Owner::guardian(&SessionId::from("s1"));
        assert_eq!(owner.kind, OwnerKind::BackgroundGuardian);
        assert_eq!(owner.id, "guardian:s1");
    }

    #[test]
    fn session_id_is_transparent_on_the_wire() {
        let id = SessionId::from("abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc\"");
    }

    #[test]
    fn only_running_and_paused_tasks_need_recovery() {
        assert!(TaskStatus::Running.needs_recovery());
        assert!(TaskStatus::Paused.needs_recovery());
        assert!(!TaskStatus::Idle.needs_recovery());
        assert!(!TaskStatus::Stopped.needs_recovery());
    }
}
