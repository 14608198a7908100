// Hub-level error taxonomy surfaced to RPC and HTTP callers.

use berth_common::types::SessionId;
use thiserror::Error;

use crate::migrate::MigrationError;
use crate::ownership::ledger::LedgerError;
use crate::process::registry::SpawnError;

#[derive(Debug, Error)]
pub enum HubError {
    /// Process never became healthy. Callers may retry.
    #[error("agent runtime failed to start: {0}")]
    SpawnFailed(#[from] SpawnError),

    /// A second interactive owner tried to open a session. Callers redirect
    /// to `tab_id` instead of reporting a failure.
    #[error("session {session_id} is already open in tab {tab_id}")]
    SingletonConflict { session_id: SessionId, tab_id: String },

    /// Rekey target already has independent state; adopt it instead.
    #[error("cannot rekey {old} to {new}: {reason}")]
    MigrationConflict { old: SessionId, new: SessionId, reason: String },

    #[error("event stream for session {session_id} disconnected after {attempts} attempts")]
    StreamDisconnected { session_id: SessionId, attempts: u32 },

    #[error("{recovered} of {total} recurring tasks recovered")]
    RecoveryPartialFailure { recovered: usize, total: usize, failed: Vec<String> },

    #[error("{owner} holds no claim on session {session_id}")]
    NotClaimed { session_id: SessionId, owner: String },

    #[error("unknown task `{0}`")]
    UnknownTask(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("task store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl HubError {
    /// Stable machine-readable code carried in RPC error data.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SpawnFailed(_) => "SPAWN_FAILED",
            Self::SingletonConflict { .. } => "SINGLETON_CONFLICT",
            Self::MigrationConflict { .. } => "MIGRATION_CONFLICT",
            Self::StreamDisconnected { .. } => "STREAM_DISCONNECTED",
            Self::RecoveryPartialFailure { .. } => "RECOVERY_PARTIAL_FAILURE",
            Self::NotClaimed { .. } => "NOT_CLAIMED",
            Self::UnknownTask(_) => "UNKNOWN_TASK",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::Store(_) => "STORE_ERROR",
        }
    }

    pub fn retryable(&self) -> bool {
        matches!(self, Self::SpawnFailed(_) | Self::StreamDisconnected { .. } | Self::Store(_))
    }
}

impl From<LedgerError> for HubError {
    fn from(error: LedgerError) -> Self {
        match error {
            LedgerError::SingletonConflict { session_id, holder } => {
                Self::SingletonConflict { session_id, tab_id: holder }
            }
            LedgerError::Spawn(spawn) => Self::SpawnFailed(spawn),
            LedgerError::WorkspaceMismatch { session_id, .. } => Self::InvalidRequest(format!(
                "session {session_id} is already bound to a different workspace"
            )),
            LedgerError::UnknownClaim(id) => {
                Self::InvalidRequest(format!("claim {id} is no longer registered"))
            }
        }
    }
}

impl From<MigrationError> for HubError {
    fn from(error: MigrationError) -> Self {
        match error {
            MigrationError::Conflict { old, new, reason } => {
                Self::MigrationConflict { old, new, reason: reason.to_string() }
            }
            MigrationError::NotFound(old) => {
                Self::InvalidRequest(format!("session {old} has no state to migrate"))
            }
            MigrationError::NotReady(old) => Self::MigrationConflict {
                new: old.clone(),
                old,
                reason: "process is not live yet".to_string(),
            },
        }
    }
}
