// Agent runtime processes: keys, handles, host facility, readiness, ports, registry.

pub mod host;
pub mod ports;
pub mod probe;
pub mod registry;

use std::fmt;
use std::path::{Path, PathBuf};

use berth_common::types::SessionId;
use uuid::Uuid;

/// What a process is for within its workspace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProcessPurpose {
    /// Dedicated to one session.
    Session(SessionId),
    /// One workspace-wide runtime shared by every session in it.
    Shared,
}

/// At most one process exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessKey {
    pub workspace_path: PathBuf,
    pub purpose: ProcessPurpose,
}

impl ProcessKey {
    pub fn session(workspace_path: impl Into<PathBuf>, session_id: SessionId) -> Self {
        Self { workspace_path: workspace_path.into(), purpose: ProcessPurpose::Session(session_id) }
    }

    pub fn shared(workspace_path: impl Into<PathBuf>) -> Self {
        Self { workspace_path: workspace_path.into(), purpose: ProcessPurpose::Shared }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace_path
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        match &self.purpose {
            ProcessPurpose::Session(id) => Some(id),
            ProcessPurpose::Shared => None,
        }
    }

    /// Same key with the session purpose moved to `new`. Shared keys are unchanged.
    pub fn rekeyed(&self, new: &SessionId) -> Self {
        match self.purpose {
            ProcessPurpose::Session(_) => Self::session(self.workspace_path.clone(), new.clone()),
            ProcessPurpose::Shared => self.clone(),
        }
    }
}

impl fmt::Display for ProcessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.purpose {
            ProcessPurpose::Session(id) => write!(f, "{}#{id}", self.workspace_path.display()),
            ProcessPurpose::Shared => write!(f, "{}#shared", self.workspace_path.display()),
        }
    }
}

/// A ready process as seen by its claimants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    /// Backend identity; changes whenever the process is replaced.
    pub id: Uuid,
    pub key: ProcessKey,
    pub port: u16,
    pub pid: u32,
}
