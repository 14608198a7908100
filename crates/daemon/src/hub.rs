// SessionHub: the one entry point consumers use to open, switch, release and
// observe sessions, and to drive recurring tasks.
//
// Every mutation of the ledger or the activation table for a session runs
// under that session's lock. Network calls that do not decide an outcome
// (close notifications) are spawned and never awaited under a lock.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use berth_common::protocol::events::GenerationPhase;
use berth_common::types::{
    Activation, Owner, OwnerKind, ProcessState, ScheduledTask, SessionId, TaskStatus,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::activation::{LaunchDecision, SessionActivationTable};
use crate::backend::AgentBackend;
use crate::config::BerthConfig;
use crate::error::HubError;
use crate::guardian::BackgroundCompletionGuardian;
use crate::migrate::{MigrationError, SessionIdentityMigrator};
use crate::ownership::ledger::{Claim, ClaimPolicy, LedgerError, OwnershipLedger, Released};
use crate::ownership::locks::{SessionGuard, SessionLocks};
use crate::process::host::ProcessHost;
use crate::process::ports::PortAllocator;
use crate::process::probe::ReadinessProbe;
use crate::process::registry::ProcessRegistry;
use crate::process::ProcessKey;
use crate::recovery::{RecoveryCoordinator, RecoveryReport};
use crate::scheduler::{TaskScheduler, TaskTicks};
use crate::store::meta_db::MetaDb;
use crate::store::tasks::TaskStore;
use crate::stream::backoff::ReconnectPolicy;
use crate::stream::connector::{StreamConnector, StreamTarget};
use crate::stream::router::{EventStreamRouter, StreamHandle};

/// Upper bound on asking a runtime whether it is generating when no stream
/// has reported a phase yet.
const STATE_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Collaborators the hub is built from.
pub struct HubDeps {
    pub config: BerthConfig,
    pub host: Arc<dyn ProcessHost>,
    pub probe: Arc<dyn ReadinessProbe>,
    /// Overrides the allocator derived from `config.runtime`.
    pub ports: Option<PortAllocator>,
    pub connector: Arc<dyn StreamConnector>,
    pub backend: Arc<dyn AgentBackend>,
    pub db: MetaDb,
}

/// Result of opening or switching to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum OpenOutcome {
    /// The caller now holds the session's tab claim.
    Opened { session_id: SessionId, port: u16, is_new: bool },
    /// Another tab already has the session open; focus it instead.
    Redirect { session_id: SessionId, tab_id: String },
}

impl OpenOutcome {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::Opened { session_id, .. } | Self::Redirect { session_id, .. } => session_id,
        }
    }
}

/// Parameters of a new recurring task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTask {
    /// Defaults to a fresh placeholder session.
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub tab_id: Option<String>,
    pub workspace_path: PathBuf,
    pub interval_minutes: u32,
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSummary {
    pub key: String,
    pub workspace_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    pub backend_id: String,
    pub port: u16,
    pub pid: u32,
    pub state: ProcessState,
    pub claims: usize,
}

/// Point-in-time view of everything the hub tracks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubStatus {
    pub processes: Vec<ProcessSummary>,
    pub activations: Vec<Activation>,
    pub sessions: usize,
    pub claims: usize,
    pub subscribers: usize,
    pub guardians: usize,
    pub armed_tasks: Vec<String>,
    pub reserved_ports: Vec<u16>,
}

pub struct SessionHub {
    config: BerthConfig,
    registry: Arc<ProcessRegistry>,
    ledger: OwnershipLedger,
    activation: Arc<SessionActivationTable>,
    router: EventStreamRouter,
    locks: SessionLocks,
    migrator: SessionIdentityMigrator,
    guardian: Arc<BackgroundCompletionGuardian>,
    scheduler: TaskScheduler,
    backend: Arc<dyn AgentBackend>,
    store: Mutex<MetaDb>,
}

impl SessionHub {
    /// Wire the core together. The returned receiver carries scheduler ticks
    /// and is handed to [`SessionHub::spawn_tick_loop`].
    pub fn new(deps: HubDeps) -> (Arc<Self>, TaskTicks) {
        let HubDeps { config, host, probe, ports, connector, backend, db } = deps;

        let ports = ports.unwrap_or_else(|| {
            PortAllocator::new(config.runtime.port_range_start, config.runtime.port_range_len)
        });
        let registry = ProcessRegistry::with_port_allocator(config.runtime.clone(), host, probe, ports);
        let router = EventStreamRouter::new(
            connector,
            ReconnectPolicy::from_config(&config.stream),
            config.stream.buffer,
        );
        let ledger = OwnershipLedger::new(Arc::clone(&registry), router.clone());
        let activation = Arc::new(SessionActivationTable::new());
        let locks = SessionLocks::new();
        let migrator = SessionIdentityMigrator::new(
            locks.clone(),
            ledger.clone(),
            Arc::clone(&activation),
            router.clone(),
        );
        let guardian = BackgroundCompletionGuardian::new(
            ledger.clone(),
            router.clone(),
            locks.clone(),
            Arc::clone(&backend),
            config.guardian.max_hold(),
        );
        let (scheduler, ticks) = TaskScheduler::new();

        let hub = Arc::new(Self {
            config,
            registry,
            ledger,
            activation,
            router,
            locks,
            migrator,
            guardian,
            scheduler,
            backend,
            store: Mutex::new(db),
        });
        (hub, ticks)
    }

    fn db(&self) -> MutexGuard<'_, MetaDb> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &BerthConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    pub fn ledger(&self) -> &OwnershipLedger {
        &self.ledger
    }

    pub fn activation(&self) -> &SessionActivationTable {
        &self.activation
    }

    pub fn router(&self) -> &EventStreamRouter {
        &self.router
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    // ── Sessions ────────────────────────────────────────────────────

    /// Open `session_id` (or a fresh placeholder) in `tab_id`.
    ///
    /// A session already open in another live tab yields
    /// [`OpenOutcome::Redirect`] rather than an error.
    pub async fn open_session(
        &self,
        workspace_path: &Path,
        session_id: Option<SessionId>,
        tab_id: &str,
    ) -> Result<OpenOutcome, HubError> {
        let target = session_id.unwrap_or_else(SessionId::placeholder);
        let current = self.current_session(tab_id, &target);
        let _lock = self.locks.lock(&target).await;

        let decision = self.decide(&target, tab_id, current.as_ref());
        debug!(session_id = %target, tab_id, ?decision, "launch decision");
        match decision {
            LaunchDecision::FocusExisting { tab_id: home } => {
                info!(session_id = %target, tab_id, home, "session already open; redirecting");
                Ok(OpenOutcome::Redirect { session_id: target, tab_id: home })
            }
            LaunchDecision::AttachToTask { task_id, workspace_path: task_workspace, .. } => {
                let key = self.key_for(&target, &task_workspace);
                info!(session_id = %target, tab_id, task_id, "attaching to task-held process");
                self.claim_home_locked(&target, tab_id, key).await
            }
            LaunchDecision::OpenFresh { .. } | LaunchDecision::Normal => {
                let key = ProcessKey::session(workspace_path, target.clone());
                self.claim_home_locked(&target, tab_id, key).await
            }
        }
    }

    /// Drop `owner_id`'s claim on `session_id`.
    ///
    /// Returns `true` when this release left the process without claims and
    /// its teardown began. A tab leaving mid-generation hands its claim to
    /// the guardian instead, and `false` is returned.
    pub async fn release_session(
        &self,
        session_id: &SessionId,
        kind: OwnerKind,
        owner_id: &str,
    ) -> Result<bool, HubError> {
        let _lock = self.locks.lock(session_id).await;
        let owner = Owner { kind, id: owner_id.to_string() };
        let claim = self.ledger.find(session_id, &owner).ok_or_else(|| HubError::NotClaimed {
            session_id: session_id.clone(),
            owner: owner.to_string(),
        })?;

        match kind {
            OwnerKind::Tab => self.release_tab_locked(&claim).await,
            OwnerKind::ScheduledTask => {
                self.scheduler.disarm(owner_id);
                self.clear_task_row(session_id, owner_id);
                let idle = self.release_claim(&claim);
                // A released task must not come back on its own after a restart.
                match self.set_status(owner_id, TaskStatus::Stopped) {
                    Ok(_) | Err(HubError::UnknownTask(_)) => {}
                    Err(error) => return Err(error),
                }
                info!(task_id = owner_id, session_id = %session_id, "task released; stopped");
                Ok(idle)
            }
            OwnerKind::BackgroundGuardian => Ok(self.release_claim(&claim)),
        }
    }

    pub fn get_session_activation(&self, session_id: &SessionId) -> Option<Activation> {
        self.activation.lookup(session_id)
    }

    /// Attach `owner_id`'s event stream to the process behind its claim.
    pub async fn subscribe_events(
        &self,
        session_id: &SessionId,
        owner_id: &str,
    ) -> Result<StreamHandle, HubError> {
        let _lock = self.locks.lock(session_id).await;
        let claim = [OwnerKind::Tab, OwnerKind::ScheduledTask, OwnerKind::BackgroundGuardian]
            .into_iter()
            .find_map(|kind| {
                self.ledger.find(session_id, &Owner { kind, id: owner_id.to_string() })
            })
            .ok_or_else(|| HubError::NotClaimed {
                session_id: session_id.clone(),
                owner: owner_id.to_string(),
            })?;
        Ok(self.router.attach(claim.owner.clone(), target_of(&claim)))
    }

    /// Move a placeholder session to its confirmed id.
    ///
    /// Returns `false` when nothing referenced `old`. A target that already
    /// has its own state fails with `MigrationConflict`; the caller then
    /// adopts it with [`SessionHub::adopt_session`].
    pub async fn rekey_session(&self, old: &SessionId, new: &SessionId) -> Result<bool, HubError> {
        if old == new {
            return Ok(true);
        }
        let guard = self.locks.lock_pair(old, new).await;
        let live = match self.migrator.rekey_locked(&guard, old, new) {
            Ok(()) => true,
            Err(MigrationError::NotFound(_)) => false,
            Err(error) => return Err(error.into()),
        };
        let moved = {
            let db = self.db();
            TaskStore::rekey_session(db.connection(), old, new, Utc::now())?
        };
        if moved > 0 {
            info!(from = %old, to = %new, tasks = moved, "scheduled tasks rekeyed");
        }
        Ok(live || moved > 0)
    }

    /// Give up a placeholder session that lost a rekey race and open the
    /// already existing `existing` in the same tab. The placeholder's process
    /// is torn down once nothing else claims it.
    pub async fn adopt_session(
        &self,
        placeholder: &SessionId,
        existing: &SessionId,
        tab_id: &str,
    ) -> Result<OpenOutcome, HubError> {
        let workspace = {
            let _lock = self.locks.lock(placeholder).await;
            let workspace =
                self.ledger.session_key(placeholder).map(|key| key.workspace().to_path_buf());
            self.activation.clear_home_if(placeholder, tab_id);
            if let Some(released) = self.ledger.release_owner(placeholder, &Owner::tab(tab_id)) {
                self.after_release(&released);
            }
            workspace
        };

        let workspace = workspace
            .or_else(|| self.activation.lookup(existing).map(|row| row.workspace_path))
            .or_else(|| self.ledger.session_key(existing).map(|key| key.workspace().to_path_buf()))
            .ok_or_else(|| {
                HubError::InvalidRequest(format!("no workspace known for session {existing}"))
            })?;
        info!(placeholder = %placeholder, session_id = %existing, tab_id, "adopting existing session");
        self.open_session(&workspace, Some(existing.clone()), tab_id).await
    }

    /// Move `tab_id` from `from` to `to` (a fresh placeholder when `None`).
    ///
    /// Uses the same launch decision as [`SessionHub::open_session`]. When the
    /// tab is the only claimant of an idle `from`, its process is repurposed
    /// for `to` instead of spawning a new one.
    pub async fn switch_session(
        &self,
        tab_id: &str,
        from: &SessionId,
        to: Option<SessionId>,
    ) -> Result<OpenOutcome, HubError> {
        let to = to.unwrap_or_else(SessionId::placeholder);
        let guard = self.locks.lock_pair(from, &to).await;
        let tab = Owner::tab(tab_id);
        let from_claim = self.ledger.find(from, &tab).ok_or_else(|| HubError::NotClaimed {
            session_id: from.clone(),
            owner: tab.to_string(),
        })?;
        if &to == from {
            return Ok(OpenOutcome::Opened {
                session_id: to,
                port: from_claim.process.port,
                is_new: false,
            });
        }
        let workspace = from_claim.key().workspace().to_path_buf();

        let decision = self.decide(&to, tab_id, Some(from));
        debug!(from = %from, to = %to, tab_id, ?decision, "switch decision");
        let outcome = match decision {
            LaunchDecision::FocusExisting { tab_id: home } => {
                return Ok(OpenOutcome::Redirect { session_id: to, tab_id: home });
            }
            LaunchDecision::AttachToTask { workspace_path, .. } => {
                let key = self.key_for(&to, &workspace_path);
                self.claim_home_locked(&to, tab_id, key).await?
            }
            LaunchDecision::OpenFresh { busy_session } => {
                debug!(session_id = %busy_session, "current session is task-held; not repurposing");
                let key = ProcessKey::session(workspace, to.clone());
                self.claim_home_locked(&to, tab_id, key).await?
            }
            LaunchDecision::Normal => {
                if self.can_repurpose(&from_claim, &to).await {
                    match self.repurpose(&guard, &from_claim, &to).await {
                        Ok(outcome) => return Ok(outcome),
                        Err(error) => {
                            warn!(from = %from, to = %to, error = %format!("{error:#}"), "repurpose failed; opening fresh");
                        }
                    }
                }
                let key = ProcessKey::session(workspace, to.clone());
                self.claim_home_locked(&to, tab_id, key).await?
            }
        };

        // The new claim is in place before the old one goes.
        if matches!(outcome, OpenOutcome::Opened { .. }) {
            self.release_tab_locked(&from_claim).await?;
        }
        Ok(outcome)
    }

    fn decide(&self, target: &SessionId, tab_id: &str, current: Option<&SessionId>) -> LaunchDecision {
        // A home tab is live exactly while it still holds its claim.
        self.activation.decide(target, tab_id, current, |home| {
            self.ledger.find(target, &Owner::tab(home)).is_some()
        })
    }

    /// Another session `tab_id` currently holds, if any.
    fn current_session(&self, tab_id: &str, target: &SessionId) -> Option<SessionId> {
        self.ledger.sessions_of(&Owner::tab(tab_id)).into_iter().find(|id| id != target)
    }

    /// The key an existing session is bound to, or a dedicated one in `workspace`.
    fn key_for(&self, session_id: &SessionId, workspace: &Path) -> ProcessKey {
        self.ledger
            .session_key(session_id)
            .unwrap_or_else(|| ProcessKey::session(workspace, session_id.clone()))
    }

    /// Claim `target` as `tab_id`'s home. Caller holds `target`'s lock.
    async fn claim_home_locked(
        &self,
        target: &SessionId,
        tab_id: &str,
        key: ProcessKey,
    ) -> Result<OpenOutcome, HubError> {
        match self.ledger.claim(target, Owner::tab(tab_id), key, ClaimPolicy::Reject).await {
            Ok(claim) => {
                self.activation.set_home(target, tab_id, claim.process.port, claim.key().workspace());
                info!(
                    session_id = %target,
                    tab_id,
                    port = claim.process.port,
                    spawned = claim.spawned,
                    "session opened"
                );
                Ok(OpenOutcome::Opened {
                    session_id: target.clone(),
                    port: claim.process.port,
                    is_new: claim.spawned,
                })
            }
            Err(LedgerError::SingletonConflict { session_id, holder }) => {
                info!(session_id = %session_id, tab_id, home = %holder, "session already open; redirecting");
                Ok(OpenOutcome::Redirect { session_id, tab_id: holder })
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Release a tab claim, handing it to the guardian when a reply is still
    /// being generated. Caller holds the session's lock.
    async fn release_tab_locked(&self, claim: &Claim) -> Result<bool, HubError> {
        let session_id = &claim.session_id;
        let guarded = self.ledger.find_kind(session_id, OwnerKind::BackgroundGuardian).is_some();
        if !guarded && self.generation_in_flight(claim).await {
            let guardian_claim = self.ledger.handover(claim, Owner::guardian(session_id))?;
            self.activation.clear_home_if(session_id, &claim.owner.id);
            info!(session_id = %session_id, tab_id = %claim.owner.id, "tab left mid-generation; guardian holds session");
            self.guardian.guard(guardian_claim);
            return Ok(false);
        }
        let idle = self.release_claim(claim);
        self.activation.clear_home_if(session_id, &claim.owner.id);
        Ok(idle)
    }

    fn release_claim(&self, claim: &Claim) -> bool {
        match self.ledger.release(claim) {
            Some(released) => {
                self.after_release(&released);
                released.key_idle
            }
            None => false,
        }
    }

    /// Local cleanup after a release. The close notification is fire and forget.
    fn after_release(&self, released: &Released) {
        if !released.key_idle {
            return;
        }
        self.router.forget_session(&released.session_id);
        if let Some(process) = &released.process {
            let close = self.backend.notify_closed(process.port, &released.session_id);
            let session_id = released.session_id.clone();
            tokio::spawn(async move {
                if let Err(error) = close.await {
                    debug!(session_id = %session_id, error = %format!("{error:#}"), "close notification failed");
                }
            });
        }
        info!(session_id = %released.session_id, key = %released.key, "session released; process idle");
    }

    async fn generation_in_flight(&self, claim: &Claim) -> bool {
        if let Some(phase) = self.router.phase(&claim.session_id) {
            return phase == GenerationPhase::Generating;
        }
        let probe = self.backend.generation_state(claim.process.port, &claim.session_id);
        match tokio::time::timeout(STATE_PROBE_TIMEOUT, probe).await {
            Ok(Ok(phase)) => phase == GenerationPhase::Generating,
            Ok(Err(error)) => {
                debug!(session_id = %claim.session_id, error = %format!("{error:#}"), "generation state unavailable");
                false
            }
            Err(_) => {
                debug!(session_id = %claim.session_id, "generation state probe timed out");
                false
            }
        }
    }

    async fn can_repurpose(&self, from_claim: &Claim, to: &SessionId) -> bool {
        let from = &from_claim.session_id;
        from_claim.key().session_id() == Some(from)
            && self.ledger.session_claim_count(from) == 1
            && !self.ledger.has_session(to)
            && !self.activation.contains(to)
            && !self.router.has_state(to)
            && !self.generation_in_flight(from_claim).await
    }

    /// Hand `from`'s process to `to`: rekey locally, then tell the runtime.
    /// A runtime that refuses gets the local state moved back.
    async fn repurpose(
        &self,
        guard: &SessionGuard,
        from_claim: &Claim,
        to: &SessionId,
    ) -> anyhow::Result<OpenOutcome> {
        let from = &from_claim.session_id;
        self.migrator.rekey_locked(guard, from, to)?;

        let port = from_claim.process.port;
        if let Err(error) = self.backend.switch_session(port, to).await {
            if let Err(rollback) = self.migrator.rekey_locked(guard, to, from) {
                warn!(from = %to, to = %from, error = %rollback, "could not restore session after failed switch");
            }
            return Err(error);
        }
        info!(from = %from, to = %to, port, "process repurposed for session switch");
        Ok(OpenOutcome::Opened { session_id: to.clone(), port, is_new: false })
    }

    // ── Scheduled tasks ─────────────────────────────────────────────

    pub fn create_task(&self, new: NewTask) -> Result<ScheduledTask, HubError> {
        if new.interval_minutes == 0 {
            return Err(HubError::InvalidRequest("interval_minutes must be at least 1".into()));
        }
        if new.prompt.trim().is_empty() {
            return Err(HubError::InvalidRequest("prompt must not be empty".into()));
        }
        let now = Utc::now();
        let task = ScheduledTask {
            id: Uuid::new_v4().to_string(),
            session_id: new.session_id.unwrap_or_else(SessionId::placeholder),
            tab_id: new.tab_id,
            workspace_path: new.workspace_path,
            interval_minutes: new.interval_minutes,
            prompt: new.prompt,
            status: TaskStatus::Idle,
            execution_count: 0,
            last_error: None,
            last_run_at: None,
            created_at: now,
            updated_at: now,
        };
        {
            let db = self.db();
            TaskStore::create(db.connection(), &task)?;
        }
        info!(task_id = %task.id, session_id = %task.session_id, interval_minutes = task.interval_minutes, "task created");
        Ok(task)
    }

    pub fn list_tasks(&self) -> Result<Vec<ScheduledTask>, HubError> {
        let db = self.db();
        Ok(TaskStore::list(db.connection())?)
    }

    fn task(&self, task_id: &str) -> Result<ScheduledTask, HubError> {
        let db = self.db();
        TaskStore::get(db.connection(), task_id)?.ok_or_else(|| HubError::UnknownTask(task_id.to_string()))
    }

    fn set_status(&self, task_id: &str, status: TaskStatus) -> Result<ScheduledTask, HubError> {
        {
            let db = self.db();
            TaskStore::update_status(db.connection(), task_id, status, Utc::now())?;
        }
        self.task(task_id)
    }

    /// Claim the task's session, then arm its timer.
    pub async fn start_task(&self, task_id: &str) -> Result<ScheduledTask, HubError> {
        let task = self.task(task_id)?;
        match task.status {
            TaskStatus::Running => return Ok(task),
            TaskStatus::Paused => return self.resume_task(task_id).await,
            TaskStatus::Idle | TaskStatus::Stopped => {}
        }
        self.claim_for_task(&task).await?;
        let task = self.set_status(task_id, TaskStatus::Running)?;
        self.scheduler.arm(&task.id, task.interval_minutes);
        info!(task_id, session_id = %task.session_id, "task started");
        Ok(task)
    }

    /// Stop firing but keep the claim, so the process stays warm.
    pub async fn pause_task(&self, task_id: &str) -> Result<ScheduledTask, HubError> {
        let task = self.task(task_id)?;
        match task.status {
            TaskStatus::Paused => Ok(task),
            TaskStatus::Running => {
                self.scheduler.disarm(task_id);
                let task = self.set_status(task_id, TaskStatus::Paused)?;
                info!(task_id, "task paused");
                Ok(task)
            }
            status => Err(HubError::InvalidRequest(format!(
                "task {task_id} is {} and cannot be paused",
                status.as_str()
            ))),
        }
    }

    pub async fn resume_task(&self, task_id: &str) -> Result<ScheduledTask, HubError> {
        let task = self.task(task_id)?;
        match task.status {
            TaskStatus::Running => Ok(task),
            TaskStatus::Paused => {
                self.claim_for_task(&task).await?;
                let task = self.set_status(task_id, TaskStatus::Running)?;
                self.scheduler.arm(&task.id, task.interval_minutes);
                info!(task_id, "task resumed");
                Ok(task)
            }
            status => Err(HubError::InvalidRequest(format!(
                "task {task_id} is {} and cannot be resumed",
                status.as_str()
            ))),
        }
    }

    /// Disarm, release the task's claim and clear its activation row.
    pub async fn stop_task(&self, task_id: &str) -> Result<ScheduledTask, HubError> {
        let task = self.task(task_id)?;
        self.scheduler.disarm(task_id);
        {
            let _lock = self.locks.lock(&task.session_id).await;
            self.clear_task_row(&task.session_id, task_id);
            let owner = Owner::scheduled_task(task_id);
            if let Some(claim) = self.ledger.find(&task.session_id, &owner) {
                // Nobody else is watching this session; don't leave its reply running.
                if self.ledger.session_claim_count(&task.session_id) == 1
                    && self.generation_in_flight(&claim).await
                {
                    let stop = self.backend.stop_generation(claim.process.port, &task.session_id);
                    let session_id = task.session_id.clone();
                    tokio::spawn(async move {
                        if let Err(error) = stop.await {
                            debug!(session_id = %session_id, error = %format!("{error:#}"), "stop request failed");
                        }
                    });
                }
                self.release_claim(&claim);
            }
        }
        let task = self.set_status(task_id, TaskStatus::Stopped)?;
        info!(task_id, session_id = %task.session_id, "task stopped");
        Ok(task)
    }

    async fn claim_for_task(&self, task: &ScheduledTask) -> Result<Claim, HubError> {
        let _lock = self.locks.lock(&task.session_id).await;
        let key = ProcessKey::session(task.workspace_path.clone(), task.session_id.clone());
        let claimed = self
            .ledger
            .claim(&task.session_id, Owner::scheduled_task(&task.id), key, ClaimPolicy::Reject)
            .await;
        match claimed {
            Ok(claim) => {
                self.activation.set_task(&task.session_id, &task.id, claim.process.port, claim.key().workspace());
                Ok(claim)
            }
            Err(error) => {
                let error = HubError::from(error);
                self.record_task_error(&task.id, &error.to_string());
                Err(error)
            }
        }
    }

    fn clear_task_row(&self, session_id: &SessionId, task_id: &str) {
        let owns_row = self
            .activation
            .lookup(session_id)
            .is_some_and(|row| row.task_owner.as_deref() == Some(task_id));
        if owns_row {
            self.activation.clear_task(session_id);
        }
    }

    fn record_task_error(&self, task_id: &str, message: &str) {
        let db = self.db();
        if let Err(error) = TaskStore::set_last_error(db.connection(), task_id, message, Utc::now()) {
            warn!(task_id, error = %format!("{error:#}"), "failed to record task error");
        }
    }

    /// Run one scheduled execution of `task_id`.
    pub async fn run_task_tick(&self, task_id: &str) -> Result<(), HubError> {
        let task = match self.task(task_id) {
            Ok(task) if task.status == TaskStatus::Running => task,
            Ok(_) | Err(HubError::UnknownTask(_)) => {
                self.scheduler.disarm(task_id);
                return Ok(());
            }
            Err(error) => return Err(error),
        };

        let Some(claim) = self.ledger.find(&task.session_id, &Owner::scheduled_task(&task.id)) else {
            warn!(task_id, session_id = %task.session_id, "tick for a task without a claim");
            self.record_task_error(task_id, "task holds no claim on its session");
            return Ok(());
        };
        if self.router.phase(&task.session_id) == Some(GenerationPhase::Generating) {
            debug!(task_id, "previous generation still running; skipping tick");
            return Ok(());
        }

        let started = self
            .backend
            .start_generation(claim.process.port, &task.session_id, &task.prompt)
            .await;
        let db = self.db();
        match started {
            Ok(()) => {
                TaskStore::record_execution(db.connection(), task_id, Utc::now())?;
                info!(task_id, session_id = %task.session_id, "task executed");
            }
            Err(error) => {
                let message = format!("{error:#}");
                warn!(task_id, error = %message, "task execution failed");
                TaskStore::set_last_error(db.connection(), task_id, &message, Utc::now())?;
            }
        }
        Ok(())
    }

    /// Drain scheduler ticks, running each execution as its own task.
    pub fn spawn_tick_loop(self: &Arc<Self>, mut ticks: TaskTicks) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(task_id) = ticks.recv().await {
                let hub = Arc::clone(&hub);
                tokio::spawn(async move {
                    if let Err(error) = hub.run_task_tick(&task_id).await {
                        warn!(task_id = %task_id, error = %error, "task tick failed");
                    }
                });
            }
        })
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    pub async fn run_recovery(&self) -> anyhow::Result<RecoveryReport> {
        RecoveryCoordinator::new(&self.store, &self.locks, &self.ledger, &self.activation, &self.scheduler)
            .run()
            .await
    }

    /// Re-probe live processes and replace the unhealthy ones that still have
    /// claims. Streams on a replaced process reconnect to the new one.
    pub async fn health_sweep(&self) -> usize {
        let unhealthy = self.registry.health_sweep().await;
        for (session_id, key) in self.ledger.session_keys() {
            if self.registry.state(&key) != Some(ProcessState::Unhealthy) {
                continue;
            }
            let _lock = self.locks.lock(&session_id).await;
            match self.ledger.refresh(&session_id).await {
                Ok(Some(process)) => {
                    self.activation.update_port(&session_id, process.port);
                    self.router.repoint(
                        &session_id,
                        StreamTarget {
                            session_id: session_id.clone(),
                            port: process.port,
                            backend_id: process.id,
                        },
                    );
                    info!(session_id = %session_id, port = process.port, "replaced unhealthy process");
                }
                Ok(None) => {}
                Err(error) => {
                    warn!(session_id = %session_id, error = %error, "could not replace unhealthy process");
                }
            }
        }
        unhealthy
    }

    pub fn status(&self) -> HubStatus {
        let processes = self
            .registry
            .snapshot()
            .into_iter()
            .map(|(handle, state)| ProcessSummary {
                key: handle.key.to_string(),
                workspace_path: handle.key.workspace().to_path_buf(),
                session_id: handle.key.session_id().cloned(),
                backend_id: handle.id.to_string(),
                port: handle.port,
                pid: handle.pid,
                state,
                claims: self.ledger.count(&handle.key),
            })
            .collect();
        HubStatus {
            processes,
            activations: self.activation.rows(),
            sessions: self.ledger.session_count(),
            claims: self.ledger.total_claims(),
            subscribers: self.router.subscriber_count(),
            guardians: self.guardian.active_count(),
            armed_tasks: self.scheduler.armed(),
            reserved_ports: self.registry.reserved_ports(),
        }
    }

    /// Stop timers and guardians, then terminate every process.
    pub async fn shutdown(&self) {
        info!("session hub shutting down");
        self.scheduler.shutdown();
        self.guardian.shutdown();
        self.registry.shutdown().await;
    }
}

fn target_of(claim: &Claim) -> StreamTarget {
    StreamTarget {
        session_id: claim.session_id.clone(),
        port: claim.process.port,
        backend_id: claim.process.id,
    }
}
