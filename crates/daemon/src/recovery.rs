// Startup recovery: rebuild claims, activation rows and timers from the
// scheduled tasks that were running or paused before shutdown.

use std::sync::{Mutex, PoisonError};

use anyhow::Result;
use berth_common::types::{Owner, ScheduledTask, TaskStatus};
use chrono::Utc;
use futures_util::future::join_all;
use tracing::{error, info, warn};

use crate::activation::SessionActivationTable;
use crate::error::HubError;
use crate::ownership::ledger::{ClaimPolicy, OwnershipLedger};
use crate::ownership::locks::SessionLocks;
use crate::process::ProcessKey;
use crate::scheduler::TaskScheduler;
use crate::store::meta_db::MetaDb;
use crate::store::tasks::TaskStore;

/// Outcome of one recovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub total: usize,
    pub recovered: usize,
    /// `(task_id, error)` for every task that could not be recovered.
    pub failures: Vec<(String, String)>,
}

impl RecoveryReport {
    pub fn summary(&self) -> String {
        format!("{} of {} recurring tasks recovered", self.recovered, self.total)
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn into_result(self) -> Result<Self, HubError> {
        if self.is_complete() {
            return Ok(self);
        }
        Err(HubError::RecoveryPartialFailure {
            recovered: self.recovered,
            total: self.total,
            failed: self.failures.into_iter().map(|(id, _)| id).collect(),
        })
    }
}

pub struct RecoveryCoordinator<'a> {
    store: &'a Mutex<MetaDb>,
    locks: &'a SessionLocks,
    ledger: &'a OwnershipLedger,
    activation: &'a SessionActivationTable,
    scheduler: &'a TaskScheduler,
}

impl<'a> RecoveryCoordinator<'a> {
    pub fn new(
        store: &'a Mutex<MetaDb>,
        locks: &'a SessionLocks,
        ledger: &'a OwnershipLedger,
        activation: &'a SessionActivationTable,
        scheduler: &'a TaskScheduler,
    ) -> Self {
        Self { store, locks, ledger, activation, scheduler }
    }

    /// Recover every `running`/`paused` task. One task failing never stops
    /// the others; failed tasks are stopped with their error recorded.
    pub async fn run(&self) -> Result<RecoveryReport> {
        let tasks = {
            let db = self.store.lock().unwrap_or_else(PoisonError::into_inner);
            TaskStore::list_recoverable(db.connection())?
        };
        if tasks.is_empty() {
            return Ok(RecoveryReport::default());
        }
        info!(count = tasks.len(), "recovering scheduled tasks");

        let outcomes = join_all(tasks.iter().map(|task| self.recover(task))).await;

        let mut report = RecoveryReport { total: tasks.len(), ..RecoveryReport::default() };
        for (task, outcome) in tasks.iter().zip(outcomes) {
            match outcome {
                Ok(()) => report.recovered += 1,
                Err(failure) => {
                    let message = failure.to_string();
                    warn!(task_id = %task.id, session_id = %task.session_id, error = %message, "task recovery failed");
                    self.mark_failed(task, &message);
                    report.failures.push((task.id.clone(), message));
                }
            }
        }
        info!(recovered = report.recovered, total = report.total, "{}", report.summary());
        Ok(report)
    }

    async fn recover(&self, task: &ScheduledTask) -> Result<(), HubError> {
        let _lock = self.locks.lock(&task.session_id).await;
        let key = ProcessKey::session(task.workspace_path.clone(), task.session_id.clone());
        let claim = self
            .ledger
            .claim(&task.session_id, Owner::scheduled_task(&task.id), key, ClaimPolicy::Reject)
            .await?;
        self.activation.set_task(&task.session_id, &task.id, claim.process.port, &task.workspace_path);

        // The process is live before the timer can fire against it.
        if task.status == TaskStatus::Running {
            self.scheduler.arm(&task.id, task.interval_minutes);
        }
        info!(task_id = %task.id, session_id = %task.session_id, port = claim.process.port, status = task.status.as_str(), "task recovered");
        Ok(())
    }

    fn mark_failed(&self, task: &ScheduledTask, message: &str) {
        let db = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Utc::now();
        let stored = TaskStore::set_last_error(db.connection(), &task.id, message, now)
            .and_then(|_| TaskStore::update_status(db.connection(), &task.id, TaskStatus::Stopped, now));
        if let Err(store_error) = stored {
            error!(task_id = %task.id, error = %format!("{store_error:#}"), "failed to record recovery failure");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use berth_common::types::SessionId;

    use super::*;
    use crate::testing::TestRig;

    fn task(id: &str, session: &str, workspace: &str, status: TaskStatus) -> ScheduledTask {
        let now = Utc::now();
        ScheduledTask {
            id: id.into(),
            session_id: SessionId::from(session),
            tab_id: None,
            workspace_path: PathBuf::from(workspace),
            interval_minutes: 10,
            prompt: "summarize".into(),
            status,
            execution_count: 0,
            last_error: None,
            last_run_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn one_failure_does_not_block_the_rest() {
        let rig = TestRig::new();
        let db = MetaDb::open_in_memory().unwrap();
        TaskStore::create(db.connection(), &task("a", "s1", "/w1", TaskStatus::Running)).unwrap();
        // Same session in another workspace cannot share the process.
        TaskStore::create(db.connection(), &task("b", "s1", "/w2", TaskStatus::Running)).unwrap();
        TaskStore::create(db.connection(), &task("c", "s2", "/w1", TaskStatus::Paused)).unwrap();
        TaskStore::create(db.connection(), &task("d", "s3", "/w1", TaskStatus::Stopped)).unwrap();
        let store = Mutex::new(db);
        let locks = SessionLocks::new();
        let activation = SessionActivationTable::new();
        let (scheduler, _ticks) = TaskScheduler::new();

        let report = RecoveryCoordinator::new(&store, &locks, &rig.ledger, &activation, &scheduler)
            .run()
            .await
            .unwrap();

        assert_eq!(report.total, 3);
        assert_eq!(report.recovered, 2);
        assert_eq!(report.summary(), "2 of 3 recurring tasks recovered");
        assert_eq!(report.failures.len(), 1);
        let failed_id = report.failures[0].0.clone();

        assert!(scheduler.is_armed(if failed_id == "a" { "b" } else { "a" }));
        assert!(!scheduler.is_armed("c"), "paused tasks hold a claim but do not fire");
        assert_eq!(activation.lookup(&SessionId::from("s2")).unwrap().task_owner.as_deref(), Some("c"));
        assert_eq!(rig.host.spawned(), 2);

        let db = store.lock().unwrap();
        let failed = TaskStore::get(db.connection(), &failed_id).unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Stopped);
        assert!(failed.last_error.is_some());

        assert!(matches!(
            report.into_result(),
            Err(HubError::RecoveryPartialFailure { recovered: 2, total: 3, .. })
        ));
    }
}
