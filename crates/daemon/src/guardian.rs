// Background completion guardian: holds a session's process after its last
// interactive owner leaves mid-generation, until the reply finishes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use berth_common::protocol::events::{EventKind, GenerationPhase};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::AgentBackend;
use crate::ownership::ledger::{Claim, OwnershipLedger};
use crate::ownership::locks::SessionLocks;
use crate::stream::connector::StreamTarget;
use crate::stream::router::EventStreamRouter;

/// Why a guardian stopped watching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GuardEnd {
    Completed,
    AlreadyIdle,
    Disconnected,
    MaxHold,
}

pub struct BackgroundCompletionGuardian {
    ledger: OwnershipLedger,
    router: EventStreamRouter,
    locks: SessionLocks,
    backend: Arc<dyn AgentBackend>,
    max_hold: Duration,
    watchers: Mutex<HashMap<u64, JoinHandle<()>>>,
}

impl BackgroundCompletionGuardian {
    pub fn new(
        ledger: OwnershipLedger,
        router: EventStreamRouter,
        locks: SessionLocks,
        backend: Arc<dyn AgentBackend>,
        max_hold: Duration,
    ) -> Arc<Self> {
        Arc::new(Self { ledger, router, locks, backend, max_hold, watchers: Mutex::new(HashMap::new()) })
    }

    fn watchers(&self) -> MutexGuard<'_, HashMap<u64, JoinHandle<()>>> {
        self.watchers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Watch a guardian claim (already handed over by the caller) and release
    /// it once the in-flight generation ends.
    pub fn guard(self: &Arc<Self>, claim: Claim) {
        let mut watchers = self.watchers();
        let claim_id = claim.id;
        let guardian = Arc::clone(self);
        let task = tokio::spawn(async move {
            let end = guardian.watch(&claim).await;
            guardian.finish(&claim, end).await;
            guardian.watchers().remove(&claim.id);
        });
        watchers.insert(claim_id, task);
    }

    async fn watch(&self, claim: &Claim) -> GuardEnd {
        let target = StreamTarget {
            session_id: claim.session_id.clone(),
            port: claim.process.port,
            backend_id: claim.process.id,
        };
        let mut stream = self.router.attach(claim.owner.clone(), target);
        info!(session_id = %claim.session_id, port = claim.process.port, "guarding in-flight generation");

        let watched = async {
            while let Some(event) = stream.recv().await {
                match event.kind() {
                    kind if kind.is_terminal() => return GuardEnd::Completed,
                    EventKind::Init if event.generation_phase() == Some(GenerationPhase::Idle) => {
                        return GuardEnd::AlreadyIdle;
                    }
                    EventKind::Disconnected => return GuardEnd::Disconnected,
                    _ => {}
                }
            }
            GuardEnd::Disconnected
        };
        tokio::time::timeout(self.max_hold, watched).await.unwrap_or(GuardEnd::MaxHold)
    }

    async fn finish(&self, claim: &Claim, end: GuardEnd) {
        // The session may have been rekeyed while we watched.
        let Some(session_id) = self.ledger.session_of(claim.id) else {
            return;
        };
        let _lock = self.locks.lock(&session_id).await;
        let Some(released) = self.ledger.release_id(claim.id) else {
            return;
        };
        match end {
            GuardEnd::MaxHold => warn!(
                session_id = %released.session_id,
                hold_secs = self.max_hold.as_secs(),
                "generation outlived the guardian hold; releasing"
            ),
            _ => info!(session_id = %released.session_id, reason = ?end, "guardian released session"),
        }

        if released.key_idle {
            self.router.forget_session(&released.session_id);
            if let Some(process) = released.process {
                let close = self.backend.notify_closed(process.port, &released.session_id);
                let session_id = released.session_id.clone();
                tokio::spawn(async move {
                    if let Err(error) = close.await {
                        debug!(session_id = %session_id, error = %format!("{error:#}"), "close notification failed");
                    }
                });
            }
        }
    }

    /// Watchers still holding a claim.
    pub fn active_count(&self) -> usize {
        self.watchers().values().filter(|task| !task.is_finished()).count()
    }

    /// Abort every watcher. Their claims are left for the registry shutdown.
    pub fn shutdown(&self) {
        for (_, task) in self.watchers().drain() {
            task.abort();
        }
    }
}
