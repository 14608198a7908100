// Session identity migration: move a placeholder session to its confirmed id
// across the ledger, the activation table, the router and the registry.
//
// Every check runs before anything is applied, under both session locks, so a
// rekey either moves all state or leaves all of it where it was.

use std::sync::Arc;

use berth_common::types::SessionId;
use thiserror::Error;
use tracing::{info, warn};

use crate::activation::SessionActivationTable;
use crate::ownership::ledger::OwnershipLedger;
use crate::ownership::locks::{SessionGuard, SessionLocks};
use crate::process::registry::{ProcessRegistry, RekeyError};
use crate::stream::router::EventStreamRouter;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MigrationError {
    /// `new` already has independent state; the caller should adopt it.
    #[error("cannot rekey {old} to {new}: {reason}")]
    Conflict { old: SessionId, new: SessionId, reason: &'static str },
    #[error("session {0} has no state to migrate")]
    NotFound(SessionId),
    /// The process behind `old` is still starting or stopping.
    #[error("process for session {0} is not live")]
    NotReady(SessionId),
}

pub struct SessionIdentityMigrator {
    locks: SessionLocks,
    ledger: OwnershipLedger,
    activation: Arc<SessionActivationTable>,
    router: EventStreamRouter,
    registry: Arc<ProcessRegistry>,
}

impl SessionIdentityMigrator {
    pub fn new(
        locks: SessionLocks,
        ledger: OwnershipLedger,
        activation: Arc<SessionActivationTable>,
        router: EventStreamRouter,
    ) -> Self {
        let registry = Arc::clone(ledger.registry());
        Self { locks, ledger, activation, router, registry }
    }

    pub async fn rekey(&self, old: &SessionId, new: &SessionId) -> bool {
        match self.try_rekey(old, new).await {
            Ok(()) => true,
            Err(error) => {
                warn!(from = %old, to = %new, error = %error, "session rekey refused");
                false
            }
        }
    }

    pub async fn try_rekey(&self, old: &SessionId, new: &SessionId) -> Result<(), MigrationError> {
        if old == new {
            return Ok(());
        }
        let guard = self.locks.lock_pair(old, new).await;
        self.rekey_locked(&guard, old, new)
    }

    /// Rekey with both session locks already held by the caller.
    pub(crate) fn rekey_locked(
        &self,
        guard: &SessionGuard,
        old: &SessionId,
        new: &SessionId,
    ) -> Result<(), MigrationError> {
        debug_assert!(guard.covers(old) && guard.covers(new), "rekey without both session locks");
        let conflict = |reason| MigrationError::Conflict { old: old.clone(), new: new.clone(), reason };

        let old_key = self.ledger.check_rekey(old, new).map_err(conflict)?;
        if self.activation.contains(new) {
            return Err(conflict("target session is already active"));
        }
        if self.router.has_state(new) {
            return Err(conflict("target session already has event streams"));
        }
        if old_key.is_none() && !self.activation.contains(old) && !self.router.has_state(old) {
            return Err(MigrationError::NotFound(old.clone()));
        }

        let keys = old_key.map(|old_key| {
            let new_key = old_key.rekeyed(new);
            (old_key, new_key)
        });
        let registry_error = |error| match error {
            RekeyError::Occupied(_) => conflict("target process key is already in use"),
            RekeyError::NotLive(_) => MigrationError::NotReady(old.clone()),
        };
        if let Some((old_key, new_key)) = &keys {
            self.registry.check_rekey(old_key, new_key).map_err(registry_error)?;
        }

        // Apply. The registry is the only step that can still refuse, so it goes first.
        if let Some((old_key, new_key)) = &keys {
            let moved = self.registry.rekey(old_key, new_key).map_err(registry_error)?;
            self.ledger.apply_rekey(old, new, new_key, moved);
        }
        self.activation.rekey(old, new);
        self.router.rekey(old, new);

        info!(from = %old, to = %new, "session rekeyed");
        Ok(())
    }
}
