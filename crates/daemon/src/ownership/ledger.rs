// Ownership ledger: reference-counted claims on sessions.
//
// A process lives exactly as long as at least one claim resolves to its key.
// The ledger is the only caller of `ProcessRegistry::acquire`/`release`, and it
// detaches an owner's event stream before removing that owner's claim.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use berth_common::types::{Owner, OwnerKind, SessionId};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::process::registry::{ProcessRegistry, SpawnError};
use crate::process::{ProcessHandle, ProcessKey};
use crate::stream::router::EventStreamRouter;

/// What to do when a second tab claims a session that already has one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimPolicy {
    /// Refuse with `SingletonConflict` so the caller can redirect.
    Reject,
    /// Drop the existing tab claim (its owner is known to be gone).
    Supersede,
}

/// A registered claim as seen by its holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub id: u64,
    pub session_id: SessionId,
    pub owner: Owner,
    pub process: ProcessHandle,
    /// The claim started or joined a spawn rather than reusing a live process.
    pub spawned: bool,
}

impl Claim {
    pub fn key(&self) -> &ProcessKey {
        &self.process.key
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("session {session_id} is already held by tab {holder}")]
    SingletonConflict { session_id: SessionId, holder: String },
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error("session {session_id} is bound to {existing}, not {requested}")]
    WorkspaceMismatch { session_id: SessionId, existing: String, requested: String },
    #[error("claim {0} is not registered")]
    UnknownClaim(u64),
}

/// What removing one claim did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Released {
    pub session_id: SessionId,
    pub owner: Owner,
    pub key: ProcessKey,
    pub process: Option<ProcessHandle>,
    /// The key's claim count reached zero and teardown was signalled.
    pub key_idle: bool,
    /// No claims remain on the session.
    pub session_empty: bool,
}

struct ClaimRecord {
    id: u64,
    owner: Owner,
    /// Registered but still waiting on the registry.
    pending: bool,
}

struct SessionEntry {
    key: ProcessKey,
    process: Option<ProcessHandle>,
    claims: Vec<ClaimRecord>,
}

impl SessionEntry {
    fn tab_holder(&self, except: &Owner) -> Option<&ClaimRecord> {
        self.claims.iter().find(|c| c.owner.kind == OwnerKind::Tab && &c.owner != except)
    }

    fn claim(&self, record: &ClaimRecord, session_id: &SessionId) -> Option<Claim> {
        Some(Claim {
            id: record.id,
            session_id: session_id.clone(),
            owner: record.owner.clone(),
            process: self.process.clone()?,
            spawned: false,
        })
    }
}

#[derive(Default)]
struct LedgerState {
    sessions: HashMap<SessionId, SessionEntry>,
    key_counts: HashMap<ProcessKey, usize>,
    index: HashMap<u64, SessionId>,
}

struct LedgerInner {
    registry: Arc<ProcessRegistry>,
    router: EventStreamRouter,
    state: Mutex<LedgerState>,
    next_id: AtomicU64,
}

#[derive(Clone)]
pub struct OwnershipLedger {
    inner: Arc<LedgerInner>,
}

/// Releases a claim whose `claim` call was dropped before the registry answered.
struct PendingClaim<'a> {
    ledger: &'a OwnershipLedger,
    claim_id: u64,
    armed: bool,
}

impl Drop for PendingClaim<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!(claim_id = self.claim_id, "claim cancelled mid-spawn; releasing");
            self.ledger.release_id(self.claim_id);
        }
    }
}

impl OwnershipLedger {
    pub fn new(registry: Arc<ProcessRegistry>, router: EventStreamRouter) -> Self {
        Self {
            inner: Arc::new(LedgerInner {
                registry,
                router,
                state: Mutex::new(LedgerState::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.inner.registry
    }

    /// Register `owner` on `session_id` and return a ready process for `key`.
    ///
    /// Claiming twice as the same owner returns the existing claim. On any
    /// failure the claim registered here is removed again.
    pub async fn claim(
        &self,
        session_id: &SessionId,
        owner: Owner,
        key: ProcessKey,
        policy: ClaimPolicy,
    ) -> Result<Claim, LedgerError> {
        let (claim_id, key) = {
            let mut guard = self.lock();
            let state = &mut *guard;

            let mut superseded = None;
            if let Some(entry) = state.sessions.get(session_id) {
                if entry.key != key {
                    return Err(LedgerError::WorkspaceMismatch {
                        session_id: session_id.clone(),
                        existing: entry.key.to_string(),
                        requested: key.to_string(),
                    });
                }
                if let Some(existing) =
                    entry.claims.iter().find(|c| c.owner == owner && !c.pending)
                {
                    if let Some(claim) = entry.claim(existing, session_id) {
                        return Ok(claim);
                    }
                }
                if owner.kind == OwnerKind::Tab {
                    if let Some(holder) = entry.tab_holder(&owner) {
                        match policy {
                            ClaimPolicy::Reject => {
                                return Err(LedgerError::SingletonConflict {
                                    session_id: session_id.clone(),
                                    holder: holder.owner.id.clone(),
                                });
                            }
                            ClaimPolicy::Supersede => superseded = Some(holder.id),
                        }
                    }
                }
            }

            let claim_id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            let entry = state.sessions.entry(session_id.clone()).or_insert_with(|| SessionEntry {
                key: key.clone(),
                process: None,
                claims: Vec::new(),
            });
            entry.claims.push(ClaimRecord { id: claim_id, owner: owner.clone(), pending: true });
            *state.key_counts.entry(key.clone()).or_insert(0) += 1;
            state.index.insert(claim_id, session_id.clone());

            // Added before removing the superseded claim so the count never touches zero.
            if let Some(old) = superseded {
                info!(session_id = %session_id, owner = %owner, "superseding stale tab claim");
                self.remove_locked(state, old);
            }
            debug_assert_single_tab(state, session_id);
            (claim_id, key)
        };

        let mut pending = PendingClaim { ledger: self, claim_id, armed: true };
        let acquired = self.inner.registry.acquire(&key).await;
        pending.armed = false;

        let acquired = match acquired {
            Ok(acquired) => acquired,
            Err(error) => {
                self.release_id(claim_id);
                return Err(LedgerError::Spawn(error));
            }
        };

        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(current_session) = state.index.get(&claim_id).cloned() else {
            // Removed while waiting; make sure the acquire's demand is not leaked.
            if state.key_counts.get(&key).copied().unwrap_or(0) == 0 {
                self.inner.registry.release(&key);
            }
            return Err(LedgerError::UnknownClaim(claim_id));
        };
        let Some(entry) = state.sessions.get_mut(&current_session) else {
            return Err(LedgerError::UnknownClaim(claim_id));
        };
        if let Some(record) = entry.claims.iter_mut().find(|c| c.id == claim_id) {
            record.pending = false;
        }
        entry.process = Some(acquired.handle.clone());
        debug!(
            session_id = %current_session,
            owner = %owner,
            port = acquired.handle.port,
            spawned = acquired.spawned,
            "claim registered"
        );

        Ok(Claim {
            id: claim_id,
            session_id: current_session,
            owner,
            process: acquired.handle,
            spawned: acquired.spawned,
        })
    }

    /// Remove a claim. The owner's stream is detached first; a key whose count
    /// reaches zero is handed to the registry for idle teardown.
    pub fn release(&self, claim: &Claim) -> Option<Released> {
        self.release_id(claim.id)
    }

    pub fn release_owner(&self, session_id: &SessionId, owner: &Owner) -> Option<Released> {
        let claim_id = {
            let state = self.lock();
            let entry = state.sessions.get(session_id)?;
            entry.claims.iter().find(|c| &c.owner == owner)?.id
        };
        self.release_id(claim_id)
    }

    pub(crate) fn release_id(&self, claim_id: u64) -> Option<Released> {
        let mut guard = self.lock();
        self.remove_locked(&mut guard, claim_id)
    }

    fn remove_locked(&self, state: &mut LedgerState, claim_id: u64) -> Option<Released> {
        let session_id = state.index.remove(&claim_id)?;
        let entry = state.sessions.get_mut(&session_id)?;
        let position = entry.claims.iter().position(|c| c.id == claim_id)?;
        let owner = entry.claims[position].owner.clone();

        self.inner.router.detach_owner(&session_id, &owner);
        entry.claims.remove(position);

        let key = entry.key.clone();
        let process = entry.process.clone();
        let session_empty = entry.claims.is_empty();
        if session_empty {
            state.sessions.remove(&session_id);
        }

        let remaining = match state.key_counts.get_mut(&key) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => {
                error!(key = %key, "claim count missing for key");
                0
            }
        };
        let key_idle = remaining == 0;
        if key_idle {
            state.key_counts.remove(&key);
            self.inner.registry.release(&key);
        }
        debug!(session_id = %session_id, owner = %owner, remaining, "claim released");

        Some(Released { session_id, owner, key, process, key_idle, session_empty })
    }

    /// Atomically replace `claim`'s owner with `to`. The session's claim count
    /// never drops to zero in between.
    pub fn handover(&self, claim: &Claim, to: Owner) -> Result<Claim, LedgerError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let session_id =
            state.index.get(&claim.id).cloned().ok_or(LedgerError::UnknownClaim(claim.id))?;
        let entry = state
            .sessions
            .get_mut(&session_id)
            .ok_or(LedgerError::UnknownClaim(claim.id))?;

        if to.kind == OwnerKind::Tab {
            if let Some(holder) =
                entry.claims.iter().find(|c| c.owner.kind == OwnerKind::Tab && c.owner != to && c.id != claim.id)
            {
                return Err(LedgerError::SingletonConflict {
                    session_id,
                    holder: holder.owner.id.clone(),
                });
            }
        }

        let from = claim.owner.clone();
        self.inner.router.detach_owner(&session_id, &from);

        if let Some(existing) = entry.claims.iter().find(|c| c.owner == to && !c.pending) {
            // `to` already holds a claim; the handover just drops `from`.
            let merged = entry.claim(existing, &session_id).ok_or(LedgerError::UnknownClaim(claim.id))?;
            self.remove_locked(state, claim.id);
            return Ok(merged);
        }

        let record = entry
            .claims
            .iter_mut()
            .find(|c| c.id == claim.id)
            .ok_or(LedgerError::UnknownClaim(claim.id))?;
        let new_id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        record.id = new_id;
        record.owner = to.clone();
        let process = entry.process.clone().ok_or(LedgerError::UnknownClaim(claim.id))?;
        state.index.remove(&claim.id);
        state.index.insert(new_id, session_id.clone());
        debug_assert_single_tab(state, &session_id);
        info!(session_id = %session_id, from = %from, to = %to, "claim handed over");

        Ok(Claim { id: new_id, session_id, owner: to, process, spawned: false })
    }

    /// Re-acquire the process behind `session_id`, replacing it if the
    /// registry marked it unhealthy. Returns the handle when it changed.
    pub async fn refresh(&self, session_id: &SessionId) -> Result<Option<ProcessHandle>, LedgerError> {
        let (key, previous) = {
            let state = self.lock();
            let Some(entry) = state.sessions.get(session_id) else {
                return Ok(None);
            };
            (entry.key.clone(), entry.process.as_ref().map(|p| p.id))
        };

        let acquired = self.inner.registry.acquire(&key).await?;

        let mut state = self.lock();
        match state.sessions.get_mut(session_id) {
            Some(entry) if entry.key == key => {
                entry.process = Some(acquired.handle.clone());
                let changed = previous != Some(acquired.handle.id);
                Ok(changed.then_some(acquired.handle))
            }
            _ => {
                if state.key_counts.get(&key).copied().unwrap_or(0) == 0 {
                    self.inner.registry.release(&key);
                }
                Ok(None)
            }
        }
    }

    // ── Rekey support (used by the migrator under both session locks) ──

    /// Key currently bound to `old`, if it has claims. Fails if `new` has any.
    pub(crate) fn check_rekey(
        &self,
        old: &SessionId,
        new: &SessionId,
    ) -> Result<Option<ProcessKey>, &'static str> {
        let state = self.lock();
        if state.sessions.contains_key(new) {
            return Err("target session already has claims");
        }
        Ok(state.sessions.get(old).map(|entry| entry.key.clone()))
    }

    pub(crate) fn apply_rekey(
        &self,
        old: &SessionId,
        new: &SessionId,
        new_key: &ProcessKey,
        moved: Option<ProcessHandle>,
    ) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(mut entry) = state.sessions.remove(old) else {
            return;
        };

        if &entry.key != new_key {
            let moved_count = entry.claims.len();
            if let Some(count) = state.key_counts.get_mut(&entry.key) {
                *count = count.saturating_sub(moved_count);
                if *count == 0 {
                    state.key_counts.remove(&entry.key);
                }
            }
            *state.key_counts.entry(new_key.clone()).or_insert(0) += moved_count;
            entry.key = new_key.clone();
        }
        match moved {
            Some(handle) => entry.process = Some(handle),
            None => {
                if let Some(process) = entry.process.as_mut() {
                    process.key = new_key.clone();
                }
            }
        }
        for record in &entry.claims {
            state.index.insert(record.id, new.clone());
        }
        state.sessions.insert(new.clone(), entry);
    }

    // ── Observers ──────────────────────────────────────────────────

    /// Claims currently resolving to `key`.
    pub fn count(&self, key: &ProcessKey) -> usize {
        self.lock().key_counts.get(key).copied().unwrap_or(0)
    }

    pub fn session_claim_count(&self, session_id: &SessionId) -> usize {
        self.lock().sessions.get(session_id).map_or(0, |entry| entry.claims.len())
    }

    pub fn has_session(&self, session_id: &SessionId) -> bool {
        self.lock().sessions.contains_key(session_id)
    }

    pub fn claims(&self, session_id: &SessionId) -> Vec<Claim> {
        let state = self.lock();
        let Some(entry) = state.sessions.get(session_id) else {
            return Vec::new();
        };
        entry
            .claims
            .iter()
            .filter(|c| !c.pending)
            .filter_map(|c| entry.claim(c, session_id))
            .collect()
    }

    pub fn find(&self, session_id: &SessionId, owner: &Owner) -> Option<Claim> {
        let state = self.lock();
        let entry = state.sessions.get(session_id)?;
        let record = entry.claims.iter().find(|c| &c.owner == owner && !c.pending)?;
        entry.claim(record, session_id)
    }

    pub fn find_kind(&self, session_id: &SessionId, kind: OwnerKind) -> Option<Claim> {
        let state = self.lock();
        let entry = state.sessions.get(session_id)?;
        let record = entry.claims.iter().find(|c| c.owner.kind == kind && !c.pending)?;
        entry.claim(record, session_id)
    }

    /// Tab id holding the session, if any.
    pub fn tab_owner(&self, session_id: &SessionId) -> Option<String> {
        let state = self.lock();
        let entry = state.sessions.get(session_id)?;
        entry
            .claims
            .iter()
            .find(|c| c.owner.kind == OwnerKind::Tab)
            .map(|c| c.owner.id.clone())
    }

    pub fn session_key(&self, session_id: &SessionId) -> Option<ProcessKey> {
        self.lock().sessions.get(session_id).map(|entry| entry.key.clone())
    }

    pub fn session_of(&self, claim_id: u64) -> Option<SessionId> {
        self.lock().index.get(&claim_id).cloned()
    }

    /// Sessions `owner` currently holds, sorted.
    pub fn sessions_of(&self, owner: &Owner) -> Vec<SessionId> {
        let state = self.lock();
        let mut sessions: Vec<SessionId> = state
            .sessions
            .iter()
            .filter(|(_, entry)| entry.claims.iter().any(|c| &c.owner == owner))
            .map(|(id, _)| id.clone())
            .collect();
        sessions.sort();
        sessions
    }

    /// Every session with claims and the key it resolves to.
    pub fn session_keys(&self) -> Vec<(SessionId, ProcessKey)> {
        let state = self.lock();
        let mut keys: Vec<_> =
            state.sessions.iter().map(|(id, entry)| (id.clone(), entry.key.clone())).collect();
        keys.sort_by(|a, b| a.0.cmp(&b.0));
        keys
    }

    pub fn total_claims(&self) -> usize {
        self.lock().index.len()
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }
}

fn debug_assert_single_tab(state: &LedgerState, session_id: &SessionId) {
    let Some(entry) = state.sessions.get(session_id) else {
        return;
    };
    let mut tabs = entry.claims.iter().filter(|c| c.owner.kind == OwnerKind::Tab);
    let Some(first) = tabs.next() else {
        return;
    };
    let single = tabs.all(|c| c.owner == first.owner);
    if !single {
        error!(session_id = %session_id, "more than one tab owns a session");
    }
    debug_assert!(single, "session {session_id} has claims from two tabs");
}
