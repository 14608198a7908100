// Per-session async locks. Operations on one session serialize; different
// sessions never block each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use berth_common::types::SessionId;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockTable = HashMap<SessionId, Arc<AsyncMutex<()>>>;

#[derive(Clone, Default)]
pub struct SessionLocks {
    table: Arc<Mutex<LockTable>>,
}

/// Held locks for one or two sessions. Unused table entries are pruned on drop.
pub struct SessionGuard {
    table: Arc<Mutex<LockTable>>,
    ids: Vec<SessionId>,
    guards: Vec<OwnedMutexGuard<()>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, id: &SessionId) -> Arc<AsyncMutex<()>> {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(table.entry(id.clone()).or_default())
    }

    pub async fn lock(&self, id: &SessionId) -> SessionGuard {
        let guard = self.entry(id).lock_owned().await;
        SessionGuard { table: Arc::clone(&self.table), ids: vec![id.clone()], guards: vec![guard] }
    }

    /// Lock two sessions in a global order so concurrent pair-locks cannot
    /// deadlock. Locking the same id twice takes it once.
    pub async fn lock_pair(&self, a: &SessionId, b: &SessionId) -> SessionGuard {
        if a == b {
            return self.lock(a).await;
        }
        let (first, second) = if a < b { (a, b) } else { (b, a) };
        let first_guard = self.entry(first).lock_owned().await;
        let second_guard = self.entry(second).lock_owned().await;
        SessionGuard {
            table: Arc::clone(&self.table),
            ids: vec![first.clone(), second.clone()],
            guards: vec![first_guard, second_guard],
        }
    }

    /// Number of sessions with a live lock entry.
    pub fn tracked(&self) -> usize {
        self.table.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl SessionGuard {
    pub fn covers(&self, id: &SessionId) -> bool {
        self.ids.contains(id)
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.guards.clear();
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        for id in &self.ids {
            if table.get(id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
                table.remove(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn same_session_serializes() {
        let locks = SessionLocks::new();
        let id = SessionId::from("s1");
        let guard = locks.lock(&id).await;

        let contender = {
            let locks = locks.clone();
            let id = id.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(&id).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn different_sessions_do_not_block() {
        let locks = SessionLocks::new();
        let _a = locks.lock(&SessionId::from("a")).await;
        let b = tokio::time::timeout(Duration::from_millis(50), locks.lock(&SessionId::from("b")))
            .await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn opposite_pair_orders_do_not_deadlock() {
        let locks = SessionLocks::new();
        let a = SessionId::from("a");
        let b = SessionId::from("b");

        let tasks = (0..16).map(|i| {
            let locks = locks.clone();
            let (x, y) = if i % 2 == 0 { (a.clone(), b.clone()) } else { (b.clone(), a.clone()) };
            tokio::spawn(async move {
                let guard = locks.lock_pair(&x, &y).await;
                assert!(guard.covers(&x) && guard.covers(&y));
                tokio::task::yield_now().await;
            })
        });
        let joined = tokio::time::timeout(Duration::from_secs(5), futures_util::future::join_all(tasks))
            .await
            .expect("pair locks should not deadlock");
        assert!(joined.into_iter().all(|r| r.is_ok()));
    }

    #[tokio::test]
    async fn entries_are_pruned_after_release() {
        let locks = SessionLocks::new();
        {
            let _guard = locks.lock_pair(&SessionId::from("a"), &SessionId::from("b")).await;
            assert_eq!(locks.tracked(), 2);
        }
        assert_eq!(locks.tracked(), 0);

        let same = locks.lock_pair(&SessionId::from("a"), &SessionId::from("a")).await;
        assert!(same.covers(&SessionId::from("a")));
    }
}
