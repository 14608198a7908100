// Session activation table and the ordered launch decision.
//
// The table mirrors the home (tab) and task owners recorded in the ledger so
// an "open this session" flow can decide what to do before claiming anything.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use berth_common::types::{Activation, SessionId};

/// What an open or switch request should do, decided in this order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchDecision {
    /// Another reachable tab already holds the session; focus it.
    FocusExisting { tab_id: String },
    /// A scheduled task keeps a process alive and no tab is home; attach to it.
    AttachToTask { task_id: String, port: u16, workspace_path: PathBuf },
    /// The caller's current session is held by a task; leave it alone and
    /// claim the target fresh.
    OpenFresh { busy_session: SessionId },
    Normal,
}

#[derive(Default)]
pub struct SessionActivationTable {
    rows: Mutex<HashMap<SessionId, Activation>>,
}

impl SessionActivationTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, Activation>> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn lookup(&self, session_id: &SessionId) -> Option<Activation> {
        self.lock().get(session_id).cloned()
    }

    pub fn set_home(&self, session_id: &SessionId, tab_id: &str, port: u16, workspace_path: &Path) {
        let mut rows = self.lock();
        let row = row_for(&mut rows, session_id, port, workspace_path);
        row.home_owner = Some(tab_id.to_string());
    }

    pub fn set_task(&self, session_id: &SessionId, task_id: &str, port: u16, workspace_path: &Path) {
        let mut rows = self.lock();
        let row = row_for(&mut rows, session_id, port, workspace_path);
        row.task_owner = Some(task_id.to_string());
    }

    pub fn clear_home(&self, session_id: &SessionId) {
        self.clear(session_id, |row| row.home_owner = None);
    }

    /// Clear the home owner only if it is still `tab_id`.
    pub fn clear_home_if(&self, session_id: &SessionId, tab_id: &str) {
        self.clear(session_id, |row| {
            if row.home_owner.as_deref() == Some(tab_id) {
                row.home_owner = None;
            }
        });
    }

    pub fn clear_task(&self, session_id: &SessionId) {
        self.clear(session_id, |row| row.task_owner = None);
    }

    fn clear(&self, session_id: &SessionId, apply: impl FnOnce(&mut Activation)) {
        let mut rows = self.lock();
        let Some(row) = rows.get_mut(session_id) else {
            return;
        };
        apply(row);
        if row.is_empty() {
            rows.remove(session_id);
        }
    }

    /// Point the row at a replacement process.
    pub fn update_port(&self, session_id: &SessionId, port: u16) {
        if let Some(row) = self.lock().get_mut(session_id) {
            row.port = port;
        }
    }

    pub(crate) fn contains(&self, session_id: &SessionId) -> bool {
        self.lock().contains_key(session_id)
    }

    /// Move `old`'s row to `new`. The caller has checked `new` is free.
    pub(crate) fn rekey(&self, old: &SessionId, new: &SessionId) {
        let mut rows = self.lock();
        if let Some(mut row) = rows.remove(old) {
            row.session_id = new.clone();
            rows.insert(new.clone(), row);
        }
    }

    /// All rows, ordered by session id.
    pub fn rows(&self) -> Vec<Activation> {
        let mut rows: Vec<Activation> = self.lock().values().cloned().collect();
        rows.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        rows
    }

    /// The launch decision for `caller_tab` opening `target` while showing
    /// `current`. `is_reachable` reports whether a home tab is still alive;
    /// an unreachable home is treated as absent.
    pub fn decide(
        &self,
        target: &SessionId,
        caller_tab: &str,
        current: Option<&SessionId>,
        is_reachable: impl Fn(&str) -> bool,
    ) -> LaunchDecision {
        let rows = self.lock();

        if let Some(row) = rows.get(target) {
            if let Some(home) = row.home_owner.as_deref() {
                if home != caller_tab && is_reachable(home) {
                    return LaunchDecision::FocusExisting { tab_id: home.to_string() };
                }
            }
            let homeless = row.home_owner.as_deref().is_none_or(|home| home == caller_tab || !is_reachable(home));
            if let (true, Some(task)) = (homeless, row.task_owner.as_deref()) {
                return LaunchDecision::AttachToTask {
                    task_id: task.to_string(),
                    port: row.port,
                    workspace_path: row.workspace_path.clone(),
                };
            }
        }

        if let Some(current) = current.filter(|current| *current != target) {
            if rows.get(current).is_some_and(|row| row.task_owner.is_some()) {
                return LaunchDecision::OpenFresh { busy_session: current.clone() };
            }
        }

        LaunchDecision::Normal
    }
}

fn row_for<'a>(
    rows: &'a mut HashMap<SessionId, Activation>,
    session_id: &SessionId,
    port: u16,
    workspace_path: &Path,
) -> &'a mut Activation {
    let row = rows.entry(session_id.clone()).or_insert_with(|| Activation {
        session_id: session_id.clone(),
        home_owner: None,
        task_owner: None,
        port,
        workspace_path: workspace_path.to_path_buf(),
    });
    row.port = port;
    row
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(id: &str) -> SessionId {
        SessionId::from(id)
    }

    fn reachable(_: &str) -> bool {
        true
    }

    #[test]
    fn rows_disappear_when_both_owners_clear() {
        let table = SessionActivationTable::new();
        table.set_home(&sid("s1"), "t1", 31_415, Path::new("/w"));
        table.set_task(&sid("s1"), "r1", 31_415, Path::new("/w"));

        table.clear_home(&sid("s1"));
        let row = table.lookup(&sid("s1")).unwrap();
        assert_eq!(row.home_owner, None);
        assert_eq!(row.task_owner.as_deref(), Some("r1"));

        table.clear_task(&sid("s1"));
        assert_eq!(table.lookup(&sid("s1")), None);
    }

    #[test]
    fn clear_home_if_ignores_other_tabs() {
        let table = SessionActivationTable::new();
        table.set_home(&sid("s1"), "t2", 1, Path::new("/w"));
        table.clear_home_if(&sid("s1"), "t1");
        assert_eq!(table.lookup(&sid("s1")).unwrap().home_owner.as_deref(), Some("t2"));
    }

    #[test]
    fn open_elsewhere_wins_over_task_reuse() {
        let table = SessionActivationTable::new();
        table.set_home(&sid("s1"), "t1", 1, Path::new("/w"));
        table.set_task(&sid("s1"), "r1", 1, Path::new("/w"));

        let decision = table.decide(&sid("s1"), "t2", None, reachable);
        assert_eq!(decision, LaunchDecision::FocusExisting { tab_id: "t1".into() });
    }

    #[test]
    fn unreachable_home_falls_through_to_task_reuse() {
        let table = SessionActivationTable::new();
        table.set_home(&sid("s1"), "t1", 7, Path::new("/w"));
        table.set_task(&sid("s1"), "r1", 7, Path::new("/w"));

        let decision = table.decide(&sid("s1"), "t2", None, |_| false);
        assert_eq!(
            decision,
            LaunchDecision::AttachToTask { task_id: "r1".into(), port: 7, workspace_path: "/w".into() }
        );
    }

    #[test]
    fn task_reuse_is_checked_before_current_task_conflict() {
        let table = SessionActivationTable::new();
        table.set_task(&sid("target"), "r1", 7, Path::new("/w"));
        table.set_task(&sid("current"), "r2", 8, Path::new("/w"));

        let decision = table.decide(&sid("target"), "t1", Some(&sid("current")), reachable);
        assert!(matches!(decision, LaunchDecision::AttachToTask { ref task_id, .. } if task_id == "r1"));
    }

    #[test]
    fn busy_current_session_forces_fresh_claim() {
        let table = SessionActivationTable::new();
        table.set_home(&sid("current"), "t1", 8, Path::new("/w"));
        table.set_task(&sid("current"), "r2", 8, Path::new("/w"));

        let decision = table.decide(&sid("target"), "t1", Some(&sid("current")), reachable);
        assert_eq!(decision, LaunchDecision::OpenFresh { busy_session: sid("current") });
    }

    #[test]
    fn reopening_own_session_is_normal() {
        let table = SessionActivationTable::new();
        table.set_home(&sid("s1"), "t1", 1, Path::new("/w"));
        assert_eq!(table.decide(&sid("s1"), "t1", Some(&sid("s1")), reachable), LaunchDecision::Normal);
        assert_eq!(table.decide(&sid("s2"), "t1", None, reachable), LaunchDecision::Normal);
    }

    #[test]
    fn rekey_moves_the_row() {
        let table = SessionActivationTable::new();
        table.set_home(&sid("pending-1"), "t1", 1, Path::new("/w"));
        table.rekey(&sid("pending-1"), &sid("s1"));
        assert!(!table.contains(&sid("pending-1")));
        assert_eq!(table.lookup(&sid("s1")).unwrap().session_id, sid("s1"));
    }
}
