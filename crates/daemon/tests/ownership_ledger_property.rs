use std::path::Path;

use berth_common::types::{Owner, OwnerKind, ProcessState, SessionId};
use berth_daemon::hub::NewTask;
use berth_daemon::process::ProcessKey;
use berth_daemon::testing::TestHub;
use futures_util::future::join_all;
use proptest::prelude::*;

const WS: &str = "/work";
const SESSIONS: [&str; 3] = ["s0", "s1", "s2"];

#[derive(Debug, Clone)]
enum Op {
    Open { session: usize, tab: usize },
    Close { session: usize, tab: usize },
    StartTask { task: usize },
    StopTask { task: usize },
    Rekey { from: usize, to: usize },
}

fn op() -> impl Strategy<Value = Op> {
    let session = 0..SESSIONS.len();
    prop_oneof![
        3 => (session.clone(), 0..3usize).prop_map(|(session, tab)| Op::Open { session, tab }),
        3 => (session.clone(), 0..3usize).prop_map(|(session, tab)| Op::Close { session, tab }),
        2 => session.clone().prop_map(|task| Op::StartTask { task }),
        2 => session.clone().prop_map(|task| Op::StopTask { task }),
        2 => (session.clone(), session).prop_map(|(from, to)| Op::Rekey { from, to }),
    ]
}

fn session(index: usize) -> SessionId {
    SessionId::from(SESSIONS[index])
}

fn key(session: &SessionId) -> ProcessKey {
    ProcessKey::session(WS, session.clone())
}

async fn apply(t: &TestHub, tasks: &[String], op: &Op) {
    // Conflicts, redirects and missing claims are expected outcomes here.
    match *op {
        Op::Open { session: s, tab } => {
            let _ = t.hub.open_session(Path::new(WS), Some(session(s)), &format!("t{tab}")).await;
        }
        Op::Close { session: s, tab } => {
            let _ = t.hub.release_session(&session(s), OwnerKind::Tab, &format!("t{tab}")).await;
        }
        Op::StartTask { task } => {
            let _ = t.hub.start_task(&tasks[task]).await;
        }
        Op::StopTask { task } => {
            let _ = t.hub.stop_task(&tasks[task]).await;
        }
        Op::Rekey { from, to } => {
            let _ = t.hub.rekey_session(&session(from), &session(to)).await;
        }
    }
}

fn check_invariants(t: &TestHub) -> Result<(), TestCaseError> {
    let ledger = t.hub.ledger();
    for (session_id, process_key) in ledger.session_keys() {
        let claims = ledger.claims(&session_id);
        let tabs = claims.iter().filter(|c| c.owner.kind == OwnerKind::Tab).count();
        prop_assert!(tabs <= 1, "session {} has {} tab claims", session_id, tabs);

        // A rekey either moved everything or nothing: no claim sits under a
        // session whose process is still keyed by another id.
        prop_assert_eq!(process_key.session_id(), Some(&session_id));
        prop_assert!(claims.iter().all(|c| c.key() == &process_key), "claims of {} disagree on key", session_id);

        prop_assert_eq!(ledger.count(&process_key), claims.len());
        prop_assert_eq!(t.hub.registry().state(&process_key), Some(ProcessState::Healthy));

        let row = t.hub.get_session_activation(&session_id);
        let home = row.and_then(|row| row.home_owner);
        prop_assert_eq!(home, ledger.tab_owner(&session_id));
    }

    for row in t.hub.activation().rows() {
        prop_assert!(ledger.has_session(&row.session_id), "orphaned activation row {}", row.session_id);
        if let Some(task_id) = &row.task_owner {
            prop_assert!(ledger.find(&row.session_id, &Owner::scheduled_task(task_id)).is_some());
        }
    }
    Ok(())
}

/// After idle teardown has run out, a process exists exactly for keys with claims.
fn check_processes_match_claims(t: &TestHub) -> Result<(), TestCaseError> {
    for index in 0..SESSIONS.len() {
        let process_key = key(&session(index));
        let claimed = t.hub.ledger().count(&process_key) > 0;
        let present = t.hub.registry().state(&process_key).is_some();
        prop_assert_eq!(present, claimed, "key {} present={} claimed={}", process_key, present, claimed);
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn concurrent_batches_keep_claims_processes_and_rows_consistent(
        batches in prop::collection::vec(prop::collection::vec(op(), 1..5), 1..10)
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .expect("runtime should build");

        runtime.block_on(async {
            let t = TestHub::new().expect("hub should build");
            let mut tasks = Vec::new();
            for index in 0..SESSIONS.len() {
                let task = t
                    .hub
                    .create_task(NewTask {
                        session_id: Some(session(index)),
                        tab_id: None,
                        workspace_path: WS.into(),
                        interval_minutes: 5,
                        prompt: format!("check {index}"),
                    })
                    .expect("task should be created");
                tasks.push(task.id);
            }

            for batch in &batches {
                join_all(batch.iter().map(|op| apply(&t, &tasks, op))).await;
                check_invariants(&t)?;
                t.settle().await;
                check_processes_match_claims(&t)?;
            }

            for task in &tasks {
                let _ = t.hub.stop_task(task).await;
            }
            for (session_id, _) in t.hub.ledger().session_keys() {
                for claim in t.hub.ledger().claims(&session_id) {
                    let _ = t.hub.release_session(&session_id, claim.owner.kind, &claim.owner.id).await;
                }
            }
            t.settle().await;
            check_processes_match_claims(&t)?;
            prop_assert_eq!(t.hub.ledger().total_claims(), 0);
            prop_assert!(t.hub.activation().rows().is_empty());
            prop_assert!(t.host.alive_pids().is_empty());
            Ok(())
        })?;
    }
}
