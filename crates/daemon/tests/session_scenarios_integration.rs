use std::path::{Path, PathBuf};
use std::time::Duration;

use berth_common::protocol::events::EVENT_COMPLETE;
use berth_common::types::{Owner, OwnerKind, ScheduledTask, SessionId, TaskStatus};
use berth_daemon::hub::OpenOutcome;
use berth_daemon::ownership::ledger::ClaimPolicy;
use berth_daemon::process::ProcessKey;
use berth_daemon::store::meta_db::MetaDb;
use berth_daemon::store::tasks::TaskStore;
use berth_daemon::testing::{TestHub, TestRig};
use chrono::Utc;
use serde_json::json;

const WORKSPACE: &str = "/work";

fn port_of(outcome: &OpenOutcome) -> u16 {
    match outcome {
        OpenOutcome::Opened { port, .. } => *port,
        other => panic!("expected an opened session, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn closing_a_generating_tab_hands_the_process_to_the_guardian() {
    let t = TestHub::new().expect("hub should build");
    let s = SessionId::from("S");

    let opened = t.hub.open_session(Path::new(WORKSPACE), Some(s.clone()), "T").await.unwrap();
    let port = port_of(&opened);
    assert_eq!(t.host.spawned(), 1);
    assert_eq!(t.hub.get_session_activation(&s).unwrap().home_owner.as_deref(), Some("T"));

    t.backend.set_generating(port, true);
    let stopped = t.hub.release_session(&s, OwnerKind::Tab, "T").await.unwrap();
    assert!(!stopped, "the guardian keeps the process alive");

    let claims = t.hub.ledger().claims(&s);
    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0].owner, Owner::guardian(&s));
    assert!(t.hub.get_session_activation(&s).map_or(true, |row| row.home_owner.is_none()));
    assert_eq!(t.host.alive_pids().len(), 1);

    // Let the guardian's stream connect before the reply finishes.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(t.host.alive_pids().len(), 1, "still generating");

    t.backend.emit(port, EVENT_COMPLETE, json!({ "session_id": "S" }));
    t.settle().await;

    assert!(!t.hub.ledger().has_session(&s));
    assert!(t.host.alive_pids().is_empty());
    assert_eq!(t.backend.closed_sessions(), vec![s]);
}

#[tokio::test(start_paused = true)]
async fn recovered_task_process_is_shared_with_a_later_tab() {
    let db = MetaDb::open_in_memory().unwrap();
    let now = Utc::now();
    TaskStore::create(
        db.connection(),
        &ScheduledTask {
            id: "R".into(),
            session_id: SessionId::from("S2"),
            tab_id: None,
            workspace_path: PathBuf::from(WORKSPACE),
            interval_minutes: 15,
            prompt: "triage new issues".into(),
            status: TaskStatus::Running,
            execution_count: 4,
            last_error: None,
            last_run_at: None,
            created_at: now,
            updated_at: now,
        },
    )
    .unwrap();

    let t = TestHub::with_store(db).unwrap();
    let s2 = SessionId::from("S2");
    let report = t.hub.run_recovery().await.unwrap();
    assert_eq!((report.recovered, report.total), (1, 1));
    assert!(t.hub.scheduler().is_armed("R"));
    assert_eq!(t.host.spawned(), 1);

    let row = t.hub.get_session_activation(&s2).unwrap();
    assert_eq!(row.task_owner.as_deref(), Some("R"));
    assert_eq!(row.home_owner, None);

    let opened = t.hub.open_session(Path::new(WORKSPACE), Some(s2.clone()), "T").await.unwrap();
    assert_eq!(opened, OpenOutcome::Opened { session_id: s2.clone(), port: row.port, is_new: false });
    assert_eq!(t.host.spawned(), 1, "the tab attaches to the recovered process");

    let row = t.hub.get_session_activation(&s2).unwrap();
    assert_eq!(row.home_owner.as_deref(), Some("T"));
    assert_eq!(row.task_owner.as_deref(), Some("R"));
    assert_eq!(t.hub.ledger().session_claim_count(&s2), 2);
}

#[tokio::test(start_paused = true)]
async fn simultaneous_opens_elect_one_home_tab() {
    let t = TestHub::new().unwrap();
    let s3 = SessionId::from("S3");

    let (a, b) = tokio::join!(
        t.hub.open_session(Path::new(WORKSPACE), Some(s3.clone()), "A"),
        t.hub.open_session(Path::new(WORKSPACE), Some(s3.clone()), "B"),
    );
    let outcomes = [a.unwrap(), b.unwrap()];

    let winners: Vec<_> = outcomes.iter().filter(|o| matches!(o, OpenOutcome::Opened { .. })).collect();
    assert_eq!(winners.len(), 1, "exactly one tab wins: {outcomes:?}");
    let home = t.hub.ledger().tab_owner(&s3).expect("winner holds the tab claim");

    let redirected: Vec<_> = outcomes
        .iter()
        .filter_map(|o| match o {
            OpenOutcome::Redirect { tab_id, .. } => Some(tab_id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(redirected, vec![home.clone()]);
    assert_eq!(t.hub.get_session_activation(&s3).unwrap().home_owner, Some(home));
    assert_eq!(t.host.spawned(), 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_claims_on_one_key_spawn_once() {
    let rig = TestRig::new();
    let s = SessionId::from("S");
    let key = ProcessKey::session(WORKSPACE, s.clone());

    let claims = futures_util::future::join_all((0..8).map(|n| {
        rig.ledger.claim(&s, Owner::scheduled_task(format!("r{n}")), key.clone(), ClaimPolicy::Reject)
    }))
    .await;

    let claims: Vec<_> = claims.into_iter().map(|c| c.expect("claim should succeed")).collect();
    assert_eq!(rig.host.spawned(), 1);
    assert_eq!(rig.ledger.count(&key), 8);
    let port = claims[0].process.port;
    assert!(claims.iter().all(|c| c.process.port == port));
}

#[tokio::test(start_paused = true)]
async fn slow_startup_failure_releases_every_waiter() {
    let rig = TestRig::new();
    rig.probe.set_ready(false);
    let s = SessionId::from("S");
    let key = ProcessKey::session(WORKSPACE, s.clone());

    let (a, b) = tokio::join!(
        rig.ledger.claim(&s, Owner::tab("A"), key.clone(), ClaimPolicy::Reject),
        rig.ledger.claim(&s, Owner::scheduled_task("R"), key.clone(), ClaimPolicy::Reject),
    );
    assert!(a.is_err() && b.is_err());
    assert_eq!(rig.ledger.count(&key), 0);
    assert!(!rig.ledger.has_session(&s));

    rig.settle().await;
    assert!(rig.host.alive_pids().is_empty(), "the unready process is terminated");
    assert!(rig.registry.reserved_ports().is_empty());
}
