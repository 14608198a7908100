// The hub's HTTP collaborators against an in-process agent runtime.

use std::convert::Infallible;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use berth_common::protocol::events::RoutedEvent;
use berth_common::types::{OwnerKind, SessionId};
use berth_daemon::backend::{AgentBackend, HttpAgentBackend};
use berth_daemon::hub::{HubDeps, NewTask, OpenOutcome, SessionHub};
use berth_daemon::process::ports::PortAllocator;
use berth_daemon::process::probe::{HttpReadinessProbe, ReadinessProbe};
use berth_daemon::store::meta_db::MetaDb;
use berth_daemon::stream::connector::{HttpStreamConnector, StreamConnector, StreamTarget};
use berth_daemon::stream::router::StreamHandle;
use berth_daemon::testing::{fast_config, FakeProcessHost};
use futures_util::stream::{self, Stream};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use uuid::Uuid;

type Logged = (String, String, Value);

struct RuntimeState {
    log: Vec<Logged>,
    live: broadcast::Sender<Logged>,
    generating: bool,
    calls: Vec<(String, Value)>,
}

#[derive(Clone)]
struct FakeRuntime {
    state: Arc<Mutex<RuntimeState>>,
}

impl FakeRuntime {
    fn new() -> Self {
        let (live, _) = broadcast::channel(64);
        Self {
            state: Arc::new(Mutex::new(RuntimeState {
                log: Vec::new(),
                live,
                generating: false,
                calls: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RuntimeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, name: &str, data: Value) -> String {
        let mut state = self.lock();
        let id = (state.log.len() + 1).to_string();
        match name {
            "status" => state.generating = data["state"] == "generating",
            "complete" | "stopped" | "error" => state.generating = false,
            _ => {}
        }
        let event = (id.clone(), name.to_string(), data);
        state.log.push(event.clone());
        let _ = state.live.send(event);
        id
    }

    fn calls_to(&self, path: &str) -> Vec<Value> {
        self.lock().calls.iter().filter(|(p, _)| p == path).map(|(_, body)| body.clone()).collect()
    }

    async fn serve(self) -> u16 {
        let app = Router::new()
            .route("/health", get(|| async { StatusCode::OK }))
            .route("/api/session/state", get(session_state))
            .route("/api/session/events", get(session_events))
            .route("/api/generation/start", post(generation_start))
            .route("/api/generation/stop", post(record))
            .route("/api/session/switch", post(record))
            .route("/api/session/close", post(record))
            .with_state(self);
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("runtime listener should bind");
        let port = listener.local_addr().expect("listener should expose address").port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("fake runtime should serve");
        });
        port
    }
}

#[derive(Deserialize)]
struct SessionQuery {
    session_id: String,
}

async fn session_state(State(runtime): State<FakeRuntime>) -> Json<Value> {
    Json(json!({ "generating": runtime.lock().generating }))
}

async fn record(State(runtime): State<FakeRuntime>, uri: Uri, Json(body): Json<Value>) -> StatusCode {
    runtime.lock().calls.push((uri.path().to_string(), body));
    StatusCode::OK
}

async fn generation_start(
    State(runtime): State<FakeRuntime>,
    uri: Uri,
    Json(body): Json<Value>,
) -> StatusCode {
    runtime.lock().calls.push((uri.path().to_string(), body));
    runtime.emit("status", json!({ "state": "generating" }));
    StatusCode::ACCEPTED
}

fn to_sse((id, name, data): Logged) -> Result<Event, Infallible> {
    Ok(Event::default().id(id).event(name).data(data.to_string()))
}

async fn session_events(
    State(runtime): State<FakeRuntime>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let last = headers.get("last-event-id").and_then(|v| v.to_str().ok()).map(str::to_string);
    let (init, replay, live) = {
        let state = runtime.lock();
        let start = last
            .and_then(|last| state.log.iter().position(|(id, _, _)| *id == last))
            .map_or(state.log.len(), |position| position + 1);
        let init = Event::default()
            .event("init")
            .data(json!({ "session_id": query.session_id, "generating": state.generating }).to_string());
        (init, state.log[start..].to_vec(), state.live.subscribe())
    };

    let live = stream::unfold(live, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => return Some((event, rx)),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    let events = stream::once(async { Ok(init) })
        .chain(stream::iter(replay).map(to_sse))
        .chain(live.map(to_sse));
    Sse::new(events).keep_alive(KeepAlive::default())
}

async fn next(handle: &mut StreamHandle) -> RoutedEvent {
    tokio::time::timeout(Duration::from_secs(5), handle.recv())
        .await
        .expect("event should arrive in time")
        .expect("stream should stay open")
}

async fn eventually(mut check: impl FnMut() -> bool, what: &str) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn probe_reports_listening_runtime_as_ready() {
    let port = FakeRuntime::new().serve().await;
    let probe = HttpReadinessProbe::new("/health");
    assert!(probe.probe(port).await);

    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let closed_port = closed.local_addr().unwrap().port();
    drop(closed);
    assert!(!probe.probe(closed_port).await);
}

#[tokio::test]
async fn connector_parses_events_and_resumes_after_last_id() {
    let runtime = FakeRuntime::new();
    let port = runtime.clone().serve().await;
    let target =
        StreamTarget { session_id: SessionId::from("s1"), port, backend_id: Uuid::new_v4() };
    let connector = HttpStreamConnector::new();

    let mut events = connector.connect(&target, None).await.expect("stream should open");
    let init = events.next().await.unwrap().unwrap();
    assert_eq!(init.event_name, "init");
    assert_eq!(init.payload["session_id"], "s1");

    let first = runtime.emit("delta", json!({ "text": "he" }));
    runtime.emit("delta", json!({ "text": "llo" }));
    let delta = events.next().await.unwrap().unwrap();
    assert_eq!(delta.id.as_deref(), Some(first.as_str()));
    assert_eq!(delta.payload, json!({ "text": "he" }));
    drop(events);

    let mut resumed = connector.connect(&target, Some(&first)).await.expect("stream should reopen");
    assert_eq!(resumed.next().await.unwrap().unwrap().event_name, "init");
    let replayed = resumed.next().await.unwrap().unwrap();
    assert_eq!(replayed.payload, json!({ "text": "llo" }));
}

#[tokio::test]
async fn backend_control_calls_reach_the_runtime() {
    let runtime = FakeRuntime::new();
    let port = runtime.clone().serve().await;
    let backend = HttpAgentBackend::new();
    let session = SessionId::from("s1");

    backend.start_generation(port, &session, "summarize").await.unwrap();
    assert_eq!(
        runtime.calls_to("/api/generation/start"),
        vec![json!({ "session_id": "s1", "prompt": "summarize" })]
    );
    assert_eq!(
        backend.generation_state(port, &session).await.unwrap(),
        berth_common::protocol::events::GenerationPhase::Generating
    );

    backend.switch_session(port, &SessionId::from("s2")).await.unwrap();
    assert_eq!(runtime.calls_to("/api/session/switch"), vec![json!({ "session_id": "s2" })]);
}

#[tokio::test]
async fn hub_drives_a_runtime_end_to_end() {
    let runtime = FakeRuntime::new();
    let port = runtime.clone().serve().await;

    let config = fast_config();
    let host = Arc::new(FakeProcessHost::new());
    let (hub, _ticks) = SessionHub::new(HubDeps {
        probe: Arc::new(HttpReadinessProbe::new(config.runtime.health_path.clone())),
        config,
        host: host.clone(),
        ports: Some(PortAllocator::new(port, 1).without_bind_check()),
        connector: Arc::new(HttpStreamConnector::new()),
        backend: Arc::new(HttpAgentBackend::new()),
        db: MetaDb::open_in_memory().unwrap(),
    });
    let s1 = SessionId::from("s1");

    let opened = hub.open_session(Path::new("/work"), Some(s1.clone()), "t1").await.unwrap();
    assert_eq!(opened, OpenOutcome::Opened { session_id: s1.clone(), port, is_new: true });

    let mut tab = hub.subscribe_events(&s1, "t1").await.unwrap();
    assert_eq!(next(&mut tab).await.event_name, "init");
    runtime.emit("delta", json!({ "text": "ready" }));
    assert_eq!(next(&mut tab).await.payload, json!({ "text": "ready" }));

    let task = hub
        .create_task(NewTask {
            session_id: Some(s1.clone()),
            tab_id: None,
            workspace_path: "/work".into(),
            interval_minutes: 30,
            prompt: "check CI".into(),
        })
        .unwrap();
    hub.start_task(&task.id).await.unwrap();
    hub.run_task_tick(&task.id).await.unwrap();
    assert_eq!(
        runtime.calls_to("/api/generation/start"),
        vec![json!({ "session_id": "s1", "prompt": "check CI" })]
    );
    let status = next(&mut tab).await;
    assert_eq!(status.payload, json!({ "state": "generating" }));

    runtime.emit("complete", json!({}));
    assert_eq!(next(&mut tab).await.event_name, "complete");
    assert_eq!(hub.list_tasks().unwrap()[0].execution_count, 1);

    assert!(!hub.release_session(&s1, OwnerKind::Tab, "t1").await.unwrap());
    hub.stop_task(&task.id).await.unwrap();
    eventually(|| !runtime.calls_to("/api/session/close").is_empty(), "close notification").await;
    assert_eq!(runtime.calls_to("/api/session/close"), vec![json!({ "session_id": "s1" })]);
    eventually(|| host.alive_pids().is_empty(), "process teardown").await;
    assert_eq!(host.spawned(), 1);

    hub.shutdown().await;
}
