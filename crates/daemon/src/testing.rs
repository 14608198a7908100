// In-memory collaborators for tests: process host, readiness probe, and an
// agent runtime that serves both control calls and event streams.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use berth_common::protocol::events::{
    GenerationPhase, RoutedEvent, EVENT_INIT, EVENT_STATUS, EVENT_STOPPED,
};
use berth_common::types::SessionId;
use futures_util::future::BoxFuture;
use futures_util::stream;
use futures_util::{FutureExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};

use crate::backend::AgentBackend;
use crate::config::{BerthConfig, RuntimeConfig, StreamConfig};
use crate::hub::{HubDeps, SessionHub};
use crate::ownership::ledger::OwnershipLedger;
use crate::process::host::{LaunchSpec, ProcessHost, Signal};
use crate::process::ports::PortAllocator;
use crate::process::probe::ReadinessProbe;
use crate::process::registry::ProcessRegistry;
use crate::scheduler::TaskTicks;
use crate::store::meta_db::MetaDb;
use crate::stream::backoff::ReconnectPolicy;
use crate::stream::connector::{EventStream, StreamConnector, StreamError, StreamTarget};
use crate::stream::router::EventStreamRouter;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Process host ────────────────────────────────────────────────────

struct FakeProcess {
    exit: watch::Sender<Option<Option<i32>>>,
    signals: Vec<Signal>,
}

struct HostState {
    next_pid: u32,
    processes: HashMap<u32, FakeProcess>,
    launches: Vec<LaunchSpec>,
    exit_on_spawn: Option<i32>,
    fail_spawn: bool,
    ignore_term: bool,
    ignore_kill: bool,
}

/// Processes that live in a map. Signals end them unless told to ignore them.
pub struct FakeProcessHost {
    state: Mutex<HostState>,
}

impl Default for FakeProcessHost {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeProcessHost {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HostState {
                next_pid: 1000,
                processes: HashMap::new(),
                launches: Vec::new(),
                exit_on_spawn: None,
                fail_spawn: false,
                ignore_term: false,
                ignore_kill: false,
            }),
        }
    }

    pub fn spawned(&self) -> usize {
        lock(&self.state).launches.len()
    }

    pub fn launches(&self) -> Vec<LaunchSpec> {
        lock(&self.state).launches.clone()
    }

    pub fn alive_pids(&self) -> Vec<u32> {
        let state = lock(&self.state);
        let mut pids: Vec<u32> = state
            .processes
            .iter()
            .filter(|(_, process)| process.exit.borrow().is_none())
            .map(|(pid, _)| *pid)
            .collect();
        pids.sort_unstable();
        pids
    }

    /// New processes exit immediately with `code`.
    pub fn set_exit_on_spawn(&self, code: Option<i32>) {
        lock(&self.state).exit_on_spawn = code;
    }

    pub fn set_fail_spawn(&self, fail: bool) {
        lock(&self.state).fail_spawn = fail;
    }

    pub fn set_ignore_term(&self, ignore: bool) {
        lock(&self.state).ignore_term = ignore;
    }

    pub fn set_ignore_kill(&self, ignore: bool) {
        lock(&self.state).ignore_kill = ignore;
    }

    pub fn crash(&self, pid: u32, code: i32) {
        if let Some(process) = lock(&self.state).processes.get(&pid) {
            process.exit.send_replace(Some(Some(code)));
        }
    }

    pub fn signals(&self, pid: u32) -> Vec<Signal> {
        lock(&self.state).processes.get(&pid).map(|p| p.signals.clone()).unwrap_or_default()
    }
}

impl ProcessHost for FakeProcessHost {
    fn spawn_process(&self, spec: &LaunchSpec) -> Result<u32> {
        let mut state = lock(&self.state);
        if state.fail_spawn {
            bail!("no such command `{}`", spec.command);
        }
        let pid = state.next_pid;
        state.next_pid += 1;
        let initial = state.exit_on_spawn.map(Some);
        let (exit, _) = watch::channel(initial);
        state.processes.insert(pid, FakeProcess { exit, signals: Vec::new() });
        state.launches.push(spec.clone());
        Ok(pid)
    }

    fn send_signal(&self, pid: u32, signal: Signal) -> Result<()> {
        let mut state = lock(&self.state);
        let ignored = match signal {
            Signal::Term => state.ignore_term,
            Signal::Kill => state.ignore_kill,
        };
        let process = state.processes.get_mut(&pid).ok_or_else(|| anyhow!("no process {pid}"))?;
        process.signals.push(signal);
        if !ignored && process.exit.borrow().is_none() {
            process.exit.send_replace(Some(None));
        }
        Ok(())
    }

    fn wait_exit(&self, pid: u32) -> BoxFuture<'static, Option<i32>> {
        let watch = lock(&self.state).processes.get(&pid).map(|p| p.exit.subscribe());
        async move {
            let mut rx = watch?;
            let state = rx.wait_for(Option::is_some).await.ok()?;
            (*state).flatten()
        }
        .boxed()
    }

    fn is_alive(&self, pid: u32) -> bool {
        lock(&self.state).processes.get(&pid).is_some_and(|p| p.exit.borrow().is_none())
    }
}

// ── Readiness ───────────────────────────────────────────────────────

/// Probe whose answer and per-probe latency are set by the test.
pub struct ScriptedReadiness {
    ready: AtomicBool,
    delay: Mutex<Duration>,
    probes: AtomicUsize,
}

impl ScriptedReadiness {
    fn with(ready: bool, delay: Duration) -> Self {
        Self { ready: AtomicBool::new(ready), delay: Mutex::new(delay), probes: AtomicUsize::new(0) }
    }

    pub fn ready() -> Self {
        Self::with(true, Duration::ZERO)
    }

    pub fn never_ready() -> Self {
        Self::with(false, Duration::ZERO)
    }

    /// Ready, but every probe takes `delay`.
    pub fn ready_after(delay: Duration) -> Self {
        Self::with(true, delay)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = delay;
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

impl ReadinessProbe for ScriptedReadiness {
    fn probe(&self, _port: u16) -> BoxFuture<'static, bool> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.delay);
        let ready = self.ready.load(Ordering::SeqCst);
        async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            ready
        }
        .boxed()
    }
}

// ── Agent runtime ───────────────────────────────────────────────────

/// A control call received by [`FakeBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    GenerationState { port: u16, session_id: SessionId },
    Stop { port: u16, session_id: SessionId },
    Switch { port: u16, to: SessionId },
    Start { port: u16, session_id: SessionId, prompt: String },
    Closed { port: u16, session_id: SessionId },
}

type LiveSender = mpsc::UnboundedSender<Result<RoutedEvent, StreamError>>;

#[derive(Default)]
struct PortState {
    log: Vec<RoutedEvent>,
    generating: bool,
    live: Vec<LiveSender>,
    connects: Vec<Option<String>>,
}

#[derive(Default)]
struct BackendState {
    ports: HashMap<u16, PortState>,
    next_event: u64,
    fail_connects: u32,
    replay_overlap: usize,
    fail_generation: Option<String>,
    state_delay: Option<Duration>,
    calls: Vec<BackendCall>,
}

impl BackendState {
    fn emit(&mut self, port: u16, name: &str, payload: Value) -> String {
        self.next_event += 1;
        let id = format!("e{}", self.next_event);
        let event = RoutedEvent::new(Some(id.clone()), name, payload);
        let entry = self.ports.entry(port).or_default();
        match event.generation_phase() {
            Some(GenerationPhase::Generating) => entry.generating = true,
            Some(GenerationPhase::Idle) => entry.generating = false,
            None => {}
        }
        entry.live.retain(|tx| tx.send(Ok(event.clone())).is_ok());
        entry.log.push(event);
        id
    }
}

/// Agent runtime stand-in keyed by port. Streams replay `init` plus the
/// events after `Last-Event-ID`, optionally overlapping already-seen ones.
#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<BackendState>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish an event on `port`; returns its id.
    pub fn emit(&self, port: u16, name: &str, payload: Value) -> String {
        lock(&self.state).emit(port, name, payload)
    }

    /// End every open stream on `port` as if the connection dropped.
    pub fn drop_streams(&self, port: u16) {
        if let Some(entry) = lock(&self.state).ports.get_mut(&port) {
            entry.live.clear();
        }
    }

    pub fn set_generating(&self, port: u16, generating: bool) {
        lock(&self.state).ports.entry(port).or_default().generating = generating;
    }

    pub fn fail_next_connects(&self, count: u32) {
        lock(&self.state).fail_connects = count;
    }

    /// Replay this many already-delivered events before the missed ones.
    pub fn set_replay_overlap(&self, count: usize) {
        lock(&self.state).replay_overlap = count;
    }

    pub fn set_fail_generation(&self, message: Option<&str>) {
        lock(&self.state).fail_generation = message.map(str::to_string);
    }

    /// Make `generation_state` answer only after `delay`.
    pub fn set_state_delay(&self, delay: Option<Duration>) {
        lock(&self.state).state_delay = delay;
    }

    pub fn connect_count(&self, port: u16) -> usize {
        lock(&self.state).ports.get(&port).map_or(0, |p| p.connects.len())
    }

    /// `Last-Event-ID` sent on each connect to `port`.
    pub fn last_event_ids(&self, port: u16) -> Vec<Option<String>> {
        lock(&self.state).ports.get(&port).map(|p| p.connects.clone()).unwrap_or_default()
    }

    pub fn open_streams(&self, port: u16) -> usize {
        let mut state = lock(&self.state);
        state.ports.get_mut(&port).map_or(0, |p| {
            p.live.retain(|tx| !tx.is_closed());
            p.live.len()
        })
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        lock(&self.state).calls.clone()
    }

    pub fn closed_sessions(&self) -> Vec<SessionId> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                BackendCall::Closed { session_id, .. } => Some(session_id),
                _ => None,
            })
            .collect()
    }

    pub fn started(&self) -> Vec<(SessionId, String)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                BackendCall::Start { session_id, prompt, .. } => Some((session_id, prompt)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: BackendCall) {
        lock(&self.state).calls.push(call);
    }
}

impl StreamConnector for FakeBackend {
    fn connect(
        &self,
        target: &StreamTarget,
        last_event_id: Option<&str>,
    ) -> BoxFuture<'static, Result<EventStream, StreamError>> {
        let mut state = lock(&self.state);
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return async { Err(StreamError::Connect("connection refused".into())) }.boxed();
        }
        let overlap = state.replay_overlap;
        let entry = state.ports.entry(target.port).or_default();
        entry.connects.push(last_event_id.map(str::to_string));

        let mut initial = VecDeque::new();
        initial.push_back(Ok(RoutedEvent::new(
            None,
            EVENT_INIT,
            json!({ "session_id": target.session_id, "generating": entry.generating }),
        )));
        if let Some(last) = last_event_id {
            if let Some(position) = entry.log.iter().position(|e| e.id.as_deref() == Some(last)) {
                let start = (position + 1).saturating_sub(overlap);
                initial.extend(entry.log[start..].iter().cloned().map(Ok));
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        entry.live.push(tx);
        let live = stream::unfold(rx, |mut rx| async move {
            let item = rx.recv().await?;
            Some((item, rx))
        });
        let events: EventStream = stream::iter(initial).chain(live).boxed();
        async move { Ok(events) }.boxed()
    }
}

impl AgentBackend for FakeBackend {
    fn generation_state(&self, port: u16, session_id: &SessionId) -> BoxFuture<'static, Result<GenerationPhase>> {
        self.record(BackendCall::GenerationState { port, session_id: session_id.clone() });
        let state = lock(&self.state);
        let delay = state.state_delay;
        let generating = state.ports.get(&port).is_some_and(|p| p.generating);
        async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(if generating { GenerationPhase::Generating } else { GenerationPhase::Idle })
        }
        .boxed()
    }

    fn stop_generation(&self, port: u16, session_id: &SessionId) -> BoxFuture<'static, Result<()>> {
        self.record(BackendCall::Stop { port, session_id: session_id.clone() });
        lock(&self.state).emit(port, EVENT_STOPPED, json!({}));
        async { Ok(()) }.boxed()
    }

    fn switch_session(&self, port: u16, to: &SessionId) -> BoxFuture<'static, Result<()>> {
        self.record(BackendCall::Switch { port, to: to.clone() });
        async { Ok(()) }.boxed()
    }

    fn start_generation(
        &self,
        port: u16,
        session_id: &SessionId,
        prompt: &str,
    ) -> BoxFuture<'static, Result<()>> {
        self.record(BackendCall::Start {
            port,
            session_id: session_id.clone(),
            prompt: prompt.to_string(),
        });
        let mut state = lock(&self.state);
        if let Some(message) = state.fail_generation.clone() {
            return async move { Err(anyhow!(message)) }.boxed();
        }
        state.emit(port, EVENT_STATUS, json!({ "state": "generating" }));
        async { Ok(()) }.boxed()
    }

    fn notify_closed(&self, port: u16, session_id: &SessionId) -> BoxFuture<'static, Result<()>> {
        self.record(BackendCall::Closed { port, session_id: session_id.clone() });
        async { Ok(()) }.boxed()
    }
}

// ── Assembled fixtures ──────────────────────────────────────────────

/// Runtime timings short enough for paused-clock tests.
pub fn fast_runtime_config() -> RuntimeConfig {
    RuntimeConfig {
        startup_timeout_ms: 1_000,
        probe_interval_ms: 10,
        idle_grace_ms: 100,
        terminate_grace_ms: 50,
        port_range_start: 41_000,
        port_range_len: 16,
        ..RuntimeConfig::default()
    }
}

pub fn fast_stream_config() -> StreamConfig {
    StreamConfig { base_delay_ms: 10, max_delay_ms: 80, max_attempts: 3, buffer: 64 }
}

pub fn fast_config() -> BerthConfig {
    let mut config = BerthConfig::default();
    config.runtime = fast_runtime_config();
    config.stream = fast_stream_config();
    config.guardian.max_hold_secs = 60;
    config
}

fn unchecked_ports(config: &RuntimeConfig) -> PortAllocator {
    PortAllocator::new(config.port_range_start, config.port_range_len).without_bind_check()
}

/// Registry, router and ledger wired to fakes.
pub struct TestRig {
    pub host: Arc<FakeProcessHost>,
    pub probe: Arc<ScriptedReadiness>,
    pub backend: Arc<FakeBackend>,
    pub registry: Arc<ProcessRegistry>,
    pub router: EventStreamRouter,
    pub ledger: OwnershipLedger,
}

impl Default for TestRig {
    fn default() -> Self {
        Self::new()
    }
}

impl TestRig {
    pub fn new() -> Self {
        let host = Arc::new(FakeProcessHost::new());
        let probe = Arc::new(ScriptedReadiness::ready());
        let backend = Arc::new(FakeBackend::new());
        let runtime = fast_runtime_config();
        let ports = unchecked_ports(&runtime);
        let registry =
            ProcessRegistry::with_port_allocator(runtime, host.clone(), probe.clone(), ports);
        let router = EventStreamRouter::new(
            backend.clone(),
            ReconnectPolicy::from_config(&fast_stream_config()),
            64,
        );
        let ledger = OwnershipLedger::new(registry.clone(), router.clone());
        Self { host, probe, backend, registry, router, ledger }
    }

    /// Let idle countdowns and terminations run out.
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}

/// A full hub over fakes and an in-memory store.
pub struct TestHub {
    pub hub: Arc<SessionHub>,
    pub ticks: Option<TaskTicks>,
    pub host: Arc<FakeProcessHost>,
    pub probe: Arc<ScriptedReadiness>,
    pub backend: Arc<FakeBackend>,
}

impl TestHub {
    pub fn new() -> Result<Self> {
        Self::with_store(MetaDb::open_in_memory()?)
    }

    /// Build over an existing store, e.g. one a previous hub wrote.
    pub fn with_store(db: MetaDb) -> Result<Self> {
        let host = Arc::new(FakeProcessHost::new());
        let probe = Arc::new(ScriptedReadiness::ready());
        let backend = Arc::new(FakeBackend::new());
        let config = fast_config();
        let ports = unchecked_ports(&config.runtime);
        let (hub, ticks) = SessionHub::new(HubDeps {
            config,
            host: host.clone(),
            probe: probe.clone(),
            ports: Some(ports),
            connector: backend.clone(),
            backend: backend.clone(),
            db,
        });
        Ok(Self { hub, ticks: Some(ticks), host, probe, backend })
    }

    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}
