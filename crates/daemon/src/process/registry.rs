// Process registry: spawn-or-reuse per key, single-flight spawns, idle
// teardown, two-phase termination and port quarantine.
//
// The registry keeps no claim counts. `acquire` and `release` are crate-private
// and only the ownership ledger calls them: `acquire` on every claim, `release`
// when a key's claim count reaches zero.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use berth_common::types::ProcessState;
use futures_util::future::{join_all, BoxFuture, Shared};
use futures_util::FutureExt;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::process::host::{LaunchSpec, ProcessHost, Signal};
use crate::process::ports::PortAllocator;
use crate::process::probe::{wait_until_ready, ReadinessProbe};
use crate::process::{ProcessHandle, ProcessKey};

/// Why a spawn attempt failed. Cloned to every caller joined on the attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SpawnError {
    #[error("no free port in {start}..{end}")]
    NoFreePort { start: u16, end: u16 },
    #[error("failed to launch agent runtime: {0}")]
    Launch(String),
    #[error("process {pid} exited during startup (code {code:?})")]
    ExitedDuringStartup { pid: u32, code: Option<i32> },
    #[error("process {pid} was not ready within {timeout_ms}ms")]
    ReadinessTimeout { pid: u32, timeout_ms: u64 },
    #[error("process registry is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RekeyError {
    #[error("process key {0} is already in use")]
    Occupied(String),
    #[error("process for {0} is not live")]
    NotLive(String),
}

/// Result of a successful acquire.
#[derive(Debug, Clone)]
pub struct Acquired {
    pub handle: ProcessHandle,
    /// The caller started or joined a spawn instead of reusing a live process.
    pub spawned: bool,
}

type SpawnFuture = Shared<BoxFuture<'static, Result<ProcessHandle, SpawnError>>>;
type DoneFuture = Shared<BoxFuture<'static, ()>>;

enum Slot {
    Spawning { attempt: u64, future: SpawnFuture },
    Live { handle: ProcessHandle, state: ProcessState },
    Terminating { done: DoneFuture },
}

/// Whether a key is currently wanted. Every acquire/release bumps `epoch`, so
/// an idle countdown only fires if nothing happened since it started.
struct Demand {
    epoch: u64,
    retained: bool,
}

struct RegistryState {
    slots: HashMap<ProcessKey, Slot>,
    demand: HashMap<ProcessKey, Demand>,
    ports: PortAllocator,
    shutting_down: bool,
}

enum Current {
    Ready(ProcessHandle),
    Stale(ProcessHandle),
    Joining(SpawnFuture),
    Draining(DoneFuture),
    Vacant,
}

enum Install {
    Retained,
    Unclaimed { epoch: u64 },
    Orphaned,
}

pub struct ProcessRegistry {
    config: RuntimeConfig,
    host: Arc<dyn ProcessHost>,
    probe: Arc<dyn ReadinessProbe>,
    state: Mutex<RegistryState>,
    spawn_count: AtomicUsize,
    next_attempt: AtomicU64,
    next_epoch: AtomicU64,
}

impl ProcessRegistry {
    pub fn new(
        config: RuntimeConfig,
        host: Arc<dyn ProcessHost>,
        probe: Arc<dyn ReadinessProbe>,
    ) -> Arc<Self> {
        let ports = PortAllocator::new(config.port_range_start, config.port_range_len);
        Self::with_port_allocator(config, host, probe, ports)
    }

    pub fn with_port_allocator(
        config: RuntimeConfig,
        host: Arc<dyn ProcessHost>,
        probe: Arc<dyn ReadinessProbe>,
        ports: PortAllocator,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            host,
            probe,
            state: Mutex::new(RegistryState {
                slots: HashMap::new(),
                demand: HashMap::new(),
                ports,
                shutting_down: false,
            }),
            spawn_count: AtomicUsize::new(0),
            next_attempt: AtomicU64::new(1),
            next_epoch: AtomicU64::new(1),
        })
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump_demand(&self, state: &mut RegistryState, key: &ProcessKey, retained: bool) -> u64 {
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        let demand = state.demand.entry(key.clone()).or_insert(Demand { epoch, retained });
        demand.epoch = epoch;
        demand.retained = retained;
        epoch
    }

    /// Return the healthy process for `key`, spawning one if needed.
    ///
    /// Concurrent callers for the same key share one spawn attempt and all see
    /// its outcome. The spawn runs on its own task, so a caller that gives up
    /// mid-spawn does not abort it.
    pub(crate) async fn acquire(self: &Arc<Self>, key: &ProcessKey) -> Result<Acquired, SpawnError> {
        loop {
            let current = {
                let mut guard = self.lock();
                let state = &mut *guard;
                if state.shutting_down {
                    return Err(SpawnError::ShuttingDown);
                }
                self.bump_demand(state, key, true);

                let current = match state.slots.get(key) {
                    Some(Slot::Live { handle, state: ProcessState::Healthy }) => {
                        Current::Ready(handle.clone())
                    }
                    Some(Slot::Live { handle, .. }) => Current::Stale(handle.clone()),
                    Some(Slot::Spawning { future, .. }) => Current::Joining(future.clone()),
                    Some(Slot::Terminating { done }) => Current::Draining(done.clone()),
                    None => Current::Vacant,
                };
                match current {
                    Current::Stale(handle) => {
                        warn!(key = %key, pid = handle.pid, "replacing unhealthy agent runtime");
                        state.slots.remove(key);
                        Current::Draining(self.begin_terminate(state, handle))
                    }
                    Current::Vacant => Current::Joining(self.begin_spawn(state, key)?),
                    other => other,
                }
            };

            match current {
                Current::Ready(handle) => return Ok(Acquired { handle, spawned: false }),
                Current::Joining(future) => {
                    return future.await.map(|handle| Acquired { handle, spawned: true });
                }
                Current::Draining(done) => done.await,
                Current::Stale(_) | Current::Vacant => {}
            }
        }
    }

    /// Zero-claim signal from the ledger: start the idle countdown for `key`.
    pub(crate) fn release(self: &Arc<Self>, key: &ProcessKey) {
        let epoch = {
            let mut guard = self.lock();
            self.bump_demand(&mut guard, key, false)
        };
        self.start_idle_countdown(key, epoch);
    }

    /// Tear `key` down after the idle grace unless its demand epoch moves.
    fn start_idle_countdown(self: &Arc<Self>, key: &ProcessKey, epoch: u64) {
        let registry = Arc::clone(self);
        let key = key.clone();
        let grace = self.config.idle_grace();
        debug!(key = %key, grace_ms = grace.as_millis() as u64, "idle countdown started");
        tokio::spawn(async move {
            if !grace.is_zero() {
                tokio::time::sleep(grace).await;
            }
            registry.teardown_if_idle(&key, epoch);
        });
    }

    fn teardown_if_idle(self: &Arc<Self>, key: &ProcessKey, epoch: u64) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let idle = state.demand.get(key).is_some_and(|d| d.epoch == epoch && !d.retained);
        if !idle {
            return;
        }
        match state.slots.remove(key) {
            Some(Slot::Live { handle, .. }) => {
                state.demand.remove(key);
                let _draining = self.begin_terminate(state, handle);
            }
            // A spawn still in flight re-checks demand when it finishes.
            Some(other) => {
                state.slots.insert(key.clone(), other);
            }
            None => {
                state.demand.remove(key);
            }
        }
    }

    fn begin_spawn(
        self: &Arc<Self>,
        state: &mut RegistryState,
        key: &ProcessKey,
    ) -> Result<SpawnFuture, SpawnError> {
        let Some(port) = state.ports.allocate() else {
            let (start, end) = state.ports.range();
            return Err(SpawnError::NoFreePort { start, end });
        };
        let attempt = self.next_attempt.fetch_add(1, Ordering::Relaxed);
        self.spawn_count.fetch_add(1, Ordering::Relaxed);

        let registry = Arc::clone(self);
        let spawn_key = key.clone();
        let task = tokio::spawn(async move { registry.run_spawn(spawn_key, port, attempt).await });
        let future = async move {
            task.await
                .unwrap_or_else(|error| Err(SpawnError::Launch(format!("spawn task failed: {error}"))))
        }
        .boxed()
        .shared();

        state.slots.insert(key.clone(), Slot::Spawning { attempt, future: future.clone() });
        Ok(future)
    }

    async fn run_spawn(
        self: Arc<Self>,
        key: ProcessKey,
        port: u16,
        attempt: u64,
    ) -> Result<ProcessHandle, SpawnError> {
        let spec = LaunchSpec::for_key(&self.config, &key, port);
        info!(key = %key, port, command = %spec.command, "spawning agent runtime");

        let pid = match self.host.spawn_process(&spec) {
            Ok(pid) => pid,
            Err(error) => {
                warn!(key = %key, port, error = %format!("{error:#}"), "agent runtime failed to launch");
                let mut state = self.lock();
                purge_attempt(&mut state, &key, attempt);
                state.ports.free(port);
                return Err(SpawnError::Launch(format!("{error:#}")));
            }
        };

        let ready = wait_until_ready(
            self.probe.as_ref(),
            self.host.as_ref(),
            pid,
            port,
            self.config.startup_timeout(),
            self.config.probe_interval(),
        )
        .await;
        if let Err(error) = ready {
            warn!(key = %key, pid, port, error = %error, "agent runtime failed to become ready");
            purge_attempt(&mut self.lock(), &key, attempt);
            let confirmed = self.stop_pid(pid).await;
            self.release_port(&mut self.lock(), port, pid, confirmed);
            return Err(error);
        }

        let handle = ProcessHandle { id: Uuid::new_v4(), key: key.clone(), port, pid };
        let install = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let ours = matches!(
                state.slots.get(&key),
                Some(Slot::Spawning { attempt: current, .. }) if *current == attempt
            );
            if !ours || state.shutting_down {
                purge_attempt(state, &key, attempt);
                Install::Orphaned
            } else {
                state.slots.insert(
                    key.clone(),
                    Slot::Live { handle: handle.clone(), state: ProcessState::Healthy },
                );
                if state.demand.get(&key).is_some_and(|d| d.retained) {
                    Install::Retained
                } else {
                    Install::Unclaimed { epoch: self.bump_demand(state, &key, false) }
                }
            }
        };

        match install {
            Install::Retained => {
                info!(key = %key, pid, port, backend_id = %handle.id, "agent runtime ready");
                Ok(handle)
            }
            Install::Unclaimed { epoch } => {
                debug!(key = %key, pid, "claimants left during startup; releasing");
                self.start_idle_countdown(&key, epoch);
                Ok(handle)
            }
            Install::Orphaned => {
                let confirmed = self.stop_pid(pid).await;
                self.release_port(&mut self.lock(), port, pid, confirmed);
                Err(SpawnError::ShuttingDown)
            }
        }
    }

    /// Move `handle` into the terminating state and stop it in the background.
    /// The caller has already removed the live slot.
    fn begin_terminate(self: &Arc<Self>, state: &mut RegistryState, handle: ProcessHandle) -> DoneFuture {
        let key = handle.key.clone();
        let registry = Arc::clone(self);
        let task = tokio::spawn(async move { registry.finish_terminate(handle).await });
        let done = async move {
            let _ = task.await;
        }
        .boxed()
        .shared();
        state.slots.insert(key, Slot::Terminating { done: done.clone() });
        done
    }

    async fn finish_terminate(self: Arc<Self>, handle: ProcessHandle) {
        info!(key = %handle.key, pid = handle.pid, port = handle.port, "terminating agent runtime");
        let confirmed = self.stop_pid(handle.pid).await;
        let mut state = self.lock();
        if matches!(state.slots.get(&handle.key), Some(Slot::Terminating { .. })) {
            state.slots.remove(&handle.key);
        }
        self.release_port(&mut state, handle.port, handle.pid, confirmed);
    }

    /// TERM, wait up to the grace window, then KILL. Returns whether the exit
    /// was observed.
    async fn stop_pid(&self, pid: u32) -> bool {
        if !self.host.is_alive(pid) {
            return true;
        }
        let grace = self.config.terminate_grace();

        if let Err(error) = self.host.send_signal(pid, Signal::Term) {
            warn!(pid, error = %format!("{error:#}"), "failed to send TERM");
        }
        if tokio::time::timeout(grace, self.host.wait_exit(pid)).await.is_ok() {
            return true;
        }

        warn!(pid, grace_ms = grace.as_millis() as u64, "agent runtime ignored TERM; sending KILL");
        if let Err(error) = self.host.send_signal(pid, Signal::Kill) {
            warn!(pid, error = %format!("{error:#}"), "failed to send KILL");
        }
        tokio::time::timeout(grace, self.host.wait_exit(pid)).await.is_ok()
    }

    fn release_port(&self, state: &mut RegistryState, port: u16, pid: u32, confirmed: bool) {
        if confirmed {
            state.ports.free(port);
        } else {
            error!(pid, port, "agent runtime exit not confirmed; port stays quarantined");
        }
    }

    /// Re-probe every healthy process; failures become `Unhealthy` and are
    /// replaced on the next acquire. Returns how many failed.
    pub async fn health_sweep(&self) -> usize {
        let live: Vec<ProcessHandle> = self
            .lock()
            .slots
            .values()
            .filter_map(|slot| match slot {
                Slot::Live { handle, state: ProcessState::Healthy } => Some(handle.clone()),
                _ => None,
            })
            .collect();

        let mut failed = 0;
        for handle in live {
            let healthy = self.host.is_alive(handle.pid) && self.probe.probe(handle.port).await;
            if healthy {
                continue;
            }
            let mut state = self.lock();
            if let Some(Slot::Live { handle: current, state: process_state }) =
                state.slots.get_mut(&handle.key)
            {
                if current.id == handle.id {
                    warn!(key = %handle.key, pid = handle.pid, "agent runtime failed health check");
                    *process_state = ProcessState::Unhealthy;
                    failed += 1;
                }
            }
        }
        failed
    }

    /// Whether `rekey(old, new)` would succeed right now.
    pub(crate) fn check_rekey(&self, old: &ProcessKey, new: &ProcessKey) -> Result<(), RekeyError> {
        if old == new {
            return Ok(());
        }
        let state = self.lock();
        if state.slots.contains_key(new) {
            return Err(RekeyError::Occupied(new.to_string()));
        }
        match state.slots.get(old) {
            Some(Slot::Live { .. }) | None => Ok(()),
            Some(_) => Err(RekeyError::NotLive(old.to_string())),
        }
    }

    /// Move the live process under `old` to `new`. Returns the moved handle,
    /// or `None` when no process exists under `old`.
    pub(crate) fn rekey(
        self: &Arc<Self>,
        old: &ProcessKey,
        new: &ProcessKey,
    ) -> Result<Option<ProcessHandle>, RekeyError> {
        if old == new {
            return Ok(self.lookup(old));
        }
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.slots.contains_key(new) {
            return Err(RekeyError::Occupied(new.to_string()));
        }
        let (mut handle, process_state) = match state.slots.remove(old) {
            Some(Slot::Live { handle, state }) => (handle, state),
            Some(other) => {
                state.slots.insert(old.clone(), other);
                return Err(RekeyError::NotLive(old.to_string()));
            }
            None => return Ok(None),
        };
        handle.key = new.clone();
        state.slots.insert(new.clone(), Slot::Live { handle: handle.clone(), state: process_state });

        let retained = state.demand.remove(old).is_some_and(|d| d.retained);
        let epoch = self.bump_demand(state, new, retained);
        drop(guard);
        if !retained {
            self.start_idle_countdown(new, epoch);
        }
        info!(from = %old, to = %new, pid = handle.pid, "agent runtime rekeyed");
        Ok(Some(handle))
    }

    /// Terminate every process and refuse further spawns.
    pub async fn shutdown(self: &Arc<Self>) {
        let (spawning, draining) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            state.shutting_down = true;

            let mut spawning = Vec::new();
            let mut draining = Vec::new();
            let mut live = Vec::new();
            for (key, slot) in &state.slots {
                match slot {
                    Slot::Spawning { future, .. } => spawning.push(future.clone()),
                    Slot::Terminating { done } => draining.push(done.clone()),
                    Slot::Live { .. } => live.push(key.clone()),
                }
            }
            for key in live {
                if let Some(Slot::Live { handle, .. }) = state.slots.remove(&key) {
                    draining.push(self.begin_terminate(state, handle));
                }
            }
            (spawning, draining)
        };

        // In-flight spawns observe the shutdown flag and stop their own process.
        join_all(spawning).await;
        join_all(draining).await;
        info!("process registry shut down");
    }

    // ── Observers ──────────────────────────────────────────────────

    pub fn lookup(&self, key: &ProcessKey) -> Option<ProcessHandle> {
        match self.lock().slots.get(key) {
            Some(Slot::Live { handle, .. }) => Some(handle.clone()),
            _ => None,
        }
    }

    pub fn state(&self, key: &ProcessKey) -> Option<ProcessState> {
        self.lock().slots.get(key).map(|slot| match slot {
            Slot::Spawning { .. } => ProcessState::Spawning,
            Slot::Live { state, .. } => *state,
            Slot::Terminating { .. } => ProcessState::Terminating,
        })
    }

    /// Live processes with their state.
    pub fn snapshot(&self) -> Vec<(ProcessHandle, ProcessState)> {
        let mut live: Vec<_> = self
            .lock()
            .slots
            .values()
            .filter_map(|slot| match slot {
                Slot::Live { handle, state } => Some((handle.clone(), *state)),
                _ => None,
            })
            .collect();
        live.sort_by_key(|(handle, _)| handle.port);
        live
    }

    pub fn spawn_count(&self) -> usize {
        self.spawn_count.load(Ordering::Relaxed)
    }

    pub fn is_retained(&self, key: &ProcessKey) -> bool {
        self.lock().demand.get(key).is_some_and(|d| d.retained)
    }

    pub fn reserved_ports(&self) -> Vec<u16> {
        self.lock().ports.reserved()
    }

    pub fn process_count(&self) -> usize {
        self.lock().slots.len()
    }
}

fn purge_attempt(state: &mut RegistryState, key: &ProcessKey, attempt: u64) {
    if matches!(
        state.slots.get(key),
        Some(Slot::Spawning { attempt: current, .. }) if *current == attempt
    ) {
        state.slots.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use berth_common::types::SessionId;

    use super::*;
    use crate::testing::{FakeProcessHost, ScriptedReadiness};

    fn config() -> RuntimeConfig {
        RuntimeConfig {
            startup_timeout_ms: 1_000,
            probe_interval_ms: 10,
            idle_grace_ms: 100,
            terminate_grace_ms: 50,
            port_range_start: 41_000,
            port_range_len: 4,
            ..RuntimeConfig::default()
        }
    }

    fn registry(
        host: &Arc<FakeProcessHost>,
        probe: &Arc<ScriptedReadiness>,
    ) -> Arc<ProcessRegistry> {
        let cfg = config();
        let ports = PortAllocator::new(cfg.port_range_start, cfg.port_range_len).without_bind_check();
        ProcessRegistry::with_port_allocator(cfg, host.clone(), probe.clone(), ports)
    }

    fn key(id: &str) -> ProcessKey {
        ProcessKey::session("/work", SessionId::from(id))
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_acquires_share_one_spawn() {
        let host = Arc::new(FakeProcessHost::new());
        let probe = Arc::new(ScriptedReadiness::ready_after(Duration::from_millis(200)));
        let registry = registry(&host, &probe);

        let attempts = (0..8).map(|_| {
            let registry = Arc::clone(&registry);
            async move { registry.acquire(&key("s1")).await }
        });
        let results = join_all(attempts).await;

        assert_eq!(registry.spawn_count(), 1);
        assert_eq!(host.spawned(), 1);
        let first = results[0].as_ref().expect("spawn should succeed").handle.clone();
        for result in &results {
            let acquired = result.as_ref().expect("every caller sees success");
            assert_eq!(acquired.handle, first);
            assert!(acquired.spawned);
        }

        let again = registry.acquire(&key("s1")).await.unwrap();
        assert!(!again.spawned);
        assert_eq!(again.handle, first);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_spawn_is_shared_then_purged_for_retry() {
        let host = Arc::new(FakeProcessHost::new());
        let probe = Arc::new(ScriptedReadiness::never_ready());
        let registry = registry(&host, &probe);

        let (k1, k2) = (key("s1"), key("s1"));
        let (a, b) = tokio::join!(registry.acquire(&k1), registry.acquire(&k2));
        assert!(matches!(a, Err(SpawnError::ReadinessTimeout { .. })));
        assert_eq!(a.unwrap_err(), b.unwrap_err());
        assert_eq!(registry.state(&key("s1")), None, "failed attempt is purged");
        assert!(registry.reserved_ports().is_empty(), "dead process frees its port");
        assert!(host.alive_pids().is_empty());

        probe.set_ready(true);
        let retry = registry.acquire(&key("s1")).await.expect("retry should spawn cleanly");
        assert!(retry.spawned);
        assert_eq!(registry.spawn_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn process_exiting_during_startup_fails_fast() {
        let host = Arc::new(FakeProcessHost::new());
        host.set_exit_on_spawn(Some(3));
        let probe = Arc::new(ScriptedReadiness::never_ready());
        let registry = registry(&host, &probe);

        let error = registry.acquire(&key("s1")).await.unwrap_err();
        assert!(matches!(error, SpawnError::ExitedDuringStartup { code: Some(3), .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn release_tears_down_after_idle_grace() {
        let host = Arc::new(FakeProcessHost::new());
        let probe = Arc::new(ScriptedReadiness::ready());
        let registry = registry(&host, &probe);

        let handle = registry.acquire(&key("s1")).await.unwrap().handle;
        registry.release(&key("s1"));
        assert_eq!(registry.state(&key("s1")), Some(ProcessState::Healthy));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(registry.state(&key("s1")), None);
        assert_eq!(host.signals(handle.pid), vec![Signal::Term]);
        assert!(registry.reserved_ports().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_during_grace_cancels_teardown() {
        let host = Arc::new(FakeProcessHost::new());
        let probe = Arc::new(ScriptedReadiness::ready());
        let registry = registry(&host, &probe);

        let first = registry.acquire(&key("s1")).await.unwrap().handle;
        registry.release(&key("s1"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = registry.acquire(&key("s1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(!second.spawned);
        assert_eq!(second.handle, first);
        assert_eq!(registry.state(&key("s1")), Some(ProcessState::Healthy));
        assert!(registry.is_retained(&key("s1")));
    }

    #[tokio::test(start_paused = true)]
    async fn release_during_spawn_completes_then_tears_down() {
        let host = Arc::new(FakeProcessHost::new());
        let probe = Arc::new(ScriptedReadiness::ready_after(Duration::from_millis(300)));
        let registry = registry(&host, &probe);

        let pending = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.acquire(&key("s1")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        pending.abort();
        registry.release(&key("s1"));
        assert_eq!(registry.state(&key("s1")), Some(ProcessState::Spawning));

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(host.spawned(), 1, "spawn still ran to completion");
        assert_eq!(registry.state(&key("s1")), None, "and was then torn down");
        assert!(host.alive_pids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stubborn_process_is_killed_after_grace() {
        let host = Arc::new(FakeProcessHost::new());
        host.set_ignore_term(true);
        let probe = Arc::new(ScriptedReadiness::ready());
        let registry = registry(&host, &probe);

        let handle = registry.acquire(&key("s1")).await.unwrap().handle;
        registry.release(&key("s1"));
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(host.signals(handle.pid), vec![Signal::Term, Signal::Kill]);
        assert!(registry.reserved_ports().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_termination_quarantines_port() {
        let host = Arc::new(FakeProcessHost::new());
        host.set_ignore_term(true);
        host.set_ignore_kill(true);
        let probe = Arc::new(ScriptedReadiness::ready());
        let registry = registry(&host, &probe);

        let handle = registry.acquire(&key("s1")).await.unwrap().handle;
        registry.release(&key("s1"));
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(registry.state(&key("s1")), None);
        assert_eq!(registry.reserved_ports(), vec![handle.port]);

        // New processes never land on the quarantined port.
        for id in ["a", "b", "c"] {
            let other = registry.acquire(&key(id)).await.unwrap().handle;
            assert_ne!(other.port, handle.port);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_process_is_replaced_on_next_acquire() {
        let host = Arc::new(FakeProcessHost::new());
        let probe = Arc::new(ScriptedReadiness::ready());
        let registry = registry(&host, &probe);

        let first = registry.acquire(&key("s1")).await.unwrap().handle;
        host.crash(first.pid, 1);
        assert_eq!(registry.health_sweep().await, 1);
        assert_eq!(registry.state(&key("s1")), Some(ProcessState::Unhealthy));

        let second = registry.acquire(&key("s1")).await.unwrap();
        assert!(second.spawned);
        assert_ne!(second.handle.id, first.id);
        assert_eq!(registry.spawn_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rekey_moves_live_process_and_refuses_occupied_target() {
        let host = Arc::new(FakeProcessHost::new());
        let probe = Arc::new(ScriptedReadiness::ready());
        let registry = registry(&host, &probe);

        let placeholder = registry.acquire(&key("pending-1")).await.unwrap().handle;
        registry.acquire(&key("taken")).await.unwrap();

        assert!(matches!(
            registry.check_rekey(&key("pending-1"), &key("taken")),
            Err(RekeyError::Occupied(_))
        ));
        let moved = registry.rekey(&key("pending-1"), &key("s1")).unwrap().unwrap();
        assert_eq!(moved.id, placeholder.id);
        assert_eq!(moved.key, key("s1"));
        assert_eq!(registry.lookup(&key("pending-1")), None);
        assert!(registry.is_retained(&key("s1")));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_terminates_everything_and_refuses_spawns() {
        let host = Arc::new(FakeProcessHost::new());
        let probe = Arc::new(ScriptedReadiness::ready());
        let registry = registry(&host, &probe);

        registry.acquire(&key("a")).await.unwrap();
        registry.acquire(&key("b")).await.unwrap();
        registry.shutdown().await;

        assert!(host.alive_pids().is_empty());
        assert_eq!(registry.process_count(), 0);
        assert!(matches!(registry.acquire(&key("c")).await, Err(SpawnError::ShuttingDown)));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_port_range_is_reported() {
        let host = Arc::new(FakeProcessHost::new());
        let probe = Arc::new(ScriptedReadiness::ready());
        let registry = registry(&host, &probe);

        for id in ["a", "b", "c", "d"] {
            registry.acquire(&key(id)).await.unwrap();
        }
        assert!(matches!(
            registry.acquire(&key("e")).await,
            Err(SpawnError::NoFreePort { start: 41_000, end: 41_004 })
        ));
    }
}
