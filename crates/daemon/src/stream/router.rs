// Event stream router: one push connection per (session, owner) with
// reconnect, replay de-duplication, transparent rekey and re-pointing.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use berth_common::protocol::events::{GenerationPhase, RoutedEvent, EVENT_INIT};
use berth_common::types::{Owner, SessionId, StreamState};
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::stream::backoff::ReconnectPolicy;
use crate::stream::connector::{EventStream, StreamConnector, StreamTarget};

/// Event ids remembered per subscription for replay suppression.
const SEEN_CAPACITY: usize = 4096;
/// How long a full consumer buffer may hold up the final `disconnected` event.
const DISCONNECT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// A consumer's end of a subscription. Dropping it ends the subscription the
/// next time an event is delivered.
pub struct StreamHandle {
    owner: Owner,
    events: mpsc::Receiver<RoutedEvent>,
    state: watch::Receiver<StreamState>,
}

impl StreamHandle {
    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    /// Next event, or `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<RoutedEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<RoutedEvent> {
        self.events.try_recv().ok()
    }

    pub fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<StreamState> {
        self.state.clone()
    }

    pub fn into_stream(self) -> BoxStream<'static, RoutedEvent> {
        stream::unfold(self, |mut handle| async move {
            let event = handle.recv().await?;
            Some((event, handle))
        })
        .boxed()
    }
}

struct Subscription {
    id: u64,
    owner: Owner,
    target: watch::Sender<StreamTarget>,
    state: Arc<watch::Sender<StreamState>>,
    task: JoinHandle<()>,
}

impl Subscription {
    fn close(self) {
        self.state.send_replace(StreamState::Closed);
        self.task.abort();
    }
}

#[derive(Default)]
struct RouterState {
    subscriptions: HashMap<SessionId, Vec<Subscription>>,
    phases: HashMap<SessionId, GenerationPhase>,
}

impl RouterState {
    /// Drop the subscription `matches` selects. The phase goes with the
    /// session's last subscription: nothing is left to keep it current.
    fn remove_subscription(
        &mut self,
        session_id: &SessionId,
        matches: impl Fn(&Subscription) -> bool,
    ) -> Option<Subscription> {
        let subscriptions = self.subscriptions.get_mut(session_id)?;
        let position = subscriptions.iter().position(matches)?;
        let removed = subscriptions.remove(position);
        if subscriptions.is_empty() {
            self.subscriptions.remove(session_id);
            self.phases.remove(session_id);
        }
        Some(removed)
    }
}

struct RouterInner {
    connector: Arc<dyn StreamConnector>,
    policy: ReconnectPolicy,
    buffer: usize,
    state: Mutex<RouterState>,
    next_id: AtomicU64,
}

impl RouterInner {
    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone)]
pub struct EventStreamRouter {
    inner: Arc<RouterInner>,
}

impl EventStreamRouter {
    pub fn new(connector: Arc<dyn StreamConnector>, policy: ReconnectPolicy, buffer: usize) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                connector,
                policy,
                buffer: buffer.max(1),
                state: Mutex::new(RouterState::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.inner.lock()
    }

    /// Open `owner`'s stream to `target`. An existing subscription for the
    /// same owner on the same session is replaced.
    pub fn attach(&self, owner: Owner, target: StreamTarget) -> StreamHandle {
        let (events_tx, events_rx) = mpsc::channel(self.inner.buffer);
        let (state_tx, state_rx) = watch::channel(StreamState::Connecting);
        let state_tx = Arc::new(state_tx);
        let (target_tx, target_rx) = watch::channel(target.clone());
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let mut state = self.lock();
        let subscriptions = state.subscriptions.entry(target.session_id.clone()).or_default();
        if let Some(position) = subscriptions.iter().position(|s| s.owner == owner) {
            debug!(session_id = %target.session_id, owner = %owner, "replacing stream subscription");
            subscriptions.remove(position).close();
        }

        let worker = SubscriptionWorker {
            router: Arc::downgrade(&self.inner),
            connector: Arc::clone(&self.inner.connector),
            policy: self.inner.policy,
            id,
            owner: owner.clone(),
            target: target_rx,
            state: Arc::clone(&state_tx),
            events: events_tx,
            seen: SeenIds::new(SEEN_CAPACITY),
            last_id: None,
        };
        let task = tokio::spawn(worker.run());
        subscriptions.push(Subscription {
            id,
            owner: owner.clone(),
            target: target_tx,
            state: state_tx,
            task,
        });
        info!(session_id = %target.session_id, owner = %owner, port = target.port, "stream attached");

        StreamHandle { owner, events: events_rx, state: state_rx }
    }

    /// Close `owner`'s stream on `session_id`. Returns whether one existed.
    pub fn detach_owner(&self, session_id: &SessionId, owner: &Owner) -> bool {
        let Some(subscription) = self.lock().remove_subscription(session_id, |s| &s.owner == owner) else {
            return false;
        };
        subscription.close();
        debug!(session_id = %session_id, owner = %owner, "stream detached");
        true
    }

    /// Move every subscription and the tracked phase from `old` to `new`
    /// without reconnecting. The backend is unchanged, so consumers see no gap.
    pub fn rekey(&self, old: &SessionId, new: &SessionId) {
        let mut state = self.lock();
        if let Some(subscriptions) = state.subscriptions.remove(old) {
            for subscription in &subscriptions {
                subscription.target.send_modify(|target| target.session_id = new.clone());
            }
            state.subscriptions.entry(new.clone()).or_default().extend(subscriptions);
        }
        if let Some(phase) = state.phases.remove(old) {
            state.phases.insert(new.clone(), phase);
        }
    }

    /// Point every subscription on `session_id` at `target`. A different
    /// backend means a full reconnect with a fresh replay position.
    pub fn repoint(&self, session_id: &SessionId, target: StreamTarget) {
        let mut state = self.lock();
        state.phases.remove(session_id);
        let Some(subscriptions) = state.subscriptions.get(session_id) else {
            return;
        };
        for subscription in subscriptions {
            subscription.target.send_replace(target.clone());
        }
        info!(session_id = %session_id, port = target.port, "streams re-pointed");
    }

    /// Last generation phase observed on any stream of `session_id`.
    pub fn phase(&self, session_id: &SessionId) -> Option<GenerationPhase> {
        self.lock().phases.get(session_id).copied()
    }

    /// Drop all state for a session whose process is going away.
    pub fn forget_session(&self, session_id: &SessionId) {
        let mut state = self.lock();
        state.phases.remove(session_id);
        if let Some(subscriptions) = state.subscriptions.remove(session_id) {
            for subscription in subscriptions {
                subscription.close();
            }
        }
    }

    pub fn has_subscriptions(&self, session_id: &SessionId) -> bool {
        self.lock().subscriptions.get(session_id).is_some_and(|s| !s.is_empty())
    }

    /// Whether `session_id` has subscriptions or a tracked phase.
    pub(crate) fn has_state(&self, session_id: &SessionId) -> bool {
        let state = self.lock();
        state.subscriptions.contains_key(session_id) || state.phases.contains_key(session_id)
    }

    pub fn is_attached(&self, session_id: &SessionId, owner: &Owner) -> bool {
        self.lock()
            .subscriptions
            .get(session_id)
            .is_some_and(|subscriptions| subscriptions.iter().any(|s| &s.owner == owner))
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscriptions.values().map(Vec::len).sum()
    }
}

/// Bounded set of event ids already delivered to one consumer.
struct SeenIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
    capacity: usize,
}

impl SeenIds {
    fn new(capacity: usize) -> Self {
        Self { order: VecDeque::new(), ids: HashSet::new(), capacity }
    }

    /// Record `id`; false when it was already seen.
    fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.ids.insert(id.to_string());
        true
    }

    fn clear(&mut self) {
        self.order.clear();
        self.ids.clear();
    }
}

/// How one connected session ended.
enum Ended {
    /// Stream failed or the runtime closed it.
    Dropped,
    /// Backend identity changed; reconnect from scratch.
    Repointed,
    /// Consumer or router is gone.
    Finished,
}

struct SubscriptionWorker {
    router: Weak<RouterInner>,
    connector: Arc<dyn StreamConnector>,
    policy: ReconnectPolicy,
    id: u64,
    owner: Owner,
    target: watch::Receiver<StreamTarget>,
    state: Arc<watch::Sender<StreamState>>,
    events: mpsc::Sender<RoutedEvent>,
    seen: SeenIds,
    last_id: Option<String>,
}

impl SubscriptionWorker {
    async fn run(mut self) {
        let mut failures: u32 = 0;
        let mut attempted = false;

        loop {
            let current = self.target.borrow_and_update().clone();
            self.state.send_replace(if attempted {
                StreamState::Reconnecting
            } else {
                StreamState::Connecting
            });
            attempted = true;

            let connect = self.connector.connect(&current, self.last_id.as_deref());
            let connected = tokio::select! {
                result = connect => Some(result),
                changed = self.target.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    None
                }
            };

            let ended = match connected {
                // Target moved mid-connect; start over against the new one.
                None => {
                    self.reset_if_repointed(&current);
                    continue;
                }
                Some(Ok(stream)) => {
                    failures = 0;
                    self.state.send_replace(StreamState::Connected);
                    debug!(session_id = %current.session_id, owner = %self.owner, "stream connected");
                    self.pump(stream, current.clone()).await
                }
                Some(Err(error)) => {
                    warn!(
                        session_id = %current.session_id,
                        owner = %self.owner,
                        error = %error,
                        "stream connect failed"
                    );
                    Ended::Dropped
                }
            };

            match ended {
                Ended::Finished => {
                    self.finish();
                    return;
                }
                Ended::Repointed => {
                    failures = 0;
                    continue;
                }
                Ended::Dropped => {}
            }

            failures += 1;
            if self.policy.exhausted(failures) {
                let session_id = self.target.borrow().session_id.clone();
                warn!(session_id = %session_id, owner = %self.owner, attempts = failures, "stream reconnect budget exhausted");
                let disconnected = RoutedEvent::disconnected(&format!("gave up after {failures} attempts"));
                if tokio::time::timeout(DISCONNECT_SEND_TIMEOUT, self.events.send(disconnected)).await.is_err() {
                    warn!(session_id = %session_id, owner = %self.owner, "consumer not draining; disconnected event not delivered");
                }
                self.finish();
                return;
            }

            self.state.send_replace(StreamState::Degraded);
            let delay = self.policy.delay(failures - 1);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = self.target.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let next = self.target.borrow().clone();
                    if next.backend_id != current.backend_id {
                        failures = 0;
                    }
                }
            }
        }
    }

    /// Forward events until the stream ends or the backend changes.
    async fn pump(&mut self, mut stream: EventStream, mut current: StreamTarget) -> Ended {
        loop {
            tokio::select! {
                item = stream.next() => {
                    let event = match item {
                        Some(Ok(event)) => event,
                        Some(Err(error)) => {
                            warn!(session_id = %current.session_id, owner = %self.owner, error = %error, "stream read failed");
                            return Ended::Dropped;
                        }
                        None => {
                            debug!(session_id = %current.session_id, owner = %self.owner, "stream closed by runtime");
                            return Ended::Dropped;
                        }
                    };
                    if !self.accept(&event) {
                        continue;
                    }
                    if let Some(phase) = event.generation_phase() {
                        self.record_phase(phase);
                    }
                    if self.events.send(event).await.is_err() {
                        return Ended::Finished;
                    }
                }
                changed = self.target.changed() => {
                    if changed.is_err() {
                        return Ended::Finished;
                    }
                    let next = self.target.borrow_and_update().clone();
                    if self.reset_if_repointed(&current) {
                        info!(session_id = %next.session_id, owner = %self.owner, port = next.port, "backend changed; reconnecting");
                        return Ended::Repointed;
                    }
                    current = next;
                }
            }
        }
    }

    /// De-duplicate replayed events. `init` snapshots always pass and do not
    /// move the replay position.
    fn accept(&mut self, event: &RoutedEvent) -> bool {
        if event.event_name == EVENT_INIT {
            return true;
        }
        match event.id.as_deref() {
            Some(id) => {
                if !self.seen.insert(id) {
                    return false;
                }
                self.last_id = Some(id.to_string());
                true
            }
            None => true,
        }
    }

    /// Clear the replay position when the backend behind the target changed.
    fn reset_if_repointed(&mut self, previous: &StreamTarget) -> bool {
        let changed = self.target.borrow().backend_id != previous.backend_id;
        if changed {
            self.seen.clear();
            self.last_id = None;
        }
        changed
    }

    fn record_phase(&self, phase: GenerationPhase) {
        let Some(router) = self.router.upgrade() else {
            return;
        };
        let mut state = router.lock();
        let session_id = self.target.borrow().session_id.clone();
        state.phases.insert(session_id, phase);
    }

    /// Remove this subscription from the router and mark it closed.
    fn finish(&self) {
        self.state.send_replace(StreamState::Closed);
        let Some(router) = self.router.upgrade() else {
            return;
        };
        let session_id = self.target.borrow().session_id.clone();
        // Drop rather than close the entry: its task handle is this task.
        drop(router.lock().remove_subscription(&session_id, |s| s.id == self.id));
    }
}
