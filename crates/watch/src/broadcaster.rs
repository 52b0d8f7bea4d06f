use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use strata_core::{Object, ResourceKey, ResourceVersion, StorageError};
use strata_select::Predicate;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::event::{classify, Change, WatchEvent};

/// Queue sizes for the broadcaster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcasterConfig {
    /// Per-subscription queue between `notify` and the delivery task.
    pub input_capacity: usize,
    /// Per-subscription queue between the delivery task and the `Watcher`.
    pub output_capacity: usize,
    /// Recent changes kept for replay to late subscribers.
    pub buffer_capacity: usize,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self { input_capacity: 20, output_capacity: 100, buffer_capacity: 100 }
    }
}

/// Parameters of one subscription.
#[derive(Debug)]
pub struct SubscribeRequest<T> {
    /// Only changes with RV strictly greater are delivered.
    pub watermark: ResourceVersion,
    pub predicate: Predicate,
    /// Collection or single-object key the subscription is limited to.
    pub scope: ResourceKey,
    /// Emitted before any live change.
    pub initial_events: Vec<WatchEvent<T>>,
    /// Cancelling this token stops the subscription.
    pub cancel: CancellationToken,
}

impl<T> SubscribeRequest<T> {
    pub fn new(scope: ResourceKey, watermark: ResourceVersion, predicate: Predicate) -> Self {
        Self { watermark, predicate, scope, initial_events: Vec::new(), cancel: CancellationToken::new() }
    }

    pub fn with_initial_events(mut self, events: Vec<WatchEvent<T>>) -> Self {
        self.initial_events = events;
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }
}

enum Signal<T> {
    Change(Arc<Change<T>>),
    Error(StorageError),
}

struct Entry<T> {
    tx: mpsc::Sender<Signal<T>>,
    token: CancellationToken,
}

struct Registry<T> {
    subs: FxHashMap<u64, Entry<T>>,
    buffer: VecDeque<Arc<Change<T>>>,
    /// Highest RV dropped from `buffer`; watermarks below it cannot be served.
    evicted_through: ResourceVersion,
    closed: bool,
}

/// `floor` value before anything has been observed.
const FLOOR_UNKNOWN: ResourceVersion = ResourceVersion::MAX;

struct Shared<T> {
    registry: Mutex<Registry<T>>,
    next_id: AtomicU64,
    high_watermark: AtomicU64,
    /// Oldest watermark the buffer covers: every change above it was notified here.
    floor: AtomicU64,
    config: BroadcasterConfig,
}

/// In-process fan-out of committed changes to watch subscriptions.
pub struct WatchBroadcaster<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for WatchBroadcaster<T> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<T: Object> Default for WatchBroadcaster<T> {
    fn default() -> Self {
        Self::new(BroadcasterConfig::default())
    }
}

impl<T: Object> WatchBroadcaster<T> {
    pub fn new(config: BroadcasterConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry {
                    subs: FxHashMap::default(),
                    buffer: VecDeque::with_capacity(config.buffer_capacity),
                    evicted_through: 0,
                    closed: false,
                }),
                next_id: AtomicU64::new(1),
                high_watermark: AtomicU64::new(0),
                floor: AtomicU64::new(FLOOR_UNKNOWN),
                config,
            }),
        }
    }

    pub fn config(&self) -> BroadcasterConfig {
        self.shared.config
    }

    /// Highest RV observed so far (writes, lists, relayed events).
    pub fn high_watermark(&self) -> ResourceVersion {
        self.shared.high_watermark.load(Ordering::Acquire)
    }

    /// Record a backend RV seen by a read or a write. The first observation
    /// also fixes the floor.
    pub fn observe(&self, rv: ResourceVersion) {
        self.settle_floor(rv);
        self.shared.high_watermark.fetch_max(rv, Ordering::AcqRel);
    }

    /// Oldest watermark a new subscription can start from, once known.
    /// Older ones are answered with `ResourceExpired`.
    pub fn floor(&self) -> Option<ResourceVersion> {
        match self.shared.floor.load(Ordering::Acquire) {
            FLOOR_UNKNOWN => None,
            rv => Some(rv),
        }
    }

    /// Move the floor up to `rv`, e.g. when an event feed starts there.
    pub fn raise_floor(&self, rv: ResourceVersion) {
        let _ = self.shared.floor.fetch_update(Ordering::AcqRel, Ordering::Acquire, |f| {
            Some(if f == FLOOR_UNKNOWN { rv } else { f.max(rv) })
        });
    }

    fn settle_floor(&self, rv: ResourceVersion) {
        let _ = self.shared.floor.compare_exchange(FLOOR_UNKNOWN, rv, Ordering::AcqRel, Ordering::Acquire);
    }

    pub async fn subscriber_count(&self) -> usize {
        self.shared.registry.lock().await.subs.len()
    }

    /// Fan a committed change out to every subscription.
    ///
    /// Blocks while any subscription's input queue is full; a stopped
    /// subscription releases the wait.
    pub async fn notify(&self, change: Change<T>) {
        // The change itself is buffered, so the floor sits just below it.
        self.settle_floor(change.resource_version.saturating_sub(1));
        self.observe(change.resource_version);
        let change = Arc::new(change);
        let mut guard = self.shared.registry.lock().await;
        let reg = &mut *guard;
        if reg.closed {
            return;
        }
        reg.buffer.push_back(Arc::clone(&change));
        while reg.buffer.len() > self.shared.config.buffer_capacity {
            if let Some(old) = reg.buffer.pop_front() {
                reg.evicted_through = reg.evicted_through.max(old.resource_version);
            }
        }
        let mut gone = Vec::new();
        for (id, entry) in reg.subs.iter() {
            tokio::select! {
                biased;
                _ = entry.token.cancelled() => gone.push(*id),
                res = entry.tx.send(Signal::Change(Arc::clone(&change))) => {
                    if res.is_err() {
                        gone.push(*id);
                    }
                }
            }
        }
        for id in gone {
            reg.subs.remove(&id);
        }
        counter!("watch_changes_total", 1u64);
        gauge!("watch_subscriptions", reg.subs.len() as f64);
    }

    /// Terminate every subscription with `err`.
    pub async fn broadcast_error(&self, err: StorageError) {
        let mut reg = self.shared.registry.lock().await;
        warn!(error = %err, subscribers = reg.subs.len(), "watch: terminating subscriptions with error");
        for (_, entry) in reg.subs.drain() {
            tokio::select! {
                biased;
                _ = entry.token.cancelled() => {}
                _ = entry.tx.send(Signal::Error(err.duplicate())) => {}
            }
        }
        gauge!("watch_subscriptions", 0.0);
    }

    /// Register a subscription and start its delivery task.
    pub async fn subscribe(&self, req: SubscribeRequest<T>) -> Watcher<T> {
        let SubscribeRequest { watermark, predicate, scope, initial_events, cancel } = req;
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (in_tx, in_rx) = mpsc::channel(self.shared.config.input_capacity.max(1));
        let (out_tx, out_rx) = mpsc::channel(self.shared.config.output_capacity.max(1));

        let mut reg = self.shared.registry.lock().await;
        if reg.closed {
            debug!(id, "watch: broadcaster closed; returning closed watcher");
            return Watcher::closed();
        }
        let oldest = reg.evicted_through.max(self.floor().unwrap_or(0));
        let expired = watermark < oldest;
        let backlog: Vec<Arc<Change<T>>> = if expired {
            Vec::new()
        } else {
            reg.buffer.iter().filter(|c| c.resource_version > watermark).cloned().collect()
        };
        if !expired {
            reg.subs.insert(id, Entry { tx: in_tx, token: cancel.clone() });
        }
        gauge!("watch_subscriptions", reg.subs.len() as f64);
        drop(reg);

        let head = if expired {
            counter!("watch_expired_total", 1u64);
            debug!(id, watermark, oldest, "watch: watermark older than replay buffer");
            vec![WatchEvent::Error(StorageError::ResourceExpired(format!(
                "resource version {} is too old; oldest available is {}",
                watermark, oldest
            )))]
        } else {
            initial_events
        };
        debug!(id, watermark, scope = %scope, predicate_label = %predicate.label, predicate_field = %predicate.field, replay = backlog.len(), "watch: subscribed");

        let task = Delivery { id, watermark, scope, predicate, token: cancel.clone(), out: out_tx };
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            task.run(head, backlog, in_rx).await;
            let mut reg = shared.registry.lock().await;
            reg.subs.remove(&id);
            gauge!("watch_subscriptions", reg.subs.len() as f64);
        });
        Watcher { id, rx: out_rx, token: cancel }
    }

    /// Stop every subscription and refuse new ones.
    pub async fn stop_all(&self) {
        let mut reg = self.shared.registry.lock().await;
        reg.closed = true;
        let n = reg.subs.len();
        for (_, entry) in reg.subs.drain() {
            entry.token.cancel();
        }
        reg.buffer.clear();
        gauge!("watch_subscriptions", 0.0);
        info!(stopped = n, "watch: broadcaster stopped");
    }
}

struct Delivery<T> {
    id: u64,
    watermark: ResourceVersion,
    scope: ResourceKey,
    predicate: Predicate,
    token: CancellationToken,
    out: mpsc::Sender<WatchEvent<T>>,
}

impl<T: Object> Delivery<T> {
    async fn run(self, head: Vec<WatchEvent<T>>, backlog: Vec<Arc<Change<T>>>, mut input: mpsc::Receiver<Signal<T>>) {
        let token = self.token.clone();
        let id = self.id;
        let pump = async move {
            for ev in head {
                let terminal = matches!(ev, WatchEvent::Error(_));
                if self.out.send(ev).await.is_err() || terminal {
                    return;
                }
            }
            for change in backlog.iter() {
                if !self.forward(change).await {
                    return;
                }
            }
            while let Some(signal) = input.recv().await {
                match signal {
                    Signal::Change(change) => {
                        if !self.forward(&change).await {
                            return;
                        }
                    }
                    Signal::Error(err) => {
                        let _ = self.out.send(WatchEvent::Error(err)).await;
                        return;
                    }
                }
            }
        };
        tokio::select! {
            biased;
            _ = token.cancelled() => debug!(id, "watch: subscription cancelled"),
            _ = pump => debug!(id, "watch: delivery ended"),
        }
    }

    async fn forward(&self, change: &Change<T>) -> bool {
        match classify(change, self.watermark, &self.scope, &self.predicate) {
            Some(ev) => {
                counter!("watch_events_delivered_total", 1u64);
                self.out.send(ev).await.is_ok()
            }
            None => true,
        }
    }
}

/// Caller side of a subscription: reads events and can stop it.
/// Dropping the watcher stops the subscription.
pub struct Watcher<T> {
    id: u64,
    rx: mpsc::Receiver<WatchEvent<T>>,
    token: CancellationToken,
}

impl<T> Watcher<T> {
    /// An empty watch that is already at end of stream.
    pub fn closed() -> Self {
        let (_tx, rx) = mpsc::channel(1);
        let token = CancellationToken::new();
        token.cancel();
        Self { id: 0, rx, token }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event, or `None` once the subscription has ended.
    pub async fn next(&mut self) -> Option<WatchEvent<T>> {
        self.rx.recv().await
    }

    pub fn stop(&mut self) {
        self.token.cancel();
        self.rx.close();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl<T> futures::Stream for Watcher<T> {
    type Item = WatchEvent<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl<T> Drop for Watcher<T> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
