//! Load-state observation scoped to one coordinator instance.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{self, MissedTickBehavior};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, trace};

use crate::domain::entities::{CacheKey, LoadState};

/// Default interval at which completed loads are announced.
pub const DEFAULT_BATCH_INTERVAL: Duration = Duration::from_millis(100);

/// A batch is sent early once it holds this many keys.
const MAX_BATCH_LEN: usize = 64;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Past this many tracked keys, settled keys nobody observes are dropped.
pub const PRUNE_THRESHOLD: usize = 512;

/// Cache-level events for consumers that track many keys at once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// These keys finished loading since the previous batch.
    Loaded(Vec<CacheKey>),
    /// These keys failed to load since the previous batch.
    Failed(Vec<CacheKey>),
    /// These keys were dropped by an explicit refresh.
    Invalidated(Vec<CacheKey>),
    /// Everything was cleared.
    Cleared,
}

/// Per-key [`LoadState`] channels plus a batched event feed.
pub struct LoadStateRegistry {
    states: Mutex<HashMap<CacheKey, watch::Sender<LoadState>>>,
    settled_tx: Option<mpsc::UnboundedSender<Settled>>,
    events: broadcast::Sender<CacheEvent>,
}

/// A key that reached a terminal state, queued for the next batch.
#[derive(Debug)]
struct Settled {
    key: CacheKey,
    loaded: bool,
}

impl std::fmt::Debug for LoadStateRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadStateRegistry")
            .field("keys", &self.states.lock().len())
            .finish_non_exhaustive()
    }
}

impl LoadStateRegistry {
    /// Creates a registry. When a runtime is available, a batching task
    /// groups `Loaded` and `Failed` notifications per `batch_interval`.
    #[must_use]
    pub fn new(batch_interval: Duration) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let settled_tx = tokio::runtime::Handle::try_current().ok().map(|handle| {
            let (tx, rx) = mpsc::unbounded_channel();
            handle.spawn(run_batcher(rx, events.clone(), batch_interval));
            tx
        });

        Arc::new(Self {
            states: Mutex::new(HashMap::new()),
            settled_tx,
            events,
        })
    }

    /// Current state of `key`.
    #[must_use]
    pub fn get(&self, key: &CacheKey) -> LoadState {
        self.states
            .lock()
            .get(key)
            .map_or(LoadState::Idle, |tx| tx.borrow().clone())
    }

    /// Moves `key` to `next`, waking its observers.
    ///
    /// Moving to the current state is a no-op. Moves the state machine does
    /// not allow are logged and rejected; `loaded -> loading` needs `refresh`.
    /// Returns true if the state changed.
    pub fn transition(&self, key: &CacheKey, next: LoadState, refresh: bool) -> bool {
        let terminal = next.is_terminal().then(|| next.is_loaded());
        let changed = {
            let mut states = self.states.lock();
            let tx = entry(&mut states, key);
            tx.send_if_modified(|current| {
                if *current == next {
                    return false;
                }
                if !current.can_transition_to(&next, refresh) {
                    debug!(key = %key, from = %current, to = %next, "Rejected load state change");
                    return false;
                }
                trace!(key = %key, from = %current, to = %next, "Load state change");
                *current = next;
                true
            })
        };

        if changed
            && let Some(loaded) = terminal
            && let Some(tx) = &self.settled_tx
        {
            let _ = tx.send(Settled {
                key: key.clone(),
                loaded,
            });
        }
        changed
    }

    /// Stream of states for `key`, starting with the current one.
    pub fn observe(&self, key: &CacheKey) -> WatchStream<LoadState> {
        let rx = entry(&mut self.states.lock(), key).subscribe();
        WatchStream::new(rx)
    }

    /// Number of keys currently tracked.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.states.lock().len()
    }

    /// Subscribes to batched cache events.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    /// Resets the given keys to idle and announces the invalidation.
    pub fn invalidate(&self, keys: Vec<CacheKey>) {
        if keys.is_empty() {
            return;
        }
        for key in &keys {
            self.transition(key, LoadState::Idle, false);
        }
        let _ = self.events.send(CacheEvent::Invalidated(keys));
    }

    /// Resets every key to idle, forgets the ones nobody observes, and
    /// announces the clear.
    pub fn reset_all(&self) {
        let mut states = self.states.lock();
        for tx in states.values() {
            tx.send_replace(LoadState::Idle);
        }
        prune(&mut states);
        drop(states);
        let _ = self.events.send(CacheEvent::Cleared);
    }

    /// Keys currently tracked for the given predicate.
    pub fn keys_where(&self, mut predicate: impl FnMut(&CacheKey) -> bool) -> Vec<CacheKey> {
        self.states
            .lock()
            .keys()
            .filter(|k| predicate(k))
            .cloned()
            .collect()
    }
}

/// Returns the channel for `key`, creating it idle. Growing past
/// [`PRUNE_THRESHOLD`] first drops idle or loaded keys without observers.
fn entry<'a>(
    states: &'a mut HashMap<CacheKey, watch::Sender<LoadState>>,
    key: &CacheKey,
) -> &'a watch::Sender<LoadState> {
    if !states.contains_key(key) && states.len() >= PRUNE_THRESHOLD {
        prune(states);
    }
    states
        .entry(key.clone())
        .or_insert_with(|| watch::channel(LoadState::Idle).0)
}

fn prune(states: &mut HashMap<CacheKey, watch::Sender<LoadState>>) {
    let before = states.len();
    states.retain(|_, tx| {
        tx.receiver_count() > 0 || !matches!(*tx.borrow(), LoadState::Idle | LoadState::Loaded)
    });
    let pruned = before - states.len();
    if pruned > 0 {
        trace!(pruned, remaining = states.len(), "Pruned unobserved load states");
    }
}

#[derive(Default)]
struct Batch {
    loaded: Vec<CacheKey>,
    failed: Vec<CacheKey>,
}

impl Batch {
    fn push(&mut self, settled: Settled) {
        let list = if settled.loaded {
            &mut self.loaded
        } else {
            &mut self.failed
        };
        if !list.contains(&settled.key) {
            list.push(settled.key);
        }
    }

    fn len(&self) -> usize {
        self.loaded.len() + self.failed.len()
    }

    fn publish(&mut self, events: &broadcast::Sender<CacheEvent>) {
        if !self.loaded.is_empty() {
            trace!(count = self.loaded.len(), "Publishing loaded batch");
            let _ = events.send(CacheEvent::Loaded(std::mem::take(&mut self.loaded)));
        }
        if !self.failed.is_empty() {
            trace!(count = self.failed.len(), "Publishing failed batch");
            let _ = events.send(CacheEvent::Failed(std::mem::take(&mut self.failed)));
        }
    }
}

async fn run_batcher(
    mut rx: mpsc::UnboundedReceiver<Settled>,
    events: broadcast::Sender<CacheEvent>,
    interval: Duration,
) {
    let mut ticker = time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pending = Batch::default();

    loop {
        tokio::select! {
            settled = rx.recv() => {
                match settled {
                    Some(settled) => {
                        pending.push(settled);
                        if pending.len() >= MAX_BATCH_LEN {
                            pending.publish(&events);
                        }
                    }
                    None => break,
                }
            }
            _ = ticker.tick() => pending.publish(&events),
        }
    }

    pending.publish(&events);
}
