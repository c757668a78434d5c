use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::completion::CompletionQueue;
use crate::config::{LoadConfig, LoadOrder};
use crate::error::{CacheContents, CacheError};
use crate::types::{AssetKey, Cacheable, LoaderFactory, LoaderUnit};

/// A progress callback, invoked with `(received, expected)`.
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync + 'static>;

/// A completion callback for one subscriber of a load.
pub type LoadCallback<M> = Box<dyn FnOnce(CacheContents<M>) + Send + 'static>;

/// Passed to loader units to report progress.
///
/// Ticks fan out to the progress callbacks of all subscribers currently attached to the
/// deduplicated load. Reporting after the load has settled is a no-op.
pub struct ProgressReporter {
    sinks: Arc<Mutex<HashMap<u64, ProgressFn>>>,
}

impl ProgressReporter {
    pub fn report(&self, received: u64, expected: u64) {
        let sinks: Vec<_> = self.sinks.lock().unwrap().values().cloned().collect();
        for sink in sinks {
            sink(received, expected);
        }
    }
}

/// Handle identifying one subscriber of a deduplicated load.
///
/// The token does not own the load; cancelling it only detaches this subscriber. The
/// underlying loader unit keeps running as long as other subscribers remain.
#[derive(Clone, Debug)]
pub struct LoadToken {
    key: String,
    subscriber: u64,
}

impl LoadToken {
    /// The cache key of the load this token subscribes to.
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Lifecycle of a loader unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum UnitState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl UnitState {
    fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// The coordinator-side bookkeeping for one deduplicated load.
struct LoadUnit<M> {
    key: String,
    state: Mutex<UnitState>,
    subscribers: Mutex<HashMap<u64, LoadCallback<M>>>,
    progress: Arc<Mutex<HashMap<u64, ProgressFn>>>,
}

impl<M> LoadUnit<M> {
    /// Claims the unit for execution. Fails if it was cancelled while queued.
    fn transition_to_running(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state != UnitState::Pending {
            return false;
        }
        *state = UnitState::Running;
        true
    }
}

type Registry<M> = Arc<Mutex<HashMap<String, Arc<LoadUnit<M>>>>>;

/// A unit handed to the dispatcher, pairing bookkeeping with the actual fetch.
struct QueuedUnit<M> {
    unit: Arc<LoadUnit<M>>,
    fetch: Arc<dyn LoaderUnit<M>>,
}

/// Deduplicates and schedules loader units per asset key.
///
/// Loads for the same key attach to the single in-flight loader unit instead of starting
/// another fetch; all subscribers observe the same terminal result. Units execute on a
/// worker pool bounded by [`LoadConfig::max_concurrent`], with queued units starting in
/// FIFO or LIFO order depending on [`LoadConfig::order`].
pub struct LoadCoordinator<F: LoaderFactory> {
    factory: Arc<F>,
    registry: Registry<F::Metadata>,
    queue_tx: mpsc::UnboundedSender<QueuedUnit<F::Metadata>>,
    completion: CompletionQueue,
    subscriber_ids: AtomicU64,
}

impl<F: LoaderFactory> std::fmt::Debug for LoadCoordinator<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadCoordinator")
            .field("in-flight loads", &self.registry.lock().unwrap().len())
            .finish()
    }
}

impl<F: LoaderFactory> LoadCoordinator<F> {
    /// Creates a coordinator and spawns its dispatcher on the given runtime.
    pub fn new(
        factory: F,
        config: LoadConfig,
        completion: CompletionQueue,
        runtime: tokio::runtime::Handle,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let registry: Registry<F::Metadata> = Arc::default();

        runtime.spawn(dispatch_units(
            queue_rx,
            Arc::clone(&registry),
            config,
            completion.clone(),
        ));

        Arc::new(LoadCoordinator {
            factory: Arc::new(factory),
            registry,
            queue_tx,
            completion,
            subscriber_ids: AtomicU64::new(1),
        })
    }

    /// Requests a load for `asset`, attaching to an in-flight load for the same key if
    /// one exists.
    ///
    /// `options` reach the factory only when this call creates the load; a call that
    /// attaches to an in-flight load keeps the options of the request that started it.
    ///
    /// Returns `None` for an absent asset (empty identifier); the completion callback is
    /// then delivered a [`CacheError::NotFound`] without touching the loader factory.
    pub fn load(
        &self,
        asset: &F::Asset,
        options: &F::Options,
        progress: Option<ProgressFn>,
        on_done: LoadCallback<F::Metadata>,
    ) -> Option<LoadToken> {
        let key = asset.identifier();
        if key.is_empty() {
            self.completion
                .dispatch(move || on_done(Err(CacheError::NotFound)));
            return None;
        }

        let subscriber = self.subscriber_ids.fetch_add(1, Ordering::Relaxed);

        let mut registry = self.registry.lock().unwrap();
        if let Some(unit) = registry.get(key) {
            let state = unit.state.lock().unwrap();
            if !state.is_terminal() {
                drop(state);
                unit.subscribers.lock().unwrap().insert(subscriber, on_done);
                if let Some(progress) = progress {
                    unit.progress.lock().unwrap().insert(subscriber, progress);
                }
                tracing::trace!(key, subscriber, "Attached to in-flight load");
                return Some(LoadToken {
                    key: key.to_owned(),
                    subscriber,
                });
            }
        }

        let mut progress_sinks = HashMap::new();
        if let Some(progress) = progress {
            progress_sinks.insert(subscriber, progress);
        }
        let unit = Arc::new(LoadUnit {
            key: key.to_owned(),
            state: Mutex::new(UnitState::Pending),
            subscribers: Mutex::new(HashMap::from([(subscriber, on_done)])),
            progress: Arc::new(Mutex::new(progress_sinks)),
        });
        registry.insert(key.to_owned(), Arc::clone(&unit));
        drop(registry);

        // One factory invocation per deduplicated key. The factory is external code, so
        // no lock is held while calling into it.
        let fetch = self.factory.make_unit(asset, options);
        tracing::debug!(key, "Scheduling loader unit");

        if self
            .queue_tx
            .send(QueuedUnit {
                unit: Arc::clone(&unit),
                fetch,
            })
            .is_err()
        {
            // The dispatcher is gone, fail the load instead of leaving it in-flight forever.
            if let Some(subscribers) = settle(&self.registry, &unit, UnitState::Failed) {
                for on_done in subscribers {
                    self.completion
                        .dispatch(move || on_done(Err(CacheError::InternalError)));
                }
            }
            return None;
        }

        Some(LoadToken {
            key: key.to_owned(),
            subscriber,
        })
    }

    /// Detaches the subscriber identified by `token` from its load.
    ///
    /// Returns `false` for a stale or already-cancelled token. When the last subscriber
    /// detaches from a load that has not produced a result yet, the whole unit is
    /// cancelled and its eventual result discarded.
    pub fn cancel(&self, token: &LoadToken) -> bool {
        let registry = self.registry.lock().unwrap();
        let Some(unit) = registry.get(&token.key) else {
            return false;
        };
        let unit = Arc::clone(unit);
        drop(registry);

        let removed = unit
            .subscribers
            .lock()
            .unwrap()
            .remove(&token.subscriber)
            .is_some();
        unit.progress.lock().unwrap().remove(&token.subscriber);
        if !removed {
            return false;
        }
        tracing::trace!(
            key = %token.key,
            subscriber = token.subscriber,
            "Detached subscriber"
        );

        if unit.subscribers.lock().unwrap().is_empty() {
            settle_if_unsubscribed(&self.registry, &unit);
        }
        true
    }

    /// Cancels every load currently scheduled or running.
    pub fn cancel_all(&self) {
        let units: Vec<_> = self.registry.lock().unwrap().values().cloned().collect();
        for unit in units {
            settle(&self.registry, &unit, UnitState::Cancelled);
        }
    }

    /// Whether a load for `key` is currently scheduled or running.
    pub fn is_loading(&self, key: &str) -> bool {
        self.registry.lock().unwrap().contains_key(key)
    }
}

/// Cancels a unit that lost its last subscriber, unless another subscriber attached in
/// the meantime.
///
/// Attaching requires the registry lock, so re-checking emptiness under it closes the
/// window between the caller's own emptiness check and the transition; without it, a
/// subscriber attaching in that window would hold a live token for a unit that is about
/// to be cancelled underneath it.
fn settle_if_unsubscribed<M>(registry: &Registry<M>, unit: &Arc<LoadUnit<M>>) {
    let mut registry = registry.lock().unwrap();
    if !unit.subscribers.lock().unwrap().is_empty() {
        return;
    }
    {
        let mut state = unit.state.lock().unwrap();
        if state.is_terminal() {
            return;
        }
        *state = UnitState::Cancelled;
    }

    if let Some(registered) = registry.get(&unit.key) {
        if Arc::ptr_eq(registered, unit) {
            registry.remove(&unit.key);
        }
    }
    drop(registry);

    unit.progress.lock().unwrap().clear();
}

/// Moves a unit into a terminal state, unregisters it, and detaches its subscribers.
///
/// Returns the snapshot of completion callbacks if this call performed the transition,
/// or `None` if the unit was already terminal. The registry entry is removed exactly
/// once, by whichever caller wins the transition.
fn settle<M>(
    registry: &Registry<M>,
    unit: &Arc<LoadUnit<M>>,
    next: UnitState,
) -> Option<Vec<LoadCallback<M>>> {
    debug_assert!(next.is_terminal());

    let mut registry = registry.lock().unwrap();
    {
        let mut state = unit.state.lock().unwrap();
        if state.is_terminal() {
            return None;
        }
        *state = next;
    }

    if let Some(registered) = registry.get(&unit.key) {
        if Arc::ptr_eq(registered, unit) {
            registry.remove(&unit.key);
        }
    }
    drop(registry);

    unit.progress.lock().unwrap().clear();
    let subscribers = unit
        .subscribers
        .lock()
        .unwrap()
        .drain()
        .map(|(_, on_done)| on_done)
        .collect();
    Some(subscribers)
}

/// Long running task managing the bounded worker pool.
///
/// Ready units wait in a deque; whenever a worker slot is free, the next unit is picked
/// from the front (FIFO) or back (LIFO) and spawned. Only units that have not started
/// yet are affected by the ordering policy.
async fn dispatch_units<M: Cacheable>(
    mut queue_rx: mpsc::UnboundedReceiver<QueuedUnit<M>>,
    registry: Registry<M>,
    config: LoadConfig,
    completion: CompletionQueue,
) {
    let max_concurrent = config.max_concurrent.max(1);
    let (done_tx, mut done_rx) = mpsc::channel::<()>(max_concurrent);
    let mut free_slots = max_concurrent;
    let mut ready: VecDeque<QueuedUnit<M>> = VecDeque::new();

    loop {
        tokio::select! {
            queued = queue_rx.recv() => match queued {
                Some(queued) => ready.push_back(queued),
                None => break,
            },
            Some(_) = done_rx.recv() => free_slots += 1,
        }

        while free_slots > 0 {
            let queued = match config.order {
                LoadOrder::Fifo => ready.pop_front(),
                LoadOrder::Lifo => ready.pop_back(),
            };
            let Some(queued) = queued else { break };

            // A fully cancelled unit may still sit in the queue; skip it.
            if !queued.unit.transition_to_running() {
                continue;
            }

            free_slots -= 1;
            let done_tx = done_tx.clone();
            let registry = Arc::clone(&registry);
            let completion = completion.clone();
            let timeout = config.timeout;
            tokio::spawn(async move {
                run_unit(queued, registry, completion, timeout).await;
                let _ = done_tx.send(()).await;
            });
        }
    }
    tracing::debug!("Load dispatcher terminated");
}

/// Executes one loader unit and fans its terminal result out to all subscribers.
async fn run_unit<M: Cacheable>(
    queued: QueuedUnit<M>,
    registry: Registry<M>,
    completion: CompletionQueue,
    timeout: Duration,
) {
    let QueuedUnit { unit, fetch } = queued;
    let reporter = ProgressReporter {
        sinks: Arc::clone(&unit.progress),
    };

    let result = match tokio::time::timeout(timeout, fetch.fetch(&reporter)).await {
        Ok(result) => result,
        Err(_) => Err(CacheError::Timeout(timeout)),
    };

    let next = match result {
        Ok(_) => UnitState::Completed,
        Err(_) => UnitState::Failed,
    };

    let Some(subscribers) = settle(&registry, &unit, next) else {
        // Cancelled while running; the result is produced but never delivered.
        tracing::debug!(key = %unit.key, "Discarding result of cancelled load");
        return;
    };

    tracing::trace!(
        key = %unit.key,
        subscribers = subscribers.len(),
        ok = result.is_ok(),
        "Loader unit settled"
    );
    for on_done in subscribers {
        let result = result.clone();
        completion.dispatch(move || on_done(result));
    }
}
