use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::completion::CompletionQueue;
use crate::config::{CacheConfig, LoadConfig, QueryOptions};
use crate::error::{CacheContents, CacheError};
use crate::loader::{LoadCoordinator, LoadToken, ProgressFn};
use crate::store::{CacheStore, DoneCallback, ExistsCallback};
use crate::types::{AssetKey, LoaderFactory, Tier};

/// A callback invoked with the final outcome of [`MetadataManager::load_metadata`].
///
/// The tier says where the metadata came from; a fresh load reports [`Tier::None`].
pub type MetadataCallback<M> = Box<dyn FnOnce(CacheContents<M>, Tier) + Send + 'static>;

type RunningSet = Mutex<HashMap<u64, Arc<CombinedOperation>>>;

#[derive(Default)]
struct OpState {
    cancelled: bool,
    finished: bool,
    query: Option<crate::store::QueryHandle>,
    token: Option<LoadToken>,
}

/// One `load_metadata` request: the cache query phase plus the optional load phase,
/// cancellable as a unit.
///
/// Exactly one of `cancel` and `finish` wins; after either, no completion callback for
/// this operation fires and the operation is gone from the manager's running set.
pub struct CombinedOperation {
    id: u64,
    state: Mutex<OpState>,
    cancel_load: Box<dyn Fn(&LoadToken) -> bool + Send + Sync>,
    running: Weak<RunningSet>,
}

impl std::fmt::Debug for CombinedOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("CombinedOperation")
            .field("id", &self.id)
            .field("cancelled", &state.cancelled)
            .field("finished", &state.finished)
            .finish()
    }
}

impl CombinedOperation {
    /// Cancels whichever phase is active and unregisters the operation.
    fn cancel(&self) {
        let mut state = self.state.lock().unwrap();
        if state.cancelled || state.finished {
            return;
        }
        state.cancelled = true;
        if let Some(query) = state.query.take() {
            query.cancel();
        }
        if let Some(token) = state.token.take() {
            (self.cancel_load)(&token);
        }
        if let Some(running) = self.running.upgrade() {
            running.lock().unwrap().remove(&self.id);
        }
        tracing::debug!(operation = self.id, "Cancelled combined operation");
    }

    /// Marks the operation terminal. Returns whether this call won, i.e. whether the
    /// caller should deliver the result.
    fn finish(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.cancelled || state.finished {
            return false;
        }
        state.finished = true;
        state.query = None;
        state.token = None;
        if let Some(running) = self.running.upgrade() {
            running.lock().unwrap().remove(&self.id);
        }
        true
    }

    fn is_cancelled(&self) -> bool {
        self.state.lock().unwrap().cancelled
    }

    /// Records the query handle, unless the operation already raced to a terminal state,
    /// in which case the handle is cancelled on the spot.
    fn set_query(&self, query: crate::store::QueryHandle) {
        let mut state = self.state.lock().unwrap();
        if state.cancelled || state.finished {
            drop(state);
            query.cancel();
            return;
        }
        state.query = Some(query);
    }

    fn set_token(&self, token: LoadToken) {
        let mut state = self.state.lock().unwrap();
        if state.cancelled || state.finished {
            drop(state);
            (self.cancel_load)(&token);
            return;
        }
        state.token = Some(token);
    }
}

/// Cancellation handle for one [`MetadataManager::load_metadata`] request.
#[derive(Clone, Debug)]
pub struct OperationHandle {
    op: Arc<CombinedOperation>,
}

impl OperationHandle {
    pub fn cancel(&self) {
        self.op.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.op.is_cancelled()
    }
}

/// The orchestrator: serves metadata from the [`CacheStore`] and falls back to the
/// [`LoadCoordinator`] on a miss, persisting fresh results through both tiers.
pub struct MetadataManager<F: LoaderFactory> {
    store: Arc<CacheStore<F::Metadata>>,
    coordinator: Arc<LoadCoordinator<F>>,
    running: Arc<RunningSet>,
    operation_ids: AtomicU64,
    completion: CompletionQueue,
}

impl<F: LoaderFactory> std::fmt::Debug for MetadataManager<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataManager")
            .field("running operations", &self.running.lock().unwrap().len())
            .finish()
    }
}

impl<F: LoaderFactory> MetadataManager<F> {
    /// Creates the manager together with its cache store and load coordinator, sharing
    /// one completion context across all three.
    pub fn new(
        factory: F,
        cache_config: CacheConfig,
        load_config: LoadConfig,
        completion: CompletionQueue,
        runtime: tokio::runtime::Handle,
    ) -> io::Result<Arc<Self>> {
        let store = Arc::new(CacheStore::new(
            cache_config,
            completion.clone(),
            runtime.clone(),
        )?);
        let coordinator = LoadCoordinator::new(factory, load_config, completion.clone(), runtime);

        Ok(Arc::new(MetadataManager {
            store,
            coordinator,
            running: Arc::default(),
            operation_ids: AtomicU64::new(1),
            completion,
        }))
    }

    /// Resolves metadata for `asset`: memory tier, then disk tier, then a fresh load.
    ///
    /// `loader_options` are forwarded to the [`LoaderFactory`] if the request falls
    /// through to a fresh load; a request that joins an in-flight load keeps the options
    /// of the request that started it.
    ///
    /// The callback fires exactly once on the completion context, unless the returned
    /// handle cancels the operation first, in which case it never fires. An asset with
    /// an empty identifier resolves to [`CacheError::NotFound`] immediately.
    pub fn load_metadata(
        self: &Arc<Self>,
        asset: F::Asset,
        options: QueryOptions,
        loader_options: F::Options,
        progress: Option<ProgressFn>,
        on_done: MetadataCallback<F::Metadata>,
    ) -> OperationHandle {
        let id = self.operation_ids.fetch_add(1, Ordering::Relaxed);
        let coordinator = Arc::clone(&self.coordinator);
        let op = Arc::new(CombinedOperation {
            id,
            state: Mutex::default(),
            cancel_load: Box::new(move |token| coordinator.cancel(token)),
            running: Arc::downgrade(&self.running),
        });
        let handle = OperationHandle {
            op: Arc::clone(&op),
        };

        if asset.identifier().is_empty() {
            op.finish();
            self.completion
                .dispatch(move || on_done(Err(CacheError::NotFound), Tier::None));
            return handle;
        }

        self.running.lock().unwrap().insert(id, Arc::clone(&op));

        let key = asset.identifier().to_owned();
        let manager = Arc::clone(self);
        let query_op = Arc::clone(&op);
        let query = self.store.query(
            &key,
            options,
            Box::new(move |found, tier| {
                if let Some(metadata) = found {
                    if query_op.finish() {
                        on_done(Ok(metadata), tier);
                    }
                    return;
                }
                if query_op.is_cancelled() {
                    return;
                }
                manager.start_load(asset, loader_options, query_op, progress, on_done);
            }),
        );
        if let Some(query) = query {
            op.set_query(query);
        }

        handle
    }

    fn start_load(
        self: &Arc<Self>,
        asset: F::Asset,
        loader_options: F::Options,
        op: Arc<CombinedOperation>,
        progress: Option<ProgressFn>,
        on_done: MetadataCallback<F::Metadata>,
    ) {
        let store = Arc::clone(&self.store);
        let key = asset.identifier().to_owned();
        let load_op = Arc::clone(&op);
        let token = self.coordinator.load(
            &asset,
            &loader_options,
            progress,
            Box::new(move |result| {
                if let Ok(metadata) = &result {
                    // fresh results land in the cache even when this subscriber
                    // lost the race against its own cancellation
                    store.store(metadata.clone(), &key, true, None);
                }
                if load_op.finish() {
                    on_done(result, Tier::None);
                }
            }),
        );
        if let Some(token) = token {
            op.set_token(token);
        }
    }

    /// Cancels every in-flight `load_metadata` operation.
    pub fn cancel_all(&self) {
        let ops: Vec<_> = self.running.lock().unwrap().values().cloned().collect();
        for op in ops {
            op.cancel();
        }
    }

    /// Whether any `load_metadata` operation is still in flight.
    pub fn is_running(&self) -> bool {
        !self.running.lock().unwrap().is_empty()
    }

    /// Persists `metadata` for `asset` through both cache tiers, bypassing the loader.
    pub fn save_metadata(&self, metadata: F::Metadata, asset: &F::Asset, on_done: Option<DoneCallback>) {
        let key = asset.identifier();
        if key.is_empty() {
            if let Some(on_done) = on_done {
                self.completion.dispatch(on_done);
            }
            return;
        }
        self.store.store(metadata, key, true, on_done);
    }

    /// Whether either cache tier has metadata for `asset`.
    ///
    /// A memory hit answers synchronously; otherwise the disk tier is probed in the
    /// background. Either way the answer arrives through `on_done` on the completion
    /// context.
    pub fn cached_exists(&self, asset: &F::Asset, on_done: ExistsCallback) {
        let key = asset.identifier();
        if self.store.from_memory(key).is_some() {
            self.completion.dispatch(move || on_done(true));
            return;
        }
        self.store.query_exists_async(key, on_done);
    }

    /// Whether the disk tier has metadata for `asset`.
    pub fn disk_exists(&self, asset: &F::Asset, on_done: ExistsCallback) {
        self.store.query_exists_async(asset.identifier(), on_done);
    }

    /// The underlying cache store.
    pub fn cache(&self) -> &Arc<CacheStore<F::Metadata>> {
        &self.store
    }

    /// The underlying load coordinator.
    pub fn loader(&self) -> &Arc<LoadCoordinator<F>> {
        &self.coordinator
    }
}
