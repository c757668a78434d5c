use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::completion::CompletionQueue;
use crate::config::{CacheConfig, QueryOptions};
use crate::disk::DiskCache;
use crate::types::{Cacheable, Tier};

/// A callback invoked with the result of a tiered query.
///
/// `None` means neither tier had a usable value; the tier then is [`Tier::None`].
pub type QueryCallback<M> = Box<dyn FnOnce(Option<M>, Tier) + Send + 'static>;

/// A callback invoked once an asynchronous store operation finished.
pub type DoneCallback = Box<dyn FnOnce() + Send + 'static>;

/// A callback invoked with the result of an existence probe.
pub type ExistsCallback = Box<dyn FnOnce(bool) + Send + 'static>;

type MemoryCache<M> = moka::sync::Cache<String, M>;

/// Cancellable handle for the disk phase of [`CacheStore::query`].
///
/// Cancelling suppresses delivery if the disk phase has not produced a result yet; it
/// does not abort a read that is already in flight. Memory-tier hits complete
/// synchronously and never return a handle.
#[derive(Clone, Debug)]
pub struct QueryHandle {
    cancelled: Arc<AtomicBool>,
}

impl QueryHandle {
    fn new() -> Self {
        QueryHandle {
            cancelled: Arc::default(),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// A two-tier cache: a bounded in-memory map over a [`DiskCache`].
///
/// The memory tier is an approximate-LRU keyed by the asset identifier; the disk tier
/// stores the encoded metadata content-keyed. Disk I/O runs on the blocking pool of the
/// injected runtime, results are delivered on the shared completion context. Disk hits
/// repopulate the memory tier as a side effect.
pub struct CacheStore<M> {
    config: CacheConfig,
    memory: Option<MemoryCache<M>>,
    disk: DiskCache,
    completion: CompletionQueue,
    runtime: tokio::runtime::Handle,
}

impl<M> std::fmt::Debug for CacheStore<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("config", &self.config)
            .field(
                "in-memory items",
                &self.memory.as_ref().map_or(0, |m| m.entry_count()),
            )
            .finish()
    }
}

impl<M: Cacheable> CacheStore<M> {
    /// Creates the store, opening (and if necessary creating) its namespace directory.
    ///
    /// A directory that cannot be created makes the whole store unusable, so this is the
    /// one fatal error of the cache layer.
    pub fn new(
        config: CacheConfig,
        completion: CompletionQueue,
        runtime: tokio::runtime::Handle,
    ) -> io::Result<Self> {
        let disk = DiskCache::new(&config.cache_dir, &config.namespace)?;
        let memory = config.cache_in_memory.then(|| {
            MemoryCache::builder()
                .max_capacity(config.memory_count_limit)
                .build()
        });

        Ok(CacheStore {
            config,
            memory,
            disk,
            completion,
            runtime,
        })
    }

    /// Writes `metadata` into the memory tier and, if `to_disk`, the disk tier.
    ///
    /// The memory write happens synchronously; the disk write is fire-and-forget:
    /// encode or I/O failures are logged and never surfaced. `on_done` is delivered once
    /// the disk attempt finished (or immediately when no disk write was requested).
    pub fn store(&self, metadata: M, key: &str, to_disk: bool, on_done: Option<DoneCallback>) {
        if let Some(memory) = &self.memory {
            memory.insert(key.to_owned(), metadata.clone());
        }

        if !to_disk {
            if let Some(on_done) = on_done {
                self.completion.dispatch(on_done);
            }
            return;
        }

        let disk = self.disk.clone();
        let key = key.to_owned();
        let completion = self.completion.clone();
        self.runtime.spawn(async move {
            let write = tokio::task::spawn_blocking(move || write_to_disk(&disk, &metadata, &key));
            if write.await.is_err() {
                tracing::error!("Disk write task panicked");
            }
            if let Some(on_done) = on_done {
                completion.dispatch(on_done);
            }
        });
    }

    /// Tiered lookup for `key`.
    ///
    /// By default a memory hit short-circuits and the disk phase runs asynchronously on
    /// a miss; both can be changed via [`QueryOptions`] or the store-wide config. When
    /// the disk phase runs asynchronously, the returned handle can be used to suppress
    /// its delivery.
    pub fn query(
        &self,
        key: &str,
        options: QueryOptions,
        on_done: QueryCallback<M>,
    ) -> Option<QueryHandle> {
        let in_memory = self.from_memory(key);
        let force_disk = options.query_data_when_in_memory || self.config.query_data_when_in_memory;

        if let Some(metadata) = in_memory {
            if !force_disk {
                self.completion
                    .dispatch(move || on_done(Some(metadata), Tier::Memory));
                return None;
            }

            // The disk phase runs even on a memory hit; the memory value is only the
            // fallback in case the disk has nothing.
            return self.query_disk(key, Some(metadata), options, on_done);
        }

        self.query_disk(key, None, options, on_done)
    }

    fn query_disk(
        &self,
        key: &str,
        memory_fallback: Option<M>,
        options: QueryOptions,
        on_done: QueryCallback<M>,
    ) -> Option<QueryHandle> {
        let disk = self.disk.clone();
        let memory = self.memory.clone();
        let key = key.to_owned();

        let run = move || {
            match read_from_disk::<M>(&disk, &key) {
                Some(metadata) => {
                    // populate the memory tier before delivery
                    if let Some(memory) = &memory {
                        memory.insert(key, metadata.clone());
                    }
                    (Some(metadata), Tier::Disk)
                }
                None => match memory_fallback {
                    Some(metadata) => (Some(metadata), Tier::Memory),
                    None => (None, Tier::None),
                },
            }
        };

        if options.query_disk_sync || self.config.query_disk_sync {
            let (metadata, tier) = run();
            on_done(metadata, tier);
            return None;
        }

        let handle = QueryHandle::new();
        let cancelled = Arc::clone(&handle.cancelled);
        let completion = self.completion.clone();
        self.runtime.spawn(async move {
            let Ok((metadata, tier)) = tokio::task::spawn_blocking(run).await else {
                tracing::error!("Disk query task panicked");
                return;
            };
            if cancelled.load(Ordering::Relaxed) {
                return;
            }
            completion.dispatch(move || {
                // a cancel may land between queueing and delivery
                if !cancelled.load(Ordering::Relaxed) {
                    on_done(metadata, tier);
                }
            });
        });
        Some(handle)
    }

    /// Synchronous memory-tier lookup.
    pub fn from_memory(&self, key: &str) -> Option<M> {
        self.memory.as_ref()?.get(key)
    }

    /// Synchronous disk-tier lookup; populates the memory tier on a hit.
    pub fn from_disk(&self, key: &str) -> Option<M> {
        let metadata = read_from_disk::<M>(&self.disk, key)?;
        if let Some(memory) = &self.memory {
            memory.insert(key.to_owned(), metadata.clone());
        }
        Some(metadata)
    }

    /// Synchronous lookup, memory tier first, else disk.
    pub fn from_either(&self, key: &str) -> Option<M> {
        self.from_memory(key).or_else(|| self.from_disk(key))
    }

    /// Synchronous disk-only existence probe; does not decode the content.
    pub fn query_exists(&self, key: &str) -> bool {
        self.disk.contains(key)
    }

    /// Asynchronous disk-only existence probe.
    pub fn query_exists_async(&self, key: &str, on_done: ExistsCallback) {
        let disk = self.disk.clone();
        let key = key.to_owned();
        let completion = self.completion.clone();
        self.runtime.spawn(async move {
            let exists = tokio::task::spawn_blocking(move || disk.contains(&key))
                .await
                .unwrap_or(false);
            completion.dispatch(move || on_done(exists));
        });
    }

    /// Removes `key` from the memory tier and, if `from_disk`, from the disk tier.
    pub fn remove(&self, key: &str, from_disk: bool, on_done: Option<DoneCallback>) {
        if let Some(memory) = &self.memory {
            memory.invalidate(key);
        }

        if !from_disk {
            if let Some(on_done) = on_done {
                self.completion.dispatch(on_done);
            }
            return;
        }

        let disk = self.disk.clone();
        let key = key.to_owned();
        let completion = self.completion.clone();
        self.runtime.spawn(async move {
            let removed = tokio::task::spawn_blocking(move || {
                if let Err(e) = disk.remove(&key) {
                    tracing::error!(
                        error = &e as &dyn std::error::Error,
                        key,
                        "Failed to remove cache file"
                    );
                }
            });
            removed.await.ok();
            if let Some(on_done) = on_done {
                completion.dispatch(on_done);
            }
        });
    }

    /// Drops every entry of the memory tier.
    pub fn clear_memory(&self) {
        if let Some(memory) = &self.memory {
            memory.invalidate_all();
        }
    }

    /// Removes the entire disk namespace in the background.
    pub fn clear_disk(&self, on_done: Option<DoneCallback>) {
        let disk = self.disk.clone();
        let completion = self.completion.clone();
        self.runtime.spawn(async move {
            let cleared = tokio::task::spawn_blocking(move || {
                if let Err(e) = disk.clear() {
                    tracing::error!(
                        error = &e as &dyn std::error::Error,
                        "Failed to clear disk cache"
                    );
                }
            });
            cleared.await.ok();
            if let Some(on_done) = on_done {
                completion.dispatch(on_done);
            }
        });
    }

    /// The file path `key` is (or would be) persisted at.
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.disk.path_for(key)
    }

    /// Reports the number of entries in the disk tier.
    pub fn disk_entry_count(&self, on_done: Box<dyn FnOnce(usize) + Send + 'static>) {
        let disk = self.disk.clone();
        let completion = self.completion.clone();
        self.runtime.spawn(async move {
            let count = tokio::task::spawn_blocking(move || disk.entry_count().unwrap_or(0))
                .await
                .unwrap_or(0);
            completion.dispatch(move || on_done(count));
        });
    }

    /// Reports the total size in bytes of the disk tier.
    pub fn disk_size(&self, on_done: Box<dyn FnOnce(u64) + Send + 'static>) {
        let disk = self.disk.clone();
        let completion = self.completion.clone();
        self.runtime.spawn(async move {
            let size = tokio::task::spawn_blocking(move || disk.size_in_bytes().unwrap_or(0))
                .await
                .unwrap_or(0);
            completion.dispatch(move || on_done(size));
        });
    }
}

/// Encodes and persists one entry; failures are logged, never surfaced.
fn write_to_disk<M: Cacheable>(disk: &DiskCache, metadata: &M, key: &str) {
    let bytes = match metadata.encode() {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!(key, error = %e, "Failed to encode metadata for the disk cache");
            return;
        }
    };
    if let Err(e) = disk.save(&bytes, key) {
        tracing::error!(
            error = &e as &dyn std::error::Error,
            key,
            "Failed to write metadata to the disk cache"
        );
    }
}

/// Reads and decodes one entry; a missing or undecodable file is a miss.
fn read_from_disk<M: Cacheable>(disk: &DiskCache, key: &str) -> Option<M> {
    let bytes = match disk.load(key) {
        Ok(bytes) => bytes?,
        Err(e) => {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                key,
                "Failed to read cached metadata"
            );
            return None;
        }
    };
    match M::decode(&bytes) {
        Ok(metadata) => Some(metadata),
        Err(e) => {
            tracing::error!(key, error = %e, "Failed to decode cached metadata");
            None
        }
    }
}
