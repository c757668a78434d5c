use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Whether queued loader units start in submission order or newest-first.
///
/// This only affects units that are still waiting for a worker slot; units that have
/// already started are never reordered.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadOrder {
    #[default]
    Fifo,
    Lifo,
}

/// Configuration for a two-tier [`CacheStore`](crate::CacheStore).
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Root directory for disk caches. Will be created if it does not exist.
    pub cache_dir: PathBuf,

    /// Namespace of this store below `cache_dir`.
    ///
    /// Two stores with distinct namespaces never observe each other's entries.
    pub namespace: String,

    /// Approximate number of entries kept in the memory tier.
    ///
    /// Eviction is best-effort once the limit is exceeded, there is no strict recency
    /// guarantee.
    pub memory_count_limit: u64,

    /// Disables the memory tier entirely when set to `false`.
    pub cache_in_memory: bool,

    /// Probe the disk tier even when the memory tier already had the item, instead of
    /// short-circuiting on the memory hit.
    pub query_data_when_in_memory: bool,

    /// Run the disk phase of queries synchronously on the caller's thread instead of a
    /// background context.
    pub query_disk_sync: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            cache_dir: PathBuf::from(".metacache"),
            namespace: "default".into(),
            memory_count_limit: 500,
            cache_in_memory: true,
            query_data_when_in_memory: false,
            query_disk_sync: false,
        }
    }
}

/// Configuration for a [`LoadCoordinator`](crate::LoadCoordinator).
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    /// Maximum number of loader units running at the same time.
    pub max_concurrent: usize,

    /// Start order for units still waiting for a worker slot.
    pub order: LoadOrder,

    /// Deadline for a single loader unit.
    ///
    /// A unit exceeding it fails with [`CacheError::Timeout`](crate::CacheError::Timeout).
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for LoadConfig {
    fn default() -> Self {
        LoadConfig {
            max_concurrent: 6,
            order: LoadOrder::Fifo,
            timeout: Duration::from_secs(15),
        }
    }
}

/// Per-request overrides of the store-wide query flags.
///
/// Each flag is combined with its [`CacheConfig`] counterpart with "or" semantics, so a
/// request can opt in to, but not out of, a store-wide behavior.
#[derive(Clone, Copy, Debug, Default)]
pub struct QueryOptions {
    /// See [`CacheConfig::query_data_when_in_memory`].
    pub query_data_when_in_memory: bool,
    /// See [`CacheConfig::query_disk_sync`].
    pub query_disk_sync: bool,
}
