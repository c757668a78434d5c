use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::CacheContents;
use crate::loader::ProgressReporter;

/// An asset that metadata can be looked up for.
///
/// The identifier must be non-empty and stable for the lifetime of the asset; it is used
/// verbatim as the memory-tier key and hashed into the disk-tier file name. An empty
/// identifier is the encoding for "no asset" and yields
/// [`CacheError::NotFound`](crate::CacheError::NotFound).
pub trait AssetKey: Send + Sync + 'static {
    fn identifier(&self) -> &str;
}

impl AssetKey for String {
    fn identifier(&self) -> &str {
        self
    }
}

/// A metadata value that can round-trip through bytes for disk persistence.
pub trait Cacheable: Clone + Send + Sync + 'static {
    fn encode(&self) -> CacheContents<Vec<u8>>;

    fn decode(bytes: &[u8]) -> CacheContents<Self>;
}

/// One concrete execution of the external fetch strategy for one asset.
///
/// Units are created by a [`LoaderFactory`] and executed at most once by the load
/// coordinator. Progress ticks reported through the [`ProgressReporter`] fan out to all
/// subscribers currently attached to the deduplicated load.
pub trait LoaderUnit<M>: Send + Sync + 'static {
    fn fetch<'a>(&'a self, progress: &'a ProgressReporter) -> BoxFuture<'a, CacheContents<M>>;
}

/// The externally supplied loading strategy.
///
/// [`make_unit`](Self::make_unit) is invoked exactly once per deduplicated cache key,
/// no matter how many subscribers attach to the resulting load. It receives the options
/// of the request that created the load; the options of requests that merely attach to
/// an in-flight load are discarded. Use `()` when the strategy has no options.
pub trait LoaderFactory: Send + Sync + 'static {
    type Asset: AssetKey;
    type Options: Send + 'static;
    type Metadata: Cacheable;

    fn make_unit(
        &self,
        asset: &Self::Asset,
        options: &Self::Options,
    ) -> Arc<dyn LoaderUnit<Self::Metadata>>;
}

/// Where a delivered result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Freshly loaded, not served from any cache tier.
    None,
    /// Served from the in-memory tier.
    Memory,
    /// Served from the on-disk tier.
    Disk,
}

impl AsRef<str> for Tier {
    fn as_ref(&self) -> &str {
        match self {
            Self::None => "none",
            Self::Memory => "memory",
            Self::Disk => "disk",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}
