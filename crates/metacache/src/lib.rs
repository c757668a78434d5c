//! # An embeddable metadata acquisition and caching engine
//!
//! `metacache` resolves opaque metadata for application-defined assets, caching what it
//! resolved across two tiers and deduplicating concurrent loads for the same asset.
//!
//! ## Layers
//!
//! The engine consists of the following layers:
//!
//! - A bounded in-memory layer for hot entries, keyed by the asset identifier.
//! - A file-system layer that persists encoded metadata under content-addressed file
//!   names, namespaced per store.
//! - A load coordinator that runs the actual acquisition through an
//!   application-provided [`LoaderFactory`], with request coalescing (at most one load
//!   per key, no matter how many callers ask), a bounded worker pool, and a configurable
//!   start order for queued work.
//!
//! A [`MetadataManager::load_metadata`] request goes through these steps:
//! - First, it consults the in-memory layer.
//! - On miss, it reads the file-system layer; a hit repopulates the in-memory layer.
//! - On miss, it asks the coordinator for a fresh load, joining an in-flight load for
//!   the same key if one exists.
//! - A fresh result is persisted through both cache layers before being delivered.
//!
//! Every completion callback is delivered on one designated [`CompletionQueue`], so
//! callers never observe callbacks racing each other. Each phase hands out a
//! cancellation handle ([`OperationHandle`], [`LoadToken`], [`QueryHandle`]); once a
//! cancellation wins, the corresponding callback is guaranteed not to fire.
//!
//! ## Integration
//!
//! Applications plug in via three traits: [`AssetKey`] names the thing being resolved,
//! [`Cacheable`] defines the on-disk encoding of the metadata, and [`LoaderFactory`]
//! produces the [`LoaderUnit`]s that do the acquisition. Everything else is
//! configuration, see [`CacheConfig`] and [`LoadConfig`].

mod completion;
mod config;
mod disk;
mod error;
mod loader;
mod manager;
mod store;
mod types;


pub use completion::CompletionQueue;
pub use config::{CacheConfig, LoadConfig, LoadOrder, QueryOptions};
pub use error::{CacheContents, CacheError};
pub use loader::{LoadCallback, LoadCoordinator, LoadToken, ProgressFn, ProgressReporter};
pub use manager::{MetadataCallback, MetadataManager, OperationHandle};
pub use store::{CacheStore, DoneCallback, ExistsCallback, QueryCallback, QueryHandle};
pub use types::{AssetKey, Cacheable, LoaderFactory, LoaderUnit, Tier};
