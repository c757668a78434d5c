use std::time::Duration;

use thiserror::Error;

/// An error that happens while looking up or loading metadata for an asset.
///
/// These errors are delivered to completion callbacks as-is, with the exception of
/// [`InternalError`](Self::InternalError), which stands in for unexpected failures
/// inside the engine after the original error has been logged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// No asset was given, or the loader reported that the asset does not exist.
    #[error("not found")]
    NotFound,
    /// The loader unit failed to produce the metadata.
    ///
    /// The attached string contains the loader's reported error.
    #[error("load failed: {0}")]
    LoadError(String),
    /// The loader unit did not finish within the configured deadline.
    #[error("load timed out after {0:?}")]
    Timeout(Duration),
    /// Metadata could not be encoded to or decoded from bytes.
    #[error("serialization failed: {0}")]
    Serialization(String),
    /// An unexpected error in the engine itself.
    ///
    /// This variant is not intended to carry details; those are logged when it is created.
    #[error("internal error")]
    InternalError,
}

impl From<std::io::Error> for CacheError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl CacheError {
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }
}

/// The result of a cache lookup or load, either the value or the reason why it
/// is unavailable.
pub type CacheContents<T = ()> = Result<T, CacheError>;
