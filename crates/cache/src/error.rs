//! Error types for cache admission, storage layout and entry lookup.

use thiserror::Error;

/// Result alias used throughout the cache crate.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors raised synchronously by cache operations.
///
/// Every variant is returned before shared state is mutated, so a failed
/// call never leaves the cache partially updated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// Admitting the entry would push usage over the byte budget.
    #[error("cache size exceeded: {requested} bytes requested, {available} bytes available")]
    CacheSizeExceeded { requested: usize, available: usize },

    /// A provided buffer does not match the expected storage length.
    #[error("shape mismatch: expected {expected} bytes, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    /// The requested maximum is below what is currently cached.
    #[error("cannot set max cache size to {requested} bytes while {current} bytes are in use")]
    InvalidCacheSize { requested: usize, current: usize },

    /// Geometry whose byte length does not fit in `usize`.
    #[error("invalid layout: {0}")]
    InvalidLayout(String),

    #[error("no cache entry with id {0}")]
    NotFound(String),

    #[error("an entry with id {0} is already cached")]
    AlreadyCached(String),

    #[error("frame index {index} out of range for {count} frames")]
    FrameOutOfRange { index: usize, count: usize },

    /// A view outlived the backing buffer it pointed into.
    #[error("backing buffer has been released")]
    BufferReleased,
}
