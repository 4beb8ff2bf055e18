//! Error types for volume streaming.

use thiserror::Error;
use voxstream_cache::CacheError;

pub type LoadResult<T> = Result<T, LoadError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Fetching or decoding a frame failed.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("load cancelled")]
    Cancelled,

    #[error("no cached volume with id {0}")]
    UnknownVolume(String),
}

impl LoadError {
    pub fn transport(message: impl Into<String>) -> Self {
        LoadError::Transport(message.into())
    }
}
