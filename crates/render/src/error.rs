//! Error types for the GPU side of the pipeline.

use thiserror::Error;
use voxstream_cache::CacheError;

pub type RenderResult<T> = Result<T, RenderError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("texture allocation failed: {0}")]
    TextureAllocation(String),

    #[error("texture upload failed: {0}")]
    Upload(String),

    #[error("failed to create rendering context {index}: {reason}")]
    ContextCreation { index: usize, reason: String },

    #[error("no rendering context with index {0}")]
    InvalidContext(usize),

    /// The pool holds no contexts, either empty from the start or destroyed.
    #[error("the rendering context pool has no contexts")]
    NoContexts,

    #[error("unknown viewport {0}")]
    UnknownViewport(String),

    /// The texture mirror was disposed and cannot stream anymore.
    #[error("texture streamer has been disposed")]
    Disposed,

    #[error(transparent)]
    Cache(#[from] CacheError),
}
