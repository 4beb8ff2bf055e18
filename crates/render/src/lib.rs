//! Voxstream Render Library
//!
//! GPU side of the volume pipeline: streaming dirty frames of a cached
//! volume into a 3-D texture, and sharing a fixed set of rendering contexts
//! between viewports. Graphics backends plug in through [`GpuDevice`] and
//! [`ContextFactory`].

pub mod context_pool;
pub mod device;
pub mod error;
pub mod format;
pub mod streamer;

pub use context_pool::{
    ContextPool, ContextSizeGroup, ViewportSizeRecord, DEFAULT_SIZE_TOLERANCE,
};
pub use device::{ContextFactory, GpuDevice};
pub use error::{RenderError, RenderResult};
pub use format::{convert_samples, needs_conversion, TextureDescriptor, TextureFormat, UploadReport};
pub use streamer::{StreamerState, TextureStreamer};
