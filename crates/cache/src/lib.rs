//! Voxstream Cache Library
//!
//! Byte-budgeted storage for frame images and volumes: contiguous backing
//! buffers, per-frame load bitmaps, dirty-frame tracking, zero-copy aliasing
//! of frame images onto volume buffers, and the event bus the rest of the
//! pipeline reports through.

pub mod alias;
pub mod bitmap;
pub mod buffer;
pub mod cache;
pub mod config;
pub mod entry;
pub mod error;
pub mod events;
pub mod memory_budget;

pub use alias::{AliasOutcome, BufferAliasOptimizer};
pub use bitmap::{DirtyFrameSet, FrameBitmap};
pub use buffer::{BackingBuffer, BufferView, ScalarType};
pub use cache::{CacheStats, LoadCanceller, VolumeCache, WeakVolumeCache};
pub use config::{CacheConfig, ConfigError, EvictionPolicy};
pub use entry::{
    CacheEntry, CachedImage, FrameOffset, FrameOffsetMap, ImageId, ImageMetadata, LoadProgress,
    LoadStatus, PixelStorage, ProgressCallback, Volume, VolumeId, VolumeMetadata,
};
pub use error::{CacheError, CacheResult};
pub use events::{CacheEvent, EventBus, EventListener, SubscriptionId};
pub use memory_budget::MemoryPressure;
