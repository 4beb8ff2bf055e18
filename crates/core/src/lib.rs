//! Voxstream Core Library
//!
//! Progressive volume loading on top of the cache and scheduler crates.
//!
//! A [`StreamingLoader`] issues one scheduled request per missing frame of a
//! cached volume, hands each to a [`FrameTransport`] for fetching and
//! decoding, and records the result in the volume's backing buffer and load
//! bitmap. [`StreamingService`] wires the loader, cache, scheduler and alias
//! optimizer together from a single configuration.

pub mod error;
pub mod loader;
pub mod order;
pub mod service;
pub mod transport;

pub use error::{LoadError, LoadResult};
pub use loader::{LoadOptions, StreamingLoader};
pub use order::FrameOrder;
pub use service::StreamingService;
pub use transport::{FrameTarget, FrameTransport, ScalingParameters};
