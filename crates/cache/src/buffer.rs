//! Contiguous voxel storage for volumes
//!
//! A [`BackingBuffer`] holds every frame of one volume back to back. Frame
//! images can borrow a byte range of it through a read-only [`BufferView`],
//! which keeps only a weak reference: the buffer stays exclusively owned by
//! its volume and a view never keeps the memory alive on its own.
//!
//! Writes go through the owning [`crate::Volume`] so that every change to a
//! frame reaches its dirty-frame trackers.

use std::ops::Range;
use std::sync::{Arc, Weak};

use parking_lot::{MappedRwLockWriteGuard, RwLock, RwLockWriteGuard};
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};

/// Element type of the voxel samples stored in a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    F64,
}

impl ScalarType {
    /// Size of one sample in bytes.
    pub fn byte_size(self) -> usize {
        match self {
            ScalarType::U8 | ScalarType::I8 => 1,
            ScalarType::U16 | ScalarType::I16 => 2,
            ScalarType::U32 | ScalarType::I32 | ScalarType::F32 => 4,
            ScalarType::F64 => 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, ScalarType::F32 | ScalarType::F64)
    }
}

type SharedBytes = Arc<RwLock<Box<[u8]>>>;

/// Contiguous memory block holding all frames of one volume.
///
/// Frame `i` occupies bytes `[i * frame_byte_length, (i + 1) * frame_byte_length)`.
/// The buffer is deliberately not `Clone`; other parties reach the bytes
/// through the owning volume or through a weak [`BufferView`].
#[derive(Debug)]
pub struct BackingBuffer {
    data: SharedBytes,
    frame_count: usize,
    frame_byte_length: usize,
    scalar_type: ScalarType,
    shared: bool,
}

impl BackingBuffer {
    /// Allocate a zero-filled buffer for `frame_count` frames.
    ///
    /// Buffers are created shareable; use [`BackingBuffer::with_sharing`] to
    /// model a transport layer that cannot hand out cross-context memory.
    pub fn new(frame_count: usize, frame_byte_length: usize, scalar_type: ScalarType) -> Self {
        let len = frame_count * frame_byte_length;
        Self {
            data: Arc::new(RwLock::new(vec![0u8; len].into_boxed_slice())),
            frame_count,
            frame_byte_length,
            scalar_type,
            shared: true,
        }
    }

    /// Wrap existing bytes. The length must be exactly `frame_count` frames.
    pub fn from_bytes(
        bytes: Vec<u8>,
        frame_count: usize,
        frame_byte_length: usize,
        scalar_type: ScalarType,
    ) -> CacheResult<Self> {
        let expected = frame_count * frame_byte_length;
        if bytes.len() != expected {
            return Err(CacheError::ShapeMismatch {
                expected,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            data: Arc::new(RwLock::new(bytes.into_boxed_slice())),
            frame_count,
            frame_byte_length,
            scalar_type,
            shared: true,
        })
    }

    /// Mark whether this buffer lives in cross-context shareable memory.
    pub fn with_sharing(mut self, shared: bool) -> Self {
        self.set_shared(shared);
        self
    }

    pub(crate) fn set_shared(&mut self, shared: bool) {
        self.shared = shared;
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn byte_length(&self) -> usize {
        self.frame_count * self.frame_byte_length
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub fn frame_byte_length(&self) -> usize {
        self.frame_byte_length
    }

    pub fn scalar_type(&self) -> ScalarType {
        self.scalar_type
    }

    /// Byte range of a frame inside the buffer.
    pub fn frame_range(&self, index: usize) -> CacheResult<Range<usize>> {
        if index >= self.frame_count {
            return Err(CacheError::FrameOutOfRange {
                index,
                count: self.frame_count,
            });
        }
        let start = index * self.frame_byte_length;
        Ok(start..start + self.frame_byte_length)
    }

    /// Overwrite one frame. `bytes` must be exactly one frame long.
    pub(crate) fn write_frame(&self, index: usize, bytes: &[u8]) -> CacheResult<()> {
        let range = self.frame_range(index)?;
        if bytes.len() != range.len() {
            return Err(CacheError::ShapeMismatch {
                expected: range.len(),
                actual: bytes.len(),
            });
        }
        self.data.write()[range].copy_from_slice(bytes);
        Ok(())
    }

    /// Lock the buffer for writing and expose one frame's bytes in place.
    pub(crate) fn frame_mut(&self, index: usize) -> CacheResult<MappedRwLockWriteGuard<'_, [u8]>> {
        let range = self.frame_range(index)?;
        Ok(RwLockWriteGuard::map(self.data.write(), move |data| {
            &mut data[range]
        }))
    }

    pub fn read_frame(&self, index: usize) -> CacheResult<Vec<u8>> {
        let range = self.frame_range(index)?;
        Ok(self.data.read()[range].to_vec())
    }

    /// Run `f` over a frame's bytes without copying them out.
    pub fn with_frame<R>(&self, index: usize, f: impl FnOnce(&[u8]) -> R) -> CacheResult<R> {
        let range = self.frame_range(index)?;
        let data = self.data.read();
        Ok(f(&data[range]))
    }

    /// Copy an arbitrary byte range out of the buffer.
    pub fn read_range(&self, offset: usize, length: usize) -> CacheResult<Vec<u8>> {
        self.check_range(offset, length)?;
        Ok(self.data.read()[offset..offset + length].to_vec())
    }

    /// Copy the full contents out of the buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.read().to_vec()
    }

    /// Create a non-owning view of `length` bytes starting at `offset`.
    pub fn view(&self, offset: usize, length: usize) -> CacheResult<BufferView> {
        self.check_range(offset, length)?;
        Ok(BufferView {
            buffer: Arc::downgrade(&self.data),
            offset,
            length,
        })
    }

    /// Whether `view` points into this buffer.
    pub fn owns_view(&self, view: &BufferView) -> bool {
        Weak::ptr_eq(&Arc::downgrade(&self.data), &view.buffer)
    }

    fn check_range(&self, offset: usize, length: usize) -> CacheResult<()> {
        let total = self.byte_length();
        match offset.checked_add(length) {
            Some(end) if end <= total => Ok(()),
            _ => Err(CacheError::ShapeMismatch {
                expected: total.saturating_sub(offset),
                actual: length,
            }),
        }
    }
}

/// Weak `(buffer, offset, length)` view into a [`BackingBuffer`].
///
/// Reads fail with [`CacheError::BufferReleased`] once the owning volume has
/// dropped its buffer.
#[derive(Debug, Clone)]
pub struct BufferView {
    buffer: Weak<RwLock<Box<[u8]>>>,
    offset: usize,
    length: usize,
}

impl BufferView {
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Whether the backing buffer is still alive.
    pub fn is_attached(&self) -> bool {
        self.buffer.strong_count() > 0
    }

    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> CacheResult<R> {
        let buffer = self.buffer.upgrade().ok_or(CacheError::BufferReleased)?;
        let data = buffer.read();
        Ok(f(&data[self.offset..self.offset + self.length]))
    }

    pub fn to_vec(&self) -> CacheResult<Vec<u8>> {
        self.with_bytes(|bytes| bytes.to_vec())
    }
}
