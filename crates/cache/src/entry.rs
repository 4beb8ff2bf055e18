//! Cache entries: single-frame images and multi-frame volumes
//!
//! A [`Volume`] owns its [`BackingBuffer`] and its [`LoadStatus`]. A
//! [`CachedImage`] either owns its pixels or borrows a frame range of some
//! volume's buffer through a [`BufferView`].

use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};

use crate::bitmap::{DirtyFrameSet, FrameBitmap};
use crate::buffer::{BackingBuffer, BufferView, ScalarType};
use crate::error::{CacheError, CacheResult};

/// Identifier of a single frame image (typically a transport URI).
pub type ImageId = String;

/// Identifier of a volume.
pub type VolumeId = String;

/// Geometry of one 2-D frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageMetadata {
    pub rows: u32,
    pub columns: u32,
    /// Samples per pixel
    pub components: u32,
    pub scalar_type: ScalarType,
    pub pixel_spacing: [f64; 2],
}

impl ImageMetadata {
    pub fn new(rows: u32, columns: u32, scalar_type: ScalarType) -> Self {
        Self {
            rows,
            columns,
            components: 1,
            scalar_type,
            pixel_spacing: [1.0, 1.0],
        }
    }

    pub fn with_components(mut self, components: u32) -> Self {
        self.components = components;
        self
    }

    pub fn with_pixel_spacing(mut self, spacing: [f64; 2]) -> Self {
        self.pixel_spacing = spacing;
        self
    }

    /// Bytes needed to store the frame's pixels, saturating at `usize::MAX`.
    pub fn byte_length(&self) -> usize {
        self.checked_byte_length().unwrap_or(usize::MAX)
    }

    pub fn checked_byte_length(&self) -> CacheResult<usize> {
        checked_product(&[
            self.rows as usize,
            self.columns as usize,
            self.components as usize,
            self.scalar_type.byte_size(),
        ])
        .ok_or_else(|| {
            CacheError::InvalidLayout(format!(
                "{}x{}x{} {:?} frame overflows",
                self.columns, self.rows, self.components, self.scalar_type
            ))
        })
    }
}

fn checked_product(factors: &[usize]) -> Option<usize> {
    factors
        .iter()
        .try_fold(1usize, |product, &factor| product.checked_mul(factor))
}

/// Where an image's pixels live.
#[derive(Debug, Clone)]
pub enum PixelStorage {
    /// Independent storage, billed to the image.
    Owned(Vec<u8>),
    /// Range of a volume's buffer, billed to the volume.
    View(BufferView),
}

/// A cached single-frame image.
#[derive(Debug)]
pub struct CachedImage {
    id: ImageId,
    metadata: ImageMetadata,
    storage: Mutex<PixelStorage>,
}

impl CachedImage {
    /// Create an image owning `pixels`, which must match the metadata's byte length.
    pub fn new(
        id: impl Into<ImageId>,
        metadata: ImageMetadata,
        pixels: Vec<u8>,
    ) -> CacheResult<Self> {
        let expected = metadata.checked_byte_length()?;
        if pixels.len() != expected {
            return Err(CacheError::ShapeMismatch {
                expected,
                actual: pixels.len(),
            });
        }
        Ok(Self {
            id: id.into(),
            metadata,
            storage: Mutex::new(PixelStorage::Owned(pixels)),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn metadata(&self) -> &ImageMetadata {
        &self.metadata
    }

    /// Bytes this image is billed for: zero while it aliases a volume.
    pub fn size_in_bytes(&self) -> usize {
        match &*self.storage.lock() {
            PixelStorage::Owned(pixels) => pixels.len(),
            PixelStorage::View(_) => 0,
        }
    }

    /// Logical pixel byte length regardless of where the bytes live.
    pub fn pixel_byte_length(&self) -> usize {
        self.metadata.byte_length()
    }

    pub fn is_aliased(&self) -> bool {
        matches!(&*self.storage.lock(), PixelStorage::View(_))
    }

    /// Copy the pixels out.
    pub fn pixel_data(&self) -> CacheResult<Vec<u8>> {
        self.with_pixels(|pixels| pixels.to_vec())
    }

    pub fn with_pixels<R>(&self, f: impl FnOnce(&[u8]) -> R) -> CacheResult<R> {
        match &*self.storage.lock() {
            PixelStorage::Owned(pixels) => Ok(f(pixels)),
            PixelStorage::View(view) => view.with_bytes(f),
        }
    }

    /// Whether the pixels currently live inside `buffer`.
    pub fn is_view_of(&self, buffer: &BackingBuffer) -> bool {
        match &*self.storage.lock() {
            PixelStorage::View(view) => buffer.owns_view(view),
            PixelStorage::Owned(_) => false,
        }
    }

    /// Swap the pixel accessor, returning the previous one.
    pub(crate) fn replace_storage(&self, storage: PixelStorage) -> PixelStorage {
        std::mem::replace(&mut *self.storage.lock(), storage)
    }
}

/// Geometry of a volume. `dimensions` is `[columns, rows, slices]` where
/// `slices` counts the frames of a single time point.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeMetadata {
    pub dimensions: [u32; 3],
    pub spacing: [f64; 3],
    pub origin: [f64; 3],
    pub direction: [f64; 9],
    pub scalar_type: ScalarType,
    pub components: u32,
}

impl VolumeMetadata {
    pub fn new(dimensions: [u32; 3], scalar_type: ScalarType) -> Self {
        Self {
            dimensions,
            spacing: [1.0, 1.0, 1.0],
            origin: [0.0, 0.0, 0.0],
            direction: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
            scalar_type,
            components: 1,
        }
    }

    pub fn with_spacing(mut self, spacing: [f64; 3]) -> Self {
        self.spacing = spacing;
        self
    }

    pub fn with_origin(mut self, origin: [f64; 3]) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_components(mut self, components: u32) -> Self {
        self.components = components;
        self
    }

    pub fn slices(&self) -> usize {
        self.dimensions[2] as usize
    }

    /// Saturates at `usize::MAX`; see [`VolumeMetadata::checked_byte_length`].
    pub fn frame_byte_length(&self) -> usize {
        checked_product(&self.frame_factors()).unwrap_or(usize::MAX)
    }

    /// Bytes for one time point, saturating at `usize::MAX`.
    pub fn byte_length(&self) -> usize {
        self.frame_byte_length().saturating_mul(self.slices())
    }

    /// Bytes for `time_points` time points, or `InvalidLayout` if that
    /// does not fit in `usize`.
    pub fn checked_byte_length(&self, time_points: usize) -> CacheResult<usize> {
        let [columns, rows, slices] = self.dimensions;
        let mut factors = self.frame_factors().to_vec();
        factors.extend([slices as usize, time_points]);
        checked_product(&factors).ok_or_else(|| {
            CacheError::InvalidLayout(format!(
                "{columns}x{rows}x{slices} {:?} volume with {time_points} time points overflows",
                self.scalar_type
            ))
        })
    }

    fn frame_factors(&self) -> [usize; 4] {
        [
            self.dimensions[0] as usize,
            self.dimensions[1] as usize,
            self.components as usize,
            self.scalar_type.byte_size(),
        ]
    }
}

/// Snapshot delivered to load listeners after each processed frame.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadProgress {
    pub volume_id: VolumeId,
    pub success: bool,
    /// `None` for synthetic snapshots (e.g. an already-loaded volume).
    pub frame_index: Option<usize>,
    pub frames_loaded: usize,
    pub frames_processed: usize,
    pub total_frames: usize,
    pub error: Option<String>,
}

impl LoadProgress {
    pub fn is_complete(&self) -> bool {
        self.frames_processed >= self.total_frames
    }

    pub fn fraction_loaded(&self) -> f64 {
        if self.total_frames == 0 {
            1.0
        } else {
            self.frames_loaded as f64 / self.total_frames as f64
        }
    }
}

/// Listener invoked with every [`LoadProgress`] snapshot.
pub type ProgressCallback = Arc<dyn Fn(&LoadProgress) + Send + Sync>;

/// Loading state of a volume. Mutated only by the streaming loader.
///
/// `loaded` is true iff every bit of `cached_frames` is set.
pub struct LoadStatus {
    pub loading: bool,
    pub loaded: bool,
    pub cached_frames: FrameBitmap,
    pub pending_callbacks: Vec<ProgressCallback>,
}

impl LoadStatus {
    fn new(frame_count: usize) -> Self {
        Self {
            loading: false,
            loaded: frame_count == 0,
            cached_frames: FrameBitmap::new(frame_count),
            pending_callbacks: Vec::new(),
        }
    }

    pub fn frames_loaded(&self) -> usize {
        self.cached_frames.count_set()
    }

    /// Recompute `loaded` from the bitmap.
    pub fn refresh_loaded(&mut self) -> bool {
        self.loaded = self.cached_frames.all_set();
        self.loaded
    }
}

impl fmt::Debug for LoadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadStatus")
            .field("loading", &self.loading)
            .field("loaded", &self.loaded)
            .field("frames_loaded", &self.cached_frames.count_set())
            .field("total_frames", &self.cached_frames.len())
            .field("pending_callbacks", &self.pending_callbacks.len())
            .finish()
    }
}

/// Location of one frame image inside a volume's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameOffset {
    pub byte_offset: usize,
    pub byte_length: usize,
}

/// Image id to frame location, populated while the images alias the volume.
pub type FrameOffsetMap = HashMap<ImageId, FrameOffset>;

/// A 3-D or 4-D voxel grid backed by one contiguous buffer.
///
/// Frames are laid out time-point major: time point `t` owns frames
/// `[t * slices, (t + 1) * slices)`.
#[derive(Debug)]
pub struct Volume {
    id: VolumeId,
    metadata: VolumeMetadata,
    frame_ids: Vec<ImageId>,
    time_point_count: usize,
    current_time_point: AtomicUsize,
    buffer: BackingBuffer,
    load_status: Mutex<LoadStatus>,
    frame_offsets: Mutex<FrameOffsetMap>,
    dirty_trackers: Mutex<Vec<Weak<Mutex<FrameBitmap>>>>,
}

impl Volume {
    /// A static volume streamed from one image per slice.
    pub fn new(
        id: impl Into<VolumeId>,
        metadata: VolumeMetadata,
        frame_ids: Vec<ImageId>,
    ) -> CacheResult<Self> {
        Self::dynamic(id, metadata, vec![frame_ids])
    }

    /// A time-varying volume; each inner list holds one time point's frame ids.
    pub fn dynamic(
        id: impl Into<VolumeId>,
        metadata: VolumeMetadata,
        time_points: Vec<Vec<ImageId>>,
    ) -> CacheResult<Self> {
        Self::check_layout(&metadata, &time_points)?;
        let slices = metadata.slices();
        let time_point_count = time_points.len();
        let frame_ids: Vec<ImageId> = time_points.into_iter().flatten().collect();
        let buffer = BackingBuffer::new(
            slices * time_point_count,
            metadata.frame_byte_length(),
            metadata.scalar_type,
        );
        Ok(Self::assemble(
            id.into(),
            metadata,
            frame_ids,
            time_point_count,
            buffer,
        ))
    }

    /// Every time point must list exactly one frame id per slice, and the
    /// whole buffer must be addressable.
    pub fn check_layout(metadata: &VolumeMetadata, time_points: &[Vec<ImageId>]) -> CacheResult<()> {
        metadata.checked_byte_length(time_points.len())?;
        let slices = metadata.slices();
        if time_points.is_empty() {
            return Err(CacheError::ShapeMismatch {
                expected: slices,
                actual: 0,
            });
        }
        match time_points.iter().find(|frames| frames.len() != slices) {
            Some(bad) => Err(CacheError::ShapeMismatch {
                expected: slices,
                actual: bad.len(),
            }),
            None => Ok(()),
        }
    }

    /// A volume produced locally rather than streamed (derived volumes,
    /// segmentations). It is complete from the start.
    pub fn local(
        id: impl Into<VolumeId>,
        metadata: VolumeMetadata,
        data: Option<Vec<u8>>,
    ) -> CacheResult<Self> {
        metadata.checked_byte_length(1)?;
        let slices = metadata.slices();
        let frame_len = metadata.frame_byte_length();
        let buffer = match data {
            Some(bytes) => BackingBuffer::from_bytes(bytes, slices, frame_len, metadata.scalar_type)?,
            None => BackingBuffer::new(slices, frame_len, metadata.scalar_type),
        };
        let volume = Self::assemble(id.into(), metadata, Vec::new(), 1, buffer);
        {
            let mut status = volume.load_status.lock();
            status.cached_frames.set_all();
            status.loaded = true;
        }
        Ok(volume)
    }

    fn assemble(
        id: VolumeId,
        metadata: VolumeMetadata,
        frame_ids: Vec<ImageId>,
        time_point_count: usize,
        buffer: BackingBuffer,
    ) -> Self {
        let frame_count = buffer.frame_count();
        Self {
            id,
            metadata,
            frame_ids,
            time_point_count,
            current_time_point: AtomicUsize::new(0),
            buffer,
            load_status: Mutex::new(LoadStatus::new(frame_count)),
            frame_offsets: Mutex::new(FrameOffsetMap::new()),
            dirty_trackers: Mutex::new(Vec::new()),
        }
    }

    /// Whether the buffer lives in cross-context shareable memory.
    pub fn with_shared_buffer(mut self, shared: bool) -> Self {
        self.buffer.set_shared(shared);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn metadata(&self) -> &VolumeMetadata {
        &self.metadata
    }

    pub fn frame_ids(&self) -> &[ImageId] {
        &self.frame_ids
    }

    pub fn frame_id(&self, frame_index: usize) -> Option<&str> {
        self.frame_ids.get(frame_index).map(String::as_str)
    }

    pub fn frame_index_of(&self, image_id: &str) -> Option<usize> {
        self.frame_ids.iter().position(|id| id == image_id)
    }

    pub fn frame_count(&self) -> usize {
        self.buffer.frame_count()
    }

    pub fn frame_byte_length(&self) -> usize {
        self.buffer.frame_byte_length()
    }

    /// Bytes billed to this volume.
    pub fn size_in_bytes(&self) -> usize {
        self.buffer.byte_length()
    }

    pub fn buffer(&self) -> &BackingBuffer {
        &self.buffer
    }

    pub fn is_dynamic(&self) -> bool {
        self.time_point_count > 1
    }

    pub fn time_point_count(&self) -> usize {
        self.time_point_count
    }

    /// Absolute frame indices belonging to a time point.
    pub fn frames_for_time_point(&self, time_point: usize) -> Range<usize> {
        let slices = self.metadata.slices();
        let start = time_point.min(self.time_point_count) * slices;
        start..(start + slices).min(self.frame_count())
    }

    pub fn current_time_point(&self) -> usize {
        self.current_time_point.load(Ordering::Acquire)
    }

    /// Select the live time point. Every frame of the newly selected point
    /// is marked dirty. Returns `false` if it was already selected.
    pub fn set_time_point(&self, time_point: usize) -> CacheResult<bool> {
        if time_point >= self.time_point_count {
            return Err(CacheError::FrameOutOfRange {
                index: time_point,
                count: self.time_point_count,
            });
        }
        let previous = self.current_time_point.swap(time_point, Ordering::AcqRel);
        if previous == time_point {
            return Ok(false);
        }
        self.mark_frames_dirty(self.frames_for_time_point(time_point));
        Ok(true)
    }

    pub fn load_status(&self) -> MutexGuard<'_, LoadStatus> {
        self.load_status.lock()
    }

    pub fn is_loaded(&self) -> bool {
        self.load_status.lock().loaded
    }

    pub fn is_loading(&self) -> bool {
        self.load_status.lock().loading
    }

    pub fn frames_loaded(&self) -> usize {
        self.load_status.lock().frames_loaded()
    }

    pub fn frame_offsets(&self) -> MutexGuard<'_, FrameOffsetMap> {
        self.frame_offsets.lock()
    }

    /// Write a frame's voxels and mark it dirty for every texture mirror.
    /// Load status is left untouched.
    pub fn write_frame(&self, frame_index: usize, bytes: &[u8]) -> CacheResult<()> {
        self.buffer.write_frame(frame_index, bytes)?;
        self.mark_frame_dirty(frame_index);
        Ok(())
    }

    /// Run `f` over a frame's bytes in place, then mark the frame dirty.
    ///
    /// The whole buffer is write-locked while `f` runs, so `f` must not
    /// read the volume.
    pub fn write_frame_with<R>(
        &self,
        frame_index: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> CacheResult<R> {
        let result = {
            let mut frame = self.buffer.frame_mut(frame_index)?;
            f(&mut frame)
        };
        self.mark_frame_dirty(frame_index);
        Ok(result)
    }

    /// Register a dirty-frame tracker. It starts with every frame dirty.
    pub fn attach_dirty_tracker(&self) -> DirtyFrameSet {
        let tracker = DirtyFrameSet::all_dirty(self.frame_count());
        self.dirty_trackers.lock().push(tracker.downgrade());
        tracker
    }

    pub fn mark_frame_dirty(&self, frame_index: usize) {
        self.for_each_tracker(|bits| {
            bits.set(frame_index);
        });
    }

    /// Structural change: every frame must be streamed again.
    pub fn mark_modified(&self) {
        self.for_each_tracker(FrameBitmap::set_all);
    }

    fn mark_frames_dirty(&self, frames: Range<usize>) {
        self.for_each_tracker(|bits| {
            for frame in frames.clone() {
                bits.set(frame);
            }
        });
    }

    fn for_each_tracker(&self, mut f: impl FnMut(&mut FrameBitmap)) {
        let mut trackers = self.dirty_trackers.lock();
        trackers.retain(|weak| match weak.upgrade() {
            Some(bits) => {
                f(&mut bits.lock());
                true
            }
            None => false,
        });
    }
}

/// Anything the cache can hold.
#[derive(Debug, Clone)]
pub enum CacheEntry {
    Image(Arc<CachedImage>),
    Volume(Arc<Volume>),
}

impl CacheEntry {
    pub fn id(&self) -> &str {
        match self {
            CacheEntry::Image(image) => image.id(),
            CacheEntry::Volume(volume) => volume.id(),
        }
    }

    pub fn size_in_bytes(&self) -> usize {
        match self {
            CacheEntry::Image(image) => image.size_in_bytes(),
            CacheEntry::Volume(volume) => volume.size_in_bytes(),
        }
    }

    pub fn as_volume(&self) -> Option<&Arc<Volume>> {
        match self {
            CacheEntry::Volume(volume) => Some(volume),
            CacheEntry::Image(_) => None,
        }
    }

    pub fn as_image(&self) -> Option<&Arc<CachedImage>> {
        match self {
            CacheEntry::Image(image) => Some(image),
            CacheEntry::Volume(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_ids(prefix: &str, count: usize) -> Vec<ImageId> {
        (0..count).map(|i| format!("{prefix}:{i}")).collect()
    }

    #[test]
    fn test_image_metadata_byte_length() {
        let meta = ImageMetadata::new(4, 8, ScalarType::I16).with_components(3);
        assert_eq!(meta.byte_length(), 4 * 8 * 3 * 2);
    }

    #[test]
    fn test_image_rejects_wrong_pixel_length() {
        let meta = ImageMetadata::new(2, 2, ScalarType::U8);
        let err = CachedImage::new("img", meta, vec![0; 3]).unwrap_err();
        assert_eq!(err, CacheError::ShapeMismatch { expected: 4, actual: 3 });
    }

    #[test]
    fn test_image_billing_follows_storage() {
        let meta = ImageMetadata::new(2, 2, ScalarType::U8);
        let image = CachedImage::new("img", meta, vec![1, 2, 3, 4]).unwrap();
        assert_eq!(image.size_in_bytes(), 4);
        assert!(!image.is_aliased());

        let buffer = BackingBuffer::new(1, 4, ScalarType::U8);
        buffer.write_frame(0, &[1, 2, 3, 4]).unwrap();
        image.replace_storage(PixelStorage::View(buffer.view(0, 4).unwrap()));

        assert!(image.is_aliased());
        assert_eq!(image.size_in_bytes(), 0);
        assert_eq!(image.pixel_byte_length(), 4);
        assert_eq!(image.pixel_data().unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_volume_layout() {
        let meta = VolumeMetadata::new([4, 4, 3], ScalarType::F32);
        let volume = Volume::new("vol", meta, frame_ids("img", 3)).unwrap();

        assert_eq!(volume.frame_count(), 3);
        assert_eq!(volume.frame_byte_length(), 64);
        assert_eq!(volume.size_in_bytes(), 192);
        assert_eq!(volume.frame_index_of("img:2"), Some(2));
        assert!(!volume.is_loaded());
        assert!(!volume.is_dynamic());
    }

    #[test]
    fn test_volume_rejects_wrong_frame_count() {
        let meta = VolumeMetadata::new([4, 4, 3], ScalarType::U8);
        assert!(Volume::new("vol", meta, frame_ids("img", 2)).is_err());
    }

    #[test]
    fn test_dynamic_volume_time_points() {
        let meta = VolumeMetadata::new([2, 2, 3], ScalarType::U8);
        let volume = Volume::dynamic(
            "vol",
            meta,
            vec![frame_ids("t0", 3), frame_ids("t1", 3)],
        )
        .unwrap();

        assert!(volume.is_dynamic());
        assert_eq!(volume.frame_count(), 6);
        assert_eq!(volume.frames_for_time_point(1), 3..6);
        assert_eq!(volume.frame_id(4), Some("t1:1"));
    }

    #[test]
    fn test_set_time_point_marks_new_frames_dirty() {
        let meta = VolumeMetadata::new([2, 2, 2], ScalarType::U8);
        let volume =
            Volume::dynamic("vol", meta, vec![frame_ids("t0", 2), frame_ids("t1", 2)]).unwrap();
        let dirty = volume.attach_dirty_tracker();
        (0..4).for_each(|frame| {
            dirty.clear(frame);
        });

        assert!(volume.set_time_point(1).unwrap());
        assert_eq!(dirty.dirty_frames(), vec![2, 3]);
        assert!(!volume.set_time_point(1).unwrap());
        assert!(volume.set_time_point(2).is_err());
    }

    #[test]
    fn test_write_frame_marks_trackers_dirty() {
        let meta = VolumeMetadata::new([2, 2, 2], ScalarType::U8);
        let volume = Volume::new("vol", meta, frame_ids("img", 2)).unwrap();
        let dirty = volume.attach_dirty_tracker();
        dirty.clear(0);
        dirty.clear(1);

        volume.write_frame(1, &[5; 4]).unwrap();
        assert_eq!(dirty.dirty_frames(), vec![1]);

        volume.mark_modified();
        assert_eq!(dirty.dirty_count(), 2);
    }

    #[test]
    fn test_every_write_path_marks_frames_dirty() {
        let meta = VolumeMetadata::new([2, 2, 3], ScalarType::U8);
        let volume = Volume::local("seg", meta, None).unwrap();
        let dirty = volume.attach_dirty_tracker();
        (0..3).for_each(|frame| {
            dirty.clear(frame);
        });

        volume.write_frame(1, &[9; 4]).unwrap();
        let written = volume
            .write_frame_with(2, |bytes| {
                bytes.fill(7);
                bytes.len()
            })
            .unwrap();

        assert_eq!(written, 4);
        assert_eq!(volume.buffer().read_frame(1).unwrap(), vec![9; 4]);
        assert_eq!(volume.buffer().read_frame(2).unwrap(), vec![7; 4]);
        assert_eq!(dirty.dirty_frames(), vec![1, 2]);
        assert!(volume.write_frame_with(3, |_| ()).is_err());
        assert_eq!(dirty.dirty_frames(), vec![1, 2]);
    }

    #[test]
    fn test_oversized_geometry_is_rejected() {
        let meta = VolumeMetadata::new([u32::MAX, u32::MAX, u32::MAX], ScalarType::F64);
        assert_eq!(meta.byte_length(), usize::MAX);
        assert!(matches!(
            meta.checked_byte_length(1),
            Err(CacheError::InvalidLayout(_))
        ));
        assert!(matches!(
            Volume::local("huge", meta.clone(), None),
            Err(CacheError::InvalidLayout(_))
        ));
        let ids = vec![vec!["img".to_string()]; 2];
        assert!(matches!(
            Volume::check_layout(&meta, &ids),
            Err(CacheError::InvalidLayout(_))
        ));

        let image = ImageMetadata::new(u32::MAX, u32::MAX, ScalarType::F64).with_components(u32::MAX);
        assert!(matches!(
            CachedImage::new("huge", image, Vec::new()),
            Err(CacheError::InvalidLayout(_))
        ));
    }

    #[test]
    fn test_dropped_tracker_is_pruned() {
        let meta = VolumeMetadata::new([2, 2, 1], ScalarType::U8);
        let volume = Volume::new("vol", meta, frame_ids("img", 1)).unwrap();
        let dirty = volume.attach_dirty_tracker();
        drop(dirty);

        volume.mark_modified();
        assert!(volume.dirty_trackers.lock().is_empty());
    }

    #[test]
    fn test_local_volume_is_complete() {
        let meta = VolumeMetadata::new([2, 2, 2], ScalarType::U8);
        let volume = Volume::local("seg", meta, Some(vec![7; 8])).unwrap();

        assert!(volume.is_loaded());
        assert_eq!(volume.frames_loaded(), 2);
        assert!(volume.frame_ids().is_empty());
        assert_eq!(volume.buffer().read_frame(1).unwrap(), vec![7; 4]);
    }

    #[test]
    fn test_local_volume_shape_mismatch() {
        let meta = VolumeMetadata::new([2, 2, 2], ScalarType::U8);
        let err = Volume::local("seg", meta, Some(vec![0; 5])).unwrap_err();
        assert_eq!(err, CacheError::ShapeMismatch { expected: 8, actual: 5 });
    }
}
