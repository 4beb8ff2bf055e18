//! Byte-budgeted cache of frame images and volumes
//!
//! Admission is checked before any storage is allocated, so a refused
//! request leaves the cache untouched. Entries are tracked in recency order
//! so that LRU eviction can make room when the budget is lowered.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::alias;
use crate::config::{CacheConfig, EvictionPolicy};
use crate::entry::{CacheEntry, CachedImage, ImageId, Volume, VolumeId, VolumeMetadata};
use crate::error::{CacheError, CacheResult};
use crate::events::{CacheEvent, EventBus};
use crate::memory_budget::MemoryPressure;

/// Hook used by the cache to stop an in-flight load before decaching a volume.
pub trait LoadCanceller: Send + Sync {
    fn cancel_load(&self, volume_id: &str);
}

/// Statistics about cache usage
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    pub image_count: usize,
    pub volume_count: usize,
    /// Bytes billed against the budget
    pub memory_used: usize,
    pub memory_limit: usize,
    pub hits: u64,
    pub misses: u64,
    /// Entries removed by LRU eviction
    pub evictions: u64,
}

impl CacheStats {
    /// Fraction of lookups that found an entry (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Fraction of the budget in use (0.0 to 1.0)
    pub fn utilization(&self) -> f64 {
        if self.memory_limit == 0 {
            0.0
        } else {
            self.memory_used as f64 / self.memory_limit as f64
        }
    }

    pub fn pressure(&self) -> MemoryPressure {
        MemoryPressure::from_usage(self.memory_used, self.memory_limit)
    }

    pub fn available(&self) -> usize {
        self.memory_limit.saturating_sub(self.memory_used)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum EntryKey {
    Image(ImageId),
    Volume(VolumeId),
}

pub(crate) struct CacheState {
    pub(crate) images: HashMap<ImageId, Arc<CachedImage>>,
    pub(crate) volumes: HashMap<VolumeId, Arc<Volume>>,
    /// Most recently used at the back
    lru_queue: VecDeque<EntryKey>,
    pub(crate) current_size: usize,
    max_size: usize,
    policy: EvictionPolicy,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl CacheState {
    fn new(max_size: usize, policy: EvictionPolicy) -> Self {
        Self {
            images: HashMap::new(),
            volumes: HashMap::new(),
            lru_queue: VecDeque::new(),
            current_size: 0,
            max_size,
            policy,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    fn touch(&mut self, key: EntryKey) {
        self.forget(&key);
        self.lru_queue.push_back(key);
    }

    fn forget(&mut self, key: &EntryKey) {
        self.lru_queue.retain(|k| k != key);
    }

    fn contains(&self, id: &str) -> bool {
        self.images.contains_key(id) || self.volumes.contains_key(id)
    }

    fn fits(&self, bytes: usize) -> bool {
        self.current_size
            .checked_add(bytes)
            .is_some_and(|total| total <= self.max_size)
    }

    fn available(&self) -> usize {
        self.max_size.saturating_sub(self.current_size)
    }

    fn admit(&self, id: &str, bytes: usize) -> CacheResult<()> {
        if self.contains(id) {
            return Err(CacheError::AlreadyCached(id.to_string()));
        }
        if !self.fits(bytes) {
            return Err(CacheError::CacheSizeExceeded {
                requested: bytes,
                available: self.available(),
            });
        }
        Ok(())
    }

    /// Least recently used entry whose removal frees memory. Volumes that are
    /// still loading are never picked.
    fn lru_candidate(&self) -> Option<EntryKey> {
        self.lru_queue
            .iter()
            .find(|key| match key {
                EntryKey::Image(id) => self
                    .images
                    .get(id)
                    .is_some_and(|image| image.size_in_bytes() > 0),
                EntryKey::Volume(id) => self
                    .volumes
                    .get(id)
                    .is_some_and(|volume| !volume.is_loading()),
            })
            .cloned()
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            image_count: self.images.len(),
            volume_count: self.volumes.len(),
            memory_used: self.current_size,
            memory_limit: self.max_size,
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
        }
    }
}

struct CacheInner {
    state: Mutex<CacheState>,
    events: EventBus,
    canceller: Mutex<Option<Weak<dyn LoadCanceller>>>,
    shared_buffers: bool,
}

/// Thread-safe store of images and volumes bounded by a byte budget.
///
/// Handles are cheap to clone and all clones share the same state. Every
/// byte is billed to exactly one live entry: `cache_size()` is the sum of
/// `size_in_bytes()` over all entries.
///
/// # Example
///
/// ```
/// use voxstream_cache::{ScalarType, VolumeCache, VolumeMetadata};
///
/// let cache = VolumeCache::new(64 * 1024 * 1024);
/// let metadata = VolumeMetadata::new([256, 256, 4], ScalarType::U16);
/// let frames = (0..4).map(|i| format!("wado://series/1/frame/{i}")).collect();
///
/// let volume = cache.allocate_volume("ct-1", metadata, frames).unwrap();
/// assert_eq!(cache.cache_size(), volume.size_in_bytes());
///
/// cache.decache_volume("ct-1").unwrap();
/// assert_eq!(cache.cache_size(), 0);
/// ```
#[derive(Clone)]
pub struct VolumeCache {
    inner: Arc<CacheInner>,
}

/// Non-owning handle to a [`VolumeCache`], used by event listeners.
#[derive(Clone)]
pub struct WeakVolumeCache {
    inner: Weak<CacheInner>,
}

impl WeakVolumeCache {
    pub fn upgrade(&self) -> Option<VolumeCache> {
        self.inner.upgrade().map(|inner| VolumeCache { inner })
    }
}

impl VolumeCache {
    /// Create a cache with `max_size` bytes and the default eviction policy.
    pub fn new(max_size: usize) -> Self {
        Self::build(max_size, EvictionPolicy::default(), true)
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::build(
            config.max_cache_size,
            config.eviction_policy,
            config.shared_buffers_supported,
        )
    }

    fn build(max_size: usize, policy: EvictionPolicy, shared_buffers: bool) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                state: Mutex::new(CacheState::new(max_size, policy)),
                events: EventBus::new(),
                canceller: Mutex::new(None),
                shared_buffers,
            }),
        }
    }

    pub fn downgrade(&self) -> WeakVolumeCache {
        WeakVolumeCache {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Bus carrying every notification this cache and its collaborators emit.
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Register the loader consulted when a loading volume is decached.
    pub fn set_load_canceller(&self, canceller: Weak<dyn LoadCanceller>) {
        *self.inner.canceller.lock() = Some(canceller);
    }

    fn canceller(&self) -> Option<Arc<dyn LoadCanceller>> {
        self.inner.canceller.lock().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        self.inner.state.lock()
    }

    /// Whether `bytes` more would still fit in the budget. Never mutates.
    pub fn is_cacheable(&self, bytes: usize) -> bool {
        self.lock_state().fits(bytes)
    }

    pub fn cache_size(&self) -> usize {
        self.lock_state().current_size
    }

    pub fn max_cache_size(&self) -> usize {
        self.lock_state().max_size
    }

    pub fn eviction_policy(&self) -> EvictionPolicy {
        self.lock_state().policy
    }

    pub fn set_eviction_policy(&self, policy: EvictionPolicy) {
        self.lock_state().policy = policy;
    }

    pub fn stats(&self) -> CacheStats {
        self.lock_state().stats()
    }

    /// Cache a single-frame image that owns its pixels.
    pub fn put_image(&self, image: CachedImage) -> CacheResult<Arc<CachedImage>> {
        let image = Arc::new(image);
        let bytes = image.size_in_bytes();
        let result = {
            let mut state = self.lock_state();
            state.admit(image.id(), bytes).map(|()| {
                state.current_size += bytes;
                state.images.insert(image.id().to_string(), image.clone());
                state.touch(EntryKey::Image(image.id().to_string()));
                state.stats().pressure()
            })
        };

        match result {
            Ok(pressure) => {
                debug!(image = %image.id(), bytes, "image cached");
                self.warn_on_pressure(pressure);
                self.inner.events.publish(&CacheEvent::ImageCached {
                    image_id: image.id().to_string(),
                    bytes,
                });
                Ok(image)
            }
            Err(err) => Err(self.refused(err)),
        }
    }

    /// Cache a volume built by the caller. Its buffer is already allocated,
    /// so prefer [`VolumeCache::allocate_volume`] for large volumes.
    pub fn put_volume(&self, volume: Volume) -> CacheResult<Arc<Volume>> {
        let id = volume.id().to_string();
        let bytes = volume.size_in_bytes();
        self.insert_volume(&id, bytes, move || Ok(volume))
    }

    /// Admit and allocate a static volume streamed from `frame_ids`.
    pub fn allocate_volume(
        &self,
        id: impl Into<VolumeId>,
        metadata: VolumeMetadata,
        frame_ids: Vec<ImageId>,
    ) -> CacheResult<Arc<Volume>> {
        self.allocate_dynamic_volume(id, metadata, vec![frame_ids])
    }

    /// Admit and allocate a time-varying volume. The buffer is only
    /// allocated after the budget check passes.
    pub fn allocate_dynamic_volume(
        &self,
        id: impl Into<VolumeId>,
        metadata: VolumeMetadata,
        time_points: Vec<Vec<ImageId>>,
    ) -> CacheResult<Arc<Volume>> {
        let id = id.into();
        Volume::check_layout(&metadata, &time_points)?;
        let bytes = metadata.checked_byte_length(time_points.len())?;
        let shared = self.inner.shared_buffers;
        self.insert_volume(&id, bytes, || {
            Ok(Volume::dynamic(id.clone(), metadata, time_points)?.with_shared_buffer(shared))
        })
    }

    /// Create a complete volume with the geometry of `source_id`, filled with
    /// `scalar_data` or zeroes. The data length must match one time point of
    /// the source.
    pub fn create_derived_volume(
        &self,
        source_id: &str,
        derived_id: impl Into<VolumeId>,
        scalar_data: Option<Vec<u8>>,
    ) -> CacheResult<Arc<Volume>> {
        let derived_id = derived_id.into();
        let source = self
            .peek_volume(source_id)
            .ok_or_else(|| CacheError::NotFound(source_id.to_string()))?;
        let metadata = source.metadata().clone();
        let shared = source.buffer().is_shared();
        drop(source);

        let expected = metadata.checked_byte_length(1)?;
        if let Some(data) = &scalar_data {
            if data.len() != expected {
                return Err(CacheError::ShapeMismatch {
                    expected,
                    actual: data.len(),
                });
            }
        }

        self.insert_volume(&derived_id, expected, || {
            Ok(Volume::local(derived_id.clone(), metadata, scalar_data)?.with_shared_buffer(shared))
        })
    }

    /// Cache a volume produced outside the streaming path (e.g. a segmentation).
    pub fn create_local_volume(
        &self,
        id: impl Into<VolumeId>,
        metadata: VolumeMetadata,
        scalar_data: Option<Vec<u8>>,
    ) -> CacheResult<Arc<Volume>> {
        let id = id.into();
        let expected = metadata.checked_byte_length(1)?;
        if let Some(data) = &scalar_data {
            if data.len() != expected {
                return Err(CacheError::ShapeMismatch {
                    expected,
                    actual: data.len(),
                });
            }
        }
        let shared = self.inner.shared_buffers;
        self.insert_volume(&id, expected, || {
            Ok(Volume::local(id.clone(), metadata, scalar_data)?.with_shared_buffer(shared))
        })
    }

    fn insert_volume(
        &self,
        id: &str,
        bytes: usize,
        build: impl FnOnce() -> CacheResult<Volume>,
    ) -> CacheResult<Arc<Volume>> {
        let result = {
            let mut state = self.lock_state();
            state
                .admit(id, bytes)
                .and_then(|()| build())
                .map(|volume| {
                    let volume = Arc::new(volume);
                    state.current_size += volume.size_in_bytes();
                    state.volumes.insert(id.to_string(), volume.clone());
                    state.touch(EntryKey::Volume(id.to_string()));
                    (volume, state.stats().pressure())
                })
        };

        match result {
            Ok((volume, pressure)) => {
                let bytes = volume.size_in_bytes();
                info!(volume = %id, bytes, frames = volume.frame_count(), "volume cached");
                self.warn_on_pressure(pressure);
                self.inner.events.publish(&CacheEvent::VolumeCached {
                    volume_id: id.to_string(),
                    bytes,
                });
                Ok(volume)
            }
            Err(err) => Err(self.refused(err)),
        }
    }

    fn refused(&self, err: CacheError) -> CacheError {
        if let CacheError::CacheSizeExceeded {
            requested,
            available,
        } = err
        {
            warn!(requested, available, "cache size exceeded");
            self.inner.events.publish(&CacheEvent::CacheSizeExceeded {
                requested,
                available,
                message: format!(
                    "Cannot cache {requested} bytes: only {available} bytes of the cache budget \
                     remain. Increase the cache size or close other series."
                ),
            });
        }
        err
    }

    fn warn_on_pressure(&self, pressure: MemoryPressure) {
        if pressure == MemoryPressure::Critical {
            let stats = self.stats();
            warn!(
                used = stats.memory_used,
                limit = stats.memory_limit,
                "cache memory pressure is critical"
            );
        }
    }

    /// Look up any entry, updating recency and hit statistics.
    pub fn get(&self, id: &str) -> Option<CacheEntry> {
        let mut state = self.lock_state();
        if let Some(image) = state.images.get(id).cloned() {
            state.hits += 1;
            state.touch(EntryKey::Image(id.to_string()));
            return Some(CacheEntry::Image(image));
        }
        if let Some(volume) = state.volumes.get(id).cloned() {
            state.hits += 1;
            state.touch(EntryKey::Volume(id.to_string()));
            return Some(CacheEntry::Volume(volume));
        }
        state.misses += 1;
        None
    }

    pub fn get_image(&self, id: &str) -> Option<Arc<CachedImage>> {
        self.get(id).and_then(|entry| entry.as_image().cloned())
    }

    pub fn get_volume(&self, id: &str) -> Option<Arc<Volume>> {
        self.get(id).and_then(|entry| entry.as_volume().cloned())
    }

    /// Look up an image without touching recency or statistics.
    pub fn peek_image(&self, id: &str) -> Option<Arc<CachedImage>> {
        self.lock_state().images.get(id).cloned()
    }

    /// Look up a volume without touching recency or statistics.
    pub fn peek_volume(&self, id: &str) -> Option<Arc<Volume>> {
        self.lock_state().volumes.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock_state().contains(id)
    }

    pub fn image_ids(&self) -> Vec<ImageId> {
        self.lock_state().images.keys().cloned().collect()
    }

    pub fn volume_ids(&self) -> Vec<VolumeId> {
        self.lock_state().volumes.keys().cloned().collect()
    }

    /// Remove an image or a volume, whichever holds `id`.
    pub fn decache(&self, id: &str) -> CacheResult<usize> {
        let is_image = self.lock_state().images.contains_key(id);
        if is_image {
            self.decache_image(id)
        } else {
            self.decache_volume(id)
        }
    }

    /// Remove an image and return the bytes released.
    pub fn decache_image(&self, id: &str) -> CacheResult<usize> {
        let bytes = {
            let mut state = self.lock_state();
            let image = state
                .images
                .remove(id)
                .ok_or_else(|| CacheError::NotFound(id.to_string()))?;
            let bytes = image.size_in_bytes();
            state.current_size = state.current_size.saturating_sub(bytes);
            state.forget(&EntryKey::Image(id.to_string()));
            if image.is_aliased() {
                for volume in state.volumes.values() {
                    volume.frame_offsets().remove(id);
                }
            }
            bytes
        };

        debug!(image = %id, bytes, "image decached");
        self.inner.events.publish(&CacheEvent::ImageRemoved {
            image_id: id.to_string(),
            bytes,
        });
        Ok(bytes)
    }

    /// Remove a volume and return the bytes released.
    ///
    /// An in-flight load is cancelled first. Images aliasing the volume's
    /// buffer get their own storage back before the buffer is released.
    pub fn decache_volume(&self, id: &str) -> CacheResult<usize> {
        let volume = self
            .peek_volume(id)
            .ok_or_else(|| CacheError::NotFound(id.to_string()))?;
        if volume.is_loading() {
            if let Some(canceller) = self.canceller() {
                canceller.cancel_load(id);
            }
        }
        drop(volume);

        let (bytes, restored) = {
            let mut state = self.lock_state();
            let volume = state
                .volumes
                .remove(id)
                .ok_or_else(|| CacheError::NotFound(id.to_string()))?;
            let restored = alias::restore_frames(&mut state, &volume);
            let bytes = volume.size_in_bytes();
            state.current_size = state.current_size.saturating_sub(bytes);
            state.forget(&EntryKey::Volume(id.to_string()));
            (bytes, restored)
        };

        if restored.frames > 0 {
            self.inner.events.publish(&CacheEvent::FramesRestored {
                volume_id: id.to_string(),
                frames: restored.frames,
                bytes_restored: restored.bytes,
            });
        }
        info!(volume = %id, bytes, "volume decached");
        self.inner.events.publish(&CacheEvent::VolumeRemoved {
            volume_id: id.to_string(),
            bytes,
        });
        Ok(bytes)
    }

    /// Decache every entry.
    pub fn purge(&self) {
        let (image_ids, volume_ids) = {
            let state = self.lock_state();
            (
                state.images.keys().cloned().collect::<Vec<_>>(),
                state.volumes.keys().cloned().collect::<Vec<_>>(),
            )
        };
        // Images go first so volumes have nothing left to restore
        for id in &image_ids {
            if let Err(err) = self.decache_image(id) {
                debug!(image = %id, %err, "image vanished during purge");
            }
        }
        for id in &volume_ids {
            if let Err(err) = self.decache_volume(id) {
                debug!(volume = %id, %err, "volume vanished during purge");
            }
        }
        info!(
            images = image_ids.len(),
            volumes = volume_ids.len(),
            remaining = self.cache_size(),
            "cache purged"
        );
    }

    /// Change the byte budget.
    ///
    /// Lowering it below current usage follows the eviction policy: `Reject`
    /// refuses outright, `EvictLru` decaches idle entries oldest first and
    /// fails only if that is not enough. Evictions made before such a failure
    /// are kept.
    pub fn set_max_cache_size(&self, new_max: usize) -> CacheResult<()> {
        let (current, policy) = {
            let mut state = self.lock_state();
            if new_max >= state.current_size {
                state.max_size = new_max;
                debug!(max = new_max, "max cache size updated");
                return Ok(());
            }
            (state.current_size, state.policy)
        };

        if policy == EvictionPolicy::EvictLru {
            let evicted = self.evict_until(new_max);
            let mut state = self.lock_state();
            if state.current_size <= new_max {
                state.max_size = new_max;
                info!(max = new_max, evicted, "max cache size lowered after eviction");
                return Ok(());
            }
            let current = state.current_size;
            drop(state);
            warn!(requested = new_max, current, evicted, "not enough idle entries to evict");
            return Err(CacheError::InvalidCacheSize {
                requested: new_max,
                current,
            });
        }

        warn!(requested = new_max, current, "refusing to shrink cache below current usage");
        Err(CacheError::InvalidCacheSize {
            requested: new_max,
            current,
        })
    }

    /// Evict least-recently-used entries until `bytes` more would fit.
    /// Returns whether they fit afterwards.
    pub fn make_room(&self, bytes: usize) -> bool {
        let max = self.max_cache_size();
        if bytes > max {
            return false;
        }
        self.evict_until(max - bytes);
        self.is_cacheable(bytes)
    }

    fn evict_until(&self, target: usize) -> usize {
        let mut evicted = 0;
        loop {
            let candidate = {
                let state = self.lock_state();
                if state.current_size <= target {
                    break;
                }
                state.lru_candidate()
            };
            let Some(key) = candidate else {
                break;
            };

            let result = match &key {
                EntryKey::Image(id) => self.decache_image(id),
                EntryKey::Volume(id) => self.decache_volume(id),
            };
            let mut state = self.lock_state();
            match result {
                Ok(bytes) => {
                    evicted += 1;
                    state.evictions += 1;
                    debug!(entry = ?key, bytes, "evicted least recently used entry");
                }
                Err(_) => state.forget(&key),
            }
        }
        evicted
    }
}

impl fmt::Debug for VolumeCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        f.debug_struct("VolumeCache")
            .field("images", &stats.image_count)
            .field("volumes", &stats.volume_count)
            .field("memory_used", &stats.memory_used)
            .field("memory_limit", &stats.memory_limit)
            .finish()
    }
}
