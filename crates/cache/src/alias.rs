//! Zero-copy aliasing of frame images onto a volume's backing buffer
//!
//! Once a volume is fully loaded, any of its frames that are also cached as
//! standalone images can drop their private pixel copy and read through a
//! view into the volume buffer instead. The bytes are then billed once, to
//! the volume. Decaching the volume reverses this before the buffer goes away.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::cache::{CacheState, VolumeCache};
use crate::config::CacheConfig;
use crate::entry::{CachedImage, FrameOffset, ImageId, PixelStorage, Volume};
use crate::events::{CacheEvent, SubscriptionId};

/// Frames and bytes moved by one alias or restore pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AliasOutcome {
    pub frames: usize,
    pub bytes: usize,
}

/// Point every frame image of `volume` at the volume buffer.
///
/// All-or-nothing: the volume must still be the cached entry for its id,
/// loaded, backed by a shareable buffer, and every frame id must be cached as
/// an owned image of matching length.
pub(crate) fn alias_frames(state: &mut CacheState, volume: &Volume) -> AliasOutcome {
    let resident = state
        .volumes
        .get(volume.id())
        .is_some_and(|cached| std::ptr::eq(Arc::as_ptr(cached), volume));
    if !resident {
        debug!(volume = %volume.id(), "volume left the cache before aliasing");
        return AliasOutcome::default();
    }
    let buffer = volume.buffer();
    if !buffer.is_shared() || !volume.is_loaded() || volume.frame_ids().is_empty() {
        return AliasOutcome::default();
    }

    let plan: Option<Vec<(ImageId, Arc<CachedImage>, FrameOffset)>> = volume
        .frame_ids()
        .iter()
        .enumerate()
        .map(|(index, image_id)| {
            let image = state.images.get(image_id)?;
            if image.is_aliased() || image.pixel_byte_length() != volume.frame_byte_length() {
                return None;
            }
            let range = buffer.frame_range(index).ok()?;
            let offset = FrameOffset {
                byte_offset: range.start,
                byte_length: range.len(),
            };
            Some((image_id.clone(), image.clone(), offset))
        })
        .collect();
    let Some(plan) = plan else {
        return AliasOutcome::default();
    };

    let mut outcome = AliasOutcome::default();
    let mut offsets = volume.frame_offsets();
    for (image_id, image, offset) in plan {
        let view = match buffer.view(offset.byte_offset, offset.byte_length) {
            Ok(view) => view,
            Err(err) => {
                warn!(image = %image_id, %err, "could not create buffer view");
                continue;
            }
        };
        let released = image.size_in_bytes();
        image.replace_storage(PixelStorage::View(view));
        state.current_size = state.current_size.saturating_sub(released);
        offsets.insert(image_id, offset);
        outcome.frames += 1;
        outcome.bytes += released;
    }
    outcome
}

/// Give every image aliasing `volume` its own copy of the pixels again and
/// re-bill the bytes to the image. Clears the volume's offset map.
pub(crate) fn restore_frames(state: &mut CacheState, volume: &Volume) -> AliasOutcome {
    let offsets: Vec<(ImageId, FrameOffset)> = volume.frame_offsets().drain().collect();
    let mut outcome = AliasOutcome::default();

    for (image_id, offset) in offsets {
        let Some(image) = state.images.get(&image_id).cloned() else {
            continue;
        };
        if !image.is_view_of(volume.buffer()) {
            continue;
        }
        match volume
            .buffer()
            .read_range(offset.byte_offset, offset.byte_length)
        {
            Ok(pixels) => {
                image.replace_storage(PixelStorage::Owned(pixels));
                state.current_size += offset.byte_length;
                outcome.frames += 1;
                outcome.bytes += offset.byte_length;
            }
            Err(err) => warn!(image = %image_id, %err, "could not restore aliased frame"),
        }
    }
    outcome
}

/// Lets cached frame images share a loaded volume's buffer.
///
/// Active only when aliasing is enabled and the transport layer provides
/// shareable buffers.
#[derive(Debug, Clone)]
pub struct BufferAliasOptimizer {
    cache: VolumeCache,
    enabled: bool,
    shared_buffers_supported: bool,
}

impl BufferAliasOptimizer {
    pub fn new(cache: VolumeCache, enabled: bool, shared_buffers_supported: bool) -> Self {
        Self {
            cache,
            enabled,
            shared_buffers_supported,
        }
    }

    pub fn from_config(cache: VolumeCache, config: &CacheConfig) -> Self {
        Self::new(
            cache,
            config.enable_buffer_aliasing,
            config.shared_buffers_supported,
        )
    }

    pub fn is_active(&self) -> bool {
        self.enabled && self.shared_buffers_supported
    }

    /// Alias the frames of a volume that just finished loading.
    pub fn on_volume_loaded(&self, volume_id: &str) -> AliasOutcome {
        if !self.is_active() {
            return AliasOutcome::default();
        }
        let Some(volume) = self.cache.peek_volume(volume_id) else {
            return AliasOutcome::default();
        };
        let outcome = {
            let mut state = self.cache.lock_state();
            alias_frames(&mut state, &volume)
        };

        if outcome.frames > 0 {
            debug!(
                volume = %volume_id,
                frames = outcome.frames,
                bytes = outcome.bytes,
                "frame images now alias the volume buffer"
            );
            self.cache.events().publish(&CacheEvent::FramesAliased {
                volume_id: volume_id.to_string(),
                frames: outcome.frames,
                bytes_released: outcome.bytes,
            });
        }
        outcome
    }

    /// Undo aliasing for a volume that stays cached.
    pub fn restore(&self, volume_id: &str) -> AliasOutcome {
        let Some(volume) = self.cache.peek_volume(volume_id) else {
            return AliasOutcome::default();
        };
        let outcome = {
            let mut state = self.cache.lock_state();
            restore_frames(&mut state, &volume)
        };

        if outcome.frames > 0 {
            debug!(volume = %volume_id, frames = outcome.frames, "aliased frames restored");
            self.cache.events().publish(&CacheEvent::FramesRestored {
                volume_id: volume_id.to_string(),
                frames: outcome.frames,
                bytes_restored: outcome.bytes,
            });
        }
        outcome
    }

    /// Run [`BufferAliasOptimizer::on_volume_loaded`] whenever a load completes
    /// with every frame present.
    pub fn attach(&self) -> SubscriptionId {
        let cache = self.cache.downgrade();
        let enabled = self.enabled;
        let shared_buffers_supported = self.shared_buffers_supported;
        self.cache
            .events()
            .subscribe(Arc::new(move |event: &CacheEvent| {
                let CacheEvent::VolumeLoaded {
                    volume_id,
                    complete: true,
                    ..
                } = event
                else {
                    return;
                };
                if let Some(cache) = cache.upgrade() {
                    BufferAliasOptimizer::new(cache, enabled, shared_buffers_supported)
                        .on_volume_loaded(volume_id);
                }
            }))
    }

    pub fn detach(&self, subscription: SubscriptionId) -> bool {
        self.cache.events().unsubscribe(subscription)
    }
}
