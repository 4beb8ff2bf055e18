//! Progressive GPU mirror of a volume
//!
//! A [`TextureStreamer`] keeps one 3-D texture in step with a volume's
//! backing buffer. It owns a dirty-frame tracker registered on the volume;
//! every frame write, time point switch or structural change marks frames
//! dirty, and the next render pass uploads only those frames, one depth
//! slice each.
//!
//! Lifecycle: `Uninitialized -> Allocated -> Streaming -> Disposed`. A shape
//! change sends a streaming texture back through `Allocated`.

use std::sync::Arc;

use tracing::{debug, warn};
use voxstream_cache::{DirtyFrameSet, Volume};

use crate::device::GpuDevice;
use crate::error::{RenderError, RenderResult};
use crate::format::{convert_samples, TextureDescriptor, UploadReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamerState {
    Uninitialized,
    Allocated,
    Streaming,
    Disposed,
}

/// Mirrors one volume into one GPU texture.
pub struct TextureStreamer<T> {
    volume: Arc<Volume>,
    dirty: DirtyFrameSet,
    state: StreamerState,
    texture: Option<T>,
    descriptor: Option<TextureDescriptor>,
    mipmaps: bool,
}

impl<T> TextureStreamer<T> {
    pub fn new(volume: Arc<Volume>) -> Self {
        let dirty = volume.attach_dirty_tracker();
        Self {
            volume,
            dirty,
            state: StreamerState::Uninitialized,
            texture: None,
            descriptor: None,
            mipmaps: false,
        }
    }

    /// Regenerate mipmaps after every pass that uploaded something.
    pub fn with_mipmaps(mut self, enabled: bool) -> Self {
        self.mipmaps = enabled;
        self
    }

    pub fn state(&self) -> StreamerState {
        self.state
    }

    pub fn volume(&self) -> &Arc<Volume> {
        &self.volume
    }

    pub fn texture(&self) -> Option<&T> {
        self.texture.as_ref()
    }

    pub fn descriptor(&self) -> Option<&TextureDescriptor> {
        self.descriptor.as_ref()
    }

    /// Frames waiting for upload, across all time points.
    pub fn dirty_frames(&self) -> Vec<usize> {
        self.dirty.dirty_frames()
    }

    /// Whether the next pass would upload anything.
    pub fn has_pending_uploads(&self) -> bool {
        if self.texture.is_none() {
            return self.state != StreamerState::Disposed;
        }
        let live = self
            .volume
            .frames_for_time_point(self.volume.current_time_point());
        let status = self.volume.load_status();
        self.dirty
            .dirty_frames()
            .into_iter()
            .any(|frame| live.contains(&frame) && status.cached_frames.get(frame))
    }

    /// Force every frame of this mirror to be streamed again.
    pub fn invalidate(&self) {
        self.dirty.mark_all();
    }

    /// Switch a time-varying volume to another time point. All of its
    /// slices are re-uploaded on the next pass.
    pub fn select_time_point(&self, time_point: usize) -> RenderResult<bool> {
        Ok(self.volume.set_time_point(time_point)?)
    }

    /// Mirror a different volume from now on. The texture is reused if the
    /// shape still fits, otherwise reallocated on the next pass.
    pub fn set_volume(&mut self, volume: Arc<Volume>) {
        self.dirty = volume.attach_dirty_tracker();
        self.volume = volume;
    }

    /// Upload every dirty, resident frame of the current time point.
    ///
    /// A frame that is not loaded yet stays dirty; it is uploaded on a later
    /// pass once its bytes arrive. A failed upload leaves the remaining
    /// frames dirty.
    pub fn update<D>(&mut self, device: &mut D) -> RenderResult<UploadReport>
    where
        D: GpuDevice<Texture = T>,
    {
        if self.state == StreamerState::Disposed {
            return Err(RenderError::Disposed);
        }

        let mut report = UploadReport::default();
        let wanted = TextureDescriptor::for_volume(self.volume.metadata());
        if self.texture.is_none() || self.descriptor != Some(wanted) {
            self.allocate(device, wanted)?;
            report.reallocated = true;
        }
        let Some(texture) = self.texture.as_ref() else {
            return Err(RenderError::TextureAllocation(format!(
                "no texture for volume {}",
                self.volume.id()
            )));
        };
        device.bind(texture)?;

        let live = self
            .volume
            .frames_for_time_point(self.volume.current_time_point());
        let resident = self.volume.load_status().cached_frames.clone();
        let scalar_type = self.volume.metadata().scalar_type;

        for frame in self.dirty.dirty_frames() {
            if !live.contains(&frame) || !resident.get(frame) {
                continue;
            }
            let slice = (frame - live.start) as u32;
            let bytes = self.volume.buffer().with_frame(frame, |samples| {
                let texels = convert_samples(samples, scalar_type);
                device
                    .upload_sub_region(
                        texture,
                        [0, 0, slice],
                        [wanted.width, wanted.height, 1],
                        &texels,
                    )
                    .map(|()| texels.len())
            })??;
            self.dirty.clear(frame);
            report.slices_uploaded += 1;
            report.bytes_uploaded += bytes;
        }

        if self.mipmaps && report.slices_uploaded > 0 {
            device.generate_mipmap(texture)?;
        }
        self.state = StreamerState::Streaming;

        if !report.is_empty() {
            debug!(
                volume = %self.volume.id(),
                slices = report.slices_uploaded,
                bytes = report.bytes_uploaded,
                reallocated = report.reallocated,
                "volume texture updated"
            );
        }
        Ok(report)
    }

    /// Bring the texture up to date for drawing. On a GPU error the failure
    /// is logged and `None` returned so the caller skips this frame's draw.
    pub fn prepare_for_render<D>(&mut self, device: &mut D) -> Option<&T>
    where
        D: GpuDevice<Texture = T>,
    {
        match self.update(device) {
            Ok(_) => self.texture.as_ref(),
            Err(err) => {
                warn!(volume = %self.volume.id(), %err, "skipping render of volume texture");
                None
            }
        }
    }

    /// Release the texture. Later passes fail with [`RenderError::Disposed`].
    pub fn dispose<D>(&mut self, device: &mut D)
    where
        D: GpuDevice<Texture = T>,
    {
        if let Some(texture) = self.texture.take() {
            device.release_texture(texture);
        }
        self.descriptor = None;
        self.state = StreamerState::Disposed;
        debug!(volume = %self.volume.id(), "volume texture disposed");
    }

    fn allocate<D>(&mut self, device: &mut D, descriptor: TextureDescriptor) -> RenderResult<()>
    where
        D: GpuDevice<Texture = T>,
    {
        if let Some(old) = self.texture.take() {
            device.release_texture(old);
        }
        self.descriptor = None;

        match device.create_texture(&descriptor) {
            Ok(texture) => {
                self.texture = Some(texture);
                self.descriptor = Some(descriptor);
                self.dirty.mark_all();
                self.state = StreamerState::Allocated;
                debug!(
                    volume = %self.volume.id(),
                    width = descriptor.width,
                    height = descriptor.height,
                    depth = descriptor.depth,
                    format = ?descriptor.format,
                    "volume texture allocated"
                );
                Ok(())
            }
            Err(err) => {
                self.state = StreamerState::Uninitialized;
                Err(err)
            }
        }
    }
}

impl<T> std::fmt::Debug for TextureStreamer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextureStreamer")
            .field("volume", &self.volume.id())
            .field("state", &self.state)
            .field("descriptor", &self.descriptor)
            .field("dirty", &self.dirty.dirty_count())
            .finish()
    }
}
