//! Progressive volume loading
//!
//! A load turns every missing frame of a volume into one scheduled request.
//! Completions arrive in any order, possibly on worker threads; each one
//! updates the volume's loaded-frame bitmap and notifies every listener that
//! joined the load. A failed frame is counted as processed but stays unset,
//! so a later load only asks for the frames that are still missing.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use voxstream_cache::{
    CacheEvent, LoadCanceller, LoadProgress, ProgressCallback, Volume, VolumeCache, VolumeId,
};
use voxstream_scheduler::{
    CancellationToken, FrameRequest, RequestExecutor, RequestId, RequestScheduler, RequestType,
    ScheduledRequest,
};

use crate::error::{LoadError, LoadResult};
use crate::order::FrameOrder;
use crate::transport::{FrameTarget, FrameTransport, ScalingParameters};

/// Per-load settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadOptions {
    pub request_type: RequestType,
    pub order: FrameOrder,
    pub scaling: ScalingParameters,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            request_type: RequestType::Prefetch,
            order: FrameOrder::default(),
            scaling: ScalingParameters::default(),
        }
    }
}

impl LoadOptions {
    pub fn with_request_type(mut self, request_type: RequestType) -> Self {
        self.request_type = request_type;
        self
    }

    pub fn with_order(mut self, order: FrameOrder) -> Self {
        self.order = order;
        self
    }

    pub fn with_scaling(mut self, scaling: ScalingParameters) -> Self {
        self.scaling = scaling;
        self
    }
}

/// Bookkeeping for one volume whose load is in flight.
struct InFlightLoad {
    volume: Arc<Volume>,
    options: LoadOptions,
    /// Unresolved requests and the frame each one fetches
    requests: HashMap<RequestId, usize>,
    frames_processed: usize,
}

impl InFlightLoad {
    fn submit(&mut self, scheduler: &RequestScheduler, frame_index: usize) {
        let mut request = FrameRequest::new(self.volume.id(), frame_index);
        if let Some(image_id) = self.volume.frame_id(frame_index) {
            request = request.with_image_id(image_id);
        }
        let (id, _) = scheduler.submit(self.options.request_type, request);
        self.requests.insert(id, frame_index);
    }
}

/// What a completed request changed, gathered under the locks and acted on
/// after they are released.
struct Resolution {
    progress: LoadProgress,
    callbacks: Vec<ProgressCallback>,
    terminal: bool,
}

struct LoaderInner {
    cache: VolumeCache,
    scheduler: RequestScheduler,
    transport: Arc<dyn FrameTransport>,
    default_options: LoadOptions,
    loads: Mutex<HashMap<VolumeId, InFlightLoad>>,
}

/// Streams volumes into their backing buffers one frame at a time.
///
/// Cloning yields another handle to the same loader. Concurrent `load`
/// calls for the same volume join the load already in flight.
#[derive(Clone)]
pub struct StreamingLoader {
    inner: Arc<LoaderInner>,
}

impl StreamingLoader {
    /// Create a loader and register it with `cache` so that decaching a
    /// loading volume cancels its load first.
    pub fn new(
        cache: VolumeCache,
        scheduler: RequestScheduler,
        transport: Arc<dyn FrameTransport>,
    ) -> Self {
        Self::with_default_options(cache, scheduler, transport, LoadOptions::default())
    }

    pub fn with_default_options(
        cache: VolumeCache,
        scheduler: RequestScheduler,
        transport: Arc<dyn FrameTransport>,
        default_options: LoadOptions,
    ) -> Self {
        let inner = Arc::new(LoaderInner {
            cache,
            scheduler,
            transport,
            default_options,
            loads: Mutex::new(HashMap::new()),
        });
        let canceller: Weak<dyn LoadCanceller> = Arc::downgrade(&inner) as Weak<LoaderInner>;
        inner.cache.set_load_canceller(canceller);
        Self { inner }
    }

    pub fn cache(&self) -> &VolumeCache {
        &self.inner.cache
    }

    pub fn scheduler(&self) -> &RequestScheduler {
        &self.inner.scheduler
    }

    /// Start or join the load of a cached volume with the default options.
    /// Returns the number of new frame requests issued.
    pub fn load(&self, volume_id: &str, callback: Option<ProgressCallback>) -> LoadResult<usize> {
        self.load_with(volume_id, self.inner.default_options, callback)
    }

    /// Start or join the load of a cached volume.
    ///
    /// - Already loading: `callback` joins the load, nothing new is requested.
    /// - Already loaded: `callback` is invoked at once with a complete snapshot.
    /// - Otherwise frames already cached as standalone images are copied in,
    ///   and one request is issued per frame that is still missing.
    pub fn load_with(
        &self,
        volume_id: &str,
        options: LoadOptions,
        callback: Option<ProgressCallback>,
    ) -> LoadResult<usize> {
        let volume = self
            .inner
            .cache
            .peek_volume(volume_id)
            .ok_or_else(|| LoadError::UnknownVolume(volume_id.to_string()))?;

        let mut loads = self.inner.loads.lock();
        let mut status = volume.load_status();
        if status.loading {
            status.pending_callbacks.extend(callback);
            debug!(volume = %volume_id, "joined in-flight load");
            return Ok(0);
        }
        if status.loaded {
            drop(status);
            drop(loads);
            if let Some(callback) = callback {
                callback(&complete_snapshot(&volume));
            }
            return Ok(0);
        }

        status.loading = true;
        status.pending_callbacks.extend(callback);
        let missing: Vec<usize> = status.cached_frames.iter_unset().collect();
        drop(status);

        let reused = self.inner.copy_cached_images(&volume, &missing);
        let remaining: Vec<usize> = missing
            .into_iter()
            .filter(|frame| !reused.contains(frame))
            .collect();

        let total = volume.frame_count();
        let mut load = InFlightLoad {
            volume: volume.clone(),
            options,
            requests: HashMap::with_capacity(remaining.len()),
            frames_processed: total - remaining.len(),
        };
        for frame_index in options.order.apply(&remaining) {
            load.submit(&self.inner.scheduler, frame_index);
        }
        let issued = load.requests.len();

        info!(
            volume = %volume_id,
            frames = total,
            requested = issued,
            reused = reused.len(),
            class = %options.request_type,
            "volume load started"
        );

        if issued > 0 {
            loads.insert(volume_id.to_string(), load);
            return Ok(issued);
        }

        // Every missing frame came from the image cache
        let resolution = {
            let mut status = volume.load_status();
            status.refresh_loaded();
            status.loading = false;
            Resolution {
                progress: complete_snapshot_locked(&volume, status.frames_loaded()),
                callbacks: std::mem::take(&mut status.pending_callbacks),
                terminal: true,
            }
        };
        drop(loads);
        self.inner.deliver(volume_id, None, resolution);
        Ok(0)
    }

    /// Cancel a volume's load. Returns `false` if it was not loading.
    pub fn cancel(&self, volume_id: &str) -> bool {
        self.inner.cancel(volume_id)
    }

    /// Move a loading volume's queued requests to another class.
    pub fn prioritize(&self, volume_id: &str, request_type: RequestType) -> usize {
        let mut loads = self.inner.loads.lock();
        if let Some(load) = loads.get_mut(volume_id) {
            load.options.request_type = request_type;
        }
        self.inner
            .scheduler
            .reprioritize_volume(volume_id, request_type)
    }

    pub fn is_loading(&self, volume_id: &str) -> bool {
        self.inner.loads.lock().contains_key(volume_id)
    }

    pub fn loading_volumes(&self) -> Vec<VolumeId> {
        self.inner.loads.lock().keys().cloned().collect()
    }

    /// Unresolved requests of a volume's current load.
    pub fn outstanding_requests(&self, volume_id: &str) -> usize {
        self.inner
            .loads
            .lock()
            .get(volume_id)
            .map_or(0, |load| load.requests.len())
    }

    /// Fetch, decode and record one scheduled request.
    ///
    /// A request cancelled on its own while its volume is still loading is
    /// re-issued instead of run. Does not release the request's scheduler
    /// slot; the caller does that.
    pub fn execute(&self, request: &ScheduledRequest, token: &CancellationToken) {
        self.inner.execute(request, token);
    }

    /// Executor for a [`voxstream_scheduler::WorkerPool`].
    pub fn executor(&self) -> RequestExecutor {
        let loader = self.clone();
        Arc::new(move |request: &ScheduledRequest, token: &CancellationToken| {
            loader.execute(request, token);
        })
    }

    /// Drain the scheduler on the calling thread. Returns the number of
    /// requests handled.
    pub fn run_pending(&self) -> usize {
        let scheduler = &self.inner.scheduler;
        let mut handled = 0;
        while let Some(request) = scheduler.next_request() {
            let token = scheduler
                .cancellation_token(request.id)
                .unwrap_or_default();
            self.execute(&request, &token);
            scheduler.complete_request(request.id);
            handled += 1;
        }
        handled
    }
}

impl std::fmt::Debug for StreamingLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingLoader")
            .field("loading", &self.loading_volumes())
            .finish()
    }
}

impl LoaderInner {
    /// Copy frames already cached as owned images straight into the volume.
    fn copy_cached_images(&self, volume: &Volume, frames: &[usize]) -> Vec<usize> {
        let mut copied = Vec::new();
        for &frame_index in frames {
            let Some(image_id) = volume.frame_id(frame_index) else {
                continue;
            };
            let Some(image) = self.cache.peek_image(image_id) else {
                continue;
            };
            if image.is_aliased() || image.pixel_byte_length() != volume.frame_byte_length() {
                continue;
            }
            match image.with_pixels(|pixels| volume.write_frame(frame_index, pixels)) {
                Ok(Ok(())) => copied.push(frame_index),
                Ok(Err(err)) | Err(err) => {
                    debug!(image = %image_id, %err, "cached image not reusable");
                }
            }
        }

        if !copied.is_empty() {
            let mut status = volume.load_status();
            for &frame_index in &copied {
                status.cached_frames.set(frame_index);
            }
        }
        copied
    }

    fn execute(&self, request: &ScheduledRequest, token: &CancellationToken) {
        let volume_id = request.volume_id();
        let (volume, scaling) = {
            let loads = self.loads.lock();
            match loads.get(volume_id) {
                Some(load) if load.requests.contains_key(&request.id) => {
                    (load.volume.clone(), load.options.scaling)
                }
                _ => return,
            }
        };
        if token.is_cancelled() {
            self.requeue_if_orphaned(request);
            return;
        }

        let frame_index = request.frame_index();
        let result = decode_into_volume(
            self.transport.as_ref(),
            &volume,
            &request.request,
            &scaling,
            token,
        );
        if token.is_cancelled() || matches!(result, Err(LoadError::Cancelled)) {
            self.requeue_if_orphaned(request);
            return;
        }
        self.resolve(request.id, volume_id, frame_index, result);
    }

    /// A request cancelled on its own (not through its volume's load) gets
    /// re-issued so the load can still finish.
    fn requeue_if_orphaned(&self, request: &ScheduledRequest) {
        let mut loads = self.loads.lock();
        let Some(load) = loads.get_mut(request.volume_id()) else {
            return;
        };
        if let Some(frame_index) = load.requests.remove(&request.id) {
            load.submit(&self.scheduler, frame_index);
        }
    }

    fn resolve(&self, request_id: RequestId, volume_id: &str, frame_index: usize, result: LoadResult<()>) {
        let resolution = {
            let mut loads = self.loads.lock();
            let Some(load) = loads.get_mut(volume_id) else {
                return;
            };
            if load.requests.remove(&request_id).is_none() {
                return;
            }
            load.frames_processed += 1;
            let total = load.volume.frame_count();
            let terminal = load.frames_processed >= total;

            let mut status = load.volume.load_status();
            if result.is_ok() {
                status.cached_frames.set(frame_index);
            }
            let progress = LoadProgress {
                volume_id: volume_id.to_string(),
                success: result.is_ok(),
                frame_index: Some(frame_index),
                frames_loaded: status.frames_loaded(),
                frames_processed: load.frames_processed,
                total_frames: total,
                error: result.as_ref().err().map(ToString::to_string),
            };
            let callbacks = if terminal {
                status.refresh_loaded();
                status.loading = false;
                std::mem::take(&mut status.pending_callbacks)
            } else {
                status.pending_callbacks.clone()
            };
            drop(status);
            if terminal {
                loads.remove(volume_id);
            }
            Resolution {
                progress,
                callbacks,
                terminal,
            }
        };

        self.deliver(volume_id, Some(&result), resolution);
    }

    /// Publish events and run callbacks for one resolved frame. Called with
    /// no loader or volume lock held.
    fn deliver(&self, volume_id: &str, result: Option<&LoadResult<()>>, resolution: Resolution) {
        let progress = &resolution.progress;
        let events = self.cache.events();
        match (result, progress.frame_index) {
            (Some(Ok(())), Some(frame_index)) => {
                debug!(volume = %volume_id, frame = frame_index, "frame loaded");
                events.publish(&CacheEvent::FrameLoaded {
                    volume_id: volume_id.to_string(),
                    frame_index,
                });
            }
            (Some(Err(err)), Some(frame_index)) => {
                warn!(volume = %volume_id, frame = frame_index, %err, "frame failed to load");
                events.publish(&CacheEvent::VolumeLoadFailed {
                    volume_id: volume_id.to_string(),
                    frame_index,
                    error: err.to_string(),
                });
            }
            _ => {}
        }

        for callback in &resolution.callbacks {
            callback(progress);
        }

        if resolution.terminal {
            let complete = progress.frames_loaded == progress.total_frames;
            info!(
                volume = %volume_id,
                loaded = progress.frames_loaded,
                total = progress.total_frames,
                complete,
                "volume load finished"
            );
            events.publish(&CacheEvent::VolumeLoaded {
                volume_id: volume_id.to_string(),
                frames_loaded: progress.frames_loaded,
                total_frames: progress.total_frames,
                complete,
            });
        }
    }

    fn cancel(&self, volume_id: &str) -> bool {
        let mut loads = self.loads.lock();
        let Some(load) = loads.remove(volume_id) else {
            return false;
        };

        {
            let mut status = load.volume.load_status();
            status.loading = false;
            status.refresh_loaded();
            status.pending_callbacks.clear();
        }
        let withdrawn = self.scheduler.cancel_volume(volume_id);

        // Anything another load lost from the scheduler goes back in
        let mut resubmitted = 0;
        for (other_id, other) in loads.iter_mut() {
            let outstanding = self.scheduler.outstanding_frames(other_id);
            let stalled: Vec<(RequestId, usize)> = other
                .requests
                .iter()
                .filter(|(_, frame)| outstanding.binary_search(*frame).is_err())
                .map(|(id, frame)| (*id, *frame))
                .collect();
            for (request_id, frame_index) in stalled {
                other.requests.remove(&request_id);
                other.submit(&self.scheduler, frame_index);
                resubmitted += 1;
            }
        }
        drop(loads);

        info!(
            volume = %volume_id,
            loaded = load.volume.frames_loaded(),
            withdrawn,
            resubmitted,
            "volume load cancelled"
        );
        true
    }
}

impl LoadCanceller for LoaderInner {
    fn cancel_load(&self, volume_id: &str) {
        self.cancel(volume_id);
    }
}

/// Decode straight into the frame's range of the volume buffer. The frame
/// is marked dirty whatever the outcome, since a failed decode may have
/// written part of it.
fn decode_into_volume(
    transport: &dyn FrameTransport,
    volume: &Volume,
    request: &FrameRequest,
    scaling: &ScalingParameters,
    token: &CancellationToken,
) -> LoadResult<()> {
    let byte_offset = volume.buffer().frame_range(request.frame_index)?.start;
    let element_type = volume.metadata().scalar_type;
    volume.write_frame_with(request.frame_index, |bytes| {
        transport.decode_frame(
            request,
            FrameTarget {
                bytes,
                byte_offset,
                element_type,
            },
            scaling,
            token,
        )
    })?
}

fn complete_snapshot(volume: &Volume) -> LoadProgress {
    complete_snapshot_locked(volume, volume.frame_count())
}

fn complete_snapshot_locked(volume: &Volume, frames_loaded: usize) -> LoadProgress {
    let total = volume.frame_count();
    LoadProgress {
        volume_id: volume.id().to_string(),
        success: frames_loaded == total,
        frame_index: None,
        frames_loaded,
        frames_processed: total,
        total_frames: total,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use voxstream_cache::{CachedImage, ImageMetadata, ScalarType, VolumeMetadata};
    use voxstream_scheduler::{WorkerPool, WorkerPoolConfig};

    /// Fills each frame with its index; fails the listed frames.
    struct FakeTransport {
        failing: Mutex<HashSet<usize>>,
        decoded: Mutex<Vec<usize>>,
    }

    impl FakeTransport {
        fn new(failing: &[usize]) -> Arc<Self> {
            Arc::new(Self {
                failing: Mutex::new(failing.iter().copied().collect()),
                decoded: Mutex::new(Vec::new()),
            })
        }

        fn heal(&self) {
            self.failing.lock().clear();
        }
    }

    impl FrameTransport for FakeTransport {
        fn decode_frame(
            &self,
            request: &FrameRequest,
            target: FrameTarget<'_>,
            _scaling: &ScalingParameters,
            token: &CancellationToken,
        ) -> LoadResult<()> {
            if token.is_cancelled() {
                return Err(LoadError::Cancelled);
            }
            self.decoded.lock().push(request.frame_index);
            if self.failing.lock().contains(&request.frame_index) {
                return Err(LoadError::transport(format!("frame {} unavailable", request.frame_index)));
            }
            target.bytes.fill(request.frame_index as u8);
            Ok(())
        }
    }

    fn setup(frames: usize, transport: Arc<FakeTransport>) -> (VolumeCache, StreamingLoader) {
        let cache = VolumeCache::new(1 << 20);
        let meta = VolumeMetadata::new([4, 4, frames as u32], ScalarType::U8);
        let frame_ids = (0..frames).map(|i| format!("img:{i}")).collect();
        cache.allocate_volume("vol", meta, frame_ids).unwrap();
        let loader = StreamingLoader::new(cache.clone(), RequestScheduler::default(), transport);
        (cache, loader)
    }

    fn recorder() -> (ProgressCallback, Arc<Mutex<Vec<LoadProgress>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: ProgressCallback = Arc::new(move |progress: &LoadProgress| {
            sink.lock().push(progress.clone());
        });
        (callback, seen)
    }

    #[test]
    fn test_full_load() {
        let transport = FakeTransport::new(&[]);
        let (cache, loader) = setup(5, transport.clone());
        let (callback, seen) = recorder();

        assert_eq!(loader.load("vol", Some(callback)).unwrap(), 5);
        assert!(loader.is_loading("vol"));
        assert_eq!(loader.run_pending(), 5);

        let volume = cache.peek_volume("vol").unwrap();
        assert!(volume.is_loaded());
        assert!(!volume.is_loading());
        assert!(volume.load_status().cached_frames.all_set());
        assert!(volume.load_status().pending_callbacks.is_empty());
        assert_eq!(volume.buffer().read_frame(3).unwrap(), vec![3; 16]);

        let progress = seen.lock();
        assert_eq!(progress.len(), 5);
        assert!(progress.iter().all(|p| p.success));
        let last = progress.last().unwrap();
        assert!(last.is_complete());
        assert_eq!(last.frames_loaded, 5);
        assert!(!loader.is_loading("vol"));
    }

    #[test]
    fn test_requests_are_interleaved() {
        let transport = FakeTransport::new(&[]);
        let (_cache, loader) = setup(10, transport.clone());
        loader.load("vol", None).unwrap();
        loader.run_pending();
        assert_eq!(*transport.decoded.lock(), vec![0, 8, 4, 2, 6, 1, 3, 5, 7, 9]);
    }

    #[test]
    fn test_partial_failure_then_reload_requests_only_missing_frames() {
        let transport = FakeTransport::new(&[2, 5, 7]);
        let (cache, loader) = setup(10, transport.clone());
        let (callback, seen) = recorder();

        loader.load("vol", Some(callback)).unwrap();
        loader.run_pending();

        let volume = cache.peek_volume("vol").unwrap();
        assert_eq!(volume.frames_loaded(), 7);
        assert!(!volume.is_loaded());
        assert!(!volume.is_loading());
        {
            let progress = seen.lock();
            assert_eq!(progress.iter().filter(|p| !p.success).count(), 3);
            assert!(progress.iter().any(|p| p.error.as_deref() == Some("transport error: frame 5 unavailable")));
            assert_eq!(progress.last().unwrap().frames_processed, 10);
        }

        transport.heal();
        transport.decoded.lock().clear();
        assert_eq!(loader.load("vol", None).unwrap(), 3);
        loader.run_pending();

        let mut decoded = transport.decoded.lock().clone();
        decoded.sort_unstable();
        assert_eq!(decoded, vec![2, 5, 7]);
        assert!(volume.is_loaded());
    }

    #[test]
    fn test_second_load_joins_in_flight_load() {
        let transport = FakeTransport::new(&[]);
        let (_cache, loader) = setup(4, transport.clone());
        let (first, first_seen) = recorder();
        let (second, second_seen) = recorder();

        assert_eq!(loader.load("vol", Some(first)).unwrap(), 4);
        assert_eq!(loader.load("vol", Some(second)).unwrap(), 0);
        loader.run_pending();

        assert_eq!(transport.decoded.lock().len(), 4);
        assert_eq!(first_seen.lock().len(), 4);
        assert_eq!(second_seen.lock().len(), 4);
    }

    #[test]
    fn test_loaded_volume_reports_immediately() {
        let transport = FakeTransport::new(&[]);
        let (_cache, loader) = setup(3, transport.clone());
        loader.load("vol", None).unwrap();
        loader.run_pending();

        let (callback, seen) = recorder();
        assert_eq!(loader.load("vol", Some(callback)).unwrap(), 0);
        let progress = seen.lock();
        assert_eq!(progress.len(), 1);
        assert_eq!(progress[0].frame_index, None);
        assert_eq!(progress[0].fraction_loaded(), 1.0);
        assert!(progress[0].is_complete());
    }

    #[test]
    fn test_unknown_volume() {
        let (_cache, loader) = setup(1, FakeTransport::new(&[]));
        assert_eq!(
            loader.load("nope", None).unwrap_err(),
            LoadError::UnknownVolume("nope".into())
        );
    }

    #[test]
    fn test_cancel_keeps_loaded_frames() {
        let transport = FakeTransport::new(&[]);
        let (cache, loader) = setup(6, transport.clone());
        let (callback, _seen) = recorder();
        loader.load("vol", Some(callback)).unwrap();

        // resolve two frames by hand, leaving the rest queued
        for _ in 0..2 {
            let request = loader.scheduler().next_request().unwrap();
            let token = loader.scheduler().cancellation_token(request.id).unwrap();
            loader.execute(&request, &token);
            loader.scheduler().complete_request(request.id);
        }

        assert!(loader.cancel("vol"));
        assert!(!loader.cancel("vol"));

        let volume = cache.peek_volume("vol").unwrap();
        assert_eq!(volume.frames_loaded(), 2);
        assert!(!volume.is_loading());
        assert!(!volume.is_loaded());
        assert!(volume.load_status().pending_callbacks.is_empty());
        assert!(!loader.scheduler().has_pending_requests());

        // resuming only asks for what is missing
        assert_eq!(loader.load("vol", None).unwrap(), 4);
        loader.run_pending();
        assert!(volume.is_loaded());
    }

    #[test]
    fn test_result_of_cancelled_request_is_discarded() {
        let transport = FakeTransport::new(&[]);
        let (cache, loader) = setup(2, transport.clone());
        loader.load("vol", None).unwrap();

        let request = loader.scheduler().next_request().unwrap();
        let token = loader.scheduler().cancellation_token(request.id).unwrap();
        loader.cancel("vol");
        loader.execute(&request, &token);
        loader.scheduler().complete_request(request.id);

        assert_eq!(cache.peek_volume("vol").unwrap().frames_loaded(), 0);
        assert!(transport.decoded.lock().is_empty());
    }

    #[test]
    fn test_cancel_leaves_other_loads_running() {
        let transport = FakeTransport::new(&[]);
        let (cache, loader) = setup(3, transport.clone());
        let meta = VolumeMetadata::new([4, 4, 3], ScalarType::U8);
        let ids = (0..3).map(|i| format!("pet:{i}")).collect();
        cache.allocate_volume("pet", meta, ids).unwrap();

        loader.load("vol", None).unwrap();
        loader.load("pet", None).unwrap();
        loader.cancel("vol");

        assert_eq!(loader.outstanding_requests("pet"), 3);
        assert_eq!(loader.scheduler().outstanding_frames("pet"), vec![0, 1, 2]);
        loader.run_pending();
        assert!(cache.peek_volume("pet").unwrap().is_loaded());
        assert!(!cache.peek_volume("vol").unwrap().is_loaded());
    }

    #[test]
    fn test_withdrawn_request_is_reissued() {
        let transport = FakeTransport::new(&[]);
        let (cache, loader) = setup(3, transport.clone());
        let (callback, seen) = recorder();
        loader.load("vol", Some(callback)).unwrap();

        let victim = loader.scheduler().pending_list()[0].id;
        assert!(loader.scheduler().cancel_request(victim));
        assert_eq!(loader.scheduler().outstanding_frames("vol"), vec![1, 2]);

        // the flagged request is drained, re-issued and then decoded
        assert_eq!(loader.run_pending(), 4);
        assert!(!loader.is_loading("vol"));
        assert!(cache.peek_volume("vol").unwrap().is_loaded());
        assert_eq!(transport.decoded.lock().len(), 3);
        assert_eq!(seen.lock().iter().filter(|p| p.is_complete()).count(), 1);
    }

    #[test]
    fn test_frames_decode_into_the_volume_buffer() {
        /// Records where each frame was handed to the decoder.
        #[derive(Default)]
        struct AddressTransport {
            seen: Mutex<Vec<(usize, usize, usize, usize)>>,
        }

        impl FrameTransport for AddressTransport {
            fn decode_frame(
                &self,
                request: &FrameRequest,
                target: FrameTarget<'_>,
                _scaling: &ScalingParameters,
                _token: &CancellationToken,
            ) -> LoadResult<()> {
                self.seen.lock().push((
                    request.frame_index,
                    target.byte_offset,
                    target.byte_length(),
                    target.bytes.as_ptr() as usize,
                ));
                target.bytes.fill(0xAB);
                Ok(())
            }
        }

        let transport = Arc::new(AddressTransport::default());
        let cache = VolumeCache::new(1 << 20);
        let meta = VolumeMetadata::new([4, 4, 3], ScalarType::U16);
        let ids = (0..3).map(|i| format!("img:{i}")).collect();
        let volume = cache.allocate_volume("vol", meta, ids).unwrap();
        let loader = StreamingLoader::new(cache.clone(), RequestScheduler::default(), transport.clone());

        loader.load("vol", None).unwrap();
        loader.run_pending();
        assert!(volume.is_loaded());

        let seen = transport.seen.lock();
        assert_eq!(seen.len(), 3);
        for &(frame, offset, length, address) in seen.iter() {
            let range = volume.buffer().frame_range(frame).unwrap();
            assert_eq!(offset, range.start);
            assert_eq!(length, range.len());
            let frame_address = volume
                .buffer()
                .with_frame(frame, |bytes| bytes.as_ptr() as usize)
                .unwrap();
            assert_eq!(address, frame_address);
            assert_eq!(volume.buffer().read_frame(frame).unwrap(), vec![0xAB; 32]);
        }
    }

    #[test]
    fn test_cached_images_are_reused() {
        let transport = FakeTransport::new(&[]);
        let (cache, loader) = setup(3, transport.clone());
        let meta = ImageMetadata::new(4, 4, ScalarType::U8);
        cache
            .put_image(CachedImage::new("img:1", meta, vec![42; 16]).unwrap())
            .unwrap();

        assert_eq!(loader.load("vol", None).unwrap(), 2);
        loader.run_pending();

        let volume = cache.peek_volume("vol").unwrap();
        assert!(volume.is_loaded());
        assert_eq!(volume.buffer().read_frame(1).unwrap(), vec![42; 16]);
        assert!(!transport.decoded.lock().contains(&1));
    }

    #[test]
    fn test_load_satisfied_entirely_from_image_cache() {
        let transport = FakeTransport::new(&[]);
        let (cache, loader) = setup(2, transport.clone());
        for i in 0..2 {
            let meta = ImageMetadata::new(4, 4, ScalarType::U8);
            cache
                .put_image(CachedImage::new(format!("img:{i}"), meta, vec![i; 16]).unwrap())
                .unwrap();
        }
        let (callback, seen) = recorder();

        assert_eq!(loader.load("vol", Some(callback)).unwrap(), 0);
        assert!(cache.peek_volume("vol").unwrap().is_loaded());
        assert_eq!(seen.lock().len(), 1);
        assert!(seen.lock()[0].success);
    }

    #[test]
    fn test_load_marks_frames_dirty() {
        let transport = FakeTransport::new(&[]);
        let (cache, loader) = setup(3, transport);
        let volume = cache.peek_volume("vol").unwrap();
        let dirty = volume.attach_dirty_tracker();
        for frame in 0..3 {
            dirty.clear(frame);
        }

        loader.load("vol", None).unwrap();
        loader.run_pending();
        assert_eq!(dirty.dirty_frames(), vec![0, 1, 2]);
    }

    #[test]
    fn test_events_published() {
        let transport = FakeTransport::new(&[1]);
        let (cache, loader) = setup(3, transport);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        cache.events().subscribe(Arc::new(move |event: &CacheEvent| {
            sink.lock().push(event.clone());
        }));

        loader.load("vol", None).unwrap();
        loader.run_pending();

        let events = events.lock();
        let frames_loaded = events
            .iter()
            .filter(|e| matches!(e, CacheEvent::FrameLoaded { .. }))
            .count();
        assert_eq!(frames_loaded, 2);
        assert!(events.contains(&CacheEvent::VolumeLoadFailed {
            volume_id: "vol".into(),
            frame_index: 1,
            error: "transport error: frame 1 unavailable".into(),
        }));
        assert_eq!(
            events.last(),
            Some(&CacheEvent::VolumeLoaded {
                volume_id: "vol".into(),
                frames_loaded: 2,
                total_frames: 3,
                complete: false,
            })
        );
    }

    #[test]
    fn test_decache_cancels_load() {
        let transport = FakeTransport::new(&[]);
        let (cache, loader) = setup(4, transport);
        loader.load("vol", None).unwrap();

        cache.decache_volume("vol").unwrap();
        assert!(!loader.is_loading("vol"));
        assert!(!loader.scheduler().has_pending_requests());
        assert_eq!(cache.cache_size(), 0);
    }

    #[test]
    fn test_prioritize_moves_queued_requests() {
        let transport = FakeTransport::new(&[]);
        let (_cache, loader) = setup(4, transport);
        loader.load("vol", None).unwrap();

        assert_eq!(loader.prioritize("vol", RequestType::Interaction), 4);
        assert_eq!(loader.scheduler().pending_of(RequestType::Interaction), 4);
    }

    #[test]
    fn test_worker_pool_completes_out_of_order() {
        use rand::seq::SliceRandom;

        /// Sleeps a random few milliseconds so completions interleave.
        struct JitterTransport;

        impl FrameTransport for JitterTransport {
            fn decode_frame(
                &self,
                request: &FrameRequest,
                target: FrameTarget<'_>,
                _scaling: &ScalingParameters,
                _token: &CancellationToken,
            ) -> LoadResult<()> {
                let delays = [0u64, 1, 2, 3];
                let delay = delays.choose(&mut rand::thread_rng()).copied().unwrap_or(0);
                std::thread::sleep(std::time::Duration::from_millis(delay));
                target.bytes.fill(request.frame_index as u8);
                Ok(())
            }
        }

        let cache = VolumeCache::new(1 << 20);
        let meta = VolumeMetadata::new([8, 8, 32], ScalarType::U8);
        let ids = (0..32).map(|i| format!("img:{i}")).collect();
        let volume = cache.allocate_volume("vol", meta, ids).unwrap();
        let loader = StreamingLoader::new(
            cache.clone(),
            RequestScheduler::new(4),
            Arc::new(JitterTransport),
        );

        let (callback, seen) = recorder();
        loader.load("vol", Some(callback)).unwrap();
        let pool = WorkerPool::new(
            loader.scheduler().clone(),
            loader.executor(),
            WorkerPoolConfig::new(4),
        )
        .unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        while !volume.is_loaded() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        pool.shutdown();

        assert!(volume.is_loaded());
        let progress = seen.lock();
        assert_eq!(progress.len(), 32);
        assert_eq!(progress.iter().filter(|p| p.is_complete()).count(), 1);
        for frame in 0..32 {
            assert_eq!(volume.buffer().read_frame(frame).unwrap(), vec![frame as u8; 64]);
        }
    }
}
