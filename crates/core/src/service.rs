//! One handle wiring the cache, scheduler, loader and alias optimizer
//! together from a [`CacheConfig`].

use std::io;
use std::sync::Arc;

use tracing::info;
use voxstream_cache::{
    BufferAliasOptimizer, CacheConfig, CacheResult, EventBus, ProgressCallback, SubscriptionId,
    VolumeCache,
};
use voxstream_scheduler::{RequestScheduler, RequestType, WorkerPool, WorkerPoolConfig};

use crate::error::LoadResult;
use crate::loader::StreamingLoader;
use crate::transport::FrameTransport;

pub struct StreamingService {
    config: CacheConfig,
    cache: VolumeCache,
    scheduler: RequestScheduler,
    loader: StreamingLoader,
    optimizer: BufferAliasOptimizer,
    alias_subscription: Option<SubscriptionId>,
}

impl StreamingService {
    pub fn new(config: CacheConfig, transport: Arc<dyn FrameTransport>) -> Self {
        let cache = VolumeCache::from_config(&config);
        let scheduler = RequestScheduler::new(config.max_requests_per_class);
        let loader = StreamingLoader::new(cache.clone(), scheduler.clone(), transport);
        let optimizer = BufferAliasOptimizer::from_config(cache.clone(), &config);
        let alias_subscription = optimizer.is_active().then(|| optimizer.attach());

        info!(
            max_cache_mb = config.max_cache_mb(),
            policy = ?config.eviction_policy,
            aliasing = optimizer.is_active(),
            "streaming service ready"
        );

        Self {
            config,
            cache,
            scheduler,
            loader,
            optimizer,
            alias_subscription,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn cache(&self) -> &VolumeCache {
        &self.cache
    }

    pub fn scheduler(&self) -> &RequestScheduler {
        &self.scheduler
    }

    pub fn loader(&self) -> &StreamingLoader {
        &self.loader
    }

    pub fn optimizer(&self) -> &BufferAliasOptimizer {
        &self.optimizer
    }

    pub fn events(&self) -> &EventBus {
        self.cache.events()
    }

    pub fn is_cacheable(&self, bytes: usize) -> bool {
        self.cache.is_cacheable(bytes)
    }

    pub fn cache_size(&self) -> usize {
        self.cache.cache_size()
    }

    pub fn max_cache_size(&self) -> usize {
        self.cache.max_cache_size()
    }

    pub fn set_max_cache_size(&self, bytes: usize) -> CacheResult<()> {
        self.cache.set_max_cache_size(bytes)
    }

    /// Start or join the load of a cached volume. Returns the number of
    /// frame requests issued.
    pub fn load_volume(
        &self,
        volume_id: &str,
        on_progress: Option<ProgressCallback>,
    ) -> LoadResult<usize> {
        self.loader.load(volume_id, on_progress)
    }

    pub fn cancel_load_volume(&self, volume_id: &str) -> bool {
        self.loader.cancel(volume_id)
    }

    /// Remove a volume, cancelling its load and restoring aliased frames.
    pub fn decache_volume(&self, volume_id: &str) -> CacheResult<usize> {
        self.cache.decache_volume(volume_id)
    }

    pub fn purge_cache(&self) {
        self.cache.purge();
    }

    pub fn prioritize_volume(&self, volume_id: &str, request_type: RequestType) -> usize {
        self.loader.prioritize(volume_id, request_type)
    }

    /// Run every queued request on the calling thread.
    pub fn run_pending(&self) -> usize {
        self.loader.run_pending()
    }

    /// Spawn decode workers that drain the scheduler in the background.
    pub fn start_workers(&self, config: WorkerPoolConfig) -> io::Result<WorkerPool> {
        WorkerPool::new(self.scheduler.clone(), self.loader.executor(), config)
    }
}

impl Drop for StreamingService {
    fn drop(&mut self) {
        if let Some(subscription) = self.alias_subscription.take() {
            self.optimizer.detach(subscription);
        }
    }
}

impl std::fmt::Debug for StreamingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingService")
            .field("cache", &self.cache)
            .field("scheduler", &self.scheduler)
            .field("loader", &self.loader)
            .finish()
    }
}
