//! Fixed pool of rendering contexts shared by viewports
//!
//! Viewports with similar canvas sizes are packed onto the same context so
//! its render targets can be reused; dissimilar sizes are spread out to the
//! least loaded context instead.

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, info};
use voxstream_cache::CacheConfig;

use crate::device::ContextFactory;
use crate::error::{RenderError, RenderResult};

pub const DEFAULT_SIZE_TOLERANCE: u32 = 50;

/// Last known canvas size of a viewport and the context drawing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewportSizeRecord {
    pub width: u32,
    pub height: u32,
    pub context_index: usize,
}

impl ViewportSizeRecord {
    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Distinct canvas sizes currently drawn by one context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextSizeGroup {
    sizes: BTreeSet<(u32, u32)>,
}

impl ContextSizeGroup {
    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    pub fn contains(&self, width: u32, height: u32) -> bool {
        self.sizes.contains(&(width, height))
    }

    pub fn sizes(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.sizes.iter().copied()
    }

    /// Whether some tracked size is within `tolerance` in both dimensions.
    pub fn has_size_within(&self, width: u32, height: u32, tolerance: u32) -> bool {
        self.sizes
            .iter()
            .any(|&(w, h)| w.abs_diff(width) <= tolerance && h.abs_diff(height) <= tolerance)
    }

    /// Smallest `|dw| + |dh|` to any tracked size.
    pub fn min_mismatch(&self, width: u32, height: u32) -> Option<u32> {
        self.sizes
            .iter()
            .map(|&(w, h)| w.abs_diff(width) + h.abs_diff(height))
            .min()
    }

    fn insert(&mut self, size: (u32, u32)) {
        self.sizes.insert(size);
    }

    fn remove(&mut self, size: (u32, u32)) {
        self.sizes.remove(&size);
    }
}

/// A fixed number of contexts created up front; viewports are assigned to
/// them by canvas-size affinity and load.
pub struct ContextPool<C> {
    contexts: Vec<C>,
    size_groups: Vec<ContextSizeGroup>,
    viewports: HashMap<String, ViewportSizeRecord>,
    tolerance: u32,
}

impl<C> ContextPool<C> {
    /// Create `size` contexts through `factory`. If any creation fails, the
    /// ones already created are destroyed again.
    pub fn new<F>(factory: &mut F, size: usize, tolerance: u32) -> RenderResult<Self>
    where
        F: ContextFactory<Context = C>,
    {
        let mut contexts = Vec::with_capacity(size);
        for index in 0..size {
            match factory.create_context(index) {
                Ok(context) => contexts.push(context),
                Err(err) => {
                    for (created, context) in contexts.into_iter().enumerate() {
                        factory.destroy_context(created, context);
                    }
                    return Err(RenderError::ContextCreation {
                        index,
                        reason: err.to_string(),
                    });
                }
            }
        }
        info!(contexts = size, tolerance, "rendering context pool created");

        Ok(Self {
            contexts,
            size_groups: vec![ContextSizeGroup::default(); size],
            viewports: HashMap::new(),
            tolerance,
        })
    }

    pub fn from_config<F>(factory: &mut F, config: &CacheConfig) -> RenderResult<Self>
    where
        F: ContextFactory<Context = C>,
    {
        Self::new(factory, config.context_pool_size, config.size_tolerance)
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    pub fn tolerance(&self) -> u32 {
        self.tolerance
    }

    pub fn context(&self, index: usize) -> Option<&C> {
        self.contexts.get(index)
    }

    pub fn context_mut(&mut self, index: usize) -> Option<&mut C> {
        self.contexts.get_mut(index)
    }

    pub fn size_group(&self, index: usize) -> Option<&ContextSizeGroup> {
        self.size_groups.get(index)
    }

    pub fn viewport(&self, viewport_id: &str) -> Option<&ViewportSizeRecord> {
        self.viewports.get(viewport_id)
    }

    pub fn context_index_for_viewport(&self, viewport_id: &str) -> Option<usize> {
        self.viewports
            .get(viewport_id)
            .map(|record| record.context_index)
    }

    /// Viewport ids assigned to a context, sorted.
    pub fn viewports_for_context(&self, index: usize) -> Vec<String> {
        let mut ids: Vec<String> = self
            .viewports
            .iter()
            .filter(|(_, record)| record.context_index == index)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Pick a context for a canvas of the given size.
    ///
    /// The first context already drawing a size within tolerance wins.
    /// Otherwise the context with the closest size is used if it is within
    /// four times the tolerance, and failing that the context tracking the
    /// fewest sizes. Ties go to the lowest index. `None` only for an empty
    /// pool.
    pub fn find_best_context_for_size(&self, width: u32, height: u32) -> Option<usize> {
        if let Some(index) = self
            .size_groups
            .iter()
            .position(|group| group.has_size_within(width, height, self.tolerance))
        {
            return Some(index);
        }

        let closest = self
            .size_groups
            .iter()
            .enumerate()
            .filter_map(|(index, group)| {
                group
                    .min_mismatch(width, height)
                    .map(|mismatch| (mismatch, index))
            })
            .min();
        if let Some((mismatch, index)) = closest {
            if mismatch <= self.tolerance.saturating_mul(4) {
                return Some(index);
            }
        }

        self.size_groups
            .iter()
            .enumerate()
            .min_by_key(|(index, group)| (group.len(), *index))
            .map(|(index, _)| index)
    }

    /// Add a viewport at the best context for its size. Re-registering an
    /// existing viewport places it afresh.
    pub fn register_viewport(
        &mut self,
        viewport_id: impl Into<String>,
        width: u32,
        height: u32,
    ) -> RenderResult<usize> {
        let viewport_id = viewport_id.into();
        self.remove_viewport(&viewport_id);
        let index = self
            .find_best_context_for_size(width, height)
            .ok_or(RenderError::NoContexts)?;

        self.size_groups[index].insert((width, height));
        self.viewports.insert(
            viewport_id.clone(),
            ViewportSizeRecord {
                width,
                height,
                context_index: index,
            },
        );
        debug!(viewport = %viewport_id, width, height, context = index, "viewport registered");
        Ok(index)
    }

    /// Move a viewport to another context, carrying its size along.
    pub fn assign_viewport_to_context(
        &mut self,
        viewport_id: &str,
        context_index: usize,
    ) -> RenderResult<()> {
        if context_index >= self.contexts.len() {
            return Err(RenderError::InvalidContext(context_index));
        }
        let record = *self
            .viewports
            .get(viewport_id)
            .ok_or_else(|| RenderError::UnknownViewport(viewport_id.to_string()))?;

        self.release_size(viewport_id, record.context_index, record.size());
        self.size_groups[context_index].insert(record.size());
        if let Some(entry) = self.viewports.get_mut(viewport_id) {
            entry.context_index = context_index;
        }
        debug!(
            viewport = %viewport_id,
            from = record.context_index,
            to = context_index,
            "viewport reassigned"
        );
        Ok(())
    }

    /// Record a new canvas size for a viewport on its current context.
    pub fn update_viewport_size(
        &mut self,
        viewport_id: &str,
        width: u32,
        height: u32,
    ) -> RenderResult<()> {
        let record = *self
            .viewports
            .get(viewport_id)
            .ok_or_else(|| RenderError::UnknownViewport(viewport_id.to_string()))?;
        if record.size() == (width, height) {
            return Ok(());
        }

        self.release_size(viewport_id, record.context_index, record.size());
        self.size_groups[record.context_index].insert((width, height));
        if let Some(entry) = self.viewports.get_mut(viewport_id) {
            entry.width = width;
            entry.height = height;
        }
        Ok(())
    }

    /// Returns `false` for unknown viewports.
    pub fn remove_viewport(&mut self, viewport_id: &str) -> bool {
        let Some(record) = self.viewports.get(viewport_id).copied() else {
            return false;
        };
        self.release_size(viewport_id, record.context_index, record.size());
        self.viewports.remove(viewport_id);
        true
    }

    /// Release every context and forget all assignments.
    pub fn destroy<F>(&mut self, factory: &mut F)
    where
        F: ContextFactory<Context = C>,
    {
        let count = self.contexts.len();
        for (index, context) in self.contexts.drain(..).enumerate() {
            factory.destroy_context(index, context);
        }
        self.size_groups.clear();
        self.viewports.clear();
        info!(contexts = count, "rendering context pool destroyed");
    }

    /// Drop `size` from a context's group unless another viewport on that
    /// context still has it.
    fn release_size(&mut self, viewport_id: &str, context_index: usize, size: (u32, u32)) {
        let shared = self.viewports.iter().any(|(id, record)| {
            id != viewport_id && record.context_index == context_index && record.size() == size
        });
        if !shared {
            if let Some(group) = self.size_groups.get_mut(context_index) {
                group.remove(size);
            }
        }
    }
}

impl<C> std::fmt::Debug for ContextPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextPool")
            .field("contexts", &self.contexts.len())
            .field("size_groups", &self.size_groups)
            .field("viewports", &self.viewports)
            .field("tolerance", &self.tolerance)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CountingFactory {
        live: Vec<usize>,
        destroyed: Vec<usize>,
        fail_at: Option<usize>,
    }

    impl ContextFactory for CountingFactory {
        type Context = usize;

        fn create_context(&mut self, index: usize) -> RenderResult<usize> {
            if self.fail_at == Some(index) {
                return Err(RenderError::TextureAllocation("no adapter".into()));
            }
            self.live.push(index);
            Ok(index)
        }

        fn destroy_context(&mut self, index: usize, context: usize) {
            assert_eq!(index, context);
            self.live.retain(|&live| live != index);
            self.destroyed.push(index);
        }
    }

    fn pool(size: usize) -> ContextPool<usize> {
        ContextPool::new(&mut CountingFactory::default(), size, DEFAULT_SIZE_TOLERANCE).unwrap()
    }

    #[test]
    fn test_similar_sizes_share_a_context() {
        let mut pool = pool(7);
        assert_eq!(pool.register_viewport("axial", 800, 600).unwrap(), 0);
        assert_eq!(pool.register_viewport("sagittal", 820, 590).unwrap(), 0);
        // nothing close: goes to the least loaded context
        assert_eq!(pool.register_viewport("thumb", 100, 100).unwrap(), 1);

        assert_eq!(pool.context_index_for_viewport("sagittal"), Some(0));
        assert_eq!(pool.viewports_for_context(0), vec!["axial", "sagittal"]);
        assert_eq!(pool.size_group(0).unwrap().len(), 2);
    }

    #[test]
    fn test_find_best_is_pure() {
        let mut pool = pool(3);
        pool.register_viewport("a", 512, 512).unwrap();
        let first = pool.find_best_context_for_size(530, 500);
        assert_eq!(first, Some(0));
        assert_eq!(pool.find_best_context_for_size(530, 500), first);
        assert_eq!(pool.size_group(0).unwrap().len(), 1);
    }

    #[test]
    fn test_near_miss_within_four_tolerances() {
        let mut pool = pool(3);
        pool.register_viewport("a", 800, 600).unwrap();
        pool.register_viewport("b", 100, 100).unwrap();
        // 120 + 30 off from (800, 600): outside tolerance, inside 4x
        assert_eq!(pool.find_best_context_for_size(920, 630), Some(0));
        // far from both: least loaded context 2
        assert_eq!(pool.find_best_context_for_size(400, 400), Some(2));
    }

    #[test]
    fn test_least_loaded_counts_sizes() {
        let mut pool = pool(2);
        pool.register_viewport("a", 1000, 1000).unwrap();
        pool.register_viewport("b", 100, 100).unwrap();
        pool.assign_viewport_to_context("b", 0).unwrap();
        assert_eq!(pool.size_group(0).unwrap().len(), 2);
        assert!(pool.size_group(1).unwrap().is_empty());
        assert_eq!(pool.find_best_context_for_size(500, 3000), Some(1));
    }

    #[test]
    fn test_reassignment_keeps_shared_sizes() {
        let mut pool = pool(2);
        pool.register_viewport("a", 640, 480).unwrap();
        pool.register_viewport("b", 640, 480).unwrap();
        assert_eq!(pool.context_index_for_viewport("b"), Some(0));

        pool.assign_viewport_to_context("b", 1).unwrap();
        // "a" still draws 640x480 on context 0
        assert!(pool.size_group(0).unwrap().contains(640, 480));
        assert!(pool.size_group(1).unwrap().contains(640, 480));

        pool.assign_viewport_to_context("a", 1).unwrap();
        assert!(pool.size_group(0).unwrap().is_empty());
        assert_eq!(pool.viewports_for_context(1), vec!["a", "b"]);
    }

    #[test]
    fn test_resize_updates_size_group() {
        let mut pool = pool(2);
        pool.register_viewport("a", 640, 480).unwrap();
        pool.update_viewport_size("a", 1280, 960).unwrap();

        let group = pool.size_group(0).unwrap();
        assert!(!group.contains(640, 480));
        assert!(group.contains(1280, 960));
        assert_eq!(pool.viewport("a").map(|r| (r.width, r.height)), Some((1280, 960)));
        assert_eq!(pool.find_best_context_for_size(1300, 950), Some(0));
    }

    #[test]
    fn test_invalid_requests() {
        let mut pool = pool(2);
        pool.register_viewport("a", 10, 10).unwrap();
        assert_eq!(
            pool.assign_viewport_to_context("a", 5),
            Err(RenderError::InvalidContext(5))
        );
        assert_eq!(
            pool.update_viewport_size("ghost", 1, 1),
            Err(RenderError::UnknownViewport("ghost".into()))
        );
        assert!(pool.remove_viewport("a"));
        assert!(!pool.remove_viewport("a"));
        assert!(pool.size_group(0).unwrap().is_empty());
    }

    #[test]
    fn test_creation_failure_cleans_up() {
        let mut factory = CountingFactory {
            fail_at: Some(2),
            ..Default::default()
        };
        let err = ContextPool::new(&mut factory, 4, 50).unwrap_err();
        assert!(matches!(err, RenderError::ContextCreation { index: 2, .. }));
        assert!(factory.live.is_empty());
        assert_eq!(factory.destroyed, vec![0, 1]);
    }

    #[test]
    fn test_destroy_releases_everything() {
        let mut factory = CountingFactory::default();
        let config = CacheConfig::default().with_context_pool_size(3);
        let mut pool = ContextPool::from_config(&mut factory, &config).unwrap();
        assert_eq!(pool.context_count(), 3);
        assert_eq!(pool.tolerance(), 50);
        pool.register_viewport("a", 10, 10).unwrap();

        pool.destroy(&mut factory);
        assert!(factory.live.is_empty());
        assert_eq!(pool.context_count(), 0);
        assert_eq!(pool.context_index_for_viewport("a"), None);
        assert_eq!(pool.find_best_context_for_size(10, 10), None);
        assert_eq!(
            pool.register_viewport("b", 10, 10),
            Err(RenderError::NoContexts)
        );
    }
}
