//! Tile engine
//!
//! A [`TileEngine`] owns the pieces every open page shares: the image
//! backend, the job scheduler and its worker pool, and the memory-bounded
//! tile cache. Pages are opened with [`TileEngine::open`] and driven through
//! the returned [`ReaderImage`].

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::info;
use pagetile_cache::{CacheStats, MemoryBudget, TileCache};
use pagetile_render::{
    fit_display_size, DecodeError, DisplaySize, ImageBackend, ImageId, ImageRsBackend, ImageSource,
    SourceDimensions, TileCompositor, TileKey, TilePlanner, Upscaler,
};
use pagetile_scheduler::{
    CancellationToken, Job, JobExecutor, JobScheduler, ScaleLimits, SchedulerStats, WorkerPool,
};

use crate::config::EngineConfig;
use crate::decode::{self, PageSource};
use crate::error::{EngineError, PageError, PageResult};
use crate::reader::ReaderImage;

/// Called from a worker thread whenever a tile's drawable content changed
pub type TileReadyCallback = Arc<dyn Fn(ImageId, TileKey) + Send + Sync>;

/// State shared between the engine, its pages and the worker pool
pub(crate) struct EngineShared {
    pub(crate) backend: Arc<dyn ImageBackend>,
    pub(crate) scheduler: Arc<JobScheduler>,
    pub(crate) cache: TileCache,
    pub(crate) config: EngineConfig,
    pub(crate) upscaler: Option<Arc<dyn Upscaler>>,
    on_tile_ready: Option<TileReadyCallback>,
    pages: Mutex<HashMap<ImageId, Arc<PageSource>>>,
    next_image_id: AtomicU64,
}

impl EngineShared {
    fn pages(&self) -> MutexGuard<'_, HashMap<ImageId, Arc<PageSource>>> {
        self.pages.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn page(&self, id: ImageId) -> Option<Arc<PageSource>> {
        self.pages().get(&id).cloned()
    }

    fn register(&self, page: Arc<PageSource>) {
        self.pages().insert(page.id, page);
    }

    pub(crate) fn unregister(&self, id: ImageId) -> Option<Arc<PageSource>> {
        self.pages().remove(&id)
    }

    pub(crate) fn open_pages(&self) -> usize {
        self.pages().len()
    }

    /// Drop the full decodes of pages other than `keep` that have no job
    /// outstanding. Their bytes go back to the budget once no job holds them.
    pub(crate) fn reclaim_idle_full_decodes(&self, keep: ImageId) -> usize {
        let others: Vec<Arc<PageSource>> = self
            .pages()
            .values()
            .filter(|page| page.id != keep)
            .cloned()
            .collect();

        let mut reclaimed = 0;
        for page in others {
            if page.holds_full_decode() && self.scheduler.outstanding(page.id) == 0 {
                page.release_full_decode();
                reclaimed += 1;
            }
        }
        reclaimed
    }

    pub(crate) fn notify_tile_ready(&self, image: ImageId, key: TileKey) {
        if let Some(callback) = &self.on_tile_ready {
            callback(image, key);
        }
    }

    pub(crate) fn compositor(&self) -> TileCompositor {
        TileCompositor::new()
            .with_upsampling(self.config.upsampling_filter)
            .with_debug_grid(self.config.show_debug_grid)
    }
}

/// Builder for [`TileEngine`]
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use pagetile_core::{EngineConfig, TileEngine};
/// use pagetile_render::{ImageRsBackend, ResampleUpscaler};
///
/// let engine = TileEngine::builder(Arc::new(ImageRsBackend::new()))
///     .with_config(EngineConfig::default().with_worker_count(2))
///     .with_upscaler(Arc::new(ResampleUpscaler::new(2)))
///     .on_tile_ready(|image, key| println!("{image} {key:?} ready"))
///     .build()
///     .unwrap();
/// ```
pub struct TileEngineBuilder {
    backend: Arc<dyn ImageBackend>,
    config: EngineConfig,
    upscaler: Option<Arc<dyn Upscaler>>,
    on_tile_ready: Option<TileReadyCallback>,
    budget: Option<Arc<MemoryBudget>>,
}

impl TileEngineBuilder {
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_upscaler(mut self, upscaler: Arc<dyn Upscaler>) -> Self {
        self.upscaler = Some(upscaler);
        self
    }

    /// Register the tile-ready callback. It runs on worker threads and must
    /// not call back into the engine.
    pub fn on_tile_ready<F>(mut self, callback: F) -> Self
    where
        F: Fn(ImageId, TileKey) + Send + Sync + 'static,
    {
        self.on_tile_ready = Some(Arc::new(callback));
        self
    }

    /// Share a budget with other engines instead of creating one from
    /// `memory_ceiling_bytes`
    pub fn with_budget(mut self, budget: Arc<MemoryBudget>) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn build(self) -> Result<TileEngine, EngineError> {
        self.config.validate()?;

        let budget = self
            .budget
            .unwrap_or_else(|| Arc::new(MemoryBudget::new(self.config.memory_ceiling_bytes)));
        let scheduler = Arc::new(JobScheduler::new());
        let pool_config = self.config.worker_pool_config();

        let shared = Arc::new(EngineShared {
            backend: self.backend,
            scheduler: Arc::clone(&scheduler),
            cache: TileCache::new(budget),
            config: self.config,
            upscaler: self.upscaler,
            on_tile_ready: self.on_tile_ready,
            pages: Mutex::new(HashMap::new()),
            next_image_id: AtomicU64::new(1),
        });

        let worker_shared = Arc::clone(&shared);
        let executor: JobExecutor = Arc::new(move |job: &Job, token: &CancellationToken| {
            decode::run_job(&worker_shared, job, token)
        });
        let pool = WorkerPool::new(scheduler, executor, pool_config)?;

        info!(
            "tile engine started: {} workers, {} MiB tile budget, {} px max tile",
            pool.num_workers(),
            shared.cache.budget().ceiling() / (1024 * 1024),
            shared.config.max_tile_pixels
        );
        Ok(TileEngine { shared, pool })
    }
}

/// Shared decode engine for any number of open pages
pub struct TileEngine {
    shared: Arc<EngineShared>,
    pool: WorkerPool,
}

impl TileEngine {
    pub fn builder(backend: Arc<dyn ImageBackend>) -> TileEngineBuilder {
        TileEngineBuilder {
            backend,
            config: EngineConfig::default(),
            upscaler: None,
            on_tile_ready: None,
            budget: None,
        }
    }

    pub fn new(backend: Arc<dyn ImageBackend>, config: EngineConfig) -> Result<Self, EngineError> {
        Self::builder(backend).with_config(config).build()
    }

    /// Engine backed by the `image` crate, resampling with the configured
    /// kernels
    pub fn image_rs(config: EngineConfig) -> Result<Self, EngineError> {
        let backend = Arc::new(ImageRsBackend::with_resample(config.resample_config()));
        Self::new(backend, config)
    }

    /// Open a page laid out at `display_size`.
    ///
    /// Only the header is read here; decoding starts with the first
    /// [`ReaderImage::update`].
    pub fn open(&self, source: ImageSource, display_size: DisplaySize) -> PageResult<ReaderImage> {
        check_display_size(display_size)?;
        let dimensions = self.probe(&source)?;
        Ok(self.register(source, dimensions, display_size))
    }

    /// Open a page fitted into `area`, keeping its aspect ratio unless
    /// `stretch_to_fit` is set
    pub fn open_fitted(&self, source: ImageSource, area: DisplaySize) -> PageResult<ReaderImage> {
        check_display_size(area)?;
        let dimensions = self.probe(&source)?;
        let display = fit_display_size(dimensions, area, self.shared.config.stretch_to_fit);
        check_display_size(display)?;
        Ok(self.register(source, dimensions, display))
    }

    fn probe(&self, source: &ImageSource) -> PageResult<SourceDimensions> {
        let probe_error = |error| PageError::Probe {
            image: source.describe(),
            error,
        };
        let dimensions = self
            .shared
            .backend
            .probe_dimensions(source)
            .map_err(probe_error)?;
        if dimensions.is_empty() {
            return Err(probe_error(DecodeError::CorruptData(
                "image has no pixels".to_string(),
            )));
        }
        Ok(dimensions)
    }

    fn register(
        &self,
        source: ImageSource,
        dimensions: SourceDimensions,
        display_size: DisplaySize,
    ) -> ReaderImage {
        let tiles = TilePlanner::new(self.shared.config.max_tile_pixels).plan(dimensions, display_size);
        let id = ImageId(self.shared.next_image_id.fetch_add(1, Ordering::Relaxed));
        info!(
            "opened {} as {}: {}x{} in {} tiles, display {}x{}",
            source.describe(),
            id,
            dimensions.width,
            dimensions.height,
            tiles.len(),
            display_size.width,
            display_size.height
        );

        let page = Arc::new(PageSource::new(id, source, dimensions));
        self.shared.register(Arc::clone(&page));
        ReaderImage::new(Arc::clone(&self.shared), page, display_size, tiles)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn scale_limits(&self) -> ScaleLimits {
        self.shared.config.scale_limits()
    }

    /// Compositor configured with the engine's filter and debug settings
    pub fn compositor(&self) -> TileCompositor {
        self.shared.compositor()
    }

    pub fn memory_budget(&self) -> &Arc<MemoryBudget> {
        self.shared.cache.budget()
    }

    /// Bytes held by cached tile buffers. Full decodes are charged to
    /// [`memory_budget`](Self::memory_budget) as well but not counted here.
    pub fn memory_used(&self) -> usize {
        self.shared.cache.memory_used()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.shared.cache.stats()
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.shared.scheduler.stats()
    }

    pub fn open_pages(&self) -> usize {
        self.shared.open_pages()
    }

    /// Block until no job of `image` is queued or running
    pub fn wait_until_idle(&self, image: ImageId, timeout: Duration) -> bool {
        self.shared.scheduler.wait_until_idle(image, timeout)
    }
}

fn check_display_size(size: DisplaySize) -> PageResult<()> {
    if size.is_valid() {
        Ok(())
    } else {
        Err(PageError::InvalidDisplaySize {
            width: size.width,
            height: size.height,
        })
    }
}

impl fmt::Debug for TileEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TileEngine")
            .field("config", &self.shared.config)
            .field("workers", &self.pool.num_workers())
            .field("open_pages", &self.shared.open_pages())
            .field("memory_used", &self.shared.cache.memory_used())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagetile_render::testing::SyntheticBackend;

    fn engine() -> TileEngine {
        let config = EngineConfig::default().with_worker_count(2);
        TileEngine::new(Arc::new(SyntheticBackend::new(1, 1)), config).unwrap()
    }

    #[test]
    fn test_open_assigns_distinct_ids() {
        let engine = engine();
        let a = engine
            .open(SyntheticBackend::source(4000, 3000), DisplaySize::new(400.0, 300.0))
            .unwrap();
        let b = engine
            .open(SyntheticBackend::source(4000, 3000), DisplaySize::new(400.0, 300.0))
            .unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(engine.open_pages(), 2);

        a.close();
        assert_eq!(engine.open_pages(), 1);
        drop(b);
        assert_eq!(engine.open_pages(), 0);
    }

    #[test]
    fn test_open_rejects_invalid_display_size() {
        let engine = engine();
        let result = engine.open(SyntheticBackend::source(100, 100), DisplaySize::new(0.0, 100.0));
        assert!(matches!(result, Err(PageError::InvalidDisplaySize { .. })));
        assert_eq!(engine.open_pages(), 0);
    }

    #[test]
    fn test_open_rejects_empty_image() {
        let engine = engine();
        let result = engine.open(SyntheticBackend::source(0, 100), DisplaySize::new(100.0, 100.0));
        assert!(matches!(result, Err(PageError::Probe { .. })));
    }

    #[test]
    fn test_open_fitted_keeps_aspect_ratio() {
        let engine = engine();
        let page = engine
            .open_fitted(SyntheticBackend::source(4000, 2000), DisplaySize::new(1000.0, 1000.0))
            .unwrap();
        assert_eq!(page.display_size(), DisplaySize::new(1000.0, 500.0));
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let config = EngineConfig::default().with_scale_limits(2.0, 1.0);
        let result = TileEngine::new(Arc::new(SyntheticBackend::new(1, 1)), config);
        assert!(matches!(result, Err(EngineError::Config(_))));
    }
}
