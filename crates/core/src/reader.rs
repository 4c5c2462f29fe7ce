//! Open pages
//!
//! A [`ReaderImage`] is one page opened on a [`TileEngine`](crate::TileEngine).
//! The host calls [`update`](ReaderImage::update) whenever the viewport
//! changes and [`draw`](ReaderImage::draw) whenever it repaints; decoding
//! happens on the engine's workers in between.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use pagetile_cache::{CacheEntry, TileSnapshot, TileStatus};
use pagetile_render::{
    DisplaySize, DrawStats, ImageId, ImageSource, RenderSurface, SourceDimensions, SurfaceContent,
    SurfaceTile, TileDescriptor, TileKey, TilePlanner,
};
use pagetile_scheduler::{DecodeGeneration, JobId, ViewportState};

use crate::decode::{DecodeScheduler, PageSource, UpdateSummary};
use crate::engine::EngineShared;
use crate::error::{PageError, PageResult};

/// One open page
///
/// Dropping a `ReaderImage` closes it: its queued jobs are cancelled and
/// every tile buffer it holds is returned to the memory budget.
pub struct ReaderImage {
    engine: Arc<EngineShared>,
    page: Arc<PageSource>,
    display_size: DisplaySize,
    tiles: Vec<TileDescriptor>,
    scheduler: DecodeScheduler,
    last_viewport: Option<ViewportState>,
    closed: bool,
}

impl ReaderImage {
    pub(crate) fn new(
        engine: Arc<EngineShared>,
        page: Arc<PageSource>,
        display_size: DisplaySize,
        tiles: Vec<TileDescriptor>,
    ) -> Self {
        let scheduler = DecodeScheduler::new(engine.config.prefetch_margin);
        Self {
            engine,
            page,
            display_size,
            tiles,
            scheduler,
            last_viewport: None,
            closed: false,
        }
    }

    pub fn id(&self) -> ImageId {
        self.page.id
    }

    pub fn source(&self) -> &ImageSource {
        &self.page.source
    }

    pub fn dimensions(&self) -> SourceDimensions {
        self.page.dimensions
    }

    pub fn display_size(&self) -> DisplaySize {
        self.display_size
    }

    pub fn tiles(&self) -> &[TileDescriptor] {
        &self.tiles
    }

    pub fn generation(&self) -> DecodeGeneration {
        self.scheduler.generation()
    }

    /// Bring the page's decodes in line with `viewport`.
    ///
    /// Cheap when nothing changed: tiles already ready or decoding at the
    /// right resolution are left alone.
    pub fn update(&mut self, viewport: &ViewportState) -> PageResult<UpdateSummary> {
        if self.engine.scheduler.is_shut_down() {
            return Err(PageError::Closed(self.page.id));
        }
        self.last_viewport = Some(*viewport);
        Ok(self
            .scheduler
            .run(&self.engine, self.page.id, &self.tiles, viewport))
    }

    /// Lay the page out at a new display size.
    ///
    /// If the tile grid changes every tile is dropped and, when a viewport
    /// has been seen, the last one is applied again.
    pub fn set_display_size(&mut self, display_size: DisplaySize) -> PageResult<Option<UpdateSummary>> {
        if !display_size.is_valid() {
            return Err(PageError::InvalidDisplaySize {
                width: display_size.width,
                height: display_size.height,
            });
        }
        if display_size == self.display_size {
            return Ok(None);
        }

        self.display_size = display_size;
        let tiles = TilePlanner::new(self.engine.config.max_tile_pixels).plan(self.page.dimensions, display_size);
        if tiles != self.tiles {
            debug!("{}: replanned into {} tiles", self.page.id, tiles.len());
            let jobs = self.engine.cache.release_all(self.page.id);
            self.cancel_jobs(jobs);
            self.tiles = tiles;
            self.scheduler.reset();
        }

        match self.last_viewport {
            Some(viewport) => self.update(&viewport).map(Some),
            None => Ok(None),
        }
    }

    /// Immutable view of this page's tiles
    pub fn snapshot(&self) -> TileSnapshot {
        self.engine.cache.snapshot(self.page.id)
    }

    pub fn tile(&self, key: TileKey) -> Option<CacheEntry> {
        self.engine.cache.get(self.page.id, key)
    }

    pub fn tile_status(&self, key: TileKey) -> Option<TileStatus> {
        self.engine.cache.status(self.page.id, key)
    }

    /// Every tile of the page with what it can currently show
    pub fn surface_tiles(&self) -> Vec<SurfaceTile> {
        let snapshot = self.snapshot();
        self.tiles
            .iter()
            .map(|tile| {
                let content = match snapshot.get(&tile.key) {
                    Some(entry) => match &entry.pixels {
                        Some(pixels) => SurfaceContent::Pixels {
                            pixels: Arc::clone(pixels),
                            fallback: entry.is_fallback,
                        },
                        None if entry.status == TileStatus::Failed => SurfaceContent::Error,
                        None => SurfaceContent::Loading,
                    },
                    None => SurfaceContent::Loading,
                };
                SurfaceTile {
                    key: tile.key,
                    display_rect: tile.display_rect,
                    content,
                }
            })
            .collect()
    }

    /// Draw the page as currently decoded
    pub fn draw(&self, surface: &mut dyn RenderSurface, viewport: &ViewportState) -> DrawStats {
        self.engine
            .compositor()
            .draw(&self.surface_tiles(), viewport.transform(), surface)
    }

    /// Stop decoding a page that left the reader window but stays open.
    ///
    /// Ready tiles stay cached as eviction candidates and the full decode is
    /// released; the next [`update`](Self::update) resumes work.
    pub fn suspend(&mut self) {
        let jobs = self.engine.cache.suspend(self.page.id);
        let cancelled = self.cancel_jobs(jobs);
        self.page.release_full_decode();
        self.scheduler.reset();
        debug!("{}: suspended, {} jobs cancelled", self.page.id, cancelled);
    }

    /// Queued or running jobs of this page that have not been cancelled
    pub fn live_jobs(&self) -> Vec<(JobId, TileKey)> {
        self.engine.scheduler.live_jobs(self.page.id)
    }

    /// Block until none of this page's jobs is queued or running
    pub fn wait_until_settled(&self, timeout: Duration) -> bool {
        self.engine.scheduler.wait_until_idle(self.page.id, timeout)
    }

    /// Close the page, cancelling its jobs and releasing its tiles
    pub fn close(mut self) {
        self.shutdown();
    }

    fn cancel_jobs(&self, jobs: Vec<JobId>) -> usize {
        jobs.into_iter()
            .filter(|job| self.engine.scheduler.cancel_job(*job))
            .count()
    }

    fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let id = self.page.id;
        let queued = self.engine.scheduler.cancel_image(id);
        let jobs = self.engine.cache.release_all(id);
        self.cancel_jobs(jobs);
        self.page.release_full_decode();
        self.engine.unregister(id);
        info!("closed {} ({} jobs cancelled)", id, queued);
    }
}

impl fmt::Debug for ReaderImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderImage")
            .field("id", &self.page.id)
            .field("dimensions", &self.page.dimensions)
            .field("display_size", &self.display_size)
            .field("tiles", &self.tiles.len())
            .field("generation", &self.scheduler.generation())
            .finish()
    }
}

impl Drop for ReaderImage {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EngineConfig, TileEngine};
    use pagetile_render::testing::SyntheticBackend;
    use pagetile_render::RgbaCanvas;

    fn engine() -> (TileEngine, SyntheticBackend) {
        let backend = SyntheticBackend::new(1, 1);
        let config = EngineConfig::default()
            .with_worker_count(2)
            .with_max_tile_pixels(1_000_000);
        let engine = TileEngine::new(Arc::new(backend.clone()), config).unwrap();
        (engine, backend)
    }

    #[test]
    fn test_surface_tiles_cover_page_before_decoding() {
        let (engine, _backend) = engine();
        let page = engine
            .open(SyntheticBackend::source(2000, 2000), DisplaySize::new(2000.0, 2000.0))
            .unwrap();

        let tiles = page.surface_tiles();
        assert_eq!(tiles.len(), page.tiles().len());
        assert!(tiles
            .iter()
            .all(|t| matches!(t.content, SurfaceContent::Loading)));
    }

    #[test]
    fn test_draw_after_settle_uses_pixels() {
        let (engine, _backend) = engine();
        let mut page = engine
            .open(SyntheticBackend::source(2000, 1000), DisplaySize::new(200.0, 100.0))
            .unwrap();
        let viewport = ViewportState::new(200.0, 100.0);

        page.update(&viewport).unwrap();
        assert!(page.wait_until_settled(Duration::from_secs(5)));

        let mut canvas = RgbaCanvas::new(200, 100);
        let stats = page.draw(&mut canvas, &viewport);
        assert_eq!(stats.placeholders, 0);
        assert_eq!(stats.drawn, page.tiles().len());
    }

    #[test]
    fn test_set_display_size_replans() {
        let (engine, _backend) = engine();
        let mut page = engine
            .open(SyntheticBackend::source(4000, 4000), DisplaySize::new(4000.0, 4000.0))
            .unwrap();
        let before = page.tiles().to_vec();

        assert_eq!(page.set_display_size(DisplaySize::new(4000.0, 4000.0)).unwrap(), None);
        page.set_display_size(DisplaySize::new(1000.0, 1000.0)).unwrap();
        assert_ne!(page.tiles(), &before[..]);
        assert!(matches!(
            page.set_display_size(DisplaySize::new(f32::NAN, 1.0)),
            Err(PageError::InvalidDisplaySize { .. })
        ));
    }
}
