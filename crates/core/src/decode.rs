//! Decode scheduling
//!
//! Two halves live here:
//! - [`DecodeScheduler`] runs on the UI thread. Each pass turns a viewport
//!   into the page's required `{tile -> resolution}` map, diffs it against
//!   the cache, cancels superseded jobs and queues new ones.
//! - [`run_job`] runs on a worker. It produces one tile buffer from the
//!   page's shared full decode and hands it to the cache, which keeps it only
//!   if the job is still current.
//!
//! The full decode is done once per page by whichever job needs it first,
//! outside any lock. Jobs of the same page that arrive meanwhile are parked
//! in the scheduler and give their worker back, so a slow decode holds one
//! worker and never starves other pages. The decode is charged to the
//! shared memory budget for as long as it is kept.

use std::collections::HashMap;
use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use log::{debug, info, trace, warn};
use pagetile_cache::{FailureKind, InstallOutcome, Reservation, TileFailure, TileState};
use pagetile_render::{
    DecodeError, ImageId, ImageSource, NativeImage, PixelRect, Resolution, SharedPixels,
    SourceDimensions, TileDescriptor, TileKey, Upscaler,
};
use pagetile_scheduler::{
    CancellationToken, DecodeGeneration, Job, JobId, JobOutcome, JobPriority, NeededTile, TileJob,
    ViewportState, VisibilityResolver,
};

use crate::engine::EngineShared;

/// What one [`ReaderImage::update`](crate::ReaderImage::update) pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateSummary {
    pub generation: DecodeGeneration,

    /// The required tile set changed in this pass
    pub generation_bumped: bool,

    /// Tiles in the visible set plus the prefetch margin
    pub needed: usize,

    pub visible: usize,

    /// New jobs queued
    pub issued: usize,

    /// Needed tiles whose current job was kept
    pub in_flight: usize,

    /// Needed tiles already ready at the required resolution
    pub ready: usize,

    /// Needed tiles left failed until the next generation
    pub failed: usize,

    pub cancelled: usize,
}

/// Resolution a job actually decodes at, and whether it goes through the
/// upscaler
///
/// Tiles the resolver flags for upscaling are decoded at source resolution
/// and magnified by the compositor unless an upscaler is configured; with one
/// they are capped at `max_upscale_factor` times the source region.
pub(crate) fn effective_target(
    need: &NeededTile,
    source_rect: PixelRect,
    has_upscaler: bool,
    max_upscale_factor: f32,
) -> (Resolution, bool) {
    if !need.upscale {
        return (need.target, false);
    }

    if !has_upscaler {
        let target = Resolution::new(
            need.target.width.min(source_rect.width),
            need.target.height.min(source_rect.height),
        );
        return (target, false);
    }

    let cap = |source: u32| ((source as f64 * max_upscale_factor as f64).ceil() as u32).max(source);
    let target = Resolution::new(
        need.target.width.min(cap(source_rect.width)),
        need.target.height.min(cap(source_rect.height)),
    );
    (target, true)
}

/// Per-page scheduling state, owned by the page's [`ReaderImage`](crate::ReaderImage)
pub(crate) struct DecodeScheduler {
    resolver: VisibilityResolver,
    generation: DecodeGeneration,
    required: HashMap<TileKey, Resolution>,
}

struct PlannedTile<'a> {
    tile: &'a TileDescriptor,
    target: Resolution,
    upscale: bool,
    priority: JobPriority,
}

enum Action {
    Keep,
    Issue,
}

impl DecodeScheduler {
    pub(crate) fn new(prefetch_margin: f32) -> Self {
        Self {
            resolver: VisibilityResolver::new().with_prefetch_margin(prefetch_margin),
            generation: 0,
            required: HashMap::new(),
        }
    }

    pub(crate) fn generation(&self) -> DecodeGeneration {
        self.generation
    }

    /// Forget the required set so the next pass starts a new generation
    pub(crate) fn reset(&mut self) {
        self.required.clear();
    }

    pub(crate) fn run(
        &mut self,
        shared: &EngineShared,
        image: ImageId,
        tiles: &[TileDescriptor],
        viewport: &ViewportState,
    ) -> UpdateSummary {
        let needed = self.resolver.resolve(tiles, viewport);
        let has_upscaler = shared.upscaler.is_some();

        let mut planned: Vec<PlannedTile<'_>> = tiles
            .iter()
            .filter_map(|tile| {
                let need = needed.get(&tile.key)?;
                let (target, upscale) = effective_target(
                    need,
                    tile.source_rect,
                    has_upscaler,
                    shared.config.max_upscale_factor,
                );
                Some(PlannedTile {
                    tile,
                    target,
                    upscale,
                    priority: need.priority,
                })
            })
            .collect();
        // Visible tiles reserve their job ids first so they queue first
        planned.sort_by(|a, b| b.priority.cmp(&a.priority));

        let required: HashMap<TileKey, Resolution> =
            planned.iter().map(|p| (p.tile.key, p.target)).collect();
        let bumped = required != self.required;
        if bumped {
            self.generation += 1;
            self.required = required;
        }

        let mut summary = UpdateSummary {
            generation: self.generation,
            generation_bumped: bumped,
            needed: planned.len(),
            visible: planned
                .iter()
                .filter(|p| p.priority == JobPriority::Visible)
                .count(),
            ..UpdateSummary::default()
        };

        let mut to_cancel = shared.cache.evict_unneeded(image, needed.keys().copied());

        for plan in &planned {
            let key = plan.tile.key;
            let action = match shared.cache.get(image, key) {
                None => Action::Issue,
                Some(entry) => match entry.state() {
                    TileState::Pending => Action::Issue,
                    TileState::Ready { resolution, .. } if *resolution == plan.target => {
                        summary.ready += 1;
                        Action::Keep
                    }
                    TileState::Ready { .. } => Action::Issue,
                    TileState::Decoding { target, .. } if *target == plan.target => {
                        summary.in_flight += 1;
                        Action::Keep
                    }
                    TileState::Decoding { .. } => Action::Issue,
                    // Lazy retry: only a changed required set retries a failure
                    TileState::Failed { .. } if bumped => Action::Issue,
                    TileState::Failed { .. } => {
                        summary.failed += 1;
                        Action::Keep
                    }
                },
            };

            if let Action::Issue = action {
                if let Some(previous) = self.issue(shared, image, plan) {
                    to_cancel.push(previous);
                }
                summary.issued += 1;
            }
        }

        for job in to_cancel {
            if shared.scheduler.cancel_job(job) {
                summary.cancelled += 1;
            }
        }

        debug!(
            "{} pass at scale {:.3}: generation {}, {} needed ({} visible), {} issued, {} in flight, {} ready, {} cancelled",
            image,
            viewport.scale,
            summary.generation,
            summary.needed,
            summary.visible,
            summary.issued,
            summary.in_flight,
            summary.ready,
            summary.cancelled,
        );
        summary
    }

    /// Reserve, record, then queue. Returns the job this one supersedes.
    fn issue(&self, shared: &EngineShared, image: ImageId, plan: &PlannedTile<'_>) -> Option<JobId> {
        let (job_id, token) = shared.scheduler.reserve();
        let previous = shared.cache.begin_decode(
            image,
            plan.tile.key,
            job_id,
            token,
            plan.target,
            self.generation,
        );

        let job = TileJob {
            image_id: image,
            key: plan.tile.key,
            source_rect: plan.tile.source_rect,
            target: plan.target,
            generation: self.generation,
            upscale: plan.upscale,
        };
        if !shared.scheduler.enqueue(job_id, plan.priority, job) {
            // Scheduler is shutting down; leave the tile pending
            shared.cache.cancel_decode(image, plan.tile.key);
            shared.scheduler.cancel_job(job_id);
        }
        previous
    }
}

/// A page's full decode and the budget it is charged to
pub(crate) struct FullImage {
    image: NativeImage,
    // Dropped after `image`, so the bytes return once the handle is gone
    _charge: Reservation,
}

impl Deref for FullImage {
    type Target = NativeImage;

    fn deref(&self) -> &NativeImage {
        &self.image
    }
}

#[derive(Default)]
enum FullDecode {
    #[default]
    Empty,
    /// A job is decoding outside the slot lock
    Decoding,
    Ready(Arc<FullImage>),
    /// Remembered for the rest of the generation that hit it
    Failed {
        generation: DecodeGeneration,
        failure: TileFailure,
    },
}

type DecodeSlot = Arc<Mutex<FullDecode>>;

fn lock_slot(slot: &DecodeSlot) -> MutexGuard<'_, FullDecode> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Worker-side view of an open page
pub(crate) struct PageSource {
    pub(crate) id: ImageId,
    pub(crate) source: ImageSource,
    pub(crate) dimensions: SourceDimensions,
    full: Mutex<DecodeSlot>,
}

impl PageSource {
    pub(crate) fn new(id: ImageId, source: ImageSource, dimensions: SourceDimensions) -> Self {
        Self {
            id,
            source,
            dimensions,
            full: Mutex::new(DecodeSlot::default()),
        }
    }

    fn slot(&self) -> DecodeSlot {
        Arc::clone(&self.full.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Drop the full decode. A decode still running finishes into the
    /// detached slot and is released with the last job holding it.
    pub(crate) fn release_full_decode(&self) {
        let mut full = self.full.lock().unwrap_or_else(PoisonError::into_inner);
        *full = DecodeSlot::default();
    }

    pub(crate) fn holds_full_decode(&self) -> bool {
        matches!(*lock_slot(&self.slot()), FullDecode::Ready(_))
    }

    /// The shared full decode, decoding it if this job is the first to ask.
    ///
    /// A job arriving while another decodes is parked and gets
    /// [`JobError::Parked`]; the decoding job requeues it when done.
    fn full_image(
        &self,
        shared: &EngineShared,
        job: JobId,
        generation: DecodeGeneration,
    ) -> Result<Arc<FullImage>, JobError> {
        let slot = self.slot();
        {
            let mut state = lock_slot(&slot);
            match &*state {
                FullDecode::Ready(image) => return Ok(Arc::clone(image)),
                FullDecode::Failed {
                    generation: failed_in,
                    failure,
                } if *failed_in == generation => return Err(JobError::Failed(failure.clone())),
                FullDecode::Decoding => {
                    // Parked under the slot lock, so the unpark below cannot be missed
                    return Err(if shared.scheduler.park(job) {
                        JobError::Parked
                    } else {
                        JobError::Cancelled
                    });
                }
                FullDecode::Empty | FullDecode::Failed { .. } => {}
            }
            *state = FullDecode::Decoding;
        }

        let result = self.decode_full(shared);
        *lock_slot(&slot) = match &result {
            Ok(image) => FullDecode::Ready(Arc::clone(image)),
            Err(failure) => FullDecode::Failed {
                generation,
                failure: failure.clone(),
            },
        };
        let requeued = shared.scheduler.unpark_image(self.id);
        if requeued > 0 {
            trace!("{}: {} jobs resume after the full decode", self.id, requeued);
        }
        result.map_err(JobError::Failed)
    }

    fn decode_full(&self, shared: &EngineShared) -> Result<Arc<FullImage>, TileFailure> {
        let bytes = Resolution::new(self.dimensions.width, self.dimensions.height).rgba_bytes();
        let charge = match shared.cache.reserve_external(bytes) {
            Some(charge) => charge,
            None => {
                let reclaimed = shared.reclaim_idle_full_decodes(self.id);
                debug!("{}: reclaimed {} idle full decodes", self.id, reclaimed);
                shared.cache.reserve_external(bytes).ok_or_else(|| {
                    warn!(
                        "{}: full decode of {} bytes does not fit the memory budget",
                        self.id, bytes
                    );
                    TileFailure::new(
                        FailureKind::OverBudget,
                        format!(
                            "full decode needs {} bytes, {} available",
                            bytes,
                            shared.cache.budget().available()
                        ),
                    )
                })?
            }
        };

        let started = Instant::now();
        let decoded = panic::catch_unwind(AssertUnwindSafe(|| {
            NativeImage::decode(&shared.backend, &self.source)
        }))
        .unwrap_or_else(|_| Err(DecodeError::CorruptData("decoder panicked".to_string())));

        match decoded {
            Ok(image) => {
                info!(
                    "decoded {} ({}x{}) in {:?}",
                    self.id,
                    image.width(),
                    image.height(),
                    started.elapsed()
                );
                Ok(Arc::new(FullImage {
                    image,
                    _charge: charge,
                }))
            }
            Err(error) => {
                warn!("failed to decode {}: {}", self.id, error);
                Err(TileFailure::from(&error))
            }
        }
    }
}

enum JobError {
    Cancelled,
    /// Waiting in the scheduler for another job's full decode
    Parked,
    Failed(TileFailure),
}

impl From<DecodeError> for JobError {
    fn from(error: DecodeError) -> Self {
        match error {
            DecodeError::Cancelled => JobError::Cancelled,
            other => JobError::Failed(TileFailure::from(&other)),
        }
    }
}

fn checkpoint(token: &CancellationToken) -> Result<(), JobError> {
    if token.is_cancelled() {
        Err(JobError::Cancelled)
    } else {
        Ok(())
    }
}

/// Job body run by the worker pool
pub(crate) fn run_job(shared: &EngineShared, job: &Job, token: &CancellationToken) -> JobOutcome {
    let tile = job.tile;
    let Some(page) = shared.page(tile.image_id) else {
        trace!("job {}: {} is closed", job.id, tile.image_id);
        return JobOutcome::Finished;
    };

    let started = Instant::now();
    // A panicking backend must still leave the tile Failed, not stuck in Decoding
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| decode_tile(shared, &page, job, token)))
        .unwrap_or_else(|_| {
            Err(JobError::Failed(TileFailure::new(
                FailureKind::CorruptData,
                "decoder panicked",
            )))
        });
    match outcome {
        Ok(pixels) => {
            match shared
                .cache
                .install(tile.image_id, tile.key, job.id, tile.generation, pixels)
            {
                Ok(InstallOutcome::Installed) => {
                    debug!(
                        "{} {:?} ready at {}x{} in {:?}",
                        tile.image_id,
                        tile.key,
                        tile.target.width,
                        tile.target.height,
                        started.elapsed()
                    );
                    shared.notify_tile_ready(tile.image_id, tile.key);
                }
                Ok(InstallOutcome::Stale) => {
                    trace!("job {}: result for {:?} is stale", job.id, tile.key);
                }
                Err(error) => {
                    warn!("{} {:?}: {}", tile.image_id, tile.key, error);
                    shared.notify_tile_ready(tile.image_id, tile.key);
                }
            }
        }
        Err(JobError::Cancelled) => {
            trace!("job {}: cancelled", job.id);
        }
        Err(JobError::Parked) => {
            trace!("job {}: waiting for the full decode of {}", job.id, tile.image_id);
            return JobOutcome::Parked;
        }
        Err(JobError::Failed(failure)) => {
            let key = tile.key;
            if shared
                .cache
                .fail(tile.image_id, key, job.id, tile.generation, failure.clone())
            {
                warn!("{} {:?} failed: {}", tile.image_id, key, failure);
                shared.notify_tile_ready(tile.image_id, key);
            }
        }
    }
    JobOutcome::Finished
}

fn decode_tile(
    shared: &EngineShared,
    page: &PageSource,
    job: &Job,
    token: &CancellationToken,
) -> Result<SharedPixels, JobError> {
    let tile = &job.tile;
    checkpoint(token)?;
    let full = page.full_image(shared, job.id, tile.generation)?;
    checkpoint(token)?;

    trace!("{:?}: extracting {:?}", tile.key, tile.source_rect);
    let region = if tile.source_rect == page.dimensions.bounds() {
        None
    } else {
        Some(full.extract_region(tile.source_rect)?)
    };
    let base: &NativeImage = region.as_ref().unwrap_or(&**full);
    checkpoint(token)?;

    let resized = match (&shared.upscaler, tile.upscale) {
        (Some(upscaler), true) => upscale_to(shared, upscaler.as_ref(), base, tile, token)?,
        _ => {
            trace!("{:?}: resizing to {:?}", tile.key, tile.target);
            base.resize(tile.target, true)?
        }
    };
    // The region is no longer needed once resized
    drop(region);
    checkpoint(token)?;

    Ok(resized.to_pixel_buffer()?)
}

/// Upscaler round trip, falling back to plain resampling if it fails
fn upscale_to(
    shared: &EngineShared,
    upscaler: &dyn Upscaler,
    base: &NativeImage,
    tile: &TileJob,
    token: &CancellationToken,
) -> Result<NativeImage, JobError> {
    let input = base.to_pixel_buffer()?;
    checkpoint(token)?;

    trace!("{:?}: upscaling with {}", tile.key, upscaler.name());
    match upscaler.upscale(input.as_ref()) {
        Ok(upscaled) => {
            drop(input);
            checkpoint(token)?;
            let imported = NativeImage::from_pixels(&shared.backend, upscaled.as_ref())?;
            drop(upscaled);
            checkpoint(token)?;
            Ok(imported.resize(tile.target, true)?)
        }
        Err(error) => {
            warn!(
                "upscaler {} failed for {} {:?}, resampling instead: {}",
                upscaler.name(),
                tile.image_id,
                tile.key,
                error
            );
            Ok(base.resize(tile.target, true)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn need(width: u32, height: u32, upscale: bool) -> NeededTile {
        NeededTile {
            target: Resolution::new(width, height),
            upscale,
            priority: JobPriority::Visible,
        }
    }

    #[test]
    fn test_downscale_target_is_unchanged() {
        let rect = PixelRect::new(0, 0, 2000, 1500);
        assert_eq!(
            effective_target(&need(500, 375, false), rect, true, 4.0),
            (Resolution::new(500, 375), false)
        );
    }

    #[test]
    fn test_upscale_without_upscaler_clamps_to_source() {
        let rect = PixelRect::new(0, 0, 1000, 800);
        assert_eq!(
            effective_target(&need(4000, 3200, true), rect, false, 4.0),
            (Resolution::new(1000, 800), false)
        );
    }

    #[test]
    fn test_upscale_with_upscaler_is_capped() {
        let rect = PixelRect::new(0, 0, 100, 50);
        assert_eq!(
            effective_target(&need(300, 150, true), rect, true, 4.0),
            (Resolution::new(300, 150), true)
        );
        assert_eq!(
            effective_target(&need(1000, 500, true), rect, true, 2.0),
            (Resolution::new(200, 100), true)
        );
    }
}
