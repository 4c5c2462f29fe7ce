//! pagetile scheduler library
//!
//! Decides which tiles are needed and runs their decodes.
//!
//! Tiles are prioritised by viewport visibility (visible first, then the
//! prefetch margin) and executed on a bounded worker pool with FIFO ordering
//! within each priority level. Every job carries a cancellation token that
//! the decode pipeline checks between stages.
//!
//! # Example
//!
//! ```
//! use pagetile_render::{plan, SourceDimensions};
//! use pagetile_scheduler::{JobPriority, JobScheduler, TileJob, ViewportState, VisibilityResolver};
//! use std::time::Duration;
//!
//! let tiles = plan(SourceDimensions::new(8000, 6000), 4_000_000);
//! let needed = VisibilityResolver::new().resolve(&tiles, &ViewportState::new(1920.0, 1080.0));
//!
//! let scheduler = JobScheduler::new();
//! for tile in &tiles {
//!     if let Some(need) = needed.get(&tile.key) {
//!         scheduler.submit(need.priority, TileJob {
//!             image_id: pagetile_render::ImageId(1),
//!             key: tile.key,
//!             source_rect: tile.source_rect,
//!             target: need.target,
//!             generation: 1,
//!             upscale: need.upscale,
//!         });
//!     }
//! }
//!
//! let (first, _token) = scheduler.next_job(Duration::ZERO).unwrap();
//! assert_eq!(first.priority, JobPriority::Visible);
//! ```

mod cancel;
mod gesture;
mod priority;
mod scheduler;
mod viewport;
mod worker;

pub use cancel::{CancellationRegistry, CancellationToken};
pub use gesture::{FlingAnimator, GestureEvent, ScaleLimits};
pub use priority::{DecodeGeneration, Job, JobId, JobPriority, PriorityQueue, TileJob};
pub use scheduler::{JobScheduler, SchedulerStats};
pub use viewport::{
    target_resolution, NeededTile, ViewportState, VisibilityResolver, DEFAULT_PREFETCH_MARGIN,
};
pub use worker::{default_worker_count, JobExecutor, JobOutcome, WorkerPool, WorkerPoolConfig};
