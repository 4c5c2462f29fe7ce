//! pagetile cache library
//!
//! Tile lifecycle state and the memory-bounded cache shared by every open
//! page of an engine.

pub mod memory_budget;
pub mod state;
pub mod tile_cache;

pub use memory_budget::{MemoryBudget, MemoryPressure, Reservation};
pub use state::{CacheError, FailureKind, TileFailure, TileState, TileStatus};
pub use tile_cache::{CacheEntry, CacheStats, InstallOutcome, SnapshotEntry, TileCache, TileSnapshot};
