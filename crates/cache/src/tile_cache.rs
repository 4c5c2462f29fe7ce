//! Tile cache and lifecycle manager
//!
//! Holds the [`TileState`] of every tile of every open page, keyed by
//! `(ImageId, TileKey)`, and owns their pixel buffers. Once a buffer is
//! installed only the cache drops it; render passes read through immutable
//! [`TileSnapshot`]s that keep their buffers alive until the pass is done.
//!
//! Eviction is driven by the memory budget. When an install does not fit the
//! cache drops, in order:
//! 1. Fallback buffers (a previous resolution kept while a refinement decodes)
//! 2. Ready tiles that are no longer needed, least recently visible first
//!
//! Tiles in the current needed set and tiles still decoding are never evicted.
//!
//! The cache never talks to the scheduler. Operations that supersede a job
//! return its id and the caller cancels it after the cache lock is released.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, trace};
use pagetile_render::{ImageId, Resolution, SharedPixels, TileKey};
use pagetile_scheduler::{CancellationToken, DecodeGeneration, JobId};

use crate::memory_budget::{MemoryBudget, MemoryPressure, Reservation};
use crate::state::{CacheError, FailureKind, TileFailure, TileState, TileStatus};

type EntryKey = (ImageId, TileKey);

/// One tile's cache record
#[derive(Clone)]
pub struct CacheEntry {
    state: TileState,
    generation: DecodeGeneration,
    /// Previous resolution, drawn until the in-flight decode lands
    fallback: Option<SharedPixels>,
    visible: bool,
    last_visible: u64,
}

impl CacheEntry {
    fn new(generation: DecodeGeneration, tick: u64) -> Self {
        Self {
            state: TileState::Pending,
            generation,
            fallback: None,
            visible: true,
            last_visible: tick,
        }
    }

    pub fn state(&self) -> &TileState {
        &self.state
    }

    pub fn status(&self) -> TileStatus {
        self.state.status()
    }

    /// Generation of the last decode issued for this tile
    pub fn generation(&self) -> DecodeGeneration {
        self.generation
    }

    pub fn fallback(&self) -> Option<&SharedPixels> {
        self.fallback.as_ref()
    }

    /// True while the tile is in its page's needed set
    pub fn is_visible(&self) -> bool {
        self.visible
    }

    /// Failure recorded for a `Failed` tile
    pub fn failure(&self) -> Option<&TileFailure> {
        match &self.state {
            TileState::Failed { reason } => Some(reason),
            _ => None,
        }
    }

    /// True if the tile failed because the budget could not fit it
    pub fn is_over_budget(&self) -> bool {
        self.failure().is_some_and(|reason| reason.kind == FailureKind::OverBudget)
    }

    /// Bytes of the ready buffer plus any fallback
    pub fn resident_bytes(&self) -> usize {
        let ready = self.state.pixels().map_or(0, |p| p.byte_size());
        ready + self.fallback.as_ref().map_or(0, |p| p.byte_size())
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("state", &self.state)
            .field("generation", &self.generation)
            .field("fallback", &self.fallback.as_ref().map(|p| p.resolution()))
            .field("visible", &self.visible)
            .finish()
    }
}

/// Result of a successful [`TileCache::install`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// The tile is now `Ready` with the buffer
    Installed,

    /// The job was superseded; the buffer was dropped
    Stale,
}

/// Statistics about cache usage
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    /// Tiles with an entry, any state
    pub tile_count: usize,

    pub ready_tiles: usize,

    /// Tiles holding a previous-resolution buffer
    pub fallback_tiles: usize,

    /// Bytes held by this cache's buffers
    pub memory_used: usize,

    /// Ceiling of the shared budget
    pub memory_limit: usize,

    pub installs: u64,

    /// Results discarded because their job or generation was superseded
    pub stale_results: u64,

    /// Buffers dropped to make room
    pub evictions: u64,

    /// Installs refused because the budget could not fit them
    pub over_budget: u64,

    pub hits: u64,

    pub misses: u64,
}

impl CacheStats {
    /// Ready lookups over all lookups (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Memory utilization (0.0 to 1.0)
    pub fn memory_utilization(&self) -> f64 {
        if self.memory_limit == 0 {
            0.0
        } else {
            self.memory_used as f64 / self.memory_limit as f64
        }
    }
}

/// A tile as seen by one render pass
#[derive(Clone)]
pub struct SnapshotEntry {
    pub key: TileKey,
    pub status: TileStatus,

    /// Ready buffer, or the fallback while a refinement decodes
    pub pixels: Option<SharedPixels>,

    /// `pixels` is a fallback at an older resolution
    pub is_fallback: bool,
}

/// Immutable view of one page's tiles
///
/// Buffers referenced by a snapshot stay alive until it is dropped, even if
/// the cache evicts or releases them meanwhile.
#[derive(Clone, Default)]
pub struct TileSnapshot {
    entries: Arc<HashMap<TileKey, SnapshotEntry>>,
}

impl TileSnapshot {
    pub fn get(&self, key: &TileKey) -> Option<&SnapshotEntry> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SnapshotEntry> {
        self.entries.values()
    }

    pub fn count(&self, status: TileStatus) -> usize {
        self.entries.values().filter(|e| e.status == status).count()
    }
}

struct CacheInner {
    entries: HashMap<EntryKey, CacheEntry>,
    /// Bumped by every visibility pass; orders eviction candidates
    tick: u64,
    memory_used: usize,
    stats: CacheStats,
}

impl CacheInner {
    fn release(&mut self, budget: &MemoryBudget, bytes: usize) {
        if bytes > 0 {
            self.memory_used = self.memory_used.saturating_sub(bytes);
            budget.release(bytes);
        }
    }

    fn drop_fallback(&mut self, budget: &MemoryBudget, key: &EntryKey) {
        let freed = self
            .entries
            .get_mut(key)
            .and_then(|entry| entry.fallback.take())
            .map_or(0, |pixels| pixels.byte_size());
        self.release(budget, freed);
    }

    /// Drop one buffer to make room, never touching `protect`. Returns false
    /// when nothing is evictable.
    fn evict_one(&mut self, budget: &MemoryBudget, protect: Option<&EntryKey>) -> bool {
        let fallback = self
            .entries
            .iter()
            .filter(|(key, entry)| protect != Some(*key) && entry.fallback.is_some())
            .min_by_key(|(_, entry)| entry.last_visible)
            .map(|(key, _)| *key);

        if let Some(key) = fallback {
            trace!("evicting fallback of {} {:?}", key.0, key.1);
            self.drop_fallback(budget, &key);
            self.stats.evictions += 1;
            return true;
        }

        let candidate = self
            .entries
            .iter()
            .filter(|(key, entry)| {
                protect != Some(*key) && !entry.visible && entry.state.status() == TileStatus::Ready
            })
            .min_by_key(|(_, entry)| entry.last_visible)
            .map(|(key, _)| *key);

        match candidate.and_then(|key| self.entries.remove(&key).map(|entry| (key, entry))) {
            Some((key, entry)) => {
                trace!("evicting {} {:?}", key.0, key.1);
                self.release(budget, entry.resident_bytes());
                self.stats.evictions += 1;
                true
            }
            None => false,
        }
    }

    /// Reserve `bytes`, evicting until they fit
    fn reserve(&mut self, budget: &MemoryBudget, bytes: usize, protect: &EntryKey) -> bool {
        loop {
            if budget.try_reserve(bytes) {
                self.memory_used += bytes;
                return true;
            }
            if !self.evict_one(budget, Some(protect)) {
                return false;
            }
        }
    }

    fn set_failed(&mut self, budget: &MemoryBudget, key: &EntryKey, reason: TileFailure) {
        self.drop_fallback(budget, key);
        let freed = match self.entries.get_mut(key) {
            Some(entry) => {
                let previous = mem::replace(&mut entry.state, TileState::Failed { reason });
                previous.pixels().map_or(0, |p| p.byte_size())
            }
            None => 0,
        };
        self.release(budget, freed);
    }

    fn take_image(&mut self, image: ImageId) -> Vec<CacheEntry> {
        let keys: Vec<EntryKey> = self.entries.keys().filter(|(id, _)| *id == image).copied().collect();
        keys.iter().filter_map(|key| self.entries.remove(key)).collect()
    }
}

/// Shared cache of decoded tiles for all open pages
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use pagetile_cache::{InstallOutcome, MemoryBudget, TileCache, TileStatus};
/// use pagetile_render::{ImageId, Resolution, RgbaPixels, TileKey};
/// use pagetile_scheduler::CancellationToken;
///
/// let cache = TileCache::new(Arc::new(MemoryBudget::with_limit_mb(16)));
/// let (image, key) = (ImageId(1), TileKey::new(0, 0));
/// let target = Resolution::new(256, 256);
///
/// cache.begin_decode(image, key, 1, CancellationToken::new(), target, 1);
/// let pixels = RgbaPixels::filled(256, 256, [255, 255, 255, 255]).into_shared();
/// assert_eq!(cache.install(image, key, 1, 1, pixels), Ok(InstallOutcome::Installed));
///
/// let snapshot = cache.snapshot(image);
/// assert_eq!(snapshot.get(&key).unwrap().status, TileStatus::Ready);
/// ```
pub struct TileCache {
    inner: Mutex<CacheInner>,
    budget: Arc<MemoryBudget>,
}

impl TileCache {
    pub fn new(budget: Arc<MemoryBudget>) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                tick: 0,
                memory_used: 0,
                stats: CacheStats::default(),
            }),
            budget,
        }
    }

    /// A cache with its own budget of `ceiling_bytes`
    pub fn with_ceiling(ceiling_bytes: usize) -> Self {
        Self::new(Arc::new(MemoryBudget::new(ceiling_bytes)))
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn budget(&self) -> &Arc<MemoryBudget> {
        &self.budget
    }

    pub fn pressure(&self) -> MemoryPressure {
        self.budget.pressure()
    }

    pub fn get(&self, image: ImageId, key: TileKey) -> Option<CacheEntry> {
        let mut inner = self.lock();
        let entry = inner.entries.get(&(image, key)).cloned();
        if entry.as_ref().is_some_and(|e| e.status() == TileStatus::Ready) {
            inner.stats.hits += 1;
        } else {
            inner.stats.misses += 1;
        }
        entry
    }

    pub fn status(&self, image: ImageId, key: TileKey) -> Option<TileStatus> {
        self.lock().entries.get(&(image, key)).map(CacheEntry::status)
    }

    /// Store a ready buffer directly, replacing whatever the tile held.
    ///
    /// A decode in flight for the tile is superseded: its token is cancelled,
    /// its result will be discarded as stale, and its id is returned so the
    /// caller can drop it from the scheduler.
    pub fn put(
        &self,
        image: ImageId,
        key: TileKey,
        generation: DecodeGeneration,
        pixels: SharedPixels,
    ) -> Result<Option<JobId>, CacheError> {
        let mut inner = self.lock();
        let entry_key = (image, key);
        let tick = inner.tick;

        let (superseded, freed) = match inner
            .entries
            .insert(entry_key, CacheEntry::new(generation, tick))
        {
            Some(entry) => {
                let superseded = match &entry.state {
                    TileState::Decoding { job, token, .. } => {
                        token.cancel();
                        Some(*job)
                    }
                    _ => None,
                };
                (superseded, entry.resident_bytes())
            }
            None => (None, 0),
        };
        inner.release(&self.budget, freed);

        let bytes = pixels.byte_size();
        if !inner.reserve(&self.budget, bytes, &entry_key) {
            let error = CacheError::OverBudget {
                requested: bytes,
                available: self.budget.available(),
            };
            inner.stats.over_budget += 1;
            inner.set_failed(&self.budget, &entry_key, TileFailure::from(&error));
            return Err(error);
        }

        if let Some(entry) = inner.entries.get_mut(&entry_key) {
            entry.state = TileState::Ready {
                resolution: pixels.resolution(),
                pixels,
            };
        }
        inner.stats.installs += 1;
        Ok(superseded)
    }

    /// Charge `bytes` the cache does not own to the shared budget, evicting
    /// fallbacks and unneeded tiles until they fit.
    ///
    /// Returns `None` if they cannot fit even with every evictable buffer
    /// gone.
    pub fn reserve_external(&self, bytes: usize) -> Option<Reservation> {
        let mut inner = self.lock();
        loop {
            if let Some(reservation) = self.budget.try_reserve_owned(bytes) {
                return Some(reservation);
            }
            if !inner.evict_one(&self.budget, None) {
                inner.stats.over_budget += 1;
                return None;
            }
        }
    }

    /// Record that `job` is decoding the tile at `target`.
    ///
    /// A ready buffer is kept as the fallback until the new one lands.
    /// Returns the job this one supersedes, which the caller must cancel.
    pub fn begin_decode(
        &self,
        image: ImageId,
        key: TileKey,
        job: JobId,
        token: CancellationToken,
        target: Resolution,
        generation: DecodeGeneration,
    ) -> Option<JobId> {
        let mut inner = self.lock();
        let tick = inner.tick;
        let entry = inner
            .entries
            .entry((image, key))
            .or_insert_with(|| CacheEntry::new(generation, tick));

        let previous = mem::replace(&mut entry.state, TileState::Decoding { job, token, target });
        entry.generation = generation;
        entry.visible = true;
        entry.last_visible = tick;

        let mut freed = 0;
        let superseded = match previous {
            TileState::Ready { pixels, .. } => {
                // An older fallback is superseded by the newer buffer
                if let Some(older) = entry.fallback.replace(pixels) {
                    freed = older.byte_size();
                }
                None
            }
            TileState::Decoding { job, .. } => Some(job),
            TileState::Pending | TileState::Failed { .. } => None,
        };
        inner.release(&self.budget, freed);
        superseded
    }

    /// Install the result of `job`.
    ///
    /// The buffer is only stored if the tile is still decoding with this job
    /// id and generation; otherwise it is dropped and `Stale` returned. A
    /// buffer that does not match the requested resolution, or that the
    /// budget cannot fit even after eviction, fails the tile.
    pub fn install(
        &self,
        image: ImageId,
        key: TileKey,
        job: JobId,
        generation: DecodeGeneration,
        pixels: SharedPixels,
    ) -> Result<InstallOutcome, CacheError> {
        let mut inner = self.lock();
        let entry_key = (image, key);

        let target = inner.entries.get(&entry_key).and_then(|entry| match &entry.state {
            TileState::Decoding {
                job: current,
                target,
                ..
            } if *current == job && entry.generation == generation => Some(*target),
            _ => None,
        });

        let Some(target) = target else {
            inner.stats.stale_results += 1;
            trace!("discarding stale result of job {} for {} {:?}", job, image, key);
            return Ok(InstallOutcome::Stale);
        };

        let actual = pixels.resolution();
        if actual != target {
            let error = CacheError::ResolutionMismatch {
                expected: target,
                actual,
            };
            inner.set_failed(&self.budget, &entry_key, TileFailure::from(&error));
            return Err(error);
        }

        // The fallback is superseded whether or not the install fits
        inner.drop_fallback(&self.budget, &entry_key);

        let bytes = pixels.byte_size();
        if !inner.reserve(&self.budget, bytes, &entry_key) {
            let error = CacheError::OverBudget {
                requested: bytes,
                available: self.budget.available(),
            };
            inner.stats.over_budget += 1;
            inner.set_failed(&self.budget, &entry_key, TileFailure::from(&error));
            debug!("{} {:?} does not fit the memory budget", image, key);
            return Err(error);
        }

        if let Some(entry) = inner.entries.get_mut(&entry_key) {
            entry.state = TileState::Ready {
                pixels,
                resolution: actual,
            };
        }
        inner.stats.installs += 1;
        Ok(InstallOutcome::Installed)
    }

    /// Fail the tile if `job` is still its current decode. Drops any
    /// fallback so the error placeholder is drawn.
    pub fn fail(
        &self,
        image: ImageId,
        key: TileKey,
        job: JobId,
        generation: DecodeGeneration,
        reason: TileFailure,
    ) -> bool {
        let mut inner = self.lock();
        let entry_key = (image, key);
        let current = inner.entries.get(&entry_key).is_some_and(|entry| {
            entry.generation == generation && entry.state.job() == Some(job)
        });
        if current {
            inner.set_failed(&self.budget, &entry_key, reason);
        } else {
            inner.stats.stale_results += 1;
        }
        current
    }

    /// Return a decoding tile to `Pending`, handing back the job to cancel
    pub fn cancel_decode(&self, image: ImageId, key: TileKey) -> Option<JobId> {
        let mut inner = self.lock();
        let entry = inner.entries.get_mut(&(image, key))?;
        let job = entry.state.job()?;
        entry.state = TileState::Pending;
        Some(job)
    }

    /// Apply a page's needed set.
    ///
    /// Needed tiles are marked visible. Unneeded ready tiles become eviction
    /// candidates; every other unneeded entry is dropped. Returns the jobs of
    /// dropped decoding entries.
    pub fn evict_unneeded<I>(&self, image: ImageId, needed: I) -> Vec<JobId>
    where
        I: IntoIterator<Item = TileKey>,
    {
        let needed: HashSet<TileKey> = needed.into_iter().collect();
        let mut inner = self.lock();
        inner.tick += 1;
        let tick = inner.tick;

        let mut dropped = Vec::new();
        for (entry_key, entry) in inner.entries.iter_mut().filter(|((id, _), _)| *id == image) {
            if needed.contains(&entry_key.1) {
                entry.visible = true;
                entry.last_visible = tick;
            } else {
                entry.visible = false;
                if entry.status() != TileStatus::Ready {
                    dropped.push(*entry_key);
                }
            }
        }

        let mut cancelled = Vec::new();
        for entry_key in dropped {
            if let Some(entry) = inner.entries.remove(&entry_key) {
                cancelled.extend(entry.state.job());
                let freed = entry.resident_bytes();
                inner.release(&self.budget, freed);
            }
        }
        cancelled
    }

    /// Stop all decoding for a page that stays open but left the reader
    /// window. Decoding tiles go back to `Pending`; ready ones become
    /// eviction candidates.
    pub fn suspend(&self, image: ImageId) -> Vec<JobId> {
        let mut inner = self.lock();
        let mut cancelled = Vec::new();
        for (_, entry) in inner.entries.iter_mut().filter(|((id, _), _)| *id == image) {
            entry.visible = false;
            if let Some(job) = entry.state.job() {
                entry.state = TileState::Pending;
                cancelled.push(job);
            }
        }
        cancelled
    }

    /// Drop every entry of a page, releasing each buffer once. Returns the
    /// jobs that were still decoding.
    pub fn release_all(&self, image: ImageId) -> Vec<JobId> {
        let mut inner = self.lock();
        let entries = inner.take_image(image);
        let freed: usize = entries.iter().map(CacheEntry::resident_bytes).sum();
        inner.release(&self.budget, freed);
        debug!("released {} tiles ({} bytes) of {}", entries.len(), freed, image);
        entries.iter().filter_map(|entry| entry.state.job()).collect()
    }

    /// Immutable view of a page's tiles for one render pass
    pub fn snapshot(&self, image: ImageId) -> TileSnapshot {
        let inner = self.lock();
        let entries = inner
            .entries
            .iter()
            .filter(|((id, _), _)| *id == image)
            .map(|((_, key), entry)| {
                let (pixels, is_fallback) = match entry.state.pixels() {
                    Some(pixels) => (Some(Arc::clone(pixels)), false),
                    None => (entry.fallback.clone(), entry.fallback.is_some()),
                };
                let snapshot = SnapshotEntry {
                    key: *key,
                    status: entry.status(),
                    pixels,
                    is_fallback,
                };
                (*key, snapshot)
            })
            .collect();
        TileSnapshot {
            entries: Arc::new(entries),
        }
    }

    /// Bytes held by this cache
    pub fn memory_used(&self) -> usize {
        self.lock().memory_used
    }

    /// Number of entries across all pages
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        let mut stats = inner.stats;
        stats.tile_count = inner.entries.len();
        stats.ready_tiles = inner
            .entries
            .values()
            .filter(|e| e.status() == TileStatus::Ready)
            .count();
        stats.fallback_tiles = inner.entries.values().filter(|e| e.fallback.is_some()).count();
        stats.memory_used = inner.memory_used;
        stats.memory_limit = self.budget.ceiling();
        stats
    }
}

impl Drop for TileCache {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        self.budget.release(inner.memory_used);
        inner.memory_used = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagetile_render::RgbaPixels;
    use rand::{Rng, SeedableRng};
    use std::sync::Weak;

    const IMAGE: ImageId = ImageId(1);

    fn key(col: u32) -> TileKey {
        TileKey::new(0, col)
    }

    /// 4x4 RGBA: 64 bytes
    fn pixels(size: u32) -> SharedPixels {
        RgbaPixels::filled(size, size, [0, 0, 0, 255]).into_shared()
    }

    fn decode(cache: &TileCache, col: u32, job: JobId, size: u32, generation: DecodeGeneration) {
        cache.begin_decode(
            IMAGE,
            key(col),
            job,
            CancellationToken::new(),
            Resolution::new(size, size),
            generation,
        );
    }

    fn install(cache: &TileCache, col: u32, job: JobId, size: u32) -> Result<InstallOutcome, CacheError> {
        decode(cache, col, job, size, 1);
        cache.install(IMAGE, key(col), job, 1, pixels(size))
    }

    #[test]
    fn test_install_requires_current_job() {
        let cache = TileCache::with_ceiling(1 << 20);
        decode(&cache, 0, 1, 4, 1);
        assert_eq!(
            cache.begin_decode(IMAGE, key(0), 2, CancellationToken::new(), Resolution::new(4, 4), 1),
            Some(1)
        );

        assert_eq!(cache.install(IMAGE, key(0), 1, 1, pixels(4)), Ok(InstallOutcome::Stale));
        assert_eq!(cache.status(IMAGE, key(0)), Some(TileStatus::Decoding));
        assert_eq!(cache.memory_used(), 0);

        assert_eq!(cache.install(IMAGE, key(0), 2, 1, pixels(4)), Ok(InstallOutcome::Installed));
        assert_eq!(cache.memory_used(), 64);
        assert_eq!(cache.stats().stale_results, 1);
    }

    #[test]
    fn test_install_rejects_older_generation() {
        let cache = TileCache::with_ceiling(1 << 20);
        decode(&cache, 0, 1, 4, 2);
        assert_eq!(cache.install(IMAGE, key(0), 1, 1, pixels(4)), Ok(InstallOutcome::Stale));
        assert_eq!(cache.install(IMAGE, key(0), 1, 2, pixels(4)), Ok(InstallOutcome::Installed));
    }

    #[test]
    fn test_install_rejects_wrong_resolution() {
        let cache = TileCache::with_ceiling(1 << 20);
        decode(&cache, 0, 1, 4, 1);
        let result = cache.install(IMAGE, key(0), 1, 1, pixels(8));
        assert!(matches!(result, Err(CacheError::ResolutionMismatch { .. })));
        assert_eq!(cache.status(IMAGE, key(0)), Some(TileStatus::Failed));
        assert_eq!(cache.memory_used(), 0);
    }

    #[test]
    fn test_refinement_keeps_fallback_until_install() {
        let cache = TileCache::with_ceiling(1 << 20);
        install(&cache, 0, 1, 4).unwrap();

        decode(&cache, 0, 2, 8, 2);
        let snapshot = cache.snapshot(IMAGE);
        let entry = snapshot.get(&key(0)).unwrap();
        assert_eq!(entry.status, TileStatus::Decoding);
        assert!(entry.is_fallback);
        assert_eq!(entry.pixels.as_ref().unwrap().width(), 4);
        assert_eq!(cache.memory_used(), 64);

        cache.install(IMAGE, key(0), 2, 2, pixels(8)).unwrap();
        let entry = cache.get(IMAGE, key(0)).unwrap();
        assert!(entry.fallback().is_none());
        assert_eq!(cache.memory_used(), 256);
    }

    #[test]
    fn test_fail_drops_fallback() {
        let cache = TileCache::with_ceiling(1 << 20);
        install(&cache, 0, 1, 4).unwrap();
        decode(&cache, 0, 2, 8, 2);

        // A superseded job cannot fail the tile
        assert!(!cache.fail(IMAGE, key(0), 1, 2, TileFailure::new(FailureKind::Io, "gone")));
        assert!(cache.fail(IMAGE, key(0), 2, 2, TileFailure::new(FailureKind::Io, "gone")));

        let entry = cache.get(IMAGE, key(0)).unwrap();
        assert_eq!(entry.failure().unwrap().kind, FailureKind::Io);
        assert!(entry.fallback().is_none());
        assert_eq!(cache.memory_used(), 0);
    }

    #[test]
    fn test_cancel_decode() {
        let cache = TileCache::with_ceiling(1 << 20);
        decode(&cache, 0, 9, 4, 1);
        assert_eq!(cache.cancel_decode(IMAGE, key(0)), Some(9));
        assert_eq!(cache.status(IMAGE, key(0)), Some(TileStatus::Pending));
        assert_eq!(cache.cancel_decode(IMAGE, key(0)), None);
        assert_eq!(cache.install(IMAGE, key(0), 9, 1, pixels(4)), Ok(InstallOutcome::Stale));
    }

    #[test]
    fn test_evict_unneeded() {
        let cache = TileCache::with_ceiling(1 << 20);
        install(&cache, 0, 1, 4).unwrap();
        decode(&cache, 1, 2, 4, 1);
        cache.put(IMAGE, key(2), 1, pixels(4)).unwrap();
        decode(&cache, 3, 3, 4, 1);
        cache.cancel_decode(IMAGE, key(3));

        let cancelled = cache.evict_unneeded(IMAGE, [key(2)]);
        assert_eq!(cancelled, vec![2]);

        // Ready tiles are kept as candidates, the rest are dropped
        assert!(!cache.get(IMAGE, key(0)).unwrap().is_visible());
        assert!(cache.get(IMAGE, key(1)).is_none());
        assert!(cache.get(IMAGE, key(2)).unwrap().is_visible());
        assert!(cache.get(IMAGE, key(3)).is_none());
    }

    #[test]
    fn test_put_returns_superseded_job() {
        let cache = TileCache::with_ceiling(1 << 20);
        let token = CancellationToken::new();
        cache.begin_decode(IMAGE, key(0), 5, token.clone(), Resolution::new(4, 4), 1);

        assert_eq!(cache.put(IMAGE, key(0), 1, pixels(4)), Ok(Some(5)));
        assert!(token.is_cancelled());
        assert_eq!(cache.install(IMAGE, key(0), 5, 1, pixels(4)), Ok(InstallOutcome::Stale));

        // Replacing a ready buffer supersedes nothing
        assert_eq!(cache.put(IMAGE, key(0), 1, pixels(4)), Ok(None));
        assert_eq!(cache.memory_used(), 64);
    }

    #[test]
    fn test_external_reservation_evicts_candidates() {
        let budget = Arc::new(MemoryBudget::new(3 * 64));
        let cache = TileCache::new(Arc::clone(&budget));
        install(&cache, 0, 1, 4).unwrap();
        install(&cache, 1, 2, 4).unwrap();
        cache.evict_unneeded(IMAGE, [key(1)]);

        let held = cache.reserve_external(2 * 64).unwrap();
        assert!(cache.get(IMAGE, key(0)).is_none());
        assert_eq!(cache.status(IMAGE, key(1)), Some(TileStatus::Ready));
        assert_eq!(budget.current_usage(), 3 * 64);
        // Only tile buffers count as cache memory
        assert_eq!(cache.memory_used(), 64);

        // Needed tiles are never evicted for it
        assert!(cache.reserve_external(64).is_none());
        assert_eq!(cache.stats().over_budget, 1);

        drop(held);
        assert_eq!(budget.current_usage(), 64);
    }

    #[test]
    fn test_install_evicts_least_recently_visible_candidate() {
        // Room for three 4x4 tiles
        let cache = TileCache::with_ceiling(3 * 64);
        install(&cache, 0, 1, 4).unwrap();
        install(&cache, 1, 2, 4).unwrap();
        cache.evict_unneeded(IMAGE, [key(1)]);
        cache.evict_unneeded(IMAGE, Vec::new());
        install(&cache, 2, 3, 4).unwrap();

        // Tile 0 left the needed set first
        install(&cache, 3, 4, 4).unwrap();
        assert!(cache.get(IMAGE, key(0)).is_none());
        assert!(cache.get(IMAGE, key(1)).is_some());
        assert_eq!(cache.stats().evictions, 1);
        assert!(cache.memory_used() <= 3 * 64);
    }

    #[test]
    fn test_fallbacks_are_evicted_before_candidates() {
        let cache = TileCache::with_ceiling(3 * 64);
        install(&cache, 0, 1, 4).unwrap();
        install(&cache, 1, 2, 4).unwrap();
        cache.evict_unneeded(IMAGE, [key(1)]);
        // Tile 1 refines; its 4x4 buffer becomes a fallback
        decode(&cache, 1, 3, 2, 2);
        install(&cache, 2, 4, 4).unwrap();

        install(&cache, 3, 5, 4).unwrap();
        assert!(cache.get(IMAGE, key(1)).unwrap().fallback().is_none());
        assert_eq!(cache.status(IMAGE, key(0)), Some(TileStatus::Ready));
    }

    #[test]
    fn test_visible_tiles_are_never_evicted() {
        let cache = TileCache::with_ceiling(2 * 64);
        install(&cache, 0, 1, 4).unwrap();
        install(&cache, 1, 2, 4).unwrap();

        let result = install(&cache, 2, 3, 4);
        assert_eq!(
            result,
            Err(CacheError::OverBudget {
                requested: 64,
                available: 0
            })
        );
        let entry = cache.get(IMAGE, key(2)).unwrap();
        assert!(entry.is_over_budget());
        assert_eq!(cache.status(IMAGE, key(0)), Some(TileStatus::Ready));
        assert_eq!(cache.status(IMAGE, key(1)), Some(TileStatus::Ready));
        assert_eq!(cache.stats().over_budget, 1);
    }

    #[test]
    fn test_suspend_returns_decoding_jobs() {
        let cache = TileCache::with_ceiling(1 << 20);
        install(&cache, 0, 1, 4).unwrap();
        decode(&cache, 1, 2, 4, 1);

        assert_eq!(cache.suspend(IMAGE), vec![2]);
        assert_eq!(cache.status(IMAGE, key(1)), Some(TileStatus::Pending));
        assert!(!cache.get(IMAGE, key(0)).unwrap().is_visible());
    }

    #[test]
    fn test_release_all_drops_every_buffer_once() {
        let budget = Arc::new(MemoryBudget::new(1 << 20));
        let cache = TileCache::new(Arc::clone(&budget));
        let other = ImageId(2);

        let mut weak: Vec<Weak<dyn pagetile_render::PixelBuffer>> = Vec::new();
        for col in 0..4 {
            let buffer = pixels(4);
            weak.push(Arc::downgrade(&buffer));
            cache.put(IMAGE, key(col), 1, buffer).unwrap();
        }
        cache.put(other, key(0), 1, pixels(4)).unwrap();
        decode(&cache, 5, 7, 4, 1);

        let snapshot = cache.snapshot(IMAGE);
        assert_eq!(cache.release_all(IMAGE), vec![7]);
        assert_eq!(budget.current_usage(), 64);

        // The snapshot keeps its buffers alive until it is dropped
        assert!(weak.iter().all(|w| w.upgrade().is_some()));
        drop(snapshot);
        assert!(weak.iter().all(|w| w.upgrade().is_none()));

        assert!(cache.snapshot(IMAGE).is_empty());
        assert_eq!(cache.snapshot(other).len(), 1);
    }

    #[test]
    fn test_drop_returns_bytes_to_shared_budget() {
        let budget = Arc::new(MemoryBudget::new(1 << 20));
        let cache = TileCache::new(Arc::clone(&budget));
        cache.put(IMAGE, key(0), 1, pixels(8)).unwrap();
        assert_eq!(budget.current_usage(), 256);
        drop(cache);
        assert_eq!(budget.current_usage(), 0);
    }

    #[test]
    fn test_random_workload_respects_ceiling_and_visible_set() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let ceiling = 10 * 64;
        let cache = TileCache::with_ceiling(ceiling);
        let mut job = 0;

        for generation in 1..200u64 {
            let needed: Vec<TileKey> = (0..rng.gen_range(1..8)).map(|_| key(rng.gen_range(0..24))).collect();
            cache.evict_unneeded(IMAGE, needed.iter().copied());

            for tile in &needed {
                job += 1;
                let size = if rng.gen_bool(0.5) { 4 } else { 2 };
                cache.begin_decode(
                    IMAGE,
                    *tile,
                    job,
                    CancellationToken::new(),
                    Resolution::new(size, size),
                    generation,
                );
                let _ = cache.install(IMAGE, *tile, job, generation, pixels(size));
            }

            assert!(cache.memory_used() <= ceiling);
            assert_eq!(cache.memory_used(), cache.budget().current_usage());
            let snapshot = cache.snapshot(IMAGE);
            for tile in &needed {
                let status = snapshot.get(tile).map(|e| e.status);
                assert!(
                    matches!(status, Some(TileStatus::Ready) | Some(TileStatus::Failed)),
                    "needed tile {:?} was evicted",
                    tile
                );
            }
        }
    }
}
