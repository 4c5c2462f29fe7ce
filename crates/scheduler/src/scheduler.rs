//! Job scheduler
//!
//! Tracks every decode job from reservation to completion. Ids are reserved
//! before a job is queued so callers can record the id elsewhere (the tile
//! cache) before any worker can see the job.
//!
//! A running job that cannot make progress until another job of the same
//! page finishes can be parked. Parked jobs hold no worker; they go back on
//! the queue when [`JobScheduler::unpark_image`] is called for their page.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use pagetile_render::{ImageId, TileKey};

use crate::cancel::{CancellationRegistry, CancellationToken};
use crate::priority::{Job, JobId, JobPriority, PriorityQueue, TileJob};

/// Job scheduler statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub jobs_submitted: u64,
    pub jobs_completed: u64,
    /// Jobs removed from the queue before a worker picked them up
    pub jobs_cancelled: u64,
    pub queue_size: usize,
    pub running: usize,
    pub parked: usize,
}

impl SchedulerStats {
    pub fn pending_jobs(&self) -> u64 {
        self.jobs_submitted - self.jobs_completed - self.jobs_cancelled
    }
}

struct SchedulerState {
    queue: PriorityQueue,
    running: HashMap<JobId, Job>,
    parked: HashMap<JobId, Job>,
    stats: SchedulerStats,
    shutdown: bool,
}

/// Thread-safe priority scheduler for tile jobs
///
/// # Example
///
/// ```
/// use pagetile_render::{ImageId, PixelRect, Resolution, TileKey};
/// use pagetile_scheduler::{JobPriority, JobScheduler, TileJob};
/// use std::time::Duration;
///
/// let scheduler = JobScheduler::new();
/// let tile = TileJob {
///     image_id: ImageId(1),
///     key: TileKey::new(0, 0),
///     source_rect: PixelRect::new(0, 0, 512, 512),
///     target: Resolution::new(256, 256),
///     generation: 1,
///     upscale: false,
/// };
///
/// let (job_id, token) = scheduler.reserve();
/// scheduler.enqueue(job_id, JobPriority::Visible, tile);
///
/// if let Some((job, token)) = scheduler.next_job(Duration::from_millis(10)) {
///     assert!(!token.is_cancelled());
///     scheduler.complete_job(job.id);
/// }
/// ```
pub struct JobScheduler {
    state: Mutex<SchedulerState>,
    work_available: Condvar,
    job_finished: Condvar,
    cancellation: CancellationRegistry,
    next_job_id: AtomicU64,
}

impl JobScheduler {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SchedulerState {
                queue: PriorityQueue::new(),
                running: HashMap::new(),
                parked: HashMap::new(),
                stats: SchedulerStats::default(),
                shutdown: false,
            }),
            work_available: Condvar::new(),
            job_finished: Condvar::new(),
            cancellation: CancellationRegistry::new(),
            next_job_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a job id and its cancellation token without queueing anything
    pub fn reserve(&self) -> (JobId, CancellationToken) {
        let job_id = self.next_job_id.fetch_add(1, Ordering::Relaxed);
        let token = self.cancellation.register(job_id);
        (job_id, token)
    }

    /// Queue a previously reserved job.
    ///
    /// Returns `false` (and forgets the reservation) if the job was cancelled
    /// between reservation and queueing, or the scheduler is shut down.
    pub fn enqueue(&self, job_id: JobId, priority: JobPriority, tile: TileJob) -> bool {
        let cancelled = self
            .cancellation
            .get(job_id)
            .map_or(true, |token| token.is_cancelled());

        let mut state = self.lock();
        if cancelled || state.shutdown {
            drop(state);
            self.cancellation.unregister(job_id);
            return false;
        }

        state.queue.push(job_id, priority, tile);
        state.stats.jobs_submitted += 1;
        drop(state);

        self.work_available.notify_one();
        true
    }

    /// Reserve and queue in one step
    pub fn submit(&self, priority: JobPriority, tile: TileJob) -> (JobId, CancellationToken) {
        let (job_id, token) = self.reserve();
        self.enqueue(job_id, priority, tile);
        (job_id, token)
    }

    /// Take the highest priority job, waiting up to `timeout` for one.
    ///
    /// The job stays in the running set until [`complete_job`](Self::complete_job).
    pub fn next_job(&self, timeout: Duration) -> Option<(Job, CancellationToken)> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();

        loop {
            if state.shutdown {
                return None;
            }
            if let Some(job) = state.queue.pop() {
                state.running.insert(job.id, job.clone());
                drop(state);
                let token = self.cancellation.get(job.id).unwrap_or_else(|| {
                    // Unknown ids only come from jobs cancelled mid-hand-off
                    let token = CancellationToken::new();
                    token.cancel();
                    token
                });
                return Some((job, token));
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .work_available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    /// Mark a job as finished, whatever its outcome
    pub fn complete_job(&self, job_id: JobId) {
        let mut state = self.lock();
        if state.running.remove(&job_id).is_some() {
            state.stats.jobs_completed += 1;
        }
        drop(state);

        self.cancellation.unregister(job_id);
        self.job_finished.notify_all();
    }

    /// Move a running job aside until [`unpark_image`](Self::unpark_image)
    /// is called for its page.
    ///
    /// The worker that parked a job must not complete it. Returns `false`
    /// if the job is not running, is cancelled, or the scheduler is shut
    /// down; the caller then finishes the job as usual.
    pub fn park(&self, job_id: JobId) -> bool {
        let mut state = self.lock();
        let cancelled = self
            .cancellation
            .get(job_id)
            .map_or(true, |token| token.is_cancelled());
        if cancelled || state.shutdown {
            return false;
        }
        match state.running.remove(&job_id) {
            Some(job) => {
                state.parked.insert(job_id, job);
                true
            }
            None => false,
        }
    }

    /// Requeue every parked job of `image_id` at its original priority
    pub fn unpark_image(&self, image_id: ImageId) -> usize {
        let mut state = self.lock();
        let ids: Vec<JobId> = state
            .parked
            .values()
            .filter(|job| job.tile.image_id == image_id)
            .map(|job| job.id)
            .collect();
        for id in &ids {
            if let Some(job) = state.parked.remove(id) {
                state.queue.push(job.id, job.priority, job.tile);
            }
        }
        drop(state);

        if !ids.is_empty() {
            self.work_available.notify_all();
        }
        ids.len()
    }

    /// Cancel one job, queued, parked or running.
    ///
    /// A queued or parked job is removed outright; a running job only has
    /// its token cancelled. Returns `true` if the job was known.
    pub fn cancel_job(&self, job_id: JobId) -> bool {
        let known = self.cancellation.cancel(job_id);

        let mut state = self.lock();
        let mut removed = state.queue.remove_if(|job| job.id == job_id).len();
        if state.parked.remove(&job_id).is_some() {
            removed += 1;
        }
        state.stats.jobs_cancelled += removed as u64;
        drop(state);

        if removed > 0 {
            self.cancellation.unregister(job_id);
            self.job_finished.notify_all();
        }
        known || removed > 0
    }

    /// Cancel every queued, parked or running job matching `predicate`
    pub fn cancel_jobs_if<F>(&self, predicate: F) -> usize
    where
        F: Fn(&TileJob) -> bool,
    {
        let mut state = self.lock();
        let mut removed_ids: Vec<JobId> = state
            .queue
            .remove_if(|job| predicate(&job.tile))
            .iter()
            .map(|job| job.id)
            .collect();
        let parked: Vec<JobId> = state
            .parked
            .values()
            .filter(|job| predicate(&job.tile))
            .map(|job| job.id)
            .collect();
        for id in &parked {
            state.parked.remove(id);
        }
        removed_ids.extend(parked);
        state.stats.jobs_cancelled += removed_ids.len() as u64;
        let running: Vec<JobId> = state
            .running
            .values()
            .filter(|job| predicate(&job.tile))
            .map(|job| job.id)
            .collect();
        // Cancel running tokens before a worker can park one of them
        self.cancellation.cancel_many(&running);
        drop(state);

        self.cancellation.cancel_many(&removed_ids);
        for job_id in &removed_ids {
            self.cancellation.unregister(*job_id);
        }
        if !removed_ids.is_empty() {
            self.job_finished.notify_all();
        }

        removed_ids.len() + running.len()
    }

    /// Cancel all work for one page
    pub fn cancel_image(&self, image_id: ImageId) -> usize {
        self.cancel_jobs_if(|tile| tile.image_id == image_id)
    }

    /// Queued, parked and running jobs for `image_id`
    pub fn outstanding(&self, image_id: ImageId) -> usize {
        let state = self.lock();
        state
            .all_jobs()
            .filter(|job| job.tile.image_id == image_id)
            .count()
    }

    /// Outstanding jobs for `image_id` whose token is not cancelled
    pub fn live_jobs(&self, image_id: ImageId) -> Vec<(JobId, TileKey)> {
        let state = self.lock();
        let candidates: Vec<(JobId, TileKey)> = state
            .all_jobs()
            .filter(|job| job.tile.image_id == image_id)
            .map(|job| (job.id, job.tile.key))
            .collect();
        drop(state);

        candidates
            .into_iter()
            .filter(|(id, _)| {
                self.cancellation
                    .get(*id)
                    .is_some_and(|token| !token.is_cancelled())
            })
            .collect()
    }

    /// Block until no job for `image_id` is queued, parked or running.
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub fn wait_until_idle(&self, image_id: ImageId, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();

        loop {
            let busy = state.all_jobs().any(|job| job.tile.image_id == image_id);
            if !busy {
                return true;
            }
            let now = Instant::now();
            if now >= deadline || state.shutdown {
                return false;
            }
            let (guard, _) = self
                .job_finished
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    /// Drop all queued and parked jobs and wake every waiting worker
    pub fn shutdown(&self) {
        let mut state = self.lock();
        state.shutdown = true;
        let mut dropped = state.queue.clear();
        dropped.extend(state.parked.drain().map(|(_, job)| job));
        state.stats.jobs_cancelled += dropped.len() as u64;
        drop(state);

        self.cancellation.cancel_all();
        for job in dropped {
            self.cancellation.unregister(job.id);
        }
        self.work_available.notify_all();
        self.job_finished.notify_all();
    }

    pub fn is_shut_down(&self) -> bool {
        self.lock().shutdown
    }

    pub fn pending_jobs(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn running_jobs(&self) -> usize {
        self.lock().running.len()
    }

    pub fn parked_jobs(&self) -> usize {
        self.lock().parked.len()
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.lock();
        let mut stats = state.stats.clone();
        stats.queue_size = state.queue.len();
        stats.running = state.running.len();
        stats.parked = state.parked.len();
        stats
    }

    pub fn get_cancellation_token(&self, job_id: JobId) -> Option<CancellationToken> {
        self.cancellation.get(job_id)
    }
}

impl SchedulerState {
    fn all_jobs(&self) -> impl Iterator<Item = &Job> {
        self.queue
            .jobs()
            .chain(self.running.values())
            .chain(self.parked.values())
    }
}

impl Default for JobScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagetile_render::{PixelRect, Resolution};
    use std::sync::Arc;
    use std::thread;

    const NO_WAIT: Duration = Duration::from_millis(0);

    fn tile(image: u64, col: u32) -> TileJob {
        TileJob {
            image_id: ImageId(image),
            key: TileKey::new(0, col),
            source_rect: PixelRect::new(col * 10, 0, 10, 10),
            target: Resolution::new(10, 10),
            generation: 1,
            upscale: false,
        }
    }

    #[test]
    fn test_scheduler_basic() {
        let scheduler = JobScheduler::new();
        let (job_id, token) = scheduler.submit(JobPriority::Visible, tile(1, 0));
        assert_eq!(scheduler.pending_jobs(), 1);
        assert!(!token.is_cancelled());

        let (job, worker_token) = scheduler.next_job(NO_WAIT).unwrap();
        assert_eq!(job.id, job_id);
        assert!(worker_token.same_as(&token));
        assert_eq!(scheduler.running_jobs(), 1);

        scheduler.complete_job(job_id);
        let stats = scheduler.stats();
        assert_eq!(stats.jobs_submitted, 1);
        assert_eq!(stats.jobs_completed, 1);
        assert_eq!(stats.pending_jobs(), 0);
        assert!(scheduler.get_cancellation_token(job_id).is_none());
    }

    #[test]
    fn test_priority_ordering() {
        let scheduler = JobScheduler::new();
        scheduler.submit(JobPriority::Margin, tile(1, 0));
        let (visible, _) = scheduler.submit(JobPriority::Visible, tile(1, 1));
        assert_eq!(scheduler.next_job(NO_WAIT).unwrap().0.id, visible);
    }

    #[test]
    fn test_reserved_job_cancelled_before_enqueue_is_dropped() {
        let scheduler = JobScheduler::new();
        let (job_id, _token) = scheduler.reserve();
        assert!(scheduler.cancel_job(job_id));
        assert!(!scheduler.enqueue(job_id, JobPriority::Visible, tile(1, 0)));
        assert_eq!(scheduler.pending_jobs(), 0);
    }

    #[test]
    fn test_cancel_queued_and_running() {
        let scheduler = JobScheduler::new();
        let (running_id, running_token) = scheduler.submit(JobPriority::Visible, tile(1, 0));
        let (queued_id, queued_token) = scheduler.submit(JobPriority::Margin, tile(1, 1));
        scheduler.next_job(NO_WAIT).unwrap();

        assert!(scheduler.cancel_job(queued_id));
        assert!(queued_token.is_cancelled());
        assert_eq!(scheduler.pending_jobs(), 0);

        assert!(scheduler.cancel_job(running_id));
        assert!(running_token.is_cancelled());
        assert_eq!(scheduler.running_jobs(), 1);
        scheduler.complete_job(running_id);
        assert_eq!(scheduler.outstanding(ImageId(1)), 0);
    }

    #[test]
    fn test_cancel_image_leaves_other_images() {
        let scheduler = JobScheduler::new();
        scheduler.submit(JobPriority::Visible, tile(1, 0));
        scheduler.submit(JobPriority::Visible, tile(1, 1));
        scheduler.submit(JobPriority::Visible, tile(2, 0));

        assert_eq!(scheduler.cancel_image(ImageId(1)), 2);
        assert_eq!(scheduler.outstanding(ImageId(1)), 0);
        assert_eq!(scheduler.outstanding(ImageId(2)), 1);
        assert_eq!(scheduler.live_jobs(ImageId(2)).len(), 1);
    }

    #[test]
    fn test_live_jobs_excludes_cancelled_running() {
        let scheduler = JobScheduler::new();
        let (id, _) = scheduler.submit(JobPriority::Visible, tile(1, 0));
        scheduler.next_job(NO_WAIT).unwrap();
        scheduler.cancel_job(id);
        assert_eq!(scheduler.outstanding(ImageId(1)), 1);
        assert!(scheduler.live_jobs(ImageId(1)).is_empty());
    }

    #[test]
    fn test_next_job_waits_for_submission() {
        let scheduler = Arc::new(JobScheduler::new());
        let waiter = {
            let scheduler = Arc::clone(&scheduler);
            thread::spawn(move || scheduler.next_job(Duration::from_secs(5)).map(|(j, _)| j.id))
        };
        thread::sleep(Duration::from_millis(20));
        let (id, _) = scheduler.submit(JobPriority::Visible, tile(1, 0));
        assert_eq!(waiter.join().unwrap(), Some(id));
    }

    #[test]
    fn test_wait_until_idle() {
        let scheduler = Arc::new(JobScheduler::new());
        let (id, _) = scheduler.submit(JobPriority::Visible, tile(1, 0));
        assert!(!scheduler.wait_until_idle(ImageId(1), Duration::from_millis(10)));

        let worker = {
            let scheduler = Arc::clone(&scheduler);
            thread::spawn(move || {
                let (job, _) = scheduler.next_job(Duration::from_secs(1)).unwrap();
                thread::sleep(Duration::from_millis(20));
                scheduler.complete_job(job.id);
            })
        };
        assert!(scheduler.wait_until_idle(ImageId(1), Duration::from_secs(5)));
        worker.join().unwrap();
        assert!(scheduler.get_cancellation_token(id).is_none());
    }

    #[test]
    fn test_parked_job_frees_its_worker_until_unparked() {
        let scheduler = JobScheduler::new();
        let (blocked, _) = scheduler.submit(JobPriority::Visible, tile(1, 0));
        let (other, _) = scheduler.submit(JobPriority::Margin, tile(2, 0));

        let (job, _) = scheduler.next_job(NO_WAIT).unwrap();
        assert_eq!(job.id, blocked);
        assert!(scheduler.park(blocked));
        assert_eq!(scheduler.running_jobs(), 0);
        assert_eq!(scheduler.parked_jobs(), 1);
        assert_eq!(scheduler.outstanding(ImageId(1)), 1);
        assert_eq!(scheduler.live_jobs(ImageId(1)).len(), 1);
        assert!(!scheduler.wait_until_idle(ImageId(1), NO_WAIT));

        // The next job is another page's, not the parked one
        assert_eq!(scheduler.next_job(NO_WAIT).unwrap().0.id, other);
        scheduler.complete_job(other);
        assert!(scheduler.next_job(NO_WAIT).is_none());

        assert_eq!(scheduler.unpark_image(ImageId(2)), 0);
        assert_eq!(scheduler.unpark_image(ImageId(1)), 1);
        let (again, _) = scheduler.next_job(NO_WAIT).unwrap();
        assert_eq!(again.id, blocked);
        assert_eq!(again.priority, JobPriority::Visible);
        scheduler.complete_job(blocked);

        let stats = scheduler.stats();
        assert_eq!(stats.jobs_completed, 2);
        assert_eq!(stats.pending_jobs(), 0);
        assert_eq!(stats.parked, 0);
    }

    #[test]
    fn test_cancelled_jobs_cannot_park() {
        let scheduler = JobScheduler::new();
        let (id, _) = scheduler.submit(JobPriority::Visible, tile(1, 0));
        scheduler.next_job(NO_WAIT).unwrap();
        scheduler.cancel_image(ImageId(1));
        assert!(!scheduler.park(id));
        assert_eq!(scheduler.running_jobs(), 1);
        // Not running at all
        assert!(!scheduler.park(999));
    }

    #[test]
    fn test_cancel_removes_parked_jobs() {
        let scheduler = JobScheduler::new();
        let (first, first_token) = scheduler.submit(JobPriority::Visible, tile(1, 0));
        let (second, _) = scheduler.submit(JobPriority::Visible, tile(1, 1));
        scheduler.next_job(NO_WAIT).unwrap();
        scheduler.next_job(NO_WAIT).unwrap();
        assert!(scheduler.park(first));
        assert!(scheduler.park(second));

        assert!(scheduler.cancel_job(first));
        assert!(first_token.is_cancelled());
        assert!(scheduler.get_cancellation_token(first).is_none());
        assert_eq!(scheduler.cancel_image(ImageId(1)), 1);
        assert_eq!(scheduler.outstanding(ImageId(1)), 0);
        assert!(scheduler.wait_until_idle(ImageId(1), NO_WAIT));
        assert_eq!(scheduler.stats().jobs_cancelled, 2);
        assert_eq!(scheduler.unpark_image(ImageId(1)), 0);
    }

    #[test]
    fn test_shutdown_drops_queue() {
        let scheduler = JobScheduler::new();
        let (_, token) = scheduler.submit(JobPriority::Visible, tile(1, 0));
        scheduler.shutdown();
        assert!(token.is_cancelled());
        assert!(scheduler.next_job(NO_WAIT).is_none());
        assert!(scheduler.is_shut_down());
        assert_eq!(scheduler.stats().jobs_cancelled, 1);
    }
}
