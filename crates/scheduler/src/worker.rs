//! Decode worker pool
//!
//! A fixed set of threads pulls jobs from a [`JobScheduler`] and runs them
//! through a [`JobExecutor`]. Workers never decide what a job does; the
//! executor owns the decode pipeline and checks the token between stages.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, trace};

use crate::{CancellationToken, Job, JobScheduler};

/// What a worker does with a job once the executor returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Done, whatever the result; the worker completes it
    Finished,
    /// Handed to [`JobScheduler::park`]; the worker leaves it alone
    Parked,
}

/// Callback run for every job a worker takes
///
/// Jobs whose token is already cancelled when picked up are completed
/// without calling the executor. A panicking executor counts as
/// [`JobOutcome::Finished`].
pub type JobExecutor = Arc<dyn Fn(&Job, &CancellationToken) -> JobOutcome + Send + Sync>;

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker threads. Default: logical cores clamped to 2..=4.
    pub num_workers: usize,

    /// How long an idle worker waits for a job before rechecking shutdown.
    /// Default: 100ms.
    pub poll_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self::new(default_worker_count())
    }
}

impl WorkerPoolConfig {
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers: num_workers.max(1),
            poll_interval: Duration::from_millis(100),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Bounded pool of decode threads
///
/// Dropping the pool shuts the scheduler down and joins every worker.
///
/// # Example
///
/// ```
/// use pagetile_scheduler::{
///     CancellationToken, Job, JobOutcome, JobScheduler, WorkerPool, WorkerPoolConfig,
/// };
/// use std::sync::Arc;
///
/// let scheduler = Arc::new(JobScheduler::new());
/// let executor = Arc::new(|job: &Job, token: &CancellationToken| {
///     if !token.is_cancelled() {
///         println!("decoding tile {:?}", job.tile.key);
///     }
///     JobOutcome::Finished
/// });
///
/// let pool = WorkerPool::new(scheduler, executor, WorkerPoolConfig::new(2)).unwrap();
/// pool.shutdown();
/// ```
pub struct WorkerPool {
    workers: Vec<Worker>,
    scheduler: Arc<JobScheduler>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Spawn the worker threads
    pub fn new(
        scheduler: Arc<JobScheduler>,
        executor: JobExecutor,
        config: WorkerPoolConfig,
    ) -> std::io::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut pool = Self {
            workers: Vec::with_capacity(config.num_workers),
            scheduler: Arc::clone(&scheduler),
            shutdown: Arc::clone(&shutdown),
        };

        for id in 0..config.num_workers {
            // On failure the partially built pool is dropped, joining what started
            let worker = Worker::spawn(
                id,
                Arc::clone(&scheduler),
                Arc::clone(&executor),
                Arc::clone(&shutdown),
                config.poll_interval,
            )?;
            pool.workers.push(worker);
        }

        debug!("started {} decode workers", pool.workers.len());
        Ok(pool)
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Stop all workers and wait for them to exit.
    ///
    /// Workers finish the job they are running; queued jobs are dropped.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.scheduler.shutdown();
        for worker in self.workers.drain(..) {
            worker.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

struct Worker {
    id: usize,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn(
        id: usize,
        scheduler: Arc<JobScheduler>,
        executor: JobExecutor,
        shutdown: Arc<AtomicBool>,
        poll_interval: Duration,
    ) -> std::io::Result<Self> {
        let thread = thread::Builder::new()
            .name(format!("pagetile-worker-{}", id))
            .spawn(move || Self::run(scheduler, executor, shutdown, poll_interval))?;
        Ok(Self {
            id,
            thread: Some(thread),
        })
    }

    fn run(
        scheduler: Arc<JobScheduler>,
        executor: JobExecutor,
        shutdown: Arc<AtomicBool>,
        poll_interval: Duration,
    ) {
        while !shutdown.load(Ordering::Acquire) {
            let Some((job, token)) = scheduler.next_job(poll_interval) else {
                continue;
            };

            let outcome = if token.is_cancelled() {
                JobOutcome::Finished
            } else {
                panic::catch_unwind(AssertUnwindSafe(|| executor(&job, &token))).unwrap_or_else(|_| {
                    error!("decode job {} for tile {:?} panicked", job.id, job.tile.key);
                    JobOutcome::Finished
                })
            };

            match outcome {
                JobOutcome::Finished => scheduler.complete_job(job.id),
                JobOutcome::Parked => trace!("job {} parked", job.id),
            }
        }
    }

    fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("worker {} exited with a panic", self.id);
            }
        }
    }
}

/// Logical cores clamped to 2..=4
pub fn default_worker_count() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
        .clamp(2, 4)
}
