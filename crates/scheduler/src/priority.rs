//! Priority ordering of decode jobs
//!
//! Visible tiles are decoded before prefetch (margin) tiles. Within one
//! priority level jobs run in submission order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use pagetile_render::{ImageId, PixelRect, Resolution, TileKey};

/// Job priority levels, higher runs first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JobPriority {
    /// Tile inside the prefetch margin only
    Margin = 0,

    /// Tile intersecting the on-screen area
    Visible = 1,
}

/// Unique job identifier
pub type JobId = u64;

/// Monotonic counter of required tile sets for one page
pub type DecodeGeneration = u64;

/// Parameters of one tile decode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileJob {
    pub image_id: ImageId,
    pub key: TileKey,
    pub source_rect: PixelRect,
    pub target: Resolution,
    pub generation: DecodeGeneration,
    /// Route through the upscaler before resampling to `target`
    pub upscale: bool,
}

/// A queued job
///
/// Ordered by priority, then by insertion order so the heap pops FIFO within
/// one level.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub priority: JobPriority,
    pub tile: TileJob,
    insertion_order: u64,
}

impl Job {
    pub fn new(id: JobId, priority: JobPriority, tile: TileJob, insertion_order: u64) -> Self {
        Self {
            id,
            priority,
            tile,
            insertion_order,
        }
    }
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Job {}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Job {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.priority.cmp(&other.priority) {
            // BinaryHeap is a max heap, so earlier insertions must compare greater
            Ordering::Equal => other.insertion_order.cmp(&self.insertion_order),
            other => other,
        }
    }
}

/// Max-heap of jobs
///
/// Not synchronized; the scheduler keeps it behind its own lock.
#[derive(Debug, Default)]
pub struct PriorityQueue {
    heap: BinaryHeap<Job>,
    insertion_counter: u64,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a job under an id the caller reserved
    pub fn push(&mut self, id: JobId, priority: JobPriority, tile: TileJob) {
        let order = self.insertion_counter;
        self.insertion_counter += 1;
        self.heap.push(Job::new(id, priority, tile, order));
    }

    pub fn pop(&mut self) -> Option<Job> {
        self.heap.pop()
    }

    pub fn peek(&self) -> Option<&Job> {
        self.heap.peek()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.heap.iter().any(|job| job.id == id)
    }

    /// Remove every job matching `predicate`, returning the removed jobs
    pub fn remove_if<F>(&mut self, mut predicate: F) -> Vec<Job>
    where
        F: FnMut(&Job) -> bool,
    {
        let mut removed = Vec::new();
        let kept: BinaryHeap<Job> = std::mem::take(&mut self.heap)
            .into_iter()
            .filter_map(|job| {
                if predicate(&job) {
                    removed.push(job);
                    None
                } else {
                    Some(job)
                }
            })
            .collect();
        self.heap = kept;
        removed
    }

    /// Snapshot of queued jobs in arbitrary order
    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.heap.iter()
    }

    pub fn clear(&mut self) -> Vec<Job> {
        std::mem::take(&mut self.heap).into_vec()
    }
}
