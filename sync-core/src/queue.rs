//! Per-peer job queue for syncstuff.
//!
//! This module provides the ordering rules of a sync session:
//! - FIFO ordering of queued jobs
//! - At most one active job at a time
//! - Max size limits to prevent unbounded memory growth
//!
//! The queue is used by sync-client's session worker. Jobs are enqueued,
//! promoted with `activate_next()` when the worker is idle, and released with
//! `complete_active()` once the job reaches a terminal state.

use std::collections::VecDeque;
use sync_types::{JobId, SyncJob};
use thiserror::Error;

/// Default per-peer queue capacity (queued + active).
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Error type for queue operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// Queue is at capacity.
    #[error("queue full (capacity: {capacity})")]
    Full {
        /// Current queue capacity.
        capacity: usize,
    },
}

/// A job waiting in, or running from, a peer queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedJob {
    /// Handle returned to the caller.
    pub id: JobId,
    /// The work itself.
    pub job: SyncJob,
}

impl QueuedJob {
    /// Wrap a job with a fresh ID.
    pub fn new(job: SyncJob) -> Self {
        Self {
            id: JobId::new(),
            job,
        }
    }
}

/// Ordered jobs for one peer plus the single active slot.
///
/// Jobs flow through the queue in this order:
/// 1. `enqueue()` - add to the back
/// 2. `activate_next()` - move the front job into the active slot
/// 3. `complete_active()` - clear the slot (completed, failed or cancelled)
///
/// `activate_next()` returns `None` while a job is active, so two jobs can
/// never be active at once.
#[derive(Debug)]
pub struct JobQueue {
    /// Maximum number of jobs (queued + active).
    capacity: usize,
    /// Jobs waiting to run.
    queue: VecDeque<QueuedJob>,
    /// Job currently running.
    active: Option<QueuedJob>,
}

impl JobQueue {
    /// Create a queue with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            queue: VecDeque::new(),
            active: None,
        }
    }

    /// Append a job and return its ID.
    pub fn enqueue(&mut self, job: SyncJob) -> Result<JobId, QueueError> {
        if self.total_count() >= self.capacity {
            return Err(QueueError::Full {
                capacity: self.capacity,
            });
        }
        let queued = QueuedJob::new(job);
        let id = queued.id;
        self.queue.push_back(queued);
        Ok(id)
    }

    /// Promote the front job if nothing is active.
    pub fn activate_next(&mut self) -> Option<QueuedJob> {
        if self.active.is_some() {
            return None;
        }
        let next = self.queue.pop_front()?;
        self.active = Some(next.clone());
        Some(next)
    }

    /// Release the active slot. Returns the job that was active.
    pub fn complete_active(&mut self) -> Option<QueuedJob> {
        self.active.take()
    }

    /// Remove a job that has not started yet.
    pub fn remove_queued(&mut self, id: &JobId) -> Option<QueuedJob> {
        let pos = self.queue.iter().position(|q| q.id == *id)?;
        self.queue.remove(pos)
    }

    /// The running job, if any.
    pub fn active(&self) -> Option<&QueuedJob> {
        self.active.as_ref()
    }

    /// Check whether `id` is the running job.
    pub fn is_active(&self, id: &JobId) -> bool {
        self.active.as_ref().is_some_and(|a| a.id == *id)
    }

    /// Check whether `id` is waiting in the queue.
    pub fn is_queued(&self, id: &JobId) -> bool {
        self.queue.iter().any(|q| q.id == *id)
    }

    /// Take every queued job (not the active one), in order.
    pub fn drain(&mut self) -> Vec<QueuedJob> {
        self.queue.drain(..).collect()
    }

    /// Number of jobs waiting (not including the active one).
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Check if nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Total number of jobs (queued + active).
    pub fn total_count(&self) -> usize {
        self.queue.len() + usize::from(self.active.is_some())
    }

    /// Queue capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}
