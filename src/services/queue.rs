use std::cmp::Ordering;
use std::collections::BinaryHeap;

use chrono::{DateTime, Utc};

use crate::models::job::{Job, JobId, MAX_PRIORITY};

/// Dispatch key: `(10 - priority, created_at, sequence)` ascending.
///
/// The sequence number keeps FIFO order for jobs stamped with the same instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct DispatchKey {
    inverted_priority: u8,
    created_at: DateTime<Utc>,
    sequence: u64,
}

#[derive(Debug)]
struct QueuedEntry {
    key: DispatchKey,
    job: Job,
}

impl PartialEq for QueuedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for QueuedEntry {}

impl PartialOrd for QueuedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEntry {
    // BinaryHeap is a max-heap; reverse so the smallest key pops first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.key.cmp(&self.key)
    }
}

/// Bounded in-memory priority queue of pending jobs.
#[derive(Debug)]
pub struct JobQueue {
    heap: BinaryHeap<QueuedEntry>,
    capacity: usize,
    sequence: u64,
    total_submitted: u64,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(capacity.min(1024)),
            capacity,
            sequence: 0,
            total_submitted: 0,
        }
    }

    /// Enqueue a job. Fails immediately when the queue is at capacity.
    pub fn enqueue(&mut self, job: Job) -> Result<(), QueueError> {
        if self.heap.len() >= self.capacity {
            return Err(QueueError::Full {
                capacity: self.capacity,
            });
        }

        let key = DispatchKey {
            inverted_priority: MAX_PRIORITY.saturating_sub(job.priority.min(MAX_PRIORITY)),
            created_at: job.created_at,
            sequence: self.sequence,
        };
        self.sequence += 1;
        self.total_submitted += 1;
        self.heap.push(QueuedEntry { key, job });
        Ok(())
    }

    /// Pop the next job in dispatch order.
    pub fn dequeue_highest_priority(&mut self) -> Option<Job> {
        self.heap.pop().map(|entry| entry.job)
    }

    /// Remove a specific job, returning it if it was queued.
    pub fn remove(&mut self, job_id: JobId) -> Option<Job> {
        let mut removed = None;
        let entries = std::mem::take(&mut self.heap).into_vec();
        let mut kept = Vec::with_capacity(entries.len());
        for entry in entries {
            if removed.is_none() && entry.job.job_id == job_id {
                removed = Some(entry.job);
            } else {
                kept.push(entry);
            }
        }
        self.heap = BinaryHeap::from(kept);
        removed
    }

    /// 1-based dispatch position of a queued job.
    pub fn position(&self, job_id: JobId) -> Option<(usize, &Job)> {
        let target = self.heap.iter().find(|entry| entry.job.job_id == job_id)?;
        let ahead = self
            .heap
            .iter()
            .filter(|entry| entry.key < target.key)
            .count();
        Some((ahead + 1, &target.job))
    }

    pub fn contains(&self, job_id: JobId) -> bool {
        self.heap.iter().any(|entry| entry.job.job_id == job_id)
    }

    /// Remove every queued job, returned in dispatch order.
    pub fn drain(&mut self) -> Vec<Job> {
        let mut entries = std::mem::take(&mut self.heap).into_vec();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries.into_iter().map(|entry| entry.job).collect()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Pending jobs as a fraction of capacity.
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 1.0;
        }
        self.heap.len() as f64 / self.capacity as f64
    }

    pub fn total_submitted(&self) -> u64 {
        self.total_submitted
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Processing queue is full (capacity {capacity})")]
    Full { capacity: usize },
}
