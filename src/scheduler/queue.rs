use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use crate::scheduler::job::Job;

/// The pending-job queue: urgent jobs enter at the front, normal jobs at the
/// back, FIFO within each priority. The capacity bound is enforced by the
/// engine's admission check, urgent jobs included.
pub struct JobQueue {
    jobs: VecDeque<Arc<Job>>,
    limit: usize,
}

impl JobQueue {
    pub fn new(limit: usize) -> Self {
        Self {
            jobs: VecDeque::new(),
            limit,
        }
    }

    /// Insert a job according to its urgency and emit the positional
    /// enqueue event (head position is 1).
    pub fn push(&mut self, job: Arc<Job>) {
        if job.policy.urgent {
            self.jobs.push_front(job);
            self.jobs[0].process_enqueue(1);
        } else {
            self.jobs.push_back(job);
            let position = self.jobs.len();
            self.jobs[position - 1].process_enqueue(position);
        }
    }

    pub fn front(&self) -> Option<&Arc<Job>> {
        self.jobs.front()
    }

    pub fn pop_front(&mut self) -> Option<Arc<Job>> {
        self.jobs.pop_front()
    }

    /// Queued jobs whose deadline has passed. Restartable: each call scans
    /// the current queue contents.
    pub fn iter_expired(&self, now: Instant) -> impl Iterator<Item = &Arc<Job>> {
        self.jobs
            .iter()
            .filter(move |job| matches!(job.policy.deadline, Some(deadline) if deadline <= now))
    }

    /// Drop every job already in a terminal state (expired or cancelled).
    /// Returns the number removed.
    pub fn drop_terminal(&mut self) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|job| !job.is_terminal());
        before - self.jobs.len()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.jobs.len() >= self.limit
    }
}
