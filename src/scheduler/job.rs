use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Where the engine writes a job's chunks, errors, and completion. The sink
/// is shared with the producer and is called from the engine's loop task;
/// implementations must be thread-safe.
pub trait ResponseSink: Send + Sync {
    fn chunk(&self, data: Bytes);
    fn error(&self, code: u32, message: &str);
    fn close(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Queued, not yet assigned to a slave.
    Pending,
    /// Assigned to exactly one slave, awaiting the first chunk.
    Dispatched,
    /// At least one chunk received.
    Streaming,
    /// Terminal success, reached on choke.
    Complete,
    /// Terminal failure, reached on error or deadline.
    Failed,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::Dispatched => write!(f, "dispatched"),
            JobState::Streaming => write!(f, "streaming"),
            JobState::Complete => write!(f, "complete"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

/// Scheduling policy attached to a job by its producer.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobPolicy {
    /// Urgent jobs are inserted at the queue head.
    pub urgent: bool,
    /// Monotonic deadline; a job still queued past it fails with a
    /// deadline error on the next GC pass.
    pub deadline: Option<Instant>,
    /// Advisory execution budget, forwarded to workers that honor it. The
    /// engine does not cancel dispatched jobs itself.
    pub timeout: Option<Duration>,
}

impl JobPolicy {
    pub fn urgent() -> Self {
        Self {
            urgent: true,
            ..Self::default()
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// One unit of work: an event name selecting a handler in the worker, an
/// opaque request payload, a policy, and a response sink.
///
/// State lives behind interior mutability: the engine advances jobs from its
/// loop task while producers may drive a job terminal (cancellation) from
/// foreign threads. Terminal states are absorbing; later events are ignored.
pub struct Job {
    pub id: Uuid,
    pub event: String,
    pub request: Bytes,
    pub policy: JobPolicy,
    pub created_at: DateTime<Utc>,
    sink: Box<dyn ResponseSink>,
    state: Mutex<JobState>,
}

impl Job {
    pub fn new(
        event: impl Into<String>,
        request: Bytes,
        policy: JobPolicy,
        sink: Box<dyn ResponseSink>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event: event.into(),
            request,
            policy,
            created_at: Utc::now(),
            sink,
            state: Mutex::new(JobState::Pending),
        }
    }

    pub fn state(&self) -> JobState {
        *self.state.lock().expect("job state poisoned")
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state(), JobState::Complete | JobState::Failed)
    }

    /// Observability event emitted on queue insertion; the state is
    /// unchanged.
    pub fn process_enqueue(&self, position: usize) {
        tracing::debug!(job_id = %self.id, event = %self.event, position, "Job enqueued");
    }

    /// The job has been handed to a slave.
    pub fn process_invoke(&self) {
        let mut state = self.state.lock().expect("job state poisoned");
        if *state == JobState::Pending {
            *state = JobState::Dispatched;
        }
    }

    /// One piece of the response arrived; forwarded to the sink.
    pub fn process_chunk(&self, data: Bytes) {
        {
            let mut state = self.state.lock().expect("job state poisoned");
            match *state {
                JobState::Dispatched | JobState::Streaming => *state = JobState::Streaming,
                _ => return,
            }
        }
        self.sink.chunk(data);
    }

    /// The worker signalled the final chunk; the job completes.
    pub fn process_choke(&self) {
        {
            let mut state = self.state.lock().expect("job state poisoned");
            match *state {
                JobState::Dispatched | JobState::Streaming => *state = JobState::Complete,
                _ => return,
            }
        }
        self.sink.close();
    }

    /// Fail the job from any non-terminal state. Producers use this for
    /// cancellation; the engine skips terminal jobs on the next queue scan.
    pub fn process_error(&self, code: u32, message: &str) {
        {
            let mut state = self.state.lock().expect("job state poisoned");
            match *state {
                JobState::Complete | JobState::Failed => return,
                _ => *state = JobState::Failed,
            }
        }
        tracing::debug!(job_id = %self.id, code, message, "Job failed");
        self.sink.error(code, message);
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("event", &self.event)
            .field("state", &self.state())
            .finish()
    }
}
