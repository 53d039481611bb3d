use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use uuid::Uuid;

use crate::rpc::codes;
use crate::scheduler::Job;

/// A worker's lifecycle state. `Alive` nests the dispatch-relevant half:
/// idle slaves are eligible for work, busy slaves carry exactly one job.
/// `Dead` is terminal; the GC reaps dead slaves from the pool.
#[derive(Debug)]
pub enum SlaveState {
    Alive(AliveState),
    Dead,
}

#[derive(Debug)]
pub enum AliveState {
    Idle,
    Busy(Arc<Job>),
}

/// Engine-side record of one worker process, driven by bus events.
pub struct Slave {
    id: Uuid,
    spawned_at: Instant,
    heartbeat_deadline: Instant,
    state: SlaveState,
}

impl Slave {
    /// A fresh slave starts idle with a full liveness budget; its process
    /// must attach and heartbeat before the budget runs out.
    pub fn new(id: Uuid, heartbeat_timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            id,
            spawned_at: now,
            heartbeat_deadline: now + heartbeat_timeout,
            state: SlaveState::Alive(AliveState::Idle),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn spawned_at(&self) -> Instant {
        self.spawned_at
    }

    pub fn is_alive(&self) -> bool {
        matches!(self.state, SlaveState::Alive(_))
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, SlaveState::Alive(AliveState::Idle))
    }

    pub fn is_busy(&self) -> bool {
        matches!(self.state, SlaveState::Alive(AliveState::Busy(_)))
    }

    pub fn is_dead(&self) -> bool {
        matches!(self.state, SlaveState::Dead)
    }

    /// Bump the liveness deadline.
    pub fn on_heartbeat(&mut self, heartbeat_timeout: Duration) {
        if self.is_alive() {
            self.heartbeat_deadline = Instant::now() + heartbeat_timeout;
        }
    }

    /// Hand a job to an idle slave. Returns false (and leaves the job
    /// untouched) unless the slave is idle.
    pub fn assign(&mut self, job: Arc<Job>) -> bool {
        match self.state {
            SlaveState::Alive(AliveState::Idle) => {
                job.process_invoke();
                self.state = SlaveState::Alive(AliveState::Busy(job));
                true
            }
            _ => false,
        }
    }

    pub fn on_chunk(&mut self, data: Bytes) {
        match &self.state {
            SlaveState::Alive(AliveState::Busy(job)) => job.process_chunk(data),
            SlaveState::Alive(AliveState::Idle) => {
                tracing::warn!(slave_id = %self.id, "Dropping a chunk from an idle slave");
            }
            SlaveState::Dead => {}
        }
    }

    /// The worker reported a job failure; the slave returns to idle.
    pub fn on_error(&mut self, code: u32, message: &str) {
        match std::mem::replace(&mut self.state, SlaveState::Dead) {
            SlaveState::Alive(AliveState::Busy(job)) => {
                job.process_error(code, message);
                self.state = SlaveState::Alive(AliveState::Idle);
            }
            SlaveState::Alive(AliveState::Idle) => {
                tracing::warn!(slave_id = %self.id, code, "Dropping an error from an idle slave");
                self.state = SlaveState::Alive(AliveState::Idle);
            }
            SlaveState::Dead => {}
        }
    }

    /// The worker signalled the end of the response; the slave returns to
    /// idle.
    pub fn on_choke(&mut self) {
        match std::mem::replace(&mut self.state, SlaveState::Dead) {
            SlaveState::Alive(AliveState::Busy(job)) => {
                job.process_choke();
                self.state = SlaveState::Alive(AliveState::Idle);
            }
            SlaveState::Alive(AliveState::Idle) => {
                tracing::warn!(slave_id = %self.id, "Dropping a choke from an idle slave");
                self.state = SlaveState::Alive(AliveState::Idle);
            }
            SlaveState::Dead => {}
        }
    }

    /// Termination, engine- or peer-initiated. Any in-flight job fails with
    /// a resource error.
    pub fn on_terminate(&mut self) {
        self.die("the worker has been terminated");
    }

    /// The GC-driven timeout event: past the liveness deadline the slave is
    /// declared dead. Returns true if it died on this call.
    pub fn expire(&mut self, now: Instant) -> bool {
        if self.is_alive() && self.heartbeat_deadline <= now {
            self.die("the worker has timed out");
            true
        } else {
            false
        }
    }

    fn die(&mut self, reason: &str) {
        match std::mem::replace(&mut self.state, SlaveState::Dead) {
            SlaveState::Alive(AliveState::Busy(job)) => {
                job.process_error(codes::RESOURCE_ERROR, reason);
            }
            SlaveState::Alive(AliveState::Idle) | SlaveState::Dead => {}
        }
    }
}
