//! The per-application engine: admission, dispatch, pool sizing, garbage
//! collection, and lifecycle.
//!
//! One loop task per engine owns all I/O and all state-machine transitions.
//! Producers interact only through [`Engine::enqueue`] and [`Engine::stop`],
//! both of which take the engine mutex briefly and signal the loop through
//! an async notification. Queue and pool are mutated under that single
//! mutex, so a slave's busy-to-idle transition and the decision about the
//! current head-of-queue job are atomic with respect to producers.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::Manifest;
use crate::error::Result;
use crate::pool::slave::Slave;
use crate::pool::{Pool, SpawnContext, Spawner};
use crate::rpc::bus::{Bus, BusHandle};
use crate::rpc::codec::Envelope;
use crate::rpc::{codes, RpcMessage};
use crate::scheduler::{Job, JobQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Running,
    Stopping,
}

impl EngineState {
    pub fn name(&self) -> &'static str {
        match self {
            EngineState::Running => "running",
            EngineState::Stopping => "stopping",
            EngineState::Stopped => "stopped",
        }
    }
}

/// Introspection snapshot; queue and pool figures are present only while
/// the engine is running.
#[derive(Debug, Serialize)]
pub struct EngineInfo {
    pub state: &'static str,
    #[serde(rename = "queue-depth", skip_serializing_if = "Option::is_none")]
    pub queue_depth: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slaves: Option<SlaveCounts>,
}

#[derive(Debug, Serialize)]
pub struct SlaveCounts {
    pub total: usize,
    pub busy: usize,
}

struct Shared {
    state: EngineState,
    queue: JobQueue,
    pool: Pool,
}

/// The scheduler for one application.
pub struct Engine {
    manifest: Arc<Manifest>,
    endpoint: PathBuf,
    shared: Arc<Mutex<Shared>>,
    notify: Arc<Notify>,
    event_loop: Option<EventLoop>,
    loop_handle: Option<JoinHandle<EventLoop>>,
}

impl Engine {
    /// Bind the bus endpoint at `<ipc_path>/<manifest name>` and assemble a
    /// stopped engine. Endpoint problems are configuration errors, fatal to
    /// this engine.
    pub fn new(ipc_path: &Path, manifest: Manifest, spawner: Arc<dyn Spawner>) -> Result<Self> {
        std::fs::create_dir_all(ipc_path).map_err(|e| {
            crate::error::SlipwayError::Configuration(format!(
                "unable to create the ipc directory {}: {}",
                ipc_path.display(),
                e
            ))
        })?;

        let endpoint = ipc_path.join(&manifest.name);
        let bus = Bus::bind(&endpoint)?;
        let bus_handle = bus.handle();

        let manifest = Arc::new(manifest);
        let shared = Arc::new(Mutex::new(Shared {
            state: EngineState::Stopped,
            queue: JobQueue::new(manifest.policy.queue_limit),
            pool: Pool::new(),
        }));
        let notify = Arc::new(Notify::new());

        let event_loop = EventLoop {
            manifest: manifest.clone(),
            shared: shared.clone(),
            notify: notify.clone(),
            bus,
            bus_handle,
            spawner,
            spawn_ctx: SpawnContext {
                app: manifest.name.clone(),
                endpoint: endpoint.clone(),
            },
        };

        Ok(Self {
            manifest,
            endpoint,
            shared,
            notify,
            event_loop: Some(event_loop),
            loop_handle: None,
        })
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// The bus endpoint workers attach to.
    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    /// Transition `stopped -> running` and launch the loop task. A no-op in
    /// any other state. Must be called within a tokio runtime.
    pub fn start(&mut self) {
        let event_loop = {
            let mut shared = self.shared.lock().expect("engine state poisoned");
            if shared.state != EngineState::Stopped {
                return;
            }
            let Some(event_loop) = self.event_loop.take() else {
                return;
            };
            shared.state = EngineState::Running;
            event_loop
        };

        tracing::info!(app = %self.manifest.name, "Starting the engine");
        self.loop_handle = Some(tokio::spawn(event_loop.run()));
    }

    /// Submit a job. Admission is checked under the engine mutex; refusals
    /// surface through the job's response sink as resource errors, and the
    /// producer is never blocked beyond the mutex.
    pub fn enqueue(&self, job: Arc<Job>) {
        let mut shared = self.lock();

        if shared.state != EngineState::Running {
            tracing::debug!(
                event = %job.event,
                "Dropping an incomplete job due to an inactive engine"
            );
            job.process_error(codes::RESOURCE_ERROR, "engine is not active");
            return;
        }

        if shared.queue.is_full() {
            tracing::debug!(
                event = %job.event,
                "Dropping an incomplete job due to a full queue"
            );
            job.process_error(codes::RESOURCE_ERROR, "the queue is full");
            return;
        }

        shared.queue.push(job);
        self.notify.notify_one();
    }

    /// Transition `running -> stopping`, wake the loop, and join it. The
    /// loop drains the queue with resource errors, multicasts terminate,
    /// and unwinds; re-entrant calls are no-ops apart from the join.
    pub async fn stop(&mut self) {
        {
            let mut shared = self.lock();
            if shared.state == EngineState::Running {
                tracing::info!(app = %self.manifest.name, "Stopping the engine");
                shared.state = EngineState::Stopping;
                self.notify.notify_one();
            }
        }

        if let Some(handle) = self.loop_handle.take() {
            tracing::debug!("Reaping the loop task");
            match handle.await {
                Ok(event_loop) => self.event_loop = Some(event_loop),
                Err(e) => tracing::error!(error = %e, "Engine loop task failed"),
            }
        }
    }

    /// A consistent snapshot of the engine, taken under one mutex
    /// acquisition. Safe to call concurrently with `enqueue`.
    pub fn info(&self) -> EngineInfo {
        let shared = self.lock();
        let running = shared.state == EngineState::Running;
        EngineInfo {
            state: shared.state.name(),
            queue_depth: running.then(|| shared.queue.len()),
            slaves: running.then(|| SlaveCounts {
                total: shared.pool.len(),
                busy: shared.pool.busy_count(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().expect("engine state poisoned")
    }
}

/// The loop half of the engine, owned by its task while running and handed
/// back on unwind so the engine can be restarted.
struct EventLoop {
    manifest: Arc<Manifest>,
    shared: Arc<Mutex<Shared>>,
    notify: Arc<Notify>,
    bus: Bus,
    bus_handle: BusHandle,
    spawner: Arc<dyn Spawner>,
    spawn_ctx: SpawnContext,
}

impl EventLoop {
    async fn run(mut self) -> Self {
        self.bus.start();

        let mut gc = tokio::time::interval(Duration::from_millis(self.manifest.tuning.gc_interval_ms));
        gc.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let bulk = self.manifest.tuning.io_bulk_size;
        let mut batch: Vec<Envelope> = Vec::with_capacity(bulk);

        enum Turn {
            Bus,
            Gc,
            Notified,
        }

        loop {
            batch.clear();
            let turn = tokio::select! {
                _ = self.bus.recv_batch(bulk, &mut batch) => Turn::Bus,
                _ = gc.tick() => Turn::Gc,
                _ = self.notify.notified() => Turn::Notified,
            };

            let unwound = match turn {
                Turn::Bus => self.process(&batch),
                Turn::Gc => {
                    self.cleanup();
                    false
                }
                Turn::Notified => {
                    let mut shared = self.lock();
                    self.react(&mut shared)
                }
            };

            if unwound {
                break;
            }
        }

        // Linger-zero: whatever is still queued for delivery is dropped.
        self.bus_handle.clear();
        self
    }

    /// Drain one batch of bus events, advancing the slave machines. Returns
    /// true when the engine unwound (termination).
    fn process(&self, batch: &[Envelope]) -> bool {
        let heartbeat_timeout = Duration::from_millis(self.manifest.policy.heartbeat_timeout_ms);
        let mut shared = self.lock();

        for envelope in batch {
            let opcode = envelope.message.opcode() as u32;
            let Some(slave) = shared.pool.get_mut(&envelope.slave_id) else {
                tracing::warn!(
                    opcode,
                    slave_id = %envelope.slave_id,
                    "Dropping an event from a nonexistent slave"
                );
                continue;
            };

            tracing::debug!(opcode, slave_id = %envelope.slave_id, "Got an event from a slave");

            let mut app_broken = false;
            match &envelope.message {
                RpcMessage::Heartbeat => slave.on_heartbeat(heartbeat_timeout),
                RpcMessage::Terminate => slave.on_terminate(),
                RpcMessage::Chunk { data } => slave.on_chunk(data.clone()),
                RpcMessage::Choke => slave.on_choke(),
                RpcMessage::Error { code, message } => {
                    slave.on_error(*code, message);
                    if *code == codes::SERVER_ERROR {
                        tracing::error!(message = %message, "The app seems to be broken");
                        app_broken = true;
                    }
                }
                RpcMessage::Invoke { .. } => {
                    tracing::warn!(
                        slave_id = %envelope.slave_id,
                        "Dropping an engine-bound invoke from a slave"
                    );
                }
            }

            let idle = slave.is_idle();

            if app_broken {
                // The rest of the drained batch is discarded with the engine.
                self.terminate(&mut shared);
                return true;
            }

            // An idle slave means the queue may be dispatchable again.
            if idle && self.react(&mut shared) {
                return true;
            }
        }

        false
    }

    /// The dispatch pass: pair head-of-queue jobs with idle slaves, growing
    /// the pool when dispatch fails. Returns true when the engine unwound.
    fn react(&self, shared: &mut Shared) -> bool {
        if shared.state == EngineState::Stopping {
            self.terminate(shared);
            return true;
        }

        while let Some(job) = shared.queue.front().cloned() {
            if job.is_terminal() {
                tracing::debug!(
                    event = %job.event,
                    "Dropping a complete job from the queue"
                );
                shared.queue.pop_front();
                continue;
            }

            let invoke = RpcMessage::Invoke {
                event: job.event.clone(),
                request: job.request.clone(),
            };

            match shared.pool.unicast(|s| s.is_idle(), &self.bus_handle, &invoke) {
                Some(id) => {
                    if let Some(slave) = shared.pool.get_mut(&id) {
                        slave.assign(job);
                    }
                    shared.queue.pop_front();
                }
                None => {
                    // No instant scheduling. Maybe grow, then wait for the
                    // new slave to announce itself over the bus.
                    if shared
                        .pool
                        .wants_growth(shared.queue.len(), &self.manifest.policy)
                    {
                        tracing::debug!(pool = shared.pool.len(), "Enlarging the pool");
                        match self.spawner.spawn(&self.spawn_ctx) {
                            Ok(spawned) => {
                                let timeout = Duration::from_millis(
                                    self.manifest.policy.heartbeat_timeout_ms,
                                );
                                shared.pool.insert(Slave::new(spawned.id, timeout));
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "Unable to spawn more slaves");
                            }
                        }
                    }
                    break;
                }
            }
        }

        false
    }

    /// The periodic GC pass: liveness timeouts, dead-slave recycling, and
    /// queued-job deadline expiry.
    fn cleanup(&self) {
        let mut shared = self.lock();
        let now = Instant::now();

        let died = shared.pool.expire_liveness(now);
        if died > 0 {
            tracing::debug!(count = died, "Declared unresponsive slaves dead");
        }

        let reaped = shared.pool.reap_dead();
        if reaped > 0 {
            tracing::debug!(count = reaped, "Recycled dead slaves");
        }

        let expired: Vec<Arc<Job>> = shared.queue.iter_expired(now).cloned().collect();
        for job in &expired {
            job.process_error(codes::DEADLINE_ERROR, "the job has expired");
        }
        let dropped = shared.queue.drop_terminal();
        if dropped > 0 {
            tracing::debug!(count = dropped, "Dropped expired jobs from the queue");
        }
    }

    /// Loop-task-only: drain the queue with resource errors, order every
    /// alive slave to terminate, clear the pool, and stop.
    fn terminate(&self, shared: &mut Shared) {
        if !shared.queue.is_empty() {
            tracing::debug!(
                count = shared.queue.len(),
                "Dropping incomplete jobs due to the engine shutdown"
            );
            while let Some(job) = shared.queue.pop_front() {
                job.process_error(codes::RESOURCE_ERROR, "engine is not active");
            }
        }

        shared
            .pool
            .multicast(|s| s.is_alive(), &self.bus_handle, &RpcMessage::Terminate);
        shared.pool.clear();

        shared.state = EngineState::Stopped;
        tracing::info!(app = %self.manifest.name, "Engine stopped");
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().expect("engine state poisoned")
    }
}
