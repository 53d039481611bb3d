//! Shared helpers for the integration tests: a fast-ticking manifest, a
//! recording spawner, a collecting response sink, and a scripted worker
//! speaking the real wire protocol over a real unix socket.

// Each integration test binary compiles its own copy; not every binary
// uses every helper.
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use slipway::config::{Manifest, Policy, Tuning};
use slipway::pool::spawner::{SpawnContext, SpawnError, SpawnedSlave, Spawner};
use slipway::rpc::RpcMessage;
use slipway::scheduler::ResponseSink;
use slipway::worker::WorkerSession;

/// A manifest with millisecond-scale GC and liveness so timing scenarios
/// finish fast.
pub fn test_manifest(name: &str, policy: Policy) -> Manifest {
    Manifest::new(name).with_policy(policy).with_tuning(Tuning {
        io_bulk_size: 100,
        gc_interval_ms: 50,
    })
}

pub fn test_policy() -> Policy {
    Policy {
        queue_limit: 10,
        pool_limit: 4,
        grow_threshold: 1,
        heartbeat_timeout_ms: 5_000,
    }
}

/// Poll until the condition holds or five seconds pass.
pub async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Chunk(Bytes),
    Error { code: u32, message: String },
    Close,
}

/// Response sink that records everything the engine writes to it.
#[derive(Clone, Default)]
pub struct CollectingSink {
    events: Arc<Mutex<Vec<SinkEvent>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn error_code(&self) -> Option<u32> {
        self.events().iter().find_map(|e| match e {
            SinkEvent::Error { code, .. } => Some(*code),
            _ => None,
        })
    }

    pub fn error_message(&self) -> Option<String> {
        self.events().iter().find_map(|e| match e {
            SinkEvent::Error { message, .. } => Some(message.clone()),
            _ => None,
        })
    }

    pub fn closed(&self) -> bool {
        self.events().iter().any(|e| matches!(e, SinkEvent::Close))
    }

    pub fn is_terminal(&self) -> bool {
        self.closed() || self.error_code().is_some()
    }
}

impl ResponseSink for CollectingSink {
    fn chunk(&self, data: Bytes) {
        self.events.lock().unwrap().push(SinkEvent::Chunk(data));
    }

    fn error(&self, code: u32, message: &str) {
        self.events.lock().unwrap().push(SinkEvent::Error {
            code,
            message: message.to_string(),
        });
    }

    fn close(&self) {
        self.events.lock().unwrap().push(SinkEvent::Close);
    }
}

/// Spawner that records every request. When `fail` is set it refuses,
/// which models "no worker can ever become idle".
pub struct RecordingSpawner {
    spawned: Mutex<Vec<Uuid>>,
    fail: bool,
}

impl RecordingSpawner {
    pub fn new() -> Self {
        Self {
            spawned: Mutex::new(Vec::new()),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            spawned: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.lock().unwrap().len()
    }

    pub fn spawned_ids(&self) -> Vec<Uuid> {
        self.spawned.lock().unwrap().clone()
    }
}

impl Spawner for RecordingSpawner {
    fn spawn(&self, _ctx: &SpawnContext) -> Result<SpawnedSlave, SpawnError> {
        if self.fail {
            return Err(SpawnError::Other("spawning is disabled".to_string()));
        }
        let id = Uuid::new_v4();
        self.spawned.lock().unwrap().push(id);
        Ok(SpawnedSlave { id, pid: None })
    }
}

#[derive(Debug)]
pub enum WorkerReply {
    Chunk(Bytes),
    Choke,
    Error { code: u32, message: String },
}

/// An in-process worker driven by the test: it heartbeats on a fixed
/// cadence, reports received invokes, and answers only when told to.
pub struct TestWorker {
    invokes: mpsc::UnboundedReceiver<String>,
    replies: mpsc::UnboundedSender<WorkerReply>,
    terminated: Arc<AtomicBool>,
    #[allow(dead_code)]
    handle: JoinHandle<()>,
}

impl TestWorker {
    pub fn spawn(endpoint: PathBuf, id: Uuid, heartbeat_every: Duration) -> Self {
        let (invokes_tx, invokes) = mpsc::unbounded_channel();
        let (replies, replies_rx) = mpsc::unbounded_channel();
        let terminated = Arc::new(AtomicBool::new(false));

        let flag = terminated.clone();
        let handle = tokio::spawn(async move {
            run_worker(endpoint, id, heartbeat_every, invokes_tx, replies_rx, flag).await;
        });

        Self {
            invokes,
            replies,
            terminated,
            handle,
        }
    }

    /// The event name of the next invoke this worker receives.
    pub async fn next_invoke(&mut self) -> String {
        tokio::time::timeout(Duration::from_secs(5), self.invokes.recv())
            .await
            .expect("timed out waiting for an invoke")
            .expect("worker task ended")
    }

    pub fn reply(&self, reply: WorkerReply) {
        self.replies.send(reply).expect("worker task ended");
    }

    pub fn was_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

enum Action {
    Heartbeat,
    Reply(Option<WorkerReply>),
    Message(Option<RpcMessage>),
}

async fn run_worker(
    endpoint: PathBuf,
    id: Uuid,
    heartbeat_every: Duration,
    invokes_tx: mpsc::UnboundedSender<String>,
    mut replies_rx: mpsc::UnboundedReceiver<WorkerReply>,
    terminated: Arc<AtomicBool>,
) {
    let mut session = WorkerSession::connect(&endpoint, id)
        .await
        .expect("worker could not attach to the bus");

    // The first tick fires immediately and doubles as the announce.
    let mut heartbeat = tokio::time::interval(heartbeat_every);

    loop {
        let action = tokio::select! {
            _ = heartbeat.tick() => Action::Heartbeat,
            reply = replies_rx.recv() => Action::Reply(reply),
            message = session.recv() => match message {
                Ok(message) => Action::Message(message),
                Err(_) => Action::Message(None),
            },
        };

        match action {
            Action::Heartbeat => {
                if session.heartbeat().await.is_err() {
                    break;
                }
            }
            Action::Reply(Some(WorkerReply::Chunk(data))) => {
                if session.chunk(data).await.is_err() {
                    break;
                }
            }
            Action::Reply(Some(WorkerReply::Choke)) => {
                if session.choke().await.is_err() {
                    break;
                }
            }
            Action::Reply(Some(WorkerReply::Error { code, message })) => {
                if session.error(code, message).await.is_err() {
                    break;
                }
            }
            Action::Reply(None) => break,
            Action::Message(Some(RpcMessage::Invoke { event, .. })) => {
                let _ = invokes_tx.send(event);
            }
            Action::Message(Some(RpcMessage::Terminate)) => {
                terminated.store(true, Ordering::SeqCst);
                break;
            }
            Action::Message(Some(_)) => {}
            Action::Message(None) => break,
        }
    }
}
