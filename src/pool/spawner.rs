use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use crate::pool::cgroup::ResourceGuard;

#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("unable to launch the worker: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Everything a spawner needs to know about the engine it spawns for.
#[derive(Debug, Clone)]
pub struct SpawnContext {
    /// Application name from the manifest.
    pub app: String,
    /// The engine's bus endpoint the worker must attach to.
    pub endpoint: PathBuf,
}

/// Result of a successful spawn: the fresh slave id, and the pid when an
/// actual process was started.
#[derive(Debug, Clone)]
pub struct SpawnedSlave {
    pub id: Uuid,
    pub pid: Option<u32>,
}

/// Opaque "create a worker with identity X" capability the engine depends
/// on. Spawn failures are logged and swallowed by the dispatch pass; the
/// queue keeps its jobs.
pub trait Spawner: Send + Sync {
    fn spawn(&self, ctx: &SpawnContext) -> Result<SpawnedSlave, SpawnError>;
}

/// Launches a worker executable, handing it its identity and the bus
/// endpoint on the command line, and attaches the child to the engine's
/// resource guard.
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<String>,
    guard: Arc<dyn ResourceGuard>,
}

impl ProcessSpawner {
    pub fn new(program: PathBuf, args: Vec<String>, guard: Arc<dyn ResourceGuard>) -> Self {
        Self {
            program,
            args,
            guard,
        }
    }
}

impl Spawner for ProcessSpawner {
    fn spawn(&self, ctx: &SpawnContext) -> Result<SpawnedSlave, SpawnError> {
        let id = Uuid::new_v4();

        let child = Command::new(&self.program)
            .args(&self.args)
            .arg("--app")
            .arg(&ctx.app)
            .arg("--endpoint")
            .arg(&ctx.endpoint)
            .arg("--uuid")
            .arg(id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        let pid = child.id();
        if let Err(e) = self.guard.attach(pid) {
            tracing::warn!(slave_id = %id, pid, error = %e, "Unable to attach the worker to its resource guard");
        }

        tracing::info!(slave_id = %id, pid, app = %ctx.app, "Worker spawned");
        Ok(SpawnedSlave {
            id,
            pid: Some(pid),
        })
    }
}
