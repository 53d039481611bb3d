use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use slipway::config::Manifest;
use slipway::engine::Engine;
use slipway::pool::cgroup::{CgroupGuard, NullGuard, ResourceGuard};
use slipway::pool::spawner::ProcessSpawner;
use slipway::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "slipway")]
#[command(about = "A per-application job engine with a pool of worker processes")]
struct Args {
    /// Path to the application manifest (JSON)
    #[arg(long)]
    manifest: PathBuf,

    /// Directory for the engine's bus socket
    #[arg(long, default_value = "/tmp/slipway")]
    ipc_dir: PathBuf,

    /// Worker executable to spawn for this application
    #[arg(long)]
    worker: PathBuf,

    /// Extra arguments passed to every worker, before the identity flags
    #[arg(long = "worker-arg")]
    worker_args: Vec<String>,

    /// Root of the cgroup hierarchy used for resource limits
    #[arg(long, default_value = "/sys/fs/cgroup")]
    cgroup_root: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let manifest = Manifest::load(&args.manifest)?;

    let guard: Arc<dyn ResourceGuard> = if manifest.resource_limits.is_empty() {
        Arc::new(NullGuard)
    } else {
        Arc::new(CgroupGuard::create(
            &manifest.name,
            &manifest.resource_limits,
            &args.cgroup_root,
        )?)
    };

    let spawner = Arc::new(ProcessSpawner::new(
        args.worker,
        args.worker_args,
        guard,
    ));

    tracing::info!(
        app = %manifest.name,
        queue_limit = manifest.policy.queue_limit,
        pool_limit = manifest.policy.pool_limit,
        "Starting slipway"
    );

    let mut engine = Engine::new(&args.ipc_dir, manifest, spawner)?;
    engine.start();

    let shutdown = install_shutdown_handler();
    shutdown.cancelled().await;

    engine.stop().await;
    Ok(())
}
