use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Result, SlipwayError};

/// Per-application configuration supplied to the engine at construction.
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    pub name: String,
    #[serde(default)]
    pub policy: Policy,
    #[serde(default)]
    pub tuning: Tuning,
    /// Optional cgroup limits: controller name -> parameter name -> scalar.
    #[serde(default, rename = "resource-limits")]
    pub resource_limits: serde_json::Map<String, Value>,
}

/// Admission and pool-sizing policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Policy {
    /// Maximum number of queued jobs; excess submissions are refused.
    pub queue_limit: usize,
    /// Maximum number of worker processes in the pool.
    pub pool_limit: usize,
    /// Pool growth hysteresis: a new worker is spawned only while
    /// `pool.len() * grow_threshold < queue.len() * 2`.
    pub grow_threshold: usize,
    /// A worker missing heartbeats for longer than this is declared dead.
    pub heartbeat_timeout_ms: u64,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            queue_limit: 100,
            pool_limit: 10,
            grow_threshold: 1,
            heartbeat_timeout_ms: 30_000,
        }
    }
}

/// Event-loop tuning knobs. The defaults match the engine this crate
/// descends from; tests shrink the GC cadence to keep timing scenarios fast.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Tuning {
    /// Upper bound on bus messages drained per loop turn.
    pub io_bulk_size: usize,
    /// Cadence of the garbage-collection pass (dead slaves, expired jobs).
    pub gc_interval_ms: u64,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            io_bulk_size: 100,
            gc_interval_ms: 5_000,
        }
    }
}

impl Manifest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            policy: Policy::default(),
            tuning: Tuning::default(),
            resource_limits: serde_json::Map::new(),
        }
    }

    /// Load a manifest from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SlipwayError::Configuration(format!("unable to read {}: {}", path.display(), e))
        })?;
        let manifest: Manifest = serde_json::from_str(&raw).map_err(|e| {
            SlipwayError::Configuration(format!("malformed manifest {}: {}", path.display(), e))
        })?;
        if manifest.name.is_empty() {
            return Err(SlipwayError::Configuration(
                "manifest name must not be empty".to_string(),
            ));
        }
        Ok(manifest)
    }

    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_tuning(mut self, tuning: Tuning) -> Self {
        self.tuning = tuning;
        self
    }
}
