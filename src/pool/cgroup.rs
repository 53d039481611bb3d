//! Optional resource-limit capability for worker processes.
//!
//! The manifest's `resource-limits` tree maps a cgroup controller name to a
//! map of parameter name -> scalar. [`CgroupGuard`] materializes one group
//! per controller under `/sys/fs/cgroup`, attaches worker pids to it, and
//! removes the groups on drop. When no limits are configured, [`NullGuard`]
//! stands in.

use std::io;
use std::path::PathBuf;

use serde_json::Value;

/// Capability object the spawner uses to confine worker processes.
pub trait ResourceGuard: Send + Sync {
    fn attach(&self, pid: u32) -> io::Result<()>;
}

/// No resource limits configured.
pub struct NullGuard;

impl ResourceGuard for NullGuard {
    fn attach(&self, _pid: u32) -> io::Result<()> {
        Ok(())
    }
}

/// A set of per-controller cgroups created for one engine.
pub struct CgroupGuard {
    groups: Vec<PathBuf>,
}

impl CgroupGuard {
    /// Create the configured groups and write their parameters. Parameters
    /// with non-scalar values are skipped with a warning; a controller
    /// whose group cannot be created fails the whole guard.
    pub fn create(
        name: &str,
        limits: &serde_json::Map<String, Value>,
        root: &std::path::Path,
    ) -> io::Result<Self> {
        let mut groups = Vec::new();

        for (controller, params) in limits {
            let Some(params) = params.as_object() else {
                tracing::warn!(controller = %controller, "Skipping a non-object controller entry");
                continue;
            };
            if params.is_empty() {
                continue;
            }

            let group = root.join(controller).join(name);
            std::fs::create_dir_all(&group)?;
            groups.push(group.clone());

            for (param, value) in params {
                let rendered = match value {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => (*b as u8).to_string(),
                    _ => {
                        tracing::warn!(
                            controller = %controller,
                            param = %param,
                            "Skipping a parameter with an unsupported type"
                        );
                        continue;
                    }
                };

                let path = group.join(param);
                if let Err(e) = std::fs::write(&path, &rendered) {
                    tracing::error!(
                        controller = %controller,
                        param = %param,
                        error = %e,
                        "Unable to set a resource limit"
                    );
                } else {
                    tracing::debug!(
                        controller = %controller,
                        param = %param,
                        value = %rendered,
                        "Resource limit set"
                    );
                }
            }
        }

        Ok(Self { groups })
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

impl ResourceGuard for CgroupGuard {
    fn attach(&self, pid: u32) -> io::Result<()> {
        for group in &self.groups {
            std::fs::write(group.join("cgroup.procs"), pid.to_string())?;
        }
        Ok(())
    }
}

impl Drop for CgroupGuard {
    fn drop(&mut self) {
        for group in &self.groups {
            // Workers may still be terminating, in which case removal fails
            // with "Device or resource busy".
            if let Err(e) = std::fs::remove_dir(group) {
                tracing::error!(group = %group.display(), error = %e, "Unable to delete the control group");
            }
        }
    }
}
