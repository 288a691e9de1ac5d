pub mod docker;
pub mod process;
pub mod sink;

pub use sink::OutputSink;

use crate::config::VmmsConfig;
use crate::jobs::InputFile;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// One execution environment, as tracked by the preallocator and the worker
/// that currently owns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Machine {
    pub id: u32,
    pub image: String,
    pub name: String,
    /// When false at release time the environment is destroyed instead of
    /// being returned to its pool.
    pub keep_alive: bool,
}

impl Machine {
    pub fn new(prefix: &str, id: u32, image: &str, keep_alive: bool) -> Self {
        Self {
            id,
            image: image.to_string(),
            name: instance_name(prefix, id, image),
            keep_alive,
        }
    }

    /// Inverse of [`instance_name`], used when reconciling against the
    /// driver's inventory on startup.
    pub fn parse_name(name: &str, prefix: &str) -> Option<(u32, String)> {
        let rest = name.strip_prefix(prefix)?.strip_prefix('-')?;
        let (id, image) = rest.split_once('-')?;
        let id = id.parse().ok()?;
        if image.is_empty() {
            return None;
        }
        Some((id, image.to_string()))
    }
}

/// Always construct instance names through this function so the inventory
/// stays parseable.
pub fn instance_name(prefix: &str, id: u32, image: &str) -> String {
    format!("{}-{}-{}", prefix, id, image)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    /// The build command ran to completion (its exit status may still be
    /// non-zero; that is the requester's concern, not ours).
    Normal,
    /// The run exceeded the job's time budget; partial output was kept.
    Timeout,
    /// The environment or the process died under us.
    Killed,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub exit_code: Option<i64>,
    pub outcome: RunOutcome,
}

/// Capability set every execution-environment driver implements. Drivers are
/// safe for concurrent calls on distinct machines; calls on one machine are
/// serialised by its owning worker.
#[async_trait]
pub trait VmmsDriver: Send + Sync {
    /// Create the environment. On return it is reachable but not necessarily
    /// ready to accept commands; see [`VmmsDriver::wait_vm`].
    async fn initialize_vm(&self, vm: &Machine) -> Result<()>;

    /// Poll until the environment accepts commands, up to `max_secs`.
    async fn wait_vm(&self, vm: &Machine, max_secs: u64) -> Result<()>;

    async fn copy_in(&self, vm: &Machine, files: &[InputFile]) -> Result<()>;

    /// Run `make` where the inputs were copied, streaming combined
    /// stdout+stderr into `sink` and enforcing the time budget.
    async fn run_job(
        &self,
        vm: &Machine,
        timeout_secs: u64,
        sink: &mut OutputSink,
    ) -> Result<RunReport>;

    /// Copy the captured run output to `dest` on this host.
    async fn copy_out(&self, vm: &Machine, dest: &Path) -> Result<()>;

    /// Tear the environment down. Must be idempotent.
    async fn destroy_vm(&self, vm: &Machine) -> Result<()>;

    /// Destroy, retrying for a bounded period if the environment resists.
    async fn safe_destroy_vm(&self, vm: &Machine) -> Result<()>;

    /// Enumerate environments this driver knows about (startup
    /// reconciliation).
    async fn get_vms(&self) -> Result<Vec<Machine>>;

    async fn exists_vm(&self, vm: &Machine) -> Result<bool>;

    /// Images the driver can instantiate; submissions are validated against
    /// this list.
    async fn get_images(&self) -> Result<Vec<String>>;
}

/// Factory keyed by driver name.
pub async fn create_driver(config: &VmmsConfig) -> Result<Arc<dyn VmmsDriver>> {
    let prefix = config.instance_prefix.clone();
    match config.driver.as_str() {
        "docker" => {
            let docker_config = config.docker.clone().unwrap_or_default();
            Ok(Arc::new(
                docker::DockerVmms::new(docker_config, prefix).await?,
            ))
        }
        "process" => {
            let process_config = config.process.clone().unwrap_or_default();
            Ok(Arc::new(process::ProcessVmms::new(process_config, prefix)?))
        }
        other => anyhow::bail!("unknown vmms driver: {}", other),
    }
}
