use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TangoConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub vmms: VmmsConfig,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub jobs: JobSettings,
    #[serde(default)]
    pub pool: PoolSettings,
}

impl Default for TangoConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            vmms: VmmsConfig::default(),
            scheduler: SchedulerSettings::default(),
            jobs: JobSettings::default(),
            pool: PoolSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerSettings {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_files_dir")]
    pub files_dir: PathBuf,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Accepted requester keys. Empty means any key is accepted.
    #[serde(default)]
    pub access_keys: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            address: default_address(),
            files_dir: default_files_dir(),
            output_dir: default_output_dir(),
            access_keys: vec![],
        }
    }
}

fn default_address() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_files_dir() -> PathBuf {
    PathBuf::from("/var/lib/tango/files")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("/var/lib/tango/output")
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VmmsConfig {
    #[serde(default = "default_driver")]
    pub driver: String,
    /// Every instance name is `{prefix}-{id}-{image}`; reconciliation parses
    /// this shape back out of the driver's inventory.
    #[serde(default = "default_instance_prefix")]
    pub instance_prefix: String,
    pub docker: Option<DockerConfig>,
    pub process: Option<ProcessConfig>,
}

impl Default for VmmsConfig {
    fn default() -> Self {
        Self {
            driver: default_driver(),
            instance_prefix: default_instance_prefix(),
            docker: Some(DockerConfig::default()),
            process: None,
        }
    }
}

fn default_driver() -> String {
    "docker".to_string()
}

fn default_instance_prefix() -> String {
    "tango".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DockerConfig {
    pub socket_path: Option<String>,
    #[serde(default = "default_network_mode")]
    pub network_mode: String,
    pub cpu_limit: Option<f64>,
    pub memory_limit: Option<u64>,
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
    #[serde(default = "default_security_opts")]
    pub security_opts: Vec<String>,
    #[serde(default = "default_destroy_timeout")]
    pub destroy_timeout_secs: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            network_mode: default_network_mode(),
            cpu_limit: None,
            memory_limit: None,
            scratch_dir: default_scratch_dir(),
            security_opts: default_security_opts(),
            destroy_timeout_secs: default_destroy_timeout(),
        }
    }
}

fn default_network_mode() -> String {
    "none".to_string()
}

fn default_scratch_dir() -> PathBuf {
    PathBuf::from("/var/lib/tango/scratch")
}

fn default_security_opts() -> Vec<String> {
    vec!["no-new-privileges".to_string()]
}

fn default_destroy_timeout() -> u64 {
    15
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProcessConfig {
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Images this driver advertises; every "environment" is a scratch
    /// directory, so any name works as long as submissions use it too.
    #[serde(default = "default_process_images")]
    pub images: Vec<String>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            images: default_process_images(),
        }
    }
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/var/lib/tango/work")
}

fn default_process_images() -> Vec<String> {
    vec!["default".to_string()]
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerSettings {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// How many times a job survives its worker dying before it is failed.
    #[serde(default = "default_job_retries")]
    pub job_retries: u32,
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,
    /// Replacement VMs a worker may burn through while waiting for readiness.
    #[serde(default = "default_ready_retries")]
    pub ready_retries: u32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            job_retries: default_job_retries(),
            ready_timeout_secs: default_ready_timeout(),
            ready_retries: default_ready_retries(),
        }
    }
}

fn default_tick_ms() -> u64 {
    500
}

fn default_job_retries() -> u32 {
    3
}

fn default_ready_timeout() -> u64 {
    60
}

fn default_ready_retries() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobSettings {
    #[serde(default = "default_dead_ring_capacity")]
    pub dead_ring_capacity: usize,
    #[serde(default = "default_max_timeout")]
    pub max_timeout_secs: u64,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default)]
    pub dedupe_include_access_key: bool,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            dead_ring_capacity: default_dead_ring_capacity(),
            max_timeout_secs: default_max_timeout(),
            max_output_bytes: default_max_output_bytes(),
            dedupe_include_access_key: false,
        }
    }
}

fn default_dead_ring_capacity() -> usize {
    1000
}

fn default_max_timeout() -> u64 {
    3600
}

fn default_max_output_bytes() -> usize {
    4 * 1024 * 1024
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolSettings {
    /// Upper bound on |total| for any single image.
    #[serde(default = "default_hard_cap")]
    pub hard_cap: usize,
    #[serde(default = "default_create_retries")]
    pub create_retries: u32,
    #[serde(default)]
    pub images: Vec<PoolImageSettings>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            hard_cap: default_hard_cap(),
            create_retries: default_create_retries(),
            images: vec![],
        }
    }
}

fn default_hard_cap() -> usize {
    32
}

fn default_create_retries() -> u32 {
    3
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolImageSettings {
    pub name: String,
    #[serde(default)]
    pub target: usize,
    #[serde(default = "default_true")]
    pub keep_alive: bool,
}

fn default_true() -> bool {
    true
}

impl TangoConfig {
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: TangoConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
