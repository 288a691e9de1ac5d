use super::{Machine, OutputSink, RunOutcome, RunReport, VmmsDriver};
use crate::config::ProcessConfig;
use crate::jobs::InputFile;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

const CAPTURE_FILE: &str = "output.log";

/// Host-process driver: every "environment" is a scratch directory under the
/// configured work dir and the build command runs as a child process. No
/// isolation beyond the directory; meant for deployments without a container
/// engine and for the test suites.
pub struct ProcessVmms {
    config: ProcessConfig,
    instance_prefix: String,
}

impl ProcessVmms {
    pub fn new(config: ProcessConfig, instance_prefix: String) -> Result<Self> {
        std::fs::create_dir_all(&config.work_dir).with_context(|| {
            format!("Failed to create work dir {}", config.work_dir.display())
        })?;
        Ok(Self {
            config,
            instance_prefix,
        })
    }

    fn dir(&self, vm: &Machine) -> PathBuf {
        self.config.work_dir.join(&vm.name)
    }
}

#[async_trait]
impl VmmsDriver for ProcessVmms {
    async fn initialize_vm(&self, vm: &Machine) -> Result<()> {
        fs::create_dir_all(self.dir(vm)).await?;
        tracing::info!(vm = %vm.name, "work dir created");
        Ok(())
    }

    async fn wait_vm(&self, vm: &Machine, _max_secs: u64) -> Result<()> {
        let dir = self.dir(vm);
        if !fs::try_exists(&dir).await? {
            anyhow::bail!("work dir {} is gone", dir.display());
        }
        Ok(())
    }

    async fn copy_in(&self, vm: &Machine, files: &[InputFile]) -> Result<()> {
        let dir = self.dir(vm);

        for file in files {
            let dest = dir.join(&file.dest_file);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::copy(&file.local_file, &dest).await.with_context(|| {
                format!(
                    "Failed to copy {} to {}",
                    file.local_file.display(),
                    dest.display()
                )
            })?;
        }

        Ok(())
    }

    async fn run_job(
        &self,
        vm: &Machine,
        timeout_secs: u64,
        sink: &mut OutputSink,
    ) -> Result<RunReport> {
        let dir = self.dir(vm);

        let mut child = Command::new("sh")
            .args(["-c", "make 2>&1"])
            .current_dir(&dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to spawn make")?;

        let mut stdout = child.stdout.take().context("child stdout missing")?;

        let pump = async {
            let mut buf = [0u8; 8192];
            loop {
                let n = stdout.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                sink.write(&buf[..n]);
            }
            let status = child.wait().await?;
            Ok::<_, anyhow::Error>(status)
        };

        let report = match tokio::time::timeout(Duration::from_secs(timeout_secs), pump).await {
            Ok(Ok(status)) => RunReport {
                exit_code: status.code().map(i64::from),
                outcome: if status.code().is_some() {
                    RunOutcome::Normal
                } else {
                    RunOutcome::Killed
                },
            },
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                tracing::warn!(vm = %vm.name, timeout_secs, "run exceeded time budget, killing process");
                child.kill().await.ok();
                RunReport {
                    exit_code: None,
                    outcome: RunOutcome::Timeout,
                }
            }
        };

        fs::write(dir.join(CAPTURE_FILE), sink.bytes()).await?;
        Ok(report)
    }

    async fn copy_out(&self, vm: &Machine, dest: &Path) -> Result<()> {
        let capture = self.dir(vm).join(CAPTURE_FILE);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(&capture, dest).await.with_context(|| {
            format!(
                "Failed to copy captured output {} to {}",
                capture.display(),
                dest.display()
            )
        })?;
        Ok(())
    }

    async fn destroy_vm(&self, vm: &Machine) -> Result<()> {
        match fs::remove_dir_all(self.dir(vm)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("Failed to remove work dir"),
        }
    }

    async fn safe_destroy_vm(&self, vm: &Machine) -> Result<()> {
        self.destroy_vm(vm).await
    }

    async fn get_vms(&self) -> Result<Vec<Machine>> {
        let mut machines = Vec::new();
        let mut entries = fs::read_dir(&self.config.work_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some((id, image)) = Machine::parse_name(&name, &self.instance_prefix) {
                machines.push(Machine {
                    id,
                    image,
                    name,
                    keep_alive: true,
                });
            }
        }

        Ok(machines)
    }

    async fn exists_vm(&self, vm: &Machine) -> Result<bool> {
        Ok(fs::try_exists(self.dir(vm)).await?)
    }

    async fn get_images(&self) -> Result<Vec<String>> {
        Ok(self.config.images.clone())
    }
}
