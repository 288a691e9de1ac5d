use super::{Machine, OutputSink, RunOutcome, RunReport, VmmsDriver};
use crate::config::DockerConfig;
use crate::jobs::InputFile;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{CreateImageOptions, ListImagesOptions};
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::time::Instant;

const MOUNT_POINT: &str = "/workspace";
const CAPTURE_FILE: &str = "output.log";

/// Containers as execution environments. Each machine is a long-lived
/// container kept warm with a sleep, with a host scratch directory
/// bind-mounted at [`MOUNT_POINT`]; the build command runs through the exec
/// API so the container survives between jobs of the pool's lifetime.
pub struct DockerVmms {
    docker: Docker,
    config: DockerConfig,
    instance_prefix: String,
}

impl DockerVmms {
    pub async fn new(config: DockerConfig, instance_prefix: String) -> Result<Self> {
        let docker = if let Some(socket) = &config.socket_path {
            Docker::connect_with_socket(socket, 120, bollard::API_DEFAULT_VERSION)
                .context("Failed to connect to Docker socket")?
        } else {
            Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")?
        };

        docker
            .ping()
            .await
            .context("Failed to ping Docker daemon")?;

        fs::create_dir_all(&config.scratch_dir)
            .await
            .with_context(|| {
                format!("Failed to create scratch dir {}", config.scratch_dir.display())
            })?;

        tracing::info!("Connected to Docker daemon");

        Ok(Self {
            docker,
            config,
            instance_prefix,
        })
    }

    fn scratch(&self, vm: &Machine) -> PathBuf {
        self.config.scratch_dir.join(&vm.name)
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        tracing::info!("Pulling Docker image: {}", image);

        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image,
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(result) = stream.next().await {
            result.context("Failed to pull image")?;
        }

        tracing::info!("Image pulled successfully: {}", image);
        Ok(())
    }

    async fn persist_capture(&self, vm: &Machine, sink: &OutputSink) -> Result<()> {
        let path = self.scratch(vm).join(CAPTURE_FILE);
        fs::write(&path, sink.bytes())
            .await
            .with_context(|| format!("Failed to write capture file {}", path.display()))
    }
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait]
impl VmmsDriver for DockerVmms {
    async fn initialize_vm(&self, vm: &Machine) -> Result<()> {
        self.ensure_image(&vm.image)
            .await
            .with_context(|| format!("Image '{}' is not available", vm.image))?;

        let scratch = self.scratch(vm);
        fs::create_dir_all(&scratch).await?;

        let host_config = HostConfig {
            binds: Some(vec![format!("{}:{}", scratch.display(), MOUNT_POINT)]),
            nano_cpus: self.config.cpu_limit.map(|c| (c * 1_000_000_000.0) as i64),
            memory: self.config.memory_limit.map(|m| m as i64),
            network_mode: Some(self.config.network_mode.clone()),
            security_opt: Some(self.config.security_opts.clone()),
            privileged: Some(false),
            ..Default::default()
        };

        let config = Config {
            image: Some(vm.image.clone()),
            // Keep the container warm until a job claims it.
            entrypoint: Some(vec![]),
            cmd: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                "sleep infinity".to_string(),
            ]),
            working_dir: Some(MOUNT_POINT.to_string()),
            host_config: Some(host_config),
            ..Default::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: vm.name.as_str(),
                    platform: None,
                }),
                config,
            )
            .await
            .context("Failed to create container")?;

        // Remove the half-built container if starting it fails.
        let guard = scopeguard::guard((), |_| {
            let docker = self.docker.clone();
            let name = vm.name.clone();
            tokio::spawn(async move {
                let _ = docker
                    .remove_container(
                        &name,
                        Some(RemoveContainerOptions {
                            force: true,
                            v: true,
                            ..Default::default()
                        }),
                    )
                    .await;
            });
        });

        self.docker
            .start_container(&vm.name, None::<StartContainerOptions<String>>)
            .await
            .context("Failed to start container")?;

        scopeguard::ScopeGuard::into_inner(guard);

        tracing::info!(vm = %vm.name, image = %vm.image, "container created");
        Ok(())
    }

    async fn wait_vm(&self, vm: &Machine, max_secs: u64) -> Result<()> {
        let deadline = Instant::now() + Duration::from_secs(max_secs);

        loop {
            match self.docker.inspect_container(&vm.name, None).await {
                Ok(state) => {
                    let running = state
                        .state
                        .as_ref()
                        .and_then(|s| s.running)
                        .unwrap_or(false);
                    if running {
                        return Ok(());
                    }
                }
                Err(e) if is_not_found(&e) => {}
                Err(e) => return Err(e).context("Failed to inspect container"),
            }

            if Instant::now() >= deadline {
                anyhow::bail!("container {} not running within {}s", vm.name, max_secs);
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    async fn copy_in(&self, vm: &Machine, files: &[InputFile]) -> Result<()> {
        let scratch = self.scratch(vm);

        for file in files {
            let dest = scratch.join(&file.dest_file);
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
            tracing::debug!(vm = %vm.name, file = %file.dest_file, "copied in");
        }

        Ok(())
    }

    async fn run_job(
        &self,
        vm: &Machine,
        timeout_secs: u64,
        sink: &mut OutputSink,
    ) -> Result<RunReport> {
        let exec = self
            .docker
            .create_exec(
                &vm.name,
                CreateExecOptions {
                    cmd: Some(vec![
                        "sh".to_string(),
                        "-c".to_string(),
                        format!("cd {} && make", MOUNT_POINT),
                    ]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .context("Failed to create exec")?;

        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .context("Failed to start exec")?;

        let StartExecResults::Attached { mut output, .. } = started else {
            anyhow::bail!("exec for {} started detached", vm.name);
        };

        let stream = async {
            while let Some(msg) = output.next().await {
                match msg {
                    Ok(LogOutput::StdOut { message })
                    | Ok(LogOutput::StdErr { message })
                    | Ok(LogOutput::Console { message }) => sink.write(&message),
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(vm = %vm.name, "error reading exec output: {}", e);
                        break;
                    }
                }
            }
        };

        let timed_out = tokio::time::timeout(Duration::from_secs(timeout_secs), stream)
            .await
            .is_err();

        if timed_out {
            tracing::warn!(vm = %vm.name, timeout_secs, "run exceeded time budget, killing container");
            if let Err(e) = self
                .docker
                .kill_container::<String>(&vm.name, None)
                .await
            {
                tracing::warn!(vm = %vm.name, "failed to kill timed-out container: {}", e);
            }
            self.persist_capture(vm, sink).await?;
            return Ok(RunReport {
                exit_code: None,
                outcome: RunOutcome::Timeout,
            });
        }

        self.persist_capture(vm, sink).await?;

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .context("Failed to inspect exec")?;

        match inspect.exit_code {
            Some(code) => Ok(RunReport {
                exit_code: Some(code),
                outcome: RunOutcome::Normal,
            }),
            None => Ok(RunReport {
                exit_code: None,
                outcome: RunOutcome::Killed,
            }),
        }
    }

    async fn copy_out(&self, vm: &Machine, dest: &Path) -> Result<()> {
        let capture = self.scratch(vm).join(CAPTURE_FILE);
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
        tracing::debug!(vm = %vm.name, dest = %dest.display(), "copied out");
        Ok(())
    }

    async fn destroy_vm(&self, vm: &Machine) -> Result<()> {
        let removed = self
            .docker
            .remove_container(
                &vm.name,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await;

        match removed {
            Ok(()) => {}
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(e).context("Failed to remove container"),
        }

        let scratch = self.scratch(vm);
        match fs::remove_dir_all(&scratch).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to remove scratch {}", scratch.display()))
            }
        }

        tracing::info!(vm = %vm.name, "container destroyed");
        Ok(())
    }

    async fn safe_destroy_vm(&self, vm: &Machine) -> Result<()> {
        let deadline =
            Instant::now() + Duration::from_secs(self.config.destroy_timeout_secs);

        while self.exists_vm(vm).await? {
            self.destroy_vm(vm).await?;
            if Instant::now() >= deadline {
                anyhow::bail!(
                    "container {} still present after {}s",
                    vm.name,
                    self.config.destroy_timeout_secs
                );
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        Ok(())
    }

    async fn get_vms(&self) -> Result<Vec<Machine>> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await
            .context("Failed to list containers")?;

        let mut machines = Vec::new();
        for container in containers {
            let Some(name) = container
                .names
                .as_ref()
                .and_then(|names| names.first())
                .map(|n| n.trim_start_matches('/').to_string())
            else {
                continue;
            };

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
        match self.docker.inspect_container(&vm.name, None).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e).context("Failed to inspect container"),
        }
    }

    async fn get_images(&self) -> Result<Vec<String>> {
        let images = self
            .docker
            .list_images(Some(ListImagesOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await
            .context("Failed to list images")?;

        // Strip registry prefixes so submissions can use the short name, and
        // accept both "name:tag" and a bare "name" for the default tag.
        let mut names = BTreeSet::new();
        for image in &images {
            for tag in &image.repo_tags {
                let short = tag.rsplit('/').next().unwrap_or(tag);
                names.insert(short.to_string());
                if let Some(base) = short.strip_suffix(":latest") {
                    names.insert(base.to_string());
                }
            }
        }

        Ok(names.into_iter().collect())
    }
}
