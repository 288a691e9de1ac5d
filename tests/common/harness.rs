use crate::fake::FakeVmms;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tango_server::api::{self, AppState};
use tango_server::config::{PoolImageSettings, TangoConfig};
use tango_server::execution::JobManager;
use tango_server::jobs::{Job, JobQueue, OutputFormat, OutputSpec};
use tango_server::notify::Notifier;
use tango_server::pool::Preallocator;
use tango_server::storage::FileStore;
use tango_server::vmms::VmmsDriver;
use tempfile::TempDir;
use tokio::task::JoinHandle;

fn test_config(dir: &TempDir, images: &[&str]) -> TangoConfig {
    let mut config = TangoConfig::default();
    config.server.files_dir = dir.path().join("files");
    config.server.output_dir = dir.path().join("output");
    config.scheduler.tick_ms = 20;
    config.scheduler.ready_timeout_secs = 2;
    config.jobs.dead_ring_capacity = 100;
    config.pool.images = images
        .iter()
        .map(|image| PoolImageSettings {
            name: image.to_string(),
            target: 0,
            keep_alive: true,
        })
        .collect();
    config
}

/// The assembled core (queue, pools, scheduler) over a scripted driver, with
/// no HTTP in the way. Jobs are fed straight into the queue.
pub struct TestStack {
    pub queue: Arc<JobQueue>,
    pub pool: Arc<Preallocator>,
    pub manager: Arc<JobManager>,
    pub driver: Arc<FakeVmms>,
    pub config: TangoConfig,
    pub dir: TempDir,
}

impl TestStack {
    pub async fn start(driver: Arc<FakeVmms>) -> Result<Self> {
        let dir = TempDir::new().context("Failed to create temp directory")?;
        let config = test_config(&dir, &["alpine"]);

        let queue = Arc::new(JobQueue::new(config.jobs.dead_ring_capacity));
        let dyn_driver: Arc<dyn VmmsDriver> = driver.clone();
        let pool = Preallocator::new(dyn_driver.clone(), &config.pool, "tango");
        let manager = JobManager::new(
            queue.clone(),
            pool.clone(),
            dyn_driver,
            Arc::new(Notifier::new()),
            &config.scheduler,
        );
        manager.start().await;

        Ok(Self {
            queue,
            pool,
            manager,
            driver,
            config,
            dir,
        })
    }

    /// A minimal runnable job writing its output under the temp dir.
    pub fn job(&self, image: &str, dest: &str, timeout_secs: u64) -> Job {
        Job::new(
            format!("job-{}", dest),
            image,
            vec![],
            OutputSpec {
                dest_path: self.output_path(dest),
                format: OutputFormat::Raw,
                callback_url: None,
            },
            timeout_secs,
            self.config.jobs.max_output_bytes,
        )
    }

    pub fn output_path(&self, dest: &str) -> PathBuf {
        self.dir.path().join("output").join(dest)
    }

    pub async fn wait_dead(&self, id: u64, secs: u64) -> Result<Job> {
        let deadline = Instant::now() + Duration::from_secs(secs);
        loop {
            if !self.queue.is_live(id).await {
                if let Some(job) = self.queue.get(id).await {
                    return Ok(job);
                }
            }
            if Instant::now() > deadline {
                anyhow::bail!("job {} still live after {}s", id, secs);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn wait_pool(&self, image: &str, free: usize, total: usize, secs: u64) -> Result<()> {
        let deadline = Instant::now() + Duration::from_secs(secs);
        loop {
            if let Some(status) = self.pool.get_pool(image).await {
                if status.free == free && status.total == total {
                    return Ok(());
                }
            }
            if Instant::now() > deadline {
                let status = self.pool.get_pool(image).await;
                anyhow::bail!(
                    "pool never reached free={} total={}: {:?}",
                    free,
                    total,
                    status.map(|s| (s.free, s.total))
                );
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn shutdown(self) {
        self.manager.shutdown().await;
    }
}

/// The full stack behind a real listener, exercised over HTTP.
pub struct ServerHarness {
    pub stack: TestStack,
    server_handle: JoinHandle<()>,
    server_addr: SocketAddr,
}

impl ServerHarness {
    pub async fn start(driver: Arc<FakeVmms>) -> Result<Self> {
        Self::start_with_keys(driver, vec![]).await
    }

    pub async fn start_with_keys(
        driver: Arc<FakeVmms>,
        access_keys: Vec<String>,
    ) -> Result<Self> {
        let mut stack = TestStack::start(driver.clone()).await?;
        stack.config.server.access_keys = access_keys;

        let dyn_driver: Arc<dyn VmmsDriver> = driver;
        let state = AppState {
            queue: stack.queue.clone(),
            pool: stack.pool.clone(),
            driver: dyn_driver,
            store: Arc::new(FileStore::new(&stack.config.server.files_dir)),
            config: Arc::new(stack.config.clone()),
            started_at: Instant::now(),
        };

        let app = api::router(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let server_addr = listener.local_addr()?;

        tracing::info!("Test server starting on {}", server_addr);

        let server_handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("test server failed: {}", e);
            }
        });

        Ok(Self {
            stack,
            server_handle,
            server_addr,
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.server_addr, path)
    }

    pub async fn shutdown(self) {
        self.server_handle.abort();
        self.stack.manager.shutdown().await;
    }
}

impl Drop for ServerHarness {
    fn drop(&mut self) {
        self.server_handle.abort();
    }
}
