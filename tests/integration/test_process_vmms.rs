use std::sync::Arc;
use std::time::{Duration, Instant};
use tango_server::config::{PoolImageSettings, ProcessConfig, TangoConfig};
use tango_server::execution::JobManager;
use tango_server::jobs::{InputFile, Job, JobQueue, OutputFormat, OutputSpec};
use tango_server::notify::Notifier;
use tango_server::pool::Preallocator;
use tango_server::vmms::process::ProcessVmms;
use tango_server::vmms::VmmsDriver;
use tempfile::TempDir;

fn make_available() -> bool {
    std::process::Command::new("make")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// End to end against the host-process driver: a real Makefile runs under a
/// real `make`. Skipped where make is not installed.
#[tokio::test]
async fn test_make_runs_in_a_scratch_dir() -> anyhow::Result<()> {
    if !make_available() {
        eprintln!("make not installed; skipping");
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter("info,tango_server=debug")
        .try_init()
        .ok();

    let dir = TempDir::new()?;

    let mut config = TangoConfig::default();
    config.scheduler.tick_ms = 20;
    config.pool.images = vec![PoolImageSettings {
        name: "default".to_string(),
        target: 0,
        keep_alive: true,
    }];

    let driver: Arc<dyn VmmsDriver> = Arc::new(ProcessVmms::new(
        ProcessConfig {
            work_dir: dir.path().join("work"),
            images: vec!["default".to_string()],
        },
        "tango".to_string(),
    )?);

    let queue = Arc::new(JobQueue::new(100));
    let pool = Preallocator::new(driver.clone(), &config.pool, "tango");
    let manager = JobManager::new(
        queue.clone(),
        pool.clone(),
        driver,
        Arc::new(Notifier::new()),
        &config.scheduler,
    );
    manager.start().await;

    pool.update("default", 1).await;

    let makefile = dir.path().join("Makefile");
    tokio::fs::write(&makefile, "all:\n\t@echo hi\n").await?;

    let output_path = dir.path().join("output").join("feedback");
    let job = Job::new(
        "make-job",
        "default",
        vec![InputFile {
            local_file: makefile,
            dest_file: "Makefile".to_string(),
        }],
        OutputSpec {
            dest_path: output_path.clone(),
            format: OutputFormat::Raw,
            callback_url: None,
        },
        30,
        64 * 1024,
    );

    let id = queue.add(job).await;

    let deadline = Instant::now() + Duration::from_secs(20);
    while queue.is_live(id).await {
        anyhow::ensure!(Instant::now() < deadline, "job never finished");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let done = queue.get(id).await.unwrap();
    let trace = done.trace.join("\n");
    anyhow::ensure!(trace.contains("job completed"), "trace: {}", trace);

    let output = tokio::fs::read_to_string(&output_path).await?;
    assert_eq!(output, "hi\n");

    manager.shutdown().await;
    Ok(())
}
