use std::sync::Arc;
use std::time::Duration;
use tango_integration_tests::{FakeVmms, RunScript, TestStack};

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("info,tango_server=debug")
        .try_init()
        .ok();
}

#[tokio::test]
async fn test_happy_path_runs_job_and_returns_vm_to_pool() -> anyhow::Result<()> {
    init_tracing();

    let driver = Arc::new(FakeVmms::new(&["alpine"]));
    driver.script(RunScript::Succeed {
        output: b"hi\n".to_vec(),
        exit_code: 0,
    });
    let stack = TestStack::start(driver.clone()).await?;

    stack.pool.update("alpine", 1).await;
    stack.wait_pool("alpine", 1, 1, 5).await?;

    let id = stack.queue.add(stack.job("alpine", "feedback", 10)).await;
    let job = stack.wait_dead(id, 5).await?;

    let trace = job.trace.join("\n");
    assert!(trace.contains("ready"), "trace: {}", trace);
    assert!(trace.contains("input files copied"), "trace: {}", trace);
    assert!(trace.contains("run finished (exit status 0)"), "trace: {}", trace);
    assert!(trace.contains("output copied"), "trace: {}", trace);
    assert!(trace.contains("job completed"), "trace: {}", trace);

    let output = tokio::fs::read(stack.output_path("feedback")).await?;
    assert_eq!(output, b"hi\n");

    // The machine survived and went back to the pool.
    stack.wait_pool("alpine", 1, 1, 5).await?;
    assert_eq!(driver.destroyed_count(), 0);

    stack.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_timed_out_run_keeps_partial_output_and_destroys_vm() -> anyhow::Result<()> {
    init_tracing();

    let driver = Arc::new(FakeVmms::new(&["alpine"]));
    driver.script(RunScript::Timeout {
        partial: b"partial output".to_vec(),
    });
    let stack = TestStack::start(driver.clone()).await?;

    stack.pool.update("alpine", 1).await;
    stack.wait_pool("alpine", 1, 1, 5).await?;
    let first_vm = driver.destroyed_names();
    assert!(first_vm.is_empty());

    let id = stack.queue.add(stack.job("alpine", "feedback", 2)).await;
    let job = stack.wait_dead(id, 5).await?;

    let trace = job.trace.join("\n");
    assert!(trace.contains("timed out"), "trace: {}", trace);
    assert!(trace.contains("job completed"), "trace: {}", trace);

    // Partial output still made it out.
    let output = tokio::fs::read(stack.output_path("feedback")).await?;
    assert_eq!(output, b"partial output");

    // The timed-out sandbox is untrusted: destroyed, then replaced.
    stack.wait_pool("alpine", 1, 1, 5).await?;
    assert_eq!(driver.destroyed_count(), 1);

    stack.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_identical_submissions_share_one_job_and_worker() -> anyhow::Result<()> {
    init_tracing();

    let driver = Arc::new(FakeVmms::new(&["alpine"]));
    driver.delay_runs(Duration::from_millis(300));
    let stack = TestStack::start(driver.clone()).await?;

    stack.pool.update("alpine", 1).await;
    stack.wait_pool("alpine", 1, 1, 5).await?;

    let mut first = stack.job("alpine", "feedback", 10);
    first.fingerprint = Some("same-spec".to_string());
    let mut second = stack.job("alpine", "feedback", 10);
    second.fingerprint = Some("same-spec".to_string());

    let a = stack.queue.add(first).await;
    let b = stack.queue.add(second).await;
    assert_eq!(a, b);

    stack.wait_dead(a, 5).await?;
    assert_eq!(driver.run_count(), 1);

    stack.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_ready_failures_burn_replacements_until_one_works() -> anyhow::Result<()> {
    init_tracing();

    let driver = Arc::new(FakeVmms::new(&["alpine"]));
    driver.fail_waits(2);
    let stack = TestStack::start(driver.clone()).await?;

    stack.pool.update("alpine", 1).await;
    stack.wait_pool("alpine", 1, 1, 5).await?;

    let id = stack.queue.add(stack.job("alpine", "feedback", 10)).await;
    let job = stack.wait_dead(id, 5).await?;

    let trace = job.trace.join("\n");
    assert!(trace.contains("job completed"), "trace: {}", trace);
    assert!(trace.contains("requesting replacement"), "trace: {}", trace);

    // Two machines were discarded before the third one answered.
    assert_eq!(driver.destroyed_count(), 2);
    assert_eq!(driver.created_count(), 3);

    // The survivor went back to the pool.
    stack.wait_pool("alpine", 1, 1, 5).await?;

    stack.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_job_is_reassigned_after_worker_death() -> anyhow::Result<()> {
    init_tracing();

    let driver = Arc::new(FakeVmms::new(&["alpine"]));
    driver.panic_runs(1);
    let stack = TestStack::start(driver.clone()).await?;

    stack.pool.update("alpine", 1).await;
    stack.wait_pool("alpine", 1, 1, 5).await?;

    let id = stack.queue.add(stack.job("alpine", "feedback", 10)).await;
    let job = stack.wait_dead(id, 10).await?;

    let trace = job.trace.join("\n");
    assert!(trace.contains("worker died"), "trace: {}", trace);
    assert!(trace.contains("job completed"), "trace: {}", trace);
    assert_eq!(job.retries, 1);

    // The crashed worker's machine was not trusted again.
    assert!(driver.destroyed_count() >= 1);

    let output = tokio::fs::read(stack.output_path("feedback")).await?;
    assert_eq!(output, b"hi\n");

    stack.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_repeated_worker_death_fails_the_job() -> anyhow::Result<()> {
    init_tracing();

    let driver = Arc::new(FakeVmms::new(&["alpine"]));
    driver.panic_runs(100);
    let stack = TestStack::start(driver.clone()).await?;

    stack.pool.update("alpine", 1).await;
    stack.wait_pool("alpine", 1, 1, 5).await?;

    let id = stack.queue.add(stack.job("alpine", "feedback", 10)).await;
    let job = stack.wait_dead(id, 10).await?;

    let trace = job.trace.join("\n");
    assert!(trace.contains("worker died repeatedly"), "trace: {}", trace);

    stack.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_resize_down_with_job_in_flight_converges() -> anyhow::Result<()> {
    init_tracing();

    let driver = Arc::new(FakeVmms::new(&["alpine"]));
    driver.delay_runs(Duration::from_millis(500));
    let stack = TestStack::start(driver.clone()).await?;

    stack.pool.update("alpine", 3).await;
    stack.wait_pool("alpine", 3, 3, 5).await?;

    let id = stack.queue.add(stack.job("alpine", "feedback", 10)).await;

    // Shrink while the job holds one machine; the two free ones go away.
    stack.wait_pool("alpine", 2, 3, 5).await?;
    stack.pool.update("alpine", 1).await;
    stack.wait_pool("alpine", 0, 1, 5).await?;
    assert_eq!(driver.destroyed_count(), 2);

    // The job is unaffected and the pool settles at the new target.
    stack.wait_dead(id, 5).await?;
    stack.wait_pool("alpine", 1, 1, 5).await?;

    stack.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_submission_with_empty_pool_waits_for_capacity() -> anyhow::Result<()> {
    init_tracing();

    let driver = Arc::new(FakeVmms::new(&["alpine"]));
    let stack = TestStack::start(driver.clone()).await?;

    // No pool yet: the job is accepted and just sits in pending.
    let id = stack.queue.add(stack.job("alpine", "feedback", 10)).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(stack.queue.is_live(id).await);
    assert_eq!(stack.queue.counts().await.pending, 1);

    // Capacity arrives; the job starts without resubmission.
    stack.pool.update("alpine", 1).await;
    let job = stack.wait_dead(id, 5).await?;
    assert!(job.trace.join("\n").contains("job completed"));

    stack.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_cancelled_job_fails_at_next_checkpoint() -> anyhow::Result<()> {
    init_tracing();

    let driver = Arc::new(FakeVmms::new(&["alpine"]));
    let stack = TestStack::start(driver.clone()).await?;

    // Cancel before any capacity exists, so the flag is set before the
    // worker's first checkpoint.
    let id = stack.queue.add(stack.job("alpine", "feedback", 10)).await;
    assert!(stack.queue.request_cancel(id).await);

    stack.pool.update("alpine", 1).await;
    let job = stack.wait_dead(id, 5).await?;
    assert!(job.trace.join("\n").contains("job cancelled"));

    // A cancelled job's machine is destroyed on release.
    stack.wait_pool("alpine", 1, 1, 5).await?;
    assert!(driver.destroyed_count() >= 1);

    stack.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_killed_run_fails_the_job_and_destroys_the_vm() -> anyhow::Result<()> {
    init_tracing();

    let driver = Arc::new(FakeVmms::new(&["alpine"]));
    driver.script(RunScript::Killed);
    let stack = TestStack::start(driver.clone()).await?;

    stack.pool.update("alpine", 1).await;
    stack.wait_pool("alpine", 1, 1, 5).await?;

    let id = stack.queue.add(stack.job("alpine", "feedback", 10)).await;
    let job = stack.wait_dead(id, 5).await?;

    let trace = job.trace.join("\n");
    assert!(trace.contains("job failed (run)"), "trace: {}", trace);

    stack.wait_pool("alpine", 1, 1, 5).await?;
    assert_eq!(driver.destroyed_count(), 1);

    stack.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_oversized_output_is_truncated_with_trace_marker() -> anyhow::Result<()> {
    init_tracing();

    let driver = Arc::new(FakeVmms::new(&["alpine"]));
    driver.script(RunScript::Succeed {
        output: vec![b'x'; 1024],
        exit_code: 0,
    });
    let stack = TestStack::start(driver.clone()).await?;

    stack.pool.update("alpine", 1).await;
    stack.wait_pool("alpine", 1, 1, 5).await?;

    let mut job = stack.job("alpine", "feedback", 10);
    job.max_output_bytes = 100;
    let id = stack.queue.add(job).await;
    let done = stack.wait_dead(id, 5).await?;

    let trace = done.trace.join("\n");
    assert!(trace.contains("output truncated to 100 bytes"), "trace: {}", trace);
    assert!(trace.contains("job completed"), "trace: {}", trace);

    let output = tokio::fs::read(stack.output_path("feedback")).await?;
    assert_eq!(output.len(), 100);

    stack.shutdown().await;
    Ok(())
}
