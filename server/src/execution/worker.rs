use crate::jobs::{Job, JobQueue};
use crate::notify::Notifier;
use crate::pool::Preallocator;
use crate::vmms::{Machine, OutputSink, RunOutcome, VmmsDriver};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Drives one job through its lifetime. The worker owns the machine for the
/// duration and is the only writer of the job's trace, timestamps, and
/// terminal state.
#[derive(Clone)]
pub struct Worker {
    pub queue: Arc<JobQueue>,
    pub pool: Arc<Preallocator>,
    pub driver: Arc<dyn VmmsDriver>,
    pub notifier: Arc<Notifier>,
    pub ready_timeout_secs: u64,
    pub ready_retries: u32,
}

impl Worker {
    pub fn spawn(&self, job: Job, vm: Machine) -> JoinHandle<()> {
        let worker = self.clone();
        tokio::spawn(async move {
            worker.run(job, vm).await;
        })
    }

    async fn run(self, job: Job, mut vm: Machine) {
        let id = job.id;
        tracing::info!(job = id, vm = %vm.name, image = %job.image, "worker started");

        let mut sink = OutputSink::new(job.max_output_bytes);

        // Wait for the machine to accept commands, burning through
        // replacements if it never does.
        let mut replacements = 0u32;
        loop {
            if self.cancelled(id).await {
                vm.keep_alive = false;
                return self.complete(&job, Some(vm), "job cancelled").await;
            }

            match self.driver.wait_vm(&vm, self.ready_timeout_secs).await {
                Ok(()) => {
                    self.queue
                        .append_trace(id, &format!("vm {} ready", vm.name))
                        .await;
                    break;
                }
                Err(e) => {
                    tracing::warn!(job = id, vm = %vm.name, "vm not ready: {:#}", e);
                    if replacements >= self.ready_retries {
                        vm.keep_alive = false;
                        return self
                            .complete(&job, Some(vm), "job failed (vm never became ready)")
                            .await;
                    }
                    replacements += 1;
                    self.queue
                        .append_trace(
                            id,
                            &format!(
                                "vm {} not ready, requesting replacement {} of {}",
                                vm.name, replacements, self.ready_retries
                            ),
                        )
                        .await;
                    match self.pool.replace_vm(vm).await {
                        Ok(fresh) => {
                            self.queue.set_vm(id, fresh.clone()).await;
                            vm = fresh;
                        }
                        Err(e) => {
                            tracing::error!(job = id, "replacement failed: {:#}", e);
                            return self
                                .complete(&job, None, "job failed (no replacement vm)")
                                .await;
                        }
                    }
                }
            }
        }

        // Copy the inputs in.
        if self.cancelled(id).await {
            vm.keep_alive = false;
            return self.complete(&job, Some(vm), "job cancelled").await;
        }
        if let Err(e) = self.driver.copy_in(&vm, &job.input).await {
            tracing::error!(job = id, vm = %vm.name, "copy-in failed: {:#}", e);
            vm.keep_alive = false;
            return self
                .complete(&job, Some(vm), &format!("job failed (copy-in): {:#}", e))
                .await;
        }
        self.queue.append_trace(id, "input files copied").await;

        // Run under the job's time budget.
        if self.cancelled(id).await {
            vm.keep_alive = false;
            return self.complete(&job, Some(vm), "job cancelled").await;
        }
        self.queue.mark_started(id).await;
        self.queue
            .append_trace(id, &format!("running make (timeout {}s)", job.timeout_secs))
            .await;

        match self.driver.run_job(&vm, job.timeout_secs, &mut sink).await {
            Ok(report) => match report.outcome {
                RunOutcome::Normal => {
                    self.queue
                        .append_trace(
                            id,
                            &format!(
                                "run finished (exit status {})",
                                report.exit_code.unwrap_or(-1)
                            ),
                        )
                        .await;
                }
                RunOutcome::Timeout => {
                    // Partial output is still valuable, but the sandbox is in
                    // an unknown state and must not be pooled again.
                    vm.keep_alive = false;
                    self.queue
                        .append_trace(
                            id,
                            &format!(
                                "run timed out after {}s, keeping partial output",
                                job.timeout_secs
                            ),
                        )
                        .await;
                }
                RunOutcome::Killed => {
                    vm.keep_alive = false;
                    return self
                        .complete(&job, Some(vm), "job failed (run): process killed")
                        .await;
                }
            },
            Err(e) => {
                tracing::error!(job = id, vm = %vm.name, "run failed: {:#}", e);
                vm.keep_alive = false;
                return self
                    .complete(&job, Some(vm), &format!("job failed (run): {:#}", e))
                    .await;
            }
        }

        if sink.truncated() {
            self.queue
                .append_trace(
                    id,
                    &format!(
                        "output truncated to {} bytes ({} produced)",
                        sink.limit(),
                        sink.total_bytes()
                    ),
                )
                .await;
        }

        // Copy the captured output out.
        if self.cancelled(id).await {
            vm.keep_alive = false;
            return self.complete(&job, Some(vm), "job cancelled").await;
        }
        if let Err(e) = self.driver.copy_out(&vm, &job.output.dest_path).await {
            tracing::error!(job = id, vm = %vm.name, "copy-out failed: {:#}", e);
            vm.keep_alive = false;
            return self
                .complete(&job, Some(vm), &format!("job failed (copy-out): {:#}", e))
                .await;
        }
        self.queue
            .append_trace(
                id,
                &format!("output copied to {}", job.output.dest_path.display()),
            )
            .await;

        self.complete(&job, Some(vm), "job completed").await;
        self.notifier.output_callback(&job).await;
    }

    async fn cancelled(&self, id: u64) -> bool {
        self.queue.is_cancelled(id).await
    }

    /// Common tail for every terminal state: detach the machine from the
    /// job, move the job to the dead ring, release the machine, and fire the
    /// status notification.
    async fn complete(&self, job: &Job, vm: Option<Machine>, reason: &str) {
        self.queue.detach_vm(job.id).await;
        self.queue.make_dead(job.id, reason).await;
        if let Some(vm) = vm {
            self.pool.free_vm(vm).await;
        }
        if let Some(done) = self.queue.get(job.id).await {
            self.notifier.job_finished(&done, reason).await;
        }
    }
}
