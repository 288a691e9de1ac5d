use super::worker::Worker;
use crate::config::SchedulerSettings;
use crate::jobs::JobQueue;
use crate::notify::Notifier;
use crate::pool::Preallocator;
use crate::vmms::VmmsDriver;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

/// The scheduling loop. Each tick it reaps dead workers and then pairs
/// pending jobs with free machines in submission order. It never blocks on a
/// driver call itself; workers do the slow work.
pub struct JobManager {
    queue: Arc<JobQueue>,
    pool: Arc<Preallocator>,
    worker: Worker,
    tick: Duration,
    job_retries: u32,
    running: Mutex<HashMap<u64, JoinHandle<()>>>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    shutdown_signal: Mutex<Option<oneshot::Sender<()>>>,
}

impl JobManager {
    pub fn new(
        queue: Arc<JobQueue>,
        pool: Arc<Preallocator>,
        driver: Arc<dyn VmmsDriver>,
        notifier: Arc<Notifier>,
        settings: &SchedulerSettings,
    ) -> Arc<Self> {
        let worker = Worker {
            queue: queue.clone(),
            pool: pool.clone(),
            driver,
            notifier,
            ready_timeout_secs: settings.ready_timeout_secs,
            ready_retries: settings.ready_retries,
        };

        Arc::new(Self {
            queue,
            pool,
            worker,
            tick: Duration::from_millis(settings.tick_ms),
            job_retries: settings.job_retries,
            running: Mutex::new(HashMap::new()),
            loop_handle: Mutex::new(None),
            shutdown_signal: Mutex::new(None),
        })
    }

    pub async fn start(self: &Arc<Self>) {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        *self.shutdown_signal.lock().await = Some(shutdown_tx);

        let manager = Arc::clone(self);
        let tick = self.tick;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = manager.queue.job_added().notified() => {}
                    _ = &mut shutdown_rx => {
                        tracing::info!("job manager shutting down");
                        break;
                    }
                }

                manager.reap().await;
                manager.dispatch().await;
            }
        });

        *self.loop_handle.lock().await = Some(handle);
    }

    /// Collect workers that are no longer alive. A finished worker whose job
    /// is still live died mid-flight: its machine is untrusted and is
    /// force-destroyed, and the job goes back to the head of the queue.
    async fn reap(&self) {
        let finished: Vec<u64> = {
            let mut running = self.running.lock().await;
            let ids: Vec<u64> = running
                .iter()
                .filter(|(_, handle)| handle.is_finished())
                .map(|(id, _)| *id)
                .collect();
            for id in &ids {
                running.remove(id);
            }
            ids
        };

        for id in finished {
            if !self.queue.is_live(id).await {
                continue;
            }

            tracing::warn!(job = id, "worker died with its job still live");

            if let Some(job) = self.queue.get(id).await {
                if let Some(vm) = job.vm {
                    self.queue.detach_vm(id).await;
                    self.pool.retire_vm(vm);
                }
            }

            let retries = self.queue.increment_retries(id).await;
            if retries > self.job_retries {
                self.queue.make_dead(id, "worker died repeatedly").await;
            } else {
                self.queue
                    .append_trace(id, &format!("worker died, retry {} of {}", retries, self.job_retries))
                    .await;
                self.queue.unassign_job(id).await;
            }
        }
    }

    /// Pair pending jobs with free machines in FIFO order. Stops at the
    /// first allocation failure: image-level pool sizing, not the scheduler,
    /// bounds cross-image starvation.
    async fn dispatch(&self) {
        loop {
            let Some(id) = self.queue.get_next_pending().await else {
                break;
            };
            let Some(job) = self.queue.get(id).await else {
                continue;
            };

            match self.pool.alloc_vm(&job.image).await {
                Some(vm) => {
                    self.queue.assign_job(id, vm.clone()).await;
                    tracing::info!(
                        job = id,
                        vm = %vm.name,
                        retry = job.retries,
                        "job dispatched"
                    );
                    let handle = self.worker.spawn(job, vm);
                    self.running.lock().await.insert(id, handle);
                }
                None => {
                    self.queue.requeue_front(id).await;
                    break;
                }
            }
        }
    }

    pub async fn running_workers(&self) -> usize {
        self.running.lock().await.len()
    }

    pub async fn shutdown(&self) {
        if let Some(tx) = self.shutdown_signal.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.loop_handle.lock().await.take() {
            let _ = handle.await;
        }
    }
}
