use super::Job;
use crate::vmms::Machine;
use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use tokio::sync::{Mutex, Notify};

/// Live jobs, the bounded ring of completed jobs, and the FIFO of live jobs
/// waiting for an environment. One lock guards all three so the "pending
/// contains exactly the live unassigned jobs" invariant is maintained in a
/// single critical section per operation.
pub struct JobQueue {
    inner: Mutex<Inner>,
    job_added: Notify,
    dead_capacity: usize,
}

struct Inner {
    next_id: u64,
    live: HashMap<u64, Job>,
    dead: HashMap<u64, Job>,
    dead_order: VecDeque<u64>,
    pending: VecDeque<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueCounts {
    pub live: usize,
    pub pending: usize,
    pub dead: usize,
}

impl JobQueue {
    pub fn new(dead_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                live: HashMap::new(),
                dead: HashMap::new(),
                dead_order: VecDeque::new(),
                pending: VecDeque::new(),
            }),
            job_added: Notify::new(),
            dead_capacity,
        }
    }

    /// Append a fresh job. If an identical live job exists (same
    /// fingerprint), its id is returned instead and nothing is enqueued.
    pub async fn add(&self, mut job: Job) -> u64 {
        let id = {
            let mut inner = self.inner.lock().await;

            if let Some(fp) = job.fingerprint.as_deref() {
                if let Some(existing) = inner
                    .live
                    .values()
                    .find(|j| j.fingerprint.as_deref() == Some(fp))
                {
                    tracing::info!(
                        job = existing.id,
                        "duplicate submission attached to live job"
                    );
                    return existing.id;
                }
            }

            let id = inner.alloc_id();
            job.id = id;
            job.appended_at = Some(Utc::now());
            job.append_trace("added to queue");
            inner.live.insert(id, job);
            inner.pending.push_back(id);
            id
        };

        self.job_added.notify_one();
        tracing::info!(job = id, "job queued");
        id
    }

    /// Insert straight into the dead ring. Used for synchronously rejected
    /// submissions so clients can still poll a result.
    pub async fn add_dead(&self, mut job: Job, reason: &str) -> u64 {
        let mut inner = self.inner.lock().await;
        let id = inner.alloc_id();
        job.id = id;
        job.appended_at = Some(Utc::now());
        job.finished_at = Some(Utc::now());
        job.append_trace(reason);
        inner.insert_dead(job, self.dead_capacity);
        id
    }

    /// Pop the next pending job id, skipping entries that were completed or
    /// assigned since they were queued.
    pub async fn get_next_pending(&self) -> Option<u64> {
        let mut inner = self.inner.lock().await;
        while let Some(id) = inner.pending.pop_front() {
            if inner.live.get(&id).is_some_and(|j| !j.assigned) {
                return Some(id);
            }
        }
        None
    }

    /// Put an unassigned job back at the head of the pending FIFO. Does not
    /// wake the scheduler: this is the "no environment available" path and
    /// waking it immediately would spin.
    pub async fn requeue_front(&self, id: u64) {
        let mut inner = self.inner.lock().await;
        if inner.live.get(&id).is_some_and(|j| !j.assigned) {
            inner.pending.push_front(id);
        }
    }

    pub async fn assign_job(&self, id: u64, vm: Machine) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(job) = inner.live.get_mut(&id) else {
            return false;
        };
        job.assigned = true;
        job.assigned_at = Some(Utc::now());
        job.append_trace(&format!("assigned to vm {}", vm.name));
        job.vm = Some(vm);
        true
    }

    /// Release a claimed job back to the head of the pending FIFO, used when
    /// its worker died. Reassigned jobs precede anything submitted later.
    pub async fn unassign_job(&self, id: u64) -> bool {
        let changed = {
            let mut inner = self.inner.lock().await;
            let Some(job) = inner.live.get_mut(&id) else {
                return false;
            };
            job.assigned = false;
            job.vm = None;
            job.append_trace("returned to queue");
            inner.pending.push_front(id);
            true
        };
        self.job_added.notify_one();
        changed
    }

    pub async fn set_vm(&self, id: u64, vm: Machine) {
        let mut inner = self.inner.lock().await;
        if let Some(job) = inner.live.get_mut(&id) {
            job.vm = Some(vm);
        }
    }

    pub async fn detach_vm(&self, id: u64) {
        let mut inner = self.inner.lock().await;
        if let Some(job) = inner.live.get_mut(&id) {
            job.vm = None;
        }
    }

    /// Move a live job to the dead ring. Idempotent: a second call for the
    /// same id is a no-op and returns false.
    pub async fn make_dead(&self, id: u64, reason: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(mut job) = inner.live.remove(&id) else {
            return false;
        };
        inner.pending.retain(|p| *p != id);
        job.assigned = false;
        job.vm = None;
        job.finished_at = Some(Utc::now());
        job.append_trace(reason);
        tracing::info!(job = id, reason, "job finished");
        inner.insert_dead(job, self.dead_capacity);
        true
    }

    pub async fn append_trace(&self, id: u64, message: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(job) = inner.live.get_mut(&id) {
            job.append_trace(message);
        } else if let Some(job) = inner.dead.get_mut(&id) {
            job.append_trace(message);
        }
    }

    pub async fn get(&self, id: u64) -> Option<Job> {
        let inner = self.inner.lock().await;
        inner.live.get(&id).or_else(|| inner.dead.get(&id)).cloned()
    }

    pub async fn is_live(&self, id: u64) -> bool {
        self.inner.lock().await.live.contains_key(&id)
    }

    pub async fn next_id(&self) -> u64 {
        self.inner.lock().await.next_id
    }

    pub async fn request_cancel(&self, id: u64) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(job) = inner.live.get_mut(&id) else {
            return false;
        };
        job.cancel_requested = true;
        job.append_trace("cancel requested");
        true
    }

    pub async fn is_cancelled(&self, id: u64) -> bool {
        let inner = self.inner.lock().await;
        inner
            .live
            .get(&id)
            .is_some_and(|j| j.cancel_requested)
    }

    pub async fn increment_retries(&self, id: u64) -> u32 {
        let mut inner = self.inner.lock().await;
        match inner.live.get_mut(&id) {
            Some(job) => {
                job.retries += 1;
                job.retries
            }
            None => 0,
        }
    }

    pub async fn mark_started(&self, id: u64) {
        let mut inner = self.inner.lock().await;
        if let Some(job) = inner.live.get_mut(&id) {
            job.started_at = Some(Utc::now());
        }
    }

    pub async fn del_job(&self, id: u64, dead: bool) -> bool {
        let mut inner = self.inner.lock().await;
        if dead {
            inner.dead_order.retain(|d| *d != id);
            inner.dead.remove(&id).is_some()
        } else {
            inner.pending.retain(|p| *p != id);
            inner.live.remove(&id).is_some()
        }
    }

    pub async fn live_jobs(&self) -> Vec<Job> {
        let inner = self.inner.lock().await;
        let mut jobs: Vec<Job> = inner.live.values().cloned().collect();
        jobs.sort_by_key(|j| j.id);
        jobs
    }

    pub async fn dead_jobs(&self) -> Vec<Job> {
        let inner = self.inner.lock().await;
        inner
            .dead_order
            .iter()
            .filter_map(|id| inner.dead.get(id))
            .cloned()
            .collect()
    }

    /// Most recent job (live first, then newest dead) writing to `dest`.
    pub async fn find_by_output(&self, dest: &Path) -> Option<Job> {
        let inner = self.inner.lock().await;
        inner
            .live
            .values()
            .find(|j| j.output.dest_path == dest)
            .or_else(|| {
                inner
                    .dead_order
                    .iter()
                    .rev()
                    .filter_map(|id| inner.dead.get(id))
                    .find(|j| j.output.dest_path == dest)
            })
            .cloned()
    }

    pub async fn counts(&self) -> QueueCounts {
        let inner = self.inner.lock().await;
        QueueCounts {
            live: inner.live.len(),
            pending: inner.pending.len(),
            dead: inner.dead.len(),
        }
    }

    /// Signalled when a job becomes schedulable; the manager selects on this
    /// to cut latency on an otherwise idle queue.
    pub fn job_added(&self) -> &Notify {
        &self.job_added
    }
}

impl Inner {
    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn insert_dead(&mut self, job: Job, capacity: usize) {
        self.dead_order.push_back(job.id);
        self.dead.insert(job.id, job);
        while self.dead_order.len() > capacity {
            if let Some(oldest) = self.dead_order.pop_front() {
                self.dead.remove(&oldest);
            }
        }
    }
}
