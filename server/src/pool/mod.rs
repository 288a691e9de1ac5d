use crate::config::PoolSettings;
use crate::vmms::{Machine, VmmsDriver};
use anyhow::Result;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Per-image pools of warm execution environments. `free` and `total` for an
/// image are guarded together by one lock; the slow driver calls (create,
/// destroy) always happen outside it and re-take it to record their outcome.
pub struct Preallocator {
    driver: Arc<dyn VmmsDriver>,
    pools: Mutex<HashMap<String, PoolEntry>>,
    next_vm_id: AtomicU32,
    hard_cap: usize,
    create_retries: u32,
    instance_prefix: String,
    keep_alive: HashMap<String, bool>,
}

struct PoolEntry {
    /// FIFO so the oldest warm environment is handed out first; this
    /// exercises every machine and surfaces latent failures early.
    free: VecDeque<Machine>,
    /// Every machine that exists for this image, free or assigned.
    total: HashSet<u32>,
    target: usize,
    keep_alive: bool,
}

impl PoolEntry {
    fn new(keep_alive: bool) -> Self {
        Self {
            free: VecDeque::new(),
            total: HashSet::new(),
            target: 0,
            keep_alive,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub image: String,
    pub free: usize,
    pub total: usize,
    pub target: usize,
}

impl Preallocator {
    pub fn new(
        driver: Arc<dyn VmmsDriver>,
        settings: &PoolSettings,
        instance_prefix: &str,
    ) -> Arc<Self> {
        let keep_alive = settings
            .images
            .iter()
            .map(|img| (img.name.clone(), img.keep_alive))
            .collect();

        Arc::new(Self {
            driver,
            pools: Mutex::new(HashMap::new()),
            next_vm_id: AtomicU32::new(1000),
            hard_cap: settings.hard_cap,
            create_retries: settings.create_retries,
            instance_prefix: instance_prefix.to_string(),
            keep_alive,
        })
    }

    fn keep_alive_for(&self, image: &str) -> bool {
        self.keep_alive.get(image).copied().unwrap_or(true)
    }

    fn new_machine(&self, image: &str) -> Machine {
        let id = self.next_vm_id.fetch_add(1, Ordering::SeqCst);
        Machine::new(&self.instance_prefix, id, image, self.keep_alive_for(image))
    }

    /// Resize the pool for `image`. Growth is asynchronous; shrinkage
    /// destroys as many free machines as it can immediately and sheds the
    /// rest as assigned machines are released.
    pub async fn update(self: &Arc<Self>, image: &str, target: usize) {
        let (to_create, doomed) = {
            let mut pools = self.pools.lock().await;
            let keep_alive = self.keep_alive_for(image);
            let entry = pools
                .entry(image.to_string())
                .or_insert_with(|| PoolEntry::new(keep_alive));
            entry.target = target;

            let total = entry.total.len();
            let capped_target = target.min(self.hard_cap);
            let to_create = capped_target.saturating_sub(total);

            let surplus = total.saturating_sub(target);
            let mut doomed = Vec::new();
            for _ in 0..surplus.min(entry.free.len()) {
                if let Some(vm) = entry.free.pop_front() {
                    entry.total.remove(&vm.id);
                    doomed.push(vm);
                }
            }
            (to_create, doomed)
        };

        tracing::info!(
            image,
            target,
            creating = to_create,
            destroying = doomed.len(),
            "pool resized"
        );

        for vm in doomed {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = this.driver.safe_destroy_vm(&vm).await {
                    tracing::warn!(vm = %vm.name, "failed to destroy surplus machine: {:#}", e);
                }
            });
        }

        for _ in 0..to_create {
            let this = Arc::clone(self);
            let image = image.to_string();
            tokio::spawn(async move {
                this.create_vm(&image).await;
            });
        }
    }

    /// Create one machine and put it on the free list, retrying transient
    /// driver failures up to the configured budget. Gives up with an error
    /// log after that; the pool stays below target until the next update.
    async fn create_vm(&self, image: &str) {
        for attempt in 1..=self.create_retries {
            let vm = self.new_machine(image);
            match self.driver.initialize_vm(&vm).await {
                Ok(()) => {
                    let surplus = {
                        let mut pools = self.pools.lock().await;
                        let keep_alive = self.keep_alive_for(image);
                        let entry = pools
                            .entry(image.to_string())
                            .or_insert_with(|| PoolEntry::new(keep_alive));
                        if entry.total.len() >= self.hard_cap || entry.total.len() >= entry.target
                        {
                            // Target shrank while we were creating.
                            true
                        } else {
                            entry.total.insert(vm.id);
                            entry.free.push_back(vm.clone());
                            false
                        }
                    };

                    if surplus {
                        if let Err(e) = self.driver.destroy_vm(&vm).await {
                            tracing::warn!(vm = %vm.name, "failed to destroy surplus machine: {:#}", e);
                        }
                    } else {
                        tracing::info!(vm = %vm.name, image, "machine added to pool");
                    }
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        image,
                        attempt,
                        "failed to create machine: {:#}",
                        e
                    );
                }
            }
        }

        tracing::error!(
            image,
            attempts = self.create_retries,
            "giving up creating a machine; pool remains below target"
        );
    }

    /// Hand out the oldest free machine for `image`, or None if the pool is
    /// empty. A given machine is returned to at most one caller.
    pub async fn alloc_vm(&self, image: &str) -> Option<Machine> {
        let mut pools = self.pools.lock().await;
        let vm = pools.get_mut(image)?.free.pop_front();
        if let Some(vm) = &vm {
            tracing::debug!(vm = %vm.name, image, "machine allocated");
        }
        vm
    }

    /// Return a machine its owner is finished with. Pooled again only when
    /// its keep-alive flag survived the run and the pool has room under its
    /// target; destroyed otherwise, scheduling a replacement if that leaves
    /// the pool short.
    pub async fn free_vm(self: &Arc<Self>, vm: Machine) {
        let pooled = {
            let mut pools = self.pools.lock().await;
            match pools.get_mut(&vm.image) {
                Some(entry) if entry.total.contains(&vm.id) => {
                    if vm.keep_alive
                        && entry.total.len() <= entry.target
                        && entry.free.len() < entry.target
                    {
                        entry.free.push_back(vm.clone());
                        true
                    } else {
                        entry.total.remove(&vm.id);
                        false
                    }
                }
                _ => false,
            }
        };

        if pooled {
            tracing::debug!(vm = %vm.name, "machine returned to pool");
            return;
        }

        tracing::info!(vm = %vm.name, keep_alive = vm.keep_alive, "destroying released machine");
        if let Err(e) = self.driver.safe_destroy_vm(&vm).await {
            tracing::warn!(vm = %vm.name, "failed to destroy released machine: {:#}", e);
        }
        self.schedule_refill(&vm.image);
    }

    /// Destroy a machine that is owned by a job (the worker is replacing a
    /// bad environment) and synchronously create a fresh one for the same
    /// job. The new machine is in `total` but never on the free list.
    pub async fn replace_vm(&self, old: Machine) -> Result<Machine> {
        {
            let mut pools = self.pools.lock().await;
            if let Some(entry) = pools.get_mut(&old.image) {
                entry.total.remove(&old.id);
            }
        }

        if let Err(e) = self.driver.destroy_vm(&old).await {
            tracing::warn!(vm = %old.name, "failed to destroy replaced machine: {:#}", e);
        }

        for attempt in 1..=self.create_retries {
            let vm = self.new_machine(&old.image);
            match self.driver.initialize_vm(&vm).await {
                Ok(()) => {
                    let mut pools = self.pools.lock().await;
                    let keep_alive = self.keep_alive_for(&old.image);
                    let entry = pools
                        .entry(old.image.clone())
                        .or_insert_with(|| PoolEntry::new(keep_alive));
                    entry.total.insert(vm.id);
                    return Ok(vm);
                }
                Err(e) => {
                    tracing::warn!(
                        image = %old.image,
                        attempt,
                        "failed to create replacement machine: {:#}",
                        e
                    );
                }
            }
        }

        anyhow::bail!(
            "unable to create a replacement {} machine after {} attempts",
            old.image,
            self.create_retries
        )
    }

    /// Force-destroy a machine whose owning worker died (its state is
    /// untrusted) and schedule a replacement. Fire-and-forget.
    pub fn retire_vm(self: &Arc<Self>, vm: Machine) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            {
                let mut pools = this.pools.lock().await;
                if let Some(entry) = pools.get_mut(&vm.image) {
                    entry.total.remove(&vm.id);
                }
            }
            if let Err(e) = this.driver.destroy_vm(&vm).await {
                tracing::warn!(vm = %vm.name, "failed to destroy retired machine: {:#}", e);
            }
            this.refill(&vm.image).await;
        });
    }

    fn schedule_refill(self: &Arc<Self>, image: &str) {
        let this = Arc::clone(self);
        let image = image.to_string();
        tokio::spawn(async move {
            this.refill(&image).await;
        });
    }

    async fn refill(&self, image: &str) {
        let short = {
            let pools = self.pools.lock().await;
            pools.get(image).is_some_and(|entry| {
                entry.total.len() < entry.target && entry.total.len() < self.hard_cap
            })
        };
        if short {
            self.create_vm(image).await;
        }
    }

    /// Administrative: adopt an externally created machine into its pool.
    pub async fn add_vm(&self, vm: Machine) -> Result<()> {
        let mut pools = self.pools.lock().await;
        let keep_alive = self.keep_alive_for(&vm.image);
        let entry = pools
            .entry(vm.image.clone())
            .or_insert_with(|| PoolEntry::new(keep_alive));
        if entry.total.len() >= self.hard_cap {
            anyhow::bail!(
                "pool for {} is at its hard cap of {}",
                vm.image,
                self.hard_cap
            );
        }
        entry.total.insert(vm.id);
        entry.free.push_back(vm);
        Ok(())
    }

    /// Administrative: drop a machine from its pool. If it is free it is
    /// destroyed now; if it is assigned it will be destroyed on release.
    pub async fn remove_vm(&self, image: &str, id: u32) -> Result<bool> {
        let freed = {
            let mut pools = self.pools.lock().await;
            let Some(entry) = pools.get_mut(image) else {
                return Ok(false);
            };
            if !entry.total.remove(&id) {
                return Ok(false);
            }
            let pos = entry.free.iter().position(|vm| vm.id == id);
            pos.and_then(|p| entry.free.remove(p))
        };

        if let Some(vm) = freed {
            self.driver.safe_destroy_vm(&vm).await?;
        }
        Ok(true)
    }

    pub async fn get_pool(&self, image: &str) -> Option<PoolStatus> {
        let pools = self.pools.lock().await;
        pools.get(image).map(|entry| PoolStatus {
            image: image.to_string(),
            free: entry.free.len(),
            total: entry.total.len(),
            target: entry.target,
        })
    }

    pub async fn get_all_pools(&self) -> Vec<PoolStatus> {
        let pools = self.pools.lock().await;
        let mut statuses: Vec<PoolStatus> = pools
            .iter()
            .map(|(image, entry)| PoolStatus {
                image: image.clone(),
                free: entry.free.len(),
                total: entry.total.len(),
                target: entry.target,
            })
            .collect();
        statuses.sort_by(|a, b| a.image.cmp(&b.image));
        statuses
    }

    /// Startup reconciliation: adopt leftover machines whose image has a
    /// configured pool, destroy strays. Call before applying targets.
    pub async fn reconcile(self: &Arc<Self>) -> Result<()> {
        let machines = self.driver.get_vms().await?;
        tracing::info!(found = machines.len(), "reconciling existing machines");

        for mut vm in machines {
            // Keep the id allocator ahead of anything we adopt.
            let mut current = self.next_vm_id.load(Ordering::SeqCst);
            while current <= vm.id {
                match self.next_vm_id.compare_exchange(
                    current,
                    vm.id + 1,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(_) => break,
                    Err(actual) => current = actual,
                }
            }

            if self.keep_alive.contains_key(&vm.image) {
                vm.keep_alive = self.keep_alive_for(&vm.image);
                tracing::info!(vm = %vm.name, "adopting leftover machine");
                if let Err(e) = self.add_vm(vm.clone()).await {
                    tracing::warn!(vm = %vm.name, "cannot adopt machine: {:#}", e);
                    let _ = self.driver.safe_destroy_vm(&vm).await;
                }
            } else {
                tracing::info!(vm = %vm.name, "destroying stray machine");
                if let Err(e) = self.driver.safe_destroy_vm(&vm).await {
                    tracing::warn!(vm = %vm.name, "failed to destroy stray machine: {:#}", e);
                }
            }
        }

        Ok(())
    }
}
