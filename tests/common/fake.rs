use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tango_server::jobs::InputFile;
use tango_server::vmms::{Machine, OutputSink, RunOutcome, RunReport, VmmsDriver};

/// What the next runs should do.
#[derive(Debug, Clone)]
pub enum RunScript {
    /// Stream `output`, exit with `exit_code`.
    Succeed { output: Vec<u8>, exit_code: i64 },
    /// Stream `partial`, then report that the time budget was exceeded.
    Timeout { partial: Vec<u8> },
    /// The environment dies mid-run.
    Killed,
}

struct FakeState {
    script: RunScript,
    /// `wait_vm` fails this many times before succeeding.
    wait_failures: u32,
    /// `run_job` panics this many times before following the script,
    /// simulating a worker crash mid-run.
    run_panics: u32,
    run_delay: Option<Duration>,
    active: HashSet<String>,
    created: Vec<String>,
    destroyed: Vec<String>,
    captures: HashMap<String, Vec<u8>>,
    runs: u32,
}

/// Scripted in-memory driver for deterministic scheduler and worker tests.
pub struct FakeVmms {
    images: Vec<String>,
    state: Mutex<FakeState>,
}

impl FakeVmms {
    pub fn new(images: &[&str]) -> Self {
        Self {
            images: images.iter().map(|i| i.to_string()).collect(),
            state: Mutex::new(FakeState {
                script: RunScript::Succeed {
                    output: b"hi\n".to_vec(),
                    exit_code: 0,
                },
                wait_failures: 0,
                run_panics: 0,
                run_delay: None,
                active: HashSet::new(),
                created: Vec::new(),
                destroyed: Vec::new(),
                captures: HashMap::new(),
                runs: 0,
            }),
        }
    }

    pub fn script(&self, script: RunScript) {
        self.state.lock().unwrap().script = script;
    }

    pub fn fail_waits(&self, count: u32) {
        self.state.lock().unwrap().wait_failures = count;
    }

    pub fn panic_runs(&self, count: u32) {
        self.state.lock().unwrap().run_panics = count;
    }

    pub fn delay_runs(&self, delay: Duration) {
        self.state.lock().unwrap().run_delay = Some(delay);
    }

    pub fn created_count(&self) -> usize {
        self.state.lock().unwrap().created.len()
    }

    pub fn destroyed_count(&self) -> usize {
        self.state.lock().unwrap().destroyed.len()
    }

    pub fn destroyed_names(&self) -> Vec<String> {
        self.state.lock().unwrap().destroyed.clone()
    }

    pub fn run_count(&self) -> u32 {
        self.state.lock().unwrap().runs
    }
}

#[async_trait]
impl VmmsDriver for FakeVmms {
    async fn initialize_vm(&self, vm: &Machine) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.active.insert(vm.name.clone());
        state.created.push(vm.name.clone());
        Ok(())
    }

    async fn wait_vm(&self, _vm: &Machine, _max_secs: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.wait_failures > 0 {
            state.wait_failures -= 1;
            anyhow::bail!("scripted readiness failure");
        }
        Ok(())
    }

    async fn copy_in(&self, _vm: &Machine, _files: &[InputFile]) -> Result<()> {
        Ok(())
    }

    async fn run_job(
        &self,
        vm: &Machine,
        _timeout_secs: u64,
        sink: &mut OutputSink,
    ) -> Result<RunReport> {
        let (script, delay) = {
            let mut state = self.state.lock().unwrap();
            state.runs += 1;
            if state.run_panics > 0 {
                state.run_panics -= 1;
                drop(state);
                panic!("scripted worker crash");
            }
            (state.script.clone(), state.run_delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let report = match script {
            RunScript::Succeed { output, exit_code } => {
                sink.write(&output);
                RunReport {
                    exit_code: Some(exit_code),
                    outcome: RunOutcome::Normal,
                }
            }
            RunScript::Timeout { partial } => {
                sink.write(&partial);
                RunReport {
                    exit_code: None,
                    outcome: RunOutcome::Timeout,
                }
            }
            RunScript::Killed => RunReport {
                exit_code: None,
                outcome: RunOutcome::Killed,
            },
        };

        self.state
            .lock()
            .unwrap()
            .captures
            .insert(vm.name.clone(), sink.bytes().to_vec());

        Ok(report)
    }

    async fn copy_out(&self, vm: &Machine, dest: &Path) -> Result<()> {
        let bytes = self
            .state
            .lock()
            .unwrap()
            .captures
            .get(&vm.name)
            .cloned()
            .unwrap_or_default();
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, bytes).await?;
        Ok(())
    }

    async fn destroy_vm(&self, vm: &Machine) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.active.remove(&vm.name);
        state.destroyed.push(vm.name.clone());
        Ok(())
    }

    async fn safe_destroy_vm(&self, vm: &Machine) -> Result<()> {
        self.destroy_vm(vm).await
    }

    async fn get_vms(&self) -> Result<Vec<Machine>> {
        Ok(vec![])
    }

    async fn exists_vm(&self, vm: &Machine) -> Result<bool> {
        Ok(self.state.lock().unwrap().active.contains(&vm.name))
    }

    async fn get_images(&self) -> Result<Vec<String>> {
        Ok(self.images.clone())
    }
}
