//! Scriptable collaborators shared by the containerizer integration tests.
//!
//! Every mock counts its calls. Stages that the tests need to interleave with
//! (fetch, provision, prepare) block on a [`Gate`] until the test opens it.

#![allow(dead_code)]

use async_trait::async_trait;
use magiklet::{
    CommandInfo, ContainerConfig, ContainerId, ContainerState, Containerizer, ContainerizerFlags,
    Error, ExecutorInfo, Fetcher, ForkOptions, Image, Isolator, LaunchInfo, LaunchRequest,
    Launcher, LauncherStatus, Limitation, ProvisionInfo, Provisioner, RecoveredContainer, Result,
    Termination,
};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;

pub const TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Gate
// =============================================================================

/// A latch a mock call blocks on until the test opens it.
pub struct Gate {
    open: watch::Sender<bool>,
    entered: AtomicUsize,
}

impl Gate {
    pub fn open() -> Self {
        Self {
            open: watch::Sender::new(true),
            entered: AtomicUsize::new(0),
        }
    }

    pub fn closed() -> Self {
        Self {
            open: watch::Sender::new(false),
            entered: AtomicUsize::new(0),
        }
    }

    pub fn release(&self) {
        self.open.send_replace(true);
    }

    /// Number of calls that reached the gate.
    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    async fn pass(&self) {
        self.entered.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.open.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }
}

// =============================================================================
// Fetcher
// =============================================================================

pub struct MockFetcher {
    pub gate: Gate,
    pub fail: AtomicBool,
    pub cleanups: AtomicUsize,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self {
            gate: Gate::open(),
            fail: AtomicBool::new(false),
            cleanups: AtomicUsize::new(0),
        }
    }

    pub fn gated() -> Self {
        Self {
            gate: Gate::closed(),
            ..Self::new()
        }
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(
        &self,
        id: &ContainerId,
        _command: &CommandInfo,
        _sandbox: &Path,
        _user: Option<&str>,
    ) -> Result<()> {
        self.gate.pass().await;
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::FetchFailed {
                id: id.to_string(),
                reason: "uri unreachable".to_string(),
            });
        }
        Ok(())
    }

    async fn cleanup(&self, _id: &ContainerId) -> Result<()> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// Provisioner
// =============================================================================

pub struct MockProvisioner {
    pub gate: Gate,
    pub fail: AtomicBool,
    pub fail_destroy: AtomicBool,
    pub destroys: AtomicUsize,
    pub known: Mutex<Option<HashSet<ContainerId>>>,
}

impl MockProvisioner {
    pub fn new() -> Self {
        Self {
            gate: Gate::open(),
            fail: AtomicBool::new(false),
            fail_destroy: AtomicBool::new(false),
            destroys: AtomicUsize::new(0),
            known: Mutex::new(None),
        }
    }

    pub fn gated() -> Self {
        Self {
            gate: Gate::closed(),
            ..Self::new()
        }
    }
}

#[async_trait]
impl Provisioner for MockProvisioner {
    async fn recover(&self, known: &HashSet<ContainerId>) -> Result<()> {
        *self.known.lock().unwrap() = Some(known.clone());
        Ok(())
    }

    async fn provision(&self, id: &ContainerId, image: &Image) -> Result<ProvisionInfo> {
        self.gate.pass().await;
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::ProvisionFailed {
                id: id.to_string(),
                reason: format!("cannot pull {}", image.name),
            });
        }
        Ok(ProvisionInfo::new(format!("/rootfs/{}", id.value())))
    }

    async fn destroy(&self, id: &ContainerId) -> Result<bool> {
        self.destroys.fetch_add(1, Ordering::SeqCst);
        if self.fail_destroy.load(Ordering::SeqCst) {
            return Err(Error::Internal(format!("rootfs of {} is busy", id)));
        }
        Ok(true)
    }
}

// =============================================================================
// Isolator
// =============================================================================

pub struct MockIsolator {
    name: String,
    pub gate: Gate,
    pub recover_gate: Gate,
    pub launch_info: Mutex<Option<LaunchInfo>>,
    pub fail_prepare: AtomicBool,
    pub fail_isolate: AtomicBool,
    pub fail_cleanup: AtomicBool,
    pub prepares: AtomicUsize,
    pub isolates: AtomicUsize,
    pub cleanups: AtomicUsize,
    pub recovered: Mutex<Vec<ContainerId>>,
    pub orphans: Mutex<HashSet<ContainerId>>,
    limitations: Mutex<HashMap<ContainerId, watch::Sender<Option<Limitation>>>>,
}

impl MockIsolator {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            gate: Gate::open(),
            recover_gate: Gate::open(),
            launch_info: Mutex::new(None),
            fail_prepare: AtomicBool::new(false),
            fail_isolate: AtomicBool::new(false),
            fail_cleanup: AtomicBool::new(false),
            prepares: AtomicUsize::new(0),
            isolates: AtomicUsize::new(0),
            cleanups: AtomicUsize::new(0),
            recovered: Mutex::new(Vec::new()),
            orphans: Mutex::new(HashSet::new()),
            limitations: Mutex::new(HashMap::new()),
        }
    }

    pub fn gated(name: &str) -> Self {
        Self {
            gate: Gate::closed(),
            ..Self::new(name)
        }
    }

    /// Holds `recover` until `recover_gate` is released.
    pub fn recovering(name: &str) -> Self {
        Self {
            recover_gate: Gate::closed(),
            ..Self::new(name)
        }
    }

    pub fn with_launch_info(name: &str, info: LaunchInfo) -> Self {
        let isolator = Self::new(name);
        *isolator.launch_info.lock().unwrap() = Some(info);
        isolator
    }

    fn with_limitation<T>(
        &self,
        id: &ContainerId,
        f: impl FnOnce(&watch::Sender<Option<Limitation>>) -> T,
    ) -> T {
        let mut limitations = self.limitations.lock().unwrap();
        f(limitations
            .entry(id.clone())
            .or_insert_with(|| watch::Sender::new(None)))
    }

    /// Reports a resource limitation for `id` through `watch`.
    pub fn limit(&self, id: &ContainerId, limitation: Limitation) {
        self.with_limitation(id, |tx| tx.send_replace(Some(limitation)));
    }
}

#[async_trait]
impl Isolator for MockIsolator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn recover(
        &self,
        states: &[RecoveredContainer],
        orphans: &HashSet<ContainerId>,
    ) -> Result<()> {
        self.recover_gate.pass().await;
        self.recovered
            .lock()
            .unwrap()
            .extend(states.iter().map(|s| s.container_id.clone()));
        self.orphans.lock().unwrap().extend(orphans.iter().cloned());
        Ok(())
    }

    async fn prepare(&self, id: &ContainerId, _config: &ContainerConfig) -> Result<Option<LaunchInfo>> {
        self.prepares.fetch_add(1, Ordering::SeqCst);
        self.gate.pass().await;
        if self.fail_prepare.load(Ordering::SeqCst) {
            return Err(Error::PrepareFailed {
                id: id.to_string(),
                isolator: self.name.clone(),
                reason: "no capacity".to_string(),
            });
        }
        Ok(self.launch_info.lock().unwrap().clone())
    }

    async fn isolate(&self, id: &ContainerId, _pid: u32) -> Result<()> {
        self.isolates.fetch_add(1, Ordering::SeqCst);
        if self.fail_isolate.load(Ordering::SeqCst) {
            return Err(Error::IsolateFailed {
                id: id.to_string(),
                isolator: self.name.clone(),
                reason: "cannot attach pid".to_string(),
            });
        }
        Ok(())
    }

    async fn watch(&self, id: &ContainerId) -> Result<Limitation> {
        let mut rx = self.with_limitation(id, |tx| tx.subscribe());
        let limitation = rx.wait_for(|l| l.is_some()).await.ok().and_then(|l| l.clone());
        match limitation {
            Some(limitation) => Ok(limitation),
            None => std::future::pending().await,
        }
    }

    async fn cleanup(&self, id: &ContainerId) -> Result<()> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        if self.fail_cleanup.load(Ordering::SeqCst) {
            return Err(Error::Internal(format!("{} still in use", id)));
        }
        Ok(())
    }
}

// =============================================================================
// Launcher
// =============================================================================

/// Launcher simulating processes: nothing is spawned, exits are scripted.
pub struct MockLauncher {
    next_pid: AtomicU32,
    pub fail_fork: AtomicBool,
    pub fail_destroy: AtomicBool,
    pub destroys: AtomicUsize,
    pub forks: Mutex<Vec<(ContainerId, ForkOptions)>>,
    pub recovered: Mutex<Vec<RecoveredContainer>>,
    processes: Mutex<HashMap<ContainerId, (u32, watch::Sender<Option<i32>>)>>,
}

impl MockLauncher {
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(1000),
            fail_fork: AtomicBool::new(false),
            fail_destroy: AtomicBool::new(false),
            destroys: AtomicUsize::new(0),
            forks: Mutex::new(Vec::new()),
            recovered: Mutex::new(Vec::new()),
            processes: Mutex::new(HashMap::new()),
        }
    }

    /// Makes the simulated process of `id` exit with `status`.
    pub fn exit(&self, id: &ContainerId, status: i32) {
        if let Some((_, exit)) = self.processes.lock().unwrap().get(id) {
            exit.send_replace(Some(status));
        }
    }

    pub fn fork_options(&self, id: &ContainerId) -> Option<ForkOptions> {
        self.forks
            .lock()
            .unwrap()
            .iter()
            .find(|(forked, _)| forked == id)
            .map(|(_, options)| options.clone())
    }
}

#[async_trait]
impl Launcher for MockLauncher {
    fn name(&self) -> &str {
        "mock"
    }

    async fn recover(&self, states: &[RecoveredContainer]) -> Result<()> {
        let mut processes = self.processes.lock().unwrap();
        for state in states {
            if let Some(pid) = state.pid {
                processes.insert(state.container_id.clone(), (pid, watch::Sender::new(None)));
            }
        }
        self.recovered.lock().unwrap().extend(states.iter().cloned());
        Ok(())
    }

    async fn fork(&self, id: &ContainerId, options: ForkOptions) -> Result<u32> {
        if self.fail_fork.load(Ordering::SeqCst) {
            return Err(Error::ForkFailed {
                id: id.to_string(),
                reason: "out of pids".to_string(),
            });
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.forks.lock().unwrap().push((id.clone(), options));
        self.processes
            .lock()
            .unwrap()
            .insert(id.clone(), (pid, watch::Sender::new(None)));
        Ok(pid)
    }

    async fn destroy(&self, id: &ContainerId) -> Result<()> {
        self.destroys.fetch_add(1, Ordering::SeqCst);
        if self.fail_destroy.load(Ordering::SeqCst) {
            return Err(Error::SignalFailed {
                id: id.to_string(),
                reason: "operation not permitted".to_string(),
            });
        }
        self.exit(id, 137);
        Ok(())
    }

    async fn status(&self, id: &ContainerId) -> Result<LauncherStatus> {
        self.processes
            .lock()
            .unwrap()
            .get(id)
            .map(|(pid, _)| LauncherStatus { executor_pid: *pid })
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))
    }

    async fn reap(&self, id: &ContainerId, _pid: u32) -> Result<Option<i32>> {
        let mut rx = self
            .processes
            .lock()
            .unwrap()
            .get(id)
            .map(|(_, exit)| exit.subscribe())
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;
        match rx.wait_for(|status| status.is_some()).await {
            Ok(status) => Ok(*status),
            Err(_) => Ok(None),
        }
    }
}

// =============================================================================
// Harness
// =============================================================================

pub struct Harness {
    pub dir: TempDir,
    pub containerizer: Containerizer,
    pub fetcher: Arc<MockFetcher>,
    pub provisioner: Arc<MockProvisioner>,
    pub isolators: Vec<Arc<MockIsolator>>,
    pub launcher: Arc<MockLauncher>,
}

impl Harness {
    pub fn new(isolators: Vec<MockIsolator>) -> Self {
        Self::with(MockFetcher::new(), MockProvisioner::new(), isolators)
    }

    pub fn with(
        fetcher: MockFetcher,
        provisioner: MockProvisioner,
        isolators: Vec<MockIsolator>,
    ) -> Self {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(fetcher);
        let provisioner = Arc::new(provisioner);
        let isolators: Vec<Arc<MockIsolator>> = isolators.into_iter().map(Arc::new).collect();
        let launcher = Arc::new(MockLauncher::new());

        let mut builder = Containerizer::builder(flags(dir.path()))
            .fetcher(fetcher.clone())
            .provisioner(provisioner.clone())
            .launcher(launcher.clone());
        for isolator in &isolators {
            builder = builder.isolator(isolator.clone());
        }

        Self {
            containerizer: builder.build().unwrap(),
            dir,
            fetcher,
            provisioner,
            isolators,
            launcher,
        }
    }

    pub fn runtime_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("run")
    }

    pub fn sandbox(&self, id: &ContainerId) -> std::path::PathBuf {
        self.dir.path().join("sandboxes").join(id.to_string())
    }

    pub fn request(&self, id: &ContainerId, command: &str) -> LaunchRequest {
        let sandbox = self.sandbox(id);
        std::fs::create_dir_all(&sandbox).unwrap();
        LaunchRequest::new(
            id.clone(),
            ExecutorInfo::new("executor", CommandInfo::shell(command)),
            sandbox,
        )
    }

    /// Launches `id` in the background so the test can interleave with it.
    pub fn spawn_launch(&self, request: LaunchRequest) -> tokio::task::JoinHandle<Result<bool>> {
        let containerizer = self.containerizer.clone();
        tokio::spawn(async move { containerizer.launch(request).await })
    }

    pub fn spawn_destroy(&self, id: &ContainerId) -> tokio::task::JoinHandle<Result<bool>> {
        let containerizer = self.containerizer.clone();
        let id = id.clone();
        tokio::spawn(async move { containerizer.destroy(&id).await })
    }

    pub fn spawn_wait(&self, id: &ContainerId) -> tokio::task::JoinHandle<Result<Option<Termination>>> {
        let containerizer = self.containerizer.clone();
        let id = id.clone();
        tokio::spawn(async move { containerizer.wait(&id).await })
    }

    pub async fn wait_for_state(&self, id: &ContainerId, state: ContainerState) {
        let containerizer = &self.containerizer;
        tokio::time::timeout(TIMEOUT, async {
            loop {
                let current = containerizer.status(id).await.unwrap().map(|s| s.state);
                if current == Some(state) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("container {} never reached {}", id, state));
    }
}

impl Harness {
    /// Waits until a destroy of `id` has been registered.
    pub async fn wait_for_state_destroying(&self, id: &ContainerId) {
        let containerizer = &self.containerizer;
        tokio::time::timeout(TIMEOUT, async {
            loop {
                let status = containerizer.status(id).await.unwrap();
                if status.is_some_and(|s| s.destroying) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("destroy of container {} never registered", id));
    }
}

/// Flags rooted in a temporary directory, without IO redirection.
pub fn flags(dir: &Path) -> ContainerizerFlags {
    ContainerizerFlags {
        runtime_dir: dir.join("run"),
        isolation: Vec::new(),
        reap_interval_ms: 10,
        forwarded_environment: Vec::new(),
        redirect_io: false,
        ..ContainerizerFlags::default()
    }
}

/// Logs to the test writer; `RUST_LOG=magiklet=debug` shows the control loop.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Polls `check` until it holds.
pub async fn eventually(check: impl Fn() -> bool) {
    tokio::time::timeout(TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

pub fn count(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}
