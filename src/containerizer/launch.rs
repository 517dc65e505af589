//! Launch pipeline.
//!
//! ```text
//! launch ─▶ fetch ─▶ [provision] ─▶ prepare (all isolators) ─▶ fork ─▶ isolate ─▶ watch
//!             │            │               │                    │         │
//!             └────────────┴───────────────┴── failure / destroy ┴─────────┴─▶ teardown
//! ```
//!
//! Each stage spawns its collaborator calls and returns; the completion
//! handler decides whether to advance, or to tear down because the stage
//! failed or a destroy arrived meanwhile.

use super::Message;
use super::process::Actor;
use super::registry::{Container, Teardown};
use crate::constants::{DEFAULT_PATH, SANDBOX_ENV, STDERR_FILE, STDOUT_FILE};
use crate::error::{Error, Result};
use crate::id::ContainerId;
use crate::launcher::ForkOptions;
use crate::paths;
use crate::provisioner::ProvisionInfo;
use crate::types::{
    CommandInfo, ContainerConfig, ContainerState, ContainerType, Image, LaunchInfo, LaunchRequest,
    Limitation, Mount, Namespace,
};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Launch directives of all isolators combined.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct MergedLaunch {
    pub environment: HashMap<String, String>,
    pub pre_exec_commands: Vec<CommandInfo>,
    pub namespaces: Vec<Namespace>,
    pub mounts: Vec<Mount>,
}

/// Combines the executor environment with isolator launch infos.
///
/// - `base` (caller environment overlaid with the command environment) is
///   never overridden by isolators
/// - isolators are merged in order; for the same variable the last one wins
/// - `forwarded` agent variables are added when absent from the result
/// - `PATH` and the sandbox variable get defaults when nobody set them
/// - pre-exec commands are concatenated in isolator order
pub(crate) fn merge_launch_infos<'a>(
    base: HashMap<String, String>,
    infos: impl IntoIterator<Item = &'a LaunchInfo>,
    forwarded: &HashMap<String, String>,
    sandbox: &Path,
) -> MergedLaunch {
    let protected: HashSet<String> = base.keys().cloned().collect();
    let mut merged = MergedLaunch {
        environment: base,
        ..MergedLaunch::default()
    };

    for info in infos {
        for (key, value) in &info.environment {
            if protected.contains(key) {
                debug!("Ignoring isolator override of caller variable {}", key);
                continue;
            }
            merged.environment.insert(key.clone(), value.clone());
        }
        merged.pre_exec_commands.extend(info.pre_exec_commands.iter().cloned());
        for namespace in &info.namespaces {
            if !merged.namespaces.contains(namespace) {
                merged.namespaces.push(*namespace);
            }
        }
        merged.mounts.extend(info.mounts.iter().cloned());
    }

    for (key, value) in forwarded {
        merged
            .environment
            .entry(key.clone())
            .or_insert_with(|| value.clone());
    }
    merged
        .environment
        .entry("PATH".to_string())
        .or_insert_with(|| DEFAULT_PATH.to_string());
    merged
        .environment
        .entry(SANDBOX_ENV.to_string())
        .or_insert_with(|| sandbox.display().to_string());

    merged
}

/// Caller environment overlaid with the executor command's own.
fn executor_environment(request: &LaunchRequest) -> HashMap<String, String> {
    let mut environment = request.environment.clone();
    environment.extend(
        request
            .executor
            .command
            .environment
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );
    environment
}

impl Actor {
    // =========================================================================
    // Accept
    // =========================================================================

    pub(super) fn launch(&mut self, request: LaunchRequest, reply: oneshot::Sender<Result<bool>>) {
        if let Err(e) = self.accept(&request) {
            warn!("Rejecting launch of container {}: {}", request.container_id, e);
            let _ = reply.send(Err(e));
            return;
        }

        let id = request.container_id.clone();
        let runtime_path = paths::runtime_path(&self.flags.runtime_dir, &id);
        let mut container = Container::new(id.clone(), ContainerState::Fetching, runtime_path);
        container.directory = Some(request.directory.clone());
        container.busy = true;

        let fetcher = Arc::clone(&self.fetcher);
        let command = request.executor.command.clone();
        let sandbox = request.directory.clone();
        let user = request.user.clone();
        container.request = Some(request);

        if let Err(e) = self.registry.insert(container) {
            warn!("Rejecting launch of container {}: {}", id, e);
            let _ = reply.send(Err(e));
            return;
        }
        if let Some(container) = self.registry.get_mut(&id) {
            container.launch_reply = Some(reply);
        }

        info!("Launching container {}", id);
        debug!("Fetching artifacts for container {}", id);
        let task_id = id;
        self.spawn(async move {
            let result = fetcher
                .fetch(&task_id, &command, &sandbox, user.as_deref())
                .await;
            Message::Fetched { id: task_id, result }
        });
    }

    fn accept(&self, request: &LaunchRequest) -> Result<()> {
        let id = &request.container_id;
        id.validate()?;

        // Duplicates and missing parents are rejected by the registry.
        if let Some(parent_id) = id.parent()
            && let Some(parent) = self.registry.get(parent_id)
        {
            if parent.destroy_requested || parent.teardown.is_some() || parent.state == ContainerState::Terminated {
                return Err(Error::InvalidState {
                    id: parent_id.to_string(),
                    state: parent.state.to_string(),
                    expected: "running".to_string(),
                });
            }
        }

        if request.executor.container_type() != ContainerType::Native {
            return Err(Error::NotSupported(format!(
                "container {} is not a native container",
                id
            )));
        }

        if request.image().is_some() && self.provisioner.is_none() {
            return Err(Error::NotSupported(format!(
                "container {} requests an image but no provisioner is configured",
                id
            )));
        }

        Ok(())
    }

    // =========================================================================
    // Fetch / Provision
    // =========================================================================

    pub(super) fn fetched(&mut self, id: ContainerId, result: Result<()>) {
        let Some(container) = self.registry.get_mut(&id) else {
            debug!("Ignoring fetch result of unknown container {}", id);
            return;
        };
        container.busy = false;

        if let Err(e) = result {
            warn!("Failed to fetch artifacts for container {}: {}", id, e);
            container.fetch_failed = true;
            container.fail_launch(e.to_string());
            self.start_teardown(&id);
            return;
        }

        if container.destroy_requested {
            self.start_teardown(&id);
            return;
        }

        let image = container.request.as_ref().and_then(|r| r.image().cloned());
        match image {
            Some(image) => self.provision(&id, image),
            None => self.prepare(&id),
        }
    }

    fn provision(&mut self, id: &ContainerId, image: Image) {
        let Some(container) = self.registry.get_mut(id) else {
            return;
        };
        let Some(provisioner) = self.provisioner.clone() else {
            container.fail_launch("no provisioner configured".to_string());
            self.start_teardown(id);
            return;
        };

        container.state = ContainerState::Provisioning;
        container.provisioned = true;
        container.busy = true;

        debug!("Provisioning image {} for container {}", image.name, id);
        let task_id = id.clone();
        self.spawn(async move {
            let result = provisioner.provision(&task_id, &image).await;
            Message::Provisioned { id: task_id, result }
        });
    }

    pub(super) fn provisioned(&mut self, id: ContainerId, result: Result<ProvisionInfo>) {
        let Some(container) = self.registry.get_mut(&id) else {
            debug!("Ignoring provision result of unknown container {}", id);
            return;
        };
        container.busy = false;

        match result {
            Ok(info) => {
                debug!("Provisioned rootfs {} for container {}", info.rootfs.display(), id);
                container.rootfs = Some(info.rootfs);
                container.mounts = info.mounts.unwrap_or_default();
            }
            Err(e) => {
                warn!("Failed to provision container {}: {}", id, e);
                container.fail_launch(e.to_string());
                self.start_teardown(&id);
                return;
            }
        }

        if container.destroy_requested {
            self.start_teardown(&id);
        } else {
            self.prepare(&id);
        }
    }

    // =========================================================================
    // Prepare
    // =========================================================================

    fn prepare(&mut self, id: &ContainerId) {
        let Some(container) = self.registry.get_mut(id) else {
            return;
        };
        let Some(request) = container.request.as_ref() else {
            return;
        };
        let config = ContainerConfig {
            executor: request.executor.clone(),
            task: request.task.clone(),
            directory: request.directory.clone(),
            user: request.user.clone(),
            rootfs: container.rootfs.clone(),
            checkpoint: request.checkpoint,
        };

        container.state = ContainerState::Preparing;
        if self.isolators.is_empty() {
            self.fork(id);
            return;
        }
        container.busy = true;
        container.pending = self.isolators.len();

        debug!("Preparing {} isolator(s) for container {}", self.isolators.len(), id);
        for (index, isolator) in self.isolators.iter().enumerate() {
            let isolator = Arc::clone(isolator);
            let config = config.clone();
            let task_id = id.clone();
            self.spawn(async move {
                let result = isolator.prepare(&task_id, &config).await;
                Message::Prepared {
                    id: task_id,
                    index,
                    result,
                }
            });
        }
    }

    pub(super) fn prepared(&mut self, id: ContainerId, index: usize, result: Result<Option<LaunchInfo>>) {
        let Some(container) = self.registry.get_mut(&id) else {
            debug!("Ignoring prepare result of unknown container {}", id);
            return;
        };
        container.pending = container.pending.saturating_sub(1);

        match result {
            Ok(info) => {
                container.prepared.insert(index);
                if let Some(info) = info {
                    container.launch_infos.insert(index, info);
                }
            }
            Err(e) => {
                let name = self.isolators.get(index).map_or("unknown", |i| i.name());
                warn!("Isolator {} failed to prepare container {}: {}", name, id, e);
                container.fail_launch(e.to_string());
            }
        }

        if container.pending > 0 {
            return;
        }
        container.busy = false;

        if container.launch_error.is_some() || container.destroy_requested {
            self.start_teardown(&id);
        } else {
            self.fork(&id);
        }
    }

    // =========================================================================
    // Fork
    // =========================================================================

    fn fork(&mut self, id: &ContainerId) {
        let forwarded: HashMap<String, String> = self
            .flags
            .forwarded_environment
            .iter()
            .filter_map(|name| std::env::var(name).ok().map(|value| (name.clone(), value)))
            .collect();
        let redirect_io = self.flags.redirect_io;

        let Some(container) = self.registry.get_mut(id) else {
            return;
        };
        let Some(request) = container.request.as_ref() else {
            return;
        };

        let merged = merge_launch_infos(
            executor_environment(request),
            container.launch_infos.values(),
            &forwarded,
            &request.directory,
        );
        let command = &request.executor.command;
        let options = ForkOptions {
            command: command.clone(),
            pre_exec_commands: merged.pre_exec_commands,
            environment: merged.environment,
            working_dir: request.directory.clone(),
            rootfs: container.rootfs.clone(),
            namespaces: merged.namespaces,
            mounts: container.mounts.iter().cloned().chain(merged.mounts).collect(),
            user: command.user.clone().or_else(|| request.user.clone()),
            stdout: redirect_io.then(|| request.directory.join(STDOUT_FILE)),
            stderr: redirect_io.then(|| request.directory.join(STDERR_FILE)),
        };
        let runtime_path = container.runtime_path.clone();

        container.state = ContainerState::Launching;
        container.busy = true;
        container.launch_infos.clear();

        debug!("Forking container {}", id);
        let launcher = Arc::clone(&self.launcher);
        let task_id = id.clone();
        self.spawn(async move {
            let result = match tokio::fs::create_dir_all(&runtime_path).await {
                Ok(()) => launcher.fork(&task_id, options).await,
                Err(e) => Err(Error::ForkFailed {
                    id: task_id.to_string(),
                    reason: format!(
                        "cannot create runtime directory {}: {}",
                        runtime_path.display(),
                        e
                    ),
                }),
            };
            Message::Forked { id: task_id, result }
        });
    }

    pub(super) fn forked(&mut self, id: ContainerId, result: Result<u32>) {
        let Some(container) = self.registry.get_mut(&id) else {
            debug!("Ignoring fork result of unknown container {}", id);
            return;
        };
        container.busy = false;

        let pid = match result {
            Ok(pid) => pid,
            Err(e) => {
                warn!("Failed to fork container {}: {}", id, e);
                container.exit_status = e.exit_status();
                container.fail_launch(e.to_string());
                self.start_teardown(&id);
                return;
            }
        };
        container.pid = Some(pid);
        debug!("Forked container {} with pid {}", id, pid);

        // The runtime directory exists already; the pid and status files are
        // written separately, and recovery tolerates a crash in between.
        let checkpoint = paths::write_pid(&self.flags.runtime_dir, &id, pid)
            .and_then(|()| paths::write_status(&self.flags.runtime_dir, &id, None));
        if let Err(e) = checkpoint {
            warn!("Failed to checkpoint pid of container {}: {}", id, e);
            container.fail_launch(format!("failed to checkpoint pid: {}", e));
        }

        self.start_reaper(&id, pid);

        let Some(container) = self.registry.get(&id) else {
            return;
        };
        if container.launch_error.is_some() || container.destroy_requested {
            self.start_teardown(&id);
        } else {
            self.isolate(&id, pid);
        }
    }

    /// Waits for the process in the background; reported as `Exited`.
    pub(super) fn start_reaper(&mut self, id: &ContainerId, pid: u32) {
        let launcher = Arc::clone(&self.launcher);
        let task_id = id.clone();
        let handle = self.spawn(async move {
            let result = launcher.reap(&task_id, pid).await;
            Message::Exited { id: task_id, result }
        });
        if let Some(container) = self.registry.get_mut(id) {
            container.reaper = handle;
        }
    }

    // =========================================================================
    // Isolate
    // =========================================================================

    fn isolate(&mut self, id: &ContainerId, pid: u32) {
        let Some(container) = self.registry.get_mut(id) else {
            return;
        };
        let isolators: Vec<_> = container
            .prepared
            .iter()
            .filter_map(|&index| self.isolators.get(index).map(|i| (index, Arc::clone(i))))
            .collect();

        container.state = ContainerState::Isolating;
        if isolators.is_empty() {
            self.watch(id);
            return;
        }
        container.busy = true;
        container.pending = isolators.len();

        debug!("Isolating container {} (pid {})", id, pid);
        for (index, isolator) in isolators {
            let task_id = id.clone();
            self.spawn(async move {
                let result = isolator.isolate(&task_id, pid).await;
                Message::Isolated {
                    id: task_id,
                    index,
                    result,
                }
            });
        }
    }

    pub(super) fn isolated(&mut self, id: ContainerId, index: usize, result: Result<()>) {
        let Some(container) = self.registry.get_mut(&id) else {
            debug!("Ignoring isolate result of unknown container {}", id);
            return;
        };
        container.pending = container.pending.saturating_sub(1);

        match result {
            Ok(()) => {
                container.isolated.insert(index);
            }
            Err(e) => {
                let name = self.isolators.get(index).map_or("unknown", |i| i.name());
                warn!("Isolator {} failed to isolate container {}: {}", name, id, e);
                container.isolate_failed = true;
                container.fail_launch(e.to_string());
            }
        }

        if container.pending > 0 {
            return;
        }
        container.busy = false;

        if container.launch_error.is_some() || container.destroy_requested {
            self.start_teardown(&id);
        } else {
            self.watch(&id);
        }
    }

    // =========================================================================
    // Watch
    // =========================================================================

    /// Moves a container to `Watching` and arms the limitation watches.
    pub(super) fn watch(&mut self, id: &ContainerId) {
        let Some(container) = self.registry.get_mut(id) else {
            return;
        };
        container.state = ContainerState::Watching;
        container.busy = false;

        if let Some(reply) = container.launch_reply.take() {
            info!("Container {} is running (pid {:?})", id, container.pid);
            self.metrics.record_launch();
            let _ = reply.send(Ok(true));
        }

        // The process may have exited while we were still isolating.
        if container.exited {
            self.start_teardown(id);
            return;
        }

        let isolators: Vec<_> = container
            .prepared
            .iter()
            .filter_map(|&index| self.isolators.get(index).map(|i| (index, Arc::clone(i))))
            .collect();

        let mut watches = Vec::with_capacity(isolators.len());
        for (index, isolator) in isolators {
            let task_id = id.clone();
            let handle = self.spawn(async move {
                let result = isolator.watch(&task_id).await;
                Message::Limited {
                    id: task_id,
                    index,
                    result,
                }
            });
            watches.extend(handle);
        }

        if let Some(container) = self.registry.get_mut(id) {
            container.watches = watches;
        }
    }

    pub(super) fn exited(&mut self, id: ContainerId, result: Result<Option<i32>>) {
        let Some(container) = self.registry.get_mut(&id) else {
            debug!("Ignoring exit of unknown container {}", id);
            return;
        };

        let status = result.unwrap_or_else(|e| {
            warn!("Failed to reap container {}: {}", id, e);
            None
        });
        container.exited = true;
        container.reaper = None;
        if container.exit_status.is_none() {
            container.exit_status = status;
        }
        info!("Container {} exited with status {:?}", id, status);

        if let Some(status) = status
            && let Err(e) = paths::write_status(&self.flags.runtime_dir, &id, Some(status))
        {
            debug!("Failed to checkpoint status of container {}: {}", id, e);
        }

        let watching = container.state == ContainerState::Watching && !container.busy;
        match container.teardown {
            Some(Teardown::AwaitingExit) => self.cleanup(&id),
            Some(_) => {}
            None if watching => self.start_teardown(&id),
            // Still launching: picked up once the container reaches watching.
            None => {}
        }
    }

    pub(super) fn limited(&mut self, id: ContainerId, index: usize, result: Result<Limitation>) {
        let Some(container) = self.registry.get_mut(&id) else {
            debug!("Ignoring limitation of unknown container {}", id);
            return;
        };
        if container.destroy_requested || container.teardown.is_some() {
            return;
        }

        let name = self.isolators.get(index).map_or("unknown", |i| i.name());
        match result {
            Ok(limitation) => {
                info!(
                    "Container {} reached limitation {} of isolator {}: {}",
                    id, limitation.resource, name, limitation.message
                );
                container.reason = Some(limitation.message.clone());
                container.limitation = Some(limitation);
            }
            Err(e) => {
                warn!("Isolator {} failed to watch container {}: {}", name, id, e);
                container.reason = Some(format!("isolator '{}' watch failed: {}", name, e));
            }
        }

        self.request_destroy(&id);
    }
}
