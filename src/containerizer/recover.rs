//! Recovery after an agent restart.
//!
//! 1. Plan (off the loop): walk the runtime tree parent-first, drop foreign
//!    containers and their descendants, read pid/status checkpoints and split
//!    the rest into recovered containers and orphans.
//! 2. Register every planned container, parents before children.
//! 3. Let launcher, isolators and provisioner rebuild their state.
//! 4. Resume reaping and watching; tear down containers that never got a
//!    pid, that exited while the agent was down, and every orphan.

use super::Message;
use super::process::Actor;
use super::registry::Container;
use crate::error::{Error, Result};
use crate::id::ContainerId;
use crate::paths;
use crate::types::{AgentState, ContainerState, ContainerType, RecoveredContainer};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// One container found during recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RecoveredEntry {
    pub id: ContainerId,
    /// Checkpointed pid; `None` if the agent died before writing it.
    pub pid: Option<u32>,
    /// Exit status written before the agent died.
    pub status: Option<i32>,
    pub directory: Option<PathBuf>,
}

impl RecoveredEntry {
    fn state(&self) -> RecoveredContainer {
        RecoveredContainer {
            container_id: self.id.clone(),
            pid: self.pid,
            directory: self.directory.clone(),
        }
    }
}

/// Result of the planning step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct RecoveryPlan {
    /// Containers known to the agent (and their nested containers), parents
    /// first.
    pub recovered: Vec<RecoveredEntry>,
    /// Containers on disk whose root the agent does not know, parents first.
    pub orphans: Vec<RecoveredEntry>,
}

impl RecoveryPlan {
    fn entries(&self) -> impl DoubleEndedIterator<Item = &RecoveredEntry> {
        self.recovered.iter().chain(self.orphans.iter())
    }
}

/// Builds the recovery plan from the runtime tree and the agent checkpoint.
///
/// # Errors
///
/// Unreadable runtime directories and malformed pid/status files. A missing
/// pid or status file is not an error.
pub(crate) fn plan_recovery(runtime_dir: &Path, state: &AgentState) -> Result<RecoveryPlan> {
    // Root container -> (checkpointed pid, sandbox) for live native runs.
    let mut alive: BTreeMap<ContainerId, (Option<u32>, Option<PathBuf>)> = BTreeMap::new();
    let mut foreign: HashSet<ContainerId> = HashSet::new();

    for (executor, run) in state.latest_runs() {
        let kind = executor
            .info
            .as_ref()
            .map(|info| info.container_type())
            .unwrap_or_default();
        if kind != ContainerType::Native {
            debug!(
                "Skipping recovery of {:?} container {}",
                kind, run.container_id
            );
            foreign.insert(run.container_id.clone());
            continue;
        }
        if run.completed {
            debug!("Skipping recovery of completed container {}", run.container_id);
            continue;
        }
        alive.insert(
            run.container_id.clone(),
            (run.forked_pid, run.directory.clone()),
        );
    }

    let mut plan = RecoveryPlan::default();
    let mut seen: HashSet<ContainerId> = HashSet::new();

    for id in paths::list_container_ids(runtime_dir)? {
        if id.ancestry().into_iter().any(|ancestor| foreign.contains(ancestor)) {
            debug!("Leaving container {} to its owner", id);
            continue;
        }

        let pid = paths::read_pid(runtime_dir, &id)?;
        let status = paths::read_status(runtime_dir, &id)?;

        match alive.get(id.root()) {
            Some((_, sandbox)) => {
                let directory = sandbox.as_deref().map(|root| paths::sandbox_path(root, &id));
                seen.insert(id.clone());
                plan.recovered.push(RecoveredEntry {
                    id,
                    pid,
                    status,
                    directory,
                });
            }
            None => plan.orphans.push(RecoveredEntry {
                id,
                pid,
                status,
                directory: None,
            }),
        }
    }

    // Runs checkpointed without a runtime directory: trust the forked pid.
    for (id, (forked_pid, directory)) in alive {
        if seen.contains(&id) {
            continue;
        }
        match forked_pid {
            Some(pid) => plan.recovered.push(RecoveredEntry {
                id,
                pid: Some(pid),
                status: None,
                directory,
            }),
            None => debug!("Skipping container {} with no forked pid", id),
        }
    }

    Ok(plan)
}

impl Actor {
    pub(super) fn recover(&mut self, state: AgentState, reply: oneshot::Sender<Result<()>>) {
        info!("Recovering containers");
        let runtime_dir = self.flags.runtime_dir.clone();
        self.spawn(async move {
            let result = tokio::task::spawn_blocking(move || plan_recovery(&runtime_dir, &state))
                .await
                .map_err(|e| Error::Internal(format!("recovery planning panicked: {}", e)))
                .and_then(|plan| plan);
            Message::RecoveryPlanned { result, reply }
        });
    }

    pub(super) fn recovery_planned(
        &mut self,
        result: Result<RecoveryPlan>,
        reply: oneshot::Sender<Result<()>>,
    ) {
        let plan = match result {
            Ok(plan) => plan,
            Err(e) => {
                warn!("Failed to recover containers: {}", e);
                let _ = reply.send(Err(e));
                return;
            }
        };

        let orphan_ids: HashSet<ContainerId> = plan.orphans.iter().map(|e| e.id.clone()).collect();
        let mut inserted: Vec<ContainerId> = Vec::new();

        for entry in plan.entries() {
            let state = if entry.pid.is_some() {
                ContainerState::Watching
            } else {
                ContainerState::Launching
            };
            let runtime_path = paths::runtime_path(&self.flags.runtime_dir, &entry.id);
            let mut container = Container::new(entry.id.clone(), state, runtime_path);
            container.pid = entry.pid;
            container.directory = entry.directory.clone();
            container.orphan = orphan_ids.contains(&entry.id);
            // Recovered containers went through prepare before the restart.
            container.prepared = (0..self.isolators.len()).collect();
            container.busy = true;
            if let Some(status) = entry.status {
                container.exited = true;
                container.exit_status = Some(status);
            }

            if let Err(e) = self.registry.insert(container) {
                for id in inserted.iter().rev() {
                    self.registry.remove(id);
                }
                let _ = reply.send(Err(Error::RecoveryFailed {
                    id: entry.id.to_string(),
                    reason: e.to_string(),
                }));
                return;
            }
            inserted.push(entry.id.clone());
        }

        let states: Vec<RecoveredContainer> = plan.recovered.iter().map(RecoveredEntry::state).collect();
        let all: Vec<RecoveredContainer> = plan.entries().map(RecoveredEntry::state).collect();
        let owned: HashSet<ContainerId> = inserted.into_iter().collect();

        let launcher = Arc::clone(&self.launcher);
        let isolators = self.isolators.clone();
        let provisioner = self.provisioner.clone();
        self.spawn(async move {
            let result = async {
                launcher.recover(&all).await?;
                for isolator in &isolators {
                    isolator.recover(&states, &orphan_ids).await?;
                }
                if let Some(provisioner) = provisioner {
                    provisioner.recover(&owned).await?;
                }
                Ok::<(), Error>(())
            }
            .await;
            Message::RecoveryDone {
                plan,
                result,
                reply,
            }
        });
    }

    pub(super) fn recovery_done(
        &mut self,
        plan: RecoveryPlan,
        result: Result<()>,
        reply: oneshot::Sender<Result<()>>,
    ) {
        if let Err(e) = result {
            warn!("Collaborator recovery failed: {}", e);
            for entry in plan.entries().rev() {
                self.registry.remove(&entry.id);
            }
            let _ = reply.send(Err(e));
            return;
        }

        // Every record must be idle and reaped before any teardown starts,
        // since a parent's teardown cascades into its children.
        let mut reap: HashMap<ContainerId, u32> = HashMap::new();
        let mut deferred = Vec::new();
        for entry in plan.entries() {
            if let Some(container) = self.registry.get_mut(&entry.id) {
                container.busy = false;
                if let (Some(pid), false) = (container.pid, container.exited) {
                    reap.insert(entry.id.clone(), pid);
                }
                if container.destroy_requested && container.teardown.is_none() {
                    deferred.push(entry.id.clone());
                }
            }
        }
        for (id, pid) in &reap {
            self.start_reaper(id, *pid);
        }

        // Destroys that arrived while the collaborators were recovering.
        for id in &deferred {
            debug!("Starting deferred destroy of recovered container {}", id);
            self.start_teardown(id);
        }

        for entry in &plan.recovered {
            let Some(container) = self.registry.get_mut(&entry.id) else {
                continue;
            };
            if container.teardown.is_some() {
                continue;
            }
            if container.pid.is_none() {
                container.reason = Some("container was not launched before the agent restarted".to_string());
                self.request_destroy(&entry.id);
            } else {
                self.watch(&entry.id);
            }
        }

        for entry in &plan.orphans {
            if let Some(container) = self.registry.get_mut(&entry.id) {
                container.reason = Some("orphan container".to_string());
            }
            if entry.id.parent().is_none() {
                self.request_destroy(&entry.id);
            }
        }

        self.metrics.record_recovered(plan.recovered.len() as u64);
        info!(
            "Recovered {} container(s), destroying {} orphan(s)",
            plan.recovered.len(),
            plan.orphans.len()
        );
        let _ = reply.send(Ok(()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CommandInfo, ContainerInfo, ExecutorInfo, ExecutorState, FrameworkState, RunState};
    use tempfile::TempDir;

    fn checkpoint(runtime_dir: &Path, id: &ContainerId, pid: Option<u32>, status: Option<&str>) {
        let path = paths::runtime_path(runtime_dir, id);
        std::fs::create_dir_all(&path).unwrap();
        if let Some(pid) = pid {
            std::fs::write(path.join("pid"), pid.to_string()).unwrap();
        }
        if let Some(status) = status {
            std::fs::write(path.join("status"), status).unwrap();
        }
    }

    fn agent_state(runs: Vec<(ContainerId, ContainerType, Option<u32>)>) -> AgentState {
        let executors = runs
            .into_iter()
            .enumerate()
            .map(|(i, (id, kind, pid))| {
                let mut info = ExecutorInfo::new(format!("e{i}"), CommandInfo::shell("sleep 100"));
                info.container = Some(ContainerInfo { kind, image: None });
                let executor = ExecutorState {
                    info: Some(info),
                    latest: Some(RunState {
                        container_id: id,
                        forked_pid: pid,
                        directory: Some(PathBuf::from("/sandbox")),
                        completed: false,
                    }),
                };
                (format!("e{i}"), executor)
            })
            .collect();
        let mut state = AgentState::default();
        state
            .frameworks
            .insert("fw".to_string(), FrameworkState { executors });
        state
    }

    #[test]
    fn test_plan_splits_recovered_foreign_and_orphans() {
        let dir = TempDir::new().unwrap();
        let native = ContainerId::new("native");
        let nested = ContainerId::nested(&native, "child");
        let docker = ContainerId::new("docker");
        let docker_child = ContainerId::nested(&docker, "child");
        let orphan = ContainerId::new("orphan");

        checkpoint(dir.path(), &native, Some(10), Some(""));
        checkpoint(dir.path(), &nested, Some(11), None);
        checkpoint(dir.path(), &docker, Some(20), None);
        checkpoint(dir.path(), &docker_child, Some(21), None);
        checkpoint(dir.path(), &orphan, None, None);

        let state = agent_state(vec![
            (native.clone(), ContainerType::Native, Some(10)),
            (docker.clone(), ContainerType::Docker, Some(20)),
        ]);
        let plan = plan_recovery(dir.path(), &state).unwrap();

        let recovered: Vec<&ContainerId> = plan.recovered.iter().map(|e| &e.id).collect();
        assert_eq!(recovered, vec![&native, &nested]);
        assert_eq!(plan.recovered[0].pid, Some(10));
        assert_eq!(plan.recovered[0].status, None);
        assert_eq!(
            plan.recovered[1].directory,
            Some(PathBuf::from("/sandbox/containers/child"))
        );

        assert_eq!(plan.orphans.len(), 1);
        assert_eq!(plan.orphans[0].id, orphan);
        assert_eq!(plan.orphans[0].pid, None);
    }

    #[test]
    fn test_plan_uses_forked_pid_without_runtime_directory() {
        let dir = TempDir::new().unwrap();
        let id = ContainerId::new("legacy");
        let state = agent_state(vec![(id.clone(), ContainerType::Native, Some(42))]);

        let plan = plan_recovery(dir.path(), &state).unwrap();
        assert_eq!(plan.recovered.len(), 1);
        assert_eq!(plan.recovered[0].pid, Some(42));
    }

    #[test]
    fn test_plan_fails_on_malformed_pid() {
        let dir = TempDir::new().unwrap();
        let id = ContainerId::new("c");
        checkpoint(dir.path(), &id, None, None);
        std::fs::write(paths::runtime_path(dir.path(), &id).join("pid"), "not-a-pid").unwrap();

        let state = agent_state(vec![(id, ContainerType::Native, None)]);
        assert!(matches!(
            plan_recovery(dir.path(), &state),
            Err(Error::CheckpointParse { .. })
        ));
    }
}
