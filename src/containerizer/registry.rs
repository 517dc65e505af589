//! Container records and the registry owning them.
//!
//! The registry is only ever touched from the control loop, so it needs no
//! locking. Records are linked parent → children to support cascading
//! teardown; a child is always inserted after its parent.

use crate::error::{Error, Result};
use crate::id::ContainerId;
use crate::types::{
    ContainerState, ContainerStatus, LaunchInfo, LaunchRequest, Limitation, Mount, Termination,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

/// Steps of a teardown, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Teardown {
    /// Cascaded destroys of the children are still running.
    AwaitingChildren,
    /// `Launcher::destroy` is in flight.
    KillingProcess,
    /// Processes are dead; waiting for the reaper to report the status.
    AwaitingExit,
    /// Fetcher, isolator and provisioner cleanup in flight.
    CleaningUp,
}

/// Single-resolution outcome of a container.
///
/// Callers that arrive while the container is alive are parked here and
/// answered exactly once by `finalize`.
#[derive(Debug, Default)]
pub(crate) struct Outcome {
    /// Final result once known. The error side is a teardown failure message.
    pub result: Option<std::result::Result<Termination, String>>,
    pub waiters: Vec<oneshot::Sender<Result<Option<Termination>>>>,
    pub destroyers: Vec<oneshot::Sender<Result<bool>>>,
}

impl Outcome {
    /// Answers a `wait` from the stored result.
    pub fn wait_reply(id: &ContainerId, result: &std::result::Result<Termination, String>) -> Result<Option<Termination>> {
        match result {
            Ok(termination) => Ok(Some(termination.clone())),
            Err(reason) => Err(Error::DestroyFailed {
                id: id.to_string(),
                reason: reason.clone(),
            }),
        }
    }

    /// Answers a `destroy` from the stored result.
    pub fn destroy_reply(id: &ContainerId, result: &std::result::Result<Termination, String>) -> Result<bool> {
        Self::wait_reply(id, result).map(|_| true)
    }
}

/// Lifecycle record of one container.
#[derive(Debug)]
pub(crate) struct Container {
    pub id: ContainerId,
    pub state: ContainerState,
    /// Launch arguments; `None` for recovered containers.
    pub request: Option<LaunchRequest>,
    pub directory: Option<PathBuf>,
    pub runtime_path: PathBuf,
    pub children: BTreeSet<ContainerId>,

    /// A collaborator call of the current stage is outstanding.
    pub busy: bool,
    /// Outstanding calls of a fan-out stage (prepare, isolate).
    pub pending: usize,

    pub pid: Option<u32>,
    pub rootfs: Option<PathBuf>,
    pub mounts: Vec<Mount>,
    pub launch_infos: BTreeMap<usize, LaunchInfo>,

    /// The fetch failed and may have left partial content behind.
    pub fetch_failed: bool,
    /// `Provisioner::provision` was called.
    pub provisioned: bool,
    /// Indexes of isolators whose `prepare` succeeded.
    pub prepared: BTreeSet<usize>,
    /// Indexes of isolators whose `isolate` succeeded.
    pub isolated: BTreeSet<usize>,
    /// Restrict cleanup to `isolated` (set after an isolate failure).
    pub isolate_failed: bool,

    pub destroy_requested: bool,
    /// Found on disk but unknown to the agent; nobody will collect it.
    pub orphan: bool,
    pub teardown: Option<Teardown>,
    pub launch_reply: Option<oneshot::Sender<Result<bool>>>,
    pub watches: Vec<AbortHandle>,
    pub reaper: Option<AbortHandle>,

    /// The reaper reported.
    pub exited: bool,
    pub exit_status: Option<i32>,
    pub limitation: Option<Limitation>,
    pub launch_error: Option<String>,
    /// Why a running container was torn down, if not by its own exit.
    pub reason: Option<String>,
    pub destroy_errors: Vec<String>,
    pub outcome: Outcome,
}

impl Container {
    pub fn new(id: ContainerId, state: ContainerState, runtime_path: PathBuf) -> Self {
        Self {
            id,
            state,
            request: None,
            directory: None,
            runtime_path,
            children: BTreeSet::new(),
            busy: false,
            pending: 0,
            pid: None,
            rootfs: None,
            mounts: Vec::new(),
            launch_infos: BTreeMap::new(),
            fetch_failed: false,
            provisioned: false,
            prepared: BTreeSet::new(),
            isolated: BTreeSet::new(),
            isolate_failed: false,
            destroy_requested: false,
            orphan: false,
            teardown: None,
            launch_reply: None,
            watches: Vec::new(),
            reaper: None,
            exited: false,
            exit_status: None,
            limitation: None,
            launch_error: None,
            reason: None,
            destroy_errors: Vec::new(),
            outcome: Outcome::default(),
        }
    }

    /// Isolators that must receive `cleanup`.
    pub fn cleanup_set(&self) -> Vec<usize> {
        if self.isolate_failed {
            self.isolated.iter().copied().collect()
        } else {
            self.prepared.iter().copied().collect()
        }
    }

    /// Records the first launch failure; later ones are only logged.
    pub fn fail_launch(&mut self, reason: String) {
        if self.launch_error.is_none() {
            self.launch_error = Some(reason);
        }
    }

    pub fn status(&self) -> ContainerStatus {
        ContainerStatus {
            container_id: self.id.clone(),
            state: self.state,
            pid: self.pid,
            destroying: self.destroy_requested,
        }
    }
}

/// In-memory map from identity to record.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    containers: HashMap<ContainerId, Container>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a record and links it to its parent.
    ///
    /// # Errors
    ///
    /// `ContainerAlreadyExists` for a duplicate id, `ContainerNotFound` if
    /// the parent is not registered.
    pub fn insert(&mut self, container: Container) -> Result<()> {
        if self.containers.contains_key(&container.id) {
            return Err(Error::ContainerAlreadyExists(container.id.to_string()));
        }
        if let Some(parent_id) = container.id.parent() {
            let parent = self
                .containers
                .get_mut(parent_id)
                .ok_or_else(|| Error::ContainerNotFound(parent_id.to_string()))?;
            parent.children.insert(container.id.clone());
        }
        self.containers.insert(container.id.clone(), container);
        Ok(())
    }

    pub fn get(&self, id: &ContainerId) -> Option<&Container> {
        self.containers.get(id)
    }

    pub fn get_mut(&mut self, id: &ContainerId) -> Option<&mut Container> {
        self.containers.get_mut(id)
    }

    /// Removes a record and unlinks it from its parent.
    pub fn remove(&mut self, id: &ContainerId) -> Option<Container> {
        let container = self.containers.remove(id)?;
        if let Some(parent_id) = id.parent()
            && let Some(parent) = self.containers.get_mut(parent_id)
        {
            parent.children.remove(id);
        }
        Some(container)
    }

    /// Ids of every record that has not terminated.
    pub fn live_ids(&self) -> impl Iterator<Item = &ContainerId> {
        self.containers
            .values()
            .filter(|c| c.state != ContainerState::Terminated)
            .map(|c| &c.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &ContainerId) -> Container {
        Container::new(id.clone(), ContainerState::Fetching, PathBuf::from("/run").join(id.value()))
    }

    #[test]
    fn test_insert_links_children() {
        let mut registry = Registry::new();
        let parent = ContainerId::new("p");
        let child = ContainerId::nested(&parent, "c");

        registry.insert(record(&parent)).unwrap();
        registry.insert(record(&child)).unwrap();
        assert!(registry.get(&parent).unwrap().children.contains(&child));

        registry.remove(&child);
        assert!(registry.get(&parent).unwrap().children.is_empty());
    }

    #[test]
    fn test_insert_rejects_duplicates_and_orphans() {
        let mut registry = Registry::new();
        let parent = ContainerId::new("p");

        registry.insert(record(&parent)).unwrap();
        assert!(matches!(
            registry.insert(record(&parent)),
            Err(Error::ContainerAlreadyExists(_))
        ));
        assert!(matches!(
            registry.insert(record(&ContainerId::nested(&ContainerId::new("x"), "c"))),
            Err(Error::ContainerNotFound(_))
        ));
    }

    #[test]
    fn test_cleanup_set_after_isolate_failure() {
        let mut container = record(&ContainerId::new("c"));
        container.prepared.extend([0, 1, 2]);
        container.isolated.insert(1);
        assert_eq!(container.cleanup_set(), vec![0, 1, 2]);

        container.isolate_failed = true;
        assert_eq!(container.cleanup_set(), vec![1]);
    }

    #[test]
    fn test_terminated_records_are_not_live() {
        let mut registry = Registry::new();
        let id = ContainerId::new("c");
        registry.insert(record(&id)).unwrap();
        registry.get_mut(&id).unwrap().state = ContainerState::Terminated;
        assert_eq!(registry.live_ids().count(), 0);
        assert!(registry.get(&id).is_some());
    }
}
