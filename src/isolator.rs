//! Isolator trait - one resource or namespace dimension of a container.
//!
//! Isolators are engaged in three steps by the launch pipeline:
//!
//! ```text
//! prepare(id, config) → [fork] → isolate(id, pid) → watch(id) ... cleanup(id)
//! ```
//!
//! `cleanup` is only ever called for isolators whose `prepare` succeeded, and
//! at most once per container.
//!
//! # Implementations
//!
//! - `PosixIsolator`: pid bookkeeping only, no enforcement

use crate::error::{Error, Result};
use crate::id::ContainerId;
use crate::types::{ContainerConfig, LaunchInfo, Limitation, RecoveredContainer, ResourceStatistics, Resources};
use async_trait::async_trait;
use std::collections::HashSet;

/// Pluggable isolation backend.
#[async_trait]
pub trait Isolator: Send + Sync {
    /// Returns the isolator name (used in logs and errors).
    fn name(&self) -> &str;

    /// Rebuilds internal state after a restart.
    ///
    /// # Arguments
    ///
    /// * `states` - Containers recovered by the containerizer
    /// * `orphans` - Containers found on disk but unknown to the agent; they
    ///   are destroyed right after recovery
    async fn recover(
        &self,
        states: &[RecoveredContainer],
        orphans: &HashSet<ContainerId>,
    ) -> Result<()>;

    /// Prepares the isolation boundary before the process exists.
    ///
    /// # Returns
    ///
    /// Optional launch directives (pre-exec commands, environment, namespaces)
    /// merged into the fork.
    async fn prepare(&self, id: &ContainerId, config: &ContainerConfig) -> Result<Option<LaunchInfo>>;

    /// Attaches the isolator to the freshly forked process.
    async fn isolate(&self, id: &ContainerId, pid: u32) -> Result<()>;

    /// Resolves if the container violates this isolator's policy.
    ///
    /// The default never resolves.
    async fn watch(&self, id: &ContainerId) -> Result<Limitation> {
        let _ = id;
        std::future::pending().await
    }

    /// Applies new resource limits.
    async fn update(&self, id: &ContainerId, resources: &Resources) -> Result<()> {
        let _ = (id, resources);
        Err(Error::NotSupported(format!("update not supported by {} isolator", self.name())))
    }

    /// Reports resource usage.
    async fn usage(&self, id: &ContainerId) -> Result<ResourceStatistics> {
        let _ = id;
        Err(Error::NotSupported(format!("usage not supported by {} isolator", self.name())))
    }

    /// Releases everything `prepare`/`isolate` set up.
    async fn cleanup(&self, id: &ContainerId) -> Result<()>;
}
