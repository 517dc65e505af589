//! Provisioner trait - root filesystems from images.
//!
//! The containerizer only provisions when the executor (or task) names an
//! image. Whatever `provision` produced, including a partially provisioned
//! root after a failure, is released through `destroy` during teardown.

use crate::error::Result;
use crate::id::ContainerId;
use crate::types::{Image, Mount};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::PathBuf;

/// Result of a successful provision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionInfo {
    /// Root filesystem of the container.
    pub rootfs: PathBuf,
    /// Additional mounts required by the image, if any.
    pub mounts: Option<Vec<Mount>>,
}

impl ProvisionInfo {
    pub fn new(rootfs: impl Into<PathBuf>) -> Self {
        Self {
            rootfs: rootfs.into(),
            mounts: None,
        }
    }
}

/// Image provisioning backend.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Reconciles provisioned roots after a restart.
    ///
    /// # Arguments
    ///
    /// * `known` - Containers the containerizer recovered; anything else the
    ///   provisioner holds is stale and may be removed.
    async fn recover(&self, known: &HashSet<ContainerId>) -> Result<()>;

    /// Provisions a root filesystem for `id` from `image`.
    async fn provision(&self, id: &ContainerId, image: &Image) -> Result<ProvisionInfo>;

    /// Releases everything provisioned for `id`.
    ///
    /// # Returns
    ///
    /// `true` if something was removed, `false` if nothing was provisioned.
    async fn destroy(&self, id: &ContainerId) -> Result<bool>;
}
