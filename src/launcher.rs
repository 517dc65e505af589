//! Launcher trait - process creation, status and forced termination.
//!
//! # Lifecycle
//!
//! ```text
//! fork(id, options) → pid → reap(id, pid) ... destroy(id)
//! ```
//!
//! # Implementations
//!
//! - `PosixLauncher`: plain child processes in their own process group

use crate::error::Result;
use crate::id::ContainerId;
use crate::types::{CommandInfo, Mount, Namespace, RecoveredContainer};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;

/// Everything the launcher needs to create a container process.
#[derive(Debug, Clone)]
pub struct ForkOptions {
    /// Executor command.
    pub command: CommandInfo,
    /// Commands run to completion before the executor starts.
    pub pre_exec_commands: Vec<CommandInfo>,
    /// Complete environment of the process.
    pub environment: HashMap<String, String>,
    /// Working directory (the sandbox).
    pub working_dir: PathBuf,
    /// Provisioned root filesystem, if any.
    pub rootfs: Option<PathBuf>,
    /// Namespaces requested by isolators.
    pub namespaces: Vec<Namespace>,
    /// Mounts requested by isolators and the provisioner.
    pub mounts: Vec<Mount>,
    /// User to run as.
    pub user: Option<String>,
    /// File receiving stdout (inherited when `None`).
    pub stdout: Option<PathBuf>,
    /// File receiving stderr (inherited when `None`).
    pub stderr: Option<PathBuf>,
}

/// Launcher view of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LauncherStatus {
    /// Pid of the executor process.
    pub executor_pid: u32,
}

/// Process creation backend.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Returns the launcher name.
    fn name(&self) -> &str;

    /// Re-registers processes of recovered containers.
    async fn recover(&self, states: &[RecoveredContainer]) -> Result<()>;

    /// Creates the container process and returns its pid.
    async fn fork(&self, id: &ContainerId, options: ForkOptions) -> Result<u32>;

    /// Kills every process of the container and waits until they are gone.
    async fn destroy(&self, id: &ContainerId) -> Result<()>;

    /// Returns the status of a known container.
    ///
    /// # Errors
    ///
    /// `ContainerNotFound` for containers the launcher does not know.
    async fn status(&self, id: &ContainerId) -> Result<LauncherStatus>;

    /// Waits for the container process to exit.
    ///
    /// # Returns
    ///
    /// The exit status, or `None` when it cannot be observed (e.g. the
    /// process is not a child of this agent).
    async fn reap(&self, id: &ContainerId, pid: u32) -> Result<Option<i32>>;
}
