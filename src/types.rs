//! Containerizer data types.
//!
//! This module defines the descriptions the containerizer consumes and the
//! records it produces:
//! - `ExecutorInfo` / `TaskInfo` / `CommandInfo`: what to run
//! - `LaunchRequest`: arguments of a launch
//! - `LaunchInfo`: launch-time directives contributed by isolators
//! - `ContainerState`: per-container lifecycle state machine
//! - `Termination` / `Limitation`: final outcome of a container
//! - `AgentState`: checkpointed agent state handed to recovery

use crate::error::Result;
use crate::id::ContainerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

// =============================================================================
// Commands
// =============================================================================

/// An artifact to fetch into the sandbox before launch.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommandUri {
    /// Source location (`file://...` or an absolute path).
    pub value: String,
    /// Mark the fetched file executable.
    #[serde(default)]
    pub executable: bool,
    /// File name inside the sandbox (defaults to the source basename).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file: Option<String>,
}

impl CommandUri {
    /// Creates a URI with default options.
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            ..Self::default()
        }
    }
}

/// A command to run inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandInfo {
    /// Shell snippet (when `shell`) or program path.
    pub value: String,
    /// Run `value` through `sh -c`.
    #[serde(default = "default_shell")]
    pub shell: bool,
    /// Program arguments (ignored for shell commands).
    #[serde(default)]
    pub arguments: Vec<String>,
    /// Artifacts fetched before launch.
    #[serde(default)]
    pub uris: Vec<CommandUri>,
    /// Command-specific environment.
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// User override for this command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

fn default_shell() -> bool {
    true
}

impl CommandInfo {
    /// Creates a shell command.
    pub fn shell(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            shell: true,
            arguments: Vec::new(),
            uris: Vec::new(),
            environment: HashMap::new(),
            user: None,
        }
    }

    /// Creates a direct program invocation.
    pub fn program(path: impl Into<String>, arguments: Vec<String>) -> Self {
        Self {
            shell: false,
            arguments,
            ..Self::shell(path)
        }
    }
}

// =============================================================================
// Container / Image Descriptions
// =============================================================================

/// Containerizer implementation a container belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerType {
    /// Launched by this containerizer.
    #[default]
    Native,
    /// Launched by a Docker-based containerizer.
    Docker,
}

/// Image format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageKind {
    Docker,
    Appc,
}

/// Image to provision a root filesystem from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Image {
    pub kind: ImageKind,
    pub name: String,
}

impl Image {
    /// Creates a Docker image reference.
    pub fn docker(name: impl Into<String>) -> Self {
        Self {
            kind: ImageKind::Docker,
            name: name.into(),
        }
    }
}

/// Container settings attached to an executor or task.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContainerInfo {
    #[serde(rename = "type", default)]
    pub kind: ContainerType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<Image>,
}

/// Executor to run as the container's main process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorInfo {
    pub executor_id: String,
    pub command: CommandInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerInfo>,
}

impl ExecutorInfo {
    /// Creates an executor running `command` with no container settings.
    pub fn new(executor_id: impl Into<String>, command: CommandInfo) -> Self {
        Self {
            executor_id: executor_id.into(),
            command,
            container: None,
        }
    }

    /// Containerizer implementation this executor was launched with.
    pub fn container_type(&self) -> ContainerType {
        self.container
            .as_ref()
            .map(|c| c.kind)
            .unwrap_or_default()
    }
}

/// Task the executor is launched for.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerInfo>,
}

// =============================================================================
// Launch
// =============================================================================

/// Arguments of [`crate::Containerizer::launch`].
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    /// Identifier of the new container (nested ids carry their parent).
    pub container_id: ContainerId,
    /// Task context, if launched on behalf of a task.
    pub task: Option<TaskInfo>,
    /// Executor to run.
    pub executor: ExecutorInfo,
    /// Sandbox directory.
    pub directory: PathBuf,
    /// User to run as.
    pub user: Option<String>,
    /// Agent owning the container.
    pub agent_id: String,
    /// Explicit executor environment.
    pub environment: HashMap<String, String>,
    /// Whether the agent checkpoints this container.
    pub checkpoint: bool,
}

impl LaunchRequest {
    /// Creates a request with no task, user or environment.
    pub fn new(container_id: ContainerId, executor: ExecutorInfo, directory: impl Into<PathBuf>) -> Self {
        Self {
            container_id,
            task: None,
            executor,
            directory: directory.into(),
            user: None,
            agent_id: String::new(),
            environment: HashMap::new(),
            checkpoint: false,
        }
    }

    /// Parent container, for nested launches.
    pub fn parent(&self) -> Option<&ContainerId> {
        self.container_id.parent()
    }

    /// Image to provision, if any. The executor's image wins over the task's.
    pub fn image(&self) -> Option<&Image> {
        self.executor
            .container
            .as_ref()
            .and_then(|c| c.image.as_ref())
            .or_else(|| {
                self.task
                    .as_ref()
                    .and_then(|t| t.container.as_ref())
                    .and_then(|c| c.image.as_ref())
            })
    }
}

/// Configuration handed to isolators during `prepare`.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    pub executor: ExecutorInfo,
    pub task: Option<TaskInfo>,
    pub directory: PathBuf,
    pub user: Option<String>,
    /// Provisioned root filesystem, if an image was requested.
    pub rootfs: Option<PathBuf>,
    pub checkpoint: bool,
}

/// Linux namespaces an isolator may require for the container process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    Mount,
    Pid,
    Network,
    Ipc,
    Uts,
    User,
}

/// A bind mount requested for the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub source: PathBuf,
    pub target: PathBuf,
    #[serde(default)]
    pub read_only: bool,
}

/// Launch-time directives contributed by an isolator's `prepare`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LaunchInfo {
    /// Commands run before the executor, in order.
    #[serde(default)]
    pub pre_exec_commands: Vec<CommandInfo>,
    /// Environment variables for the executor.
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// Namespaces the process must be created in.
    #[serde(default)]
    pub namespaces: Vec<Namespace>,
    /// Extra mounts.
    #[serde(default)]
    pub mounts: Vec<Mount>,
}

// =============================================================================
// Lifecycle State
// =============================================================================

/// Per-container lifecycle state.
///
/// ```text
/// Fetching ─▶ Provisioning ─▶ Preparing ─▶ Launching ─▶ Isolating ─▶ Watching
///    │        (image only)        │            │            │           │
///    └────────────────────────────┴────────────┴────────────┴───────────┴─▶ Destroying ─▶ Terminated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Fetching,
    Provisioning,
    Preparing,
    Launching,
    Isolating,
    Watching,
    Destroying,
    Terminated,
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fetching => write!(f, "fetching"),
            Self::Provisioning => write!(f, "provisioning"),
            Self::Preparing => write!(f, "preparing"),
            Self::Launching => write!(f, "launching"),
            Self::Isolating => write!(f, "isolating"),
            Self::Watching => write!(f, "watching"),
            Self::Destroying => write!(f, "destroying"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Point-in-time view of a registered container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub container_id: ContainerId,
    pub state: ContainerState,
    /// Forked pid, once known.
    pub pid: Option<u32>,
    /// A destroy has been requested (externally or by a limitation).
    pub destroying: bool,
}

// =============================================================================
// Termination
// =============================================================================

/// A resource-policy violation reported by an isolator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limitation {
    /// Resource that was exceeded (e.g. `mem`, `disk`).
    pub resource: String,
    /// Human-readable description.
    pub message: String,
}

impl Limitation {
    pub fn new(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            message: message.into(),
        }
    }
}

/// Final outcome of a container.
///
/// A process exit status and a limitation are mutually exclusive: a container
/// killed because of a limitation has no exit status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Termination {
    /// Exit status of the container process, if it ran and was reaped.
    pub status: Option<i32>,
    /// Limitation that triggered the termination.
    pub limitation: Option<Limitation>,
    /// Human-readable reason.
    pub message: Option<String>,
    /// When the teardown finished.
    pub finished_at: DateTime<Utc>,
}

impl Termination {
    /// Returns true if an exit status was recorded.
    pub fn has_status(&self) -> bool {
        self.status.is_some()
    }

    /// Returns true if the container exited with status 0.
    pub fn is_success(&self) -> bool {
        self.status == Some(0)
    }
}

// =============================================================================
// Resources
// =============================================================================

/// Resource limits applied through `Isolator::update`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Resources {
    pub cpus: Option<f64>,
    pub mem_bytes: Option<u64>,
}

/// Usage reported by `Isolator::usage`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceStatistics {
    pub timestamp: DateTime<Utc>,
    pub processes: u32,
}

// =============================================================================
// Checkpointed Agent State
// =============================================================================

/// State of a container rebuilt during recovery, handed to collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveredContainer {
    pub container_id: ContainerId,
    pub pid: Option<u32>,
    pub directory: Option<PathBuf>,
}

/// A single checkpointed run of an executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub container_id: ContainerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forked_pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
    /// The run terminated and was acknowledged before the restart.
    #[serde(default)]
    pub completed: bool,
}

/// Checkpointed executor state.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecutorState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<ExecutorInfo>,
    /// Most recent run; earlier runs are not recovered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest: Option<RunState>,
}

/// Checkpointed framework state.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FrameworkState {
    #[serde(default)]
    pub executors: HashMap<String, ExecutorState>,
}

/// Checkpointed agent state passed to [`crate::Containerizer::recover`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AgentState {
    #[serde(default)]
    pub frameworks: HashMap<String, FrameworkState>,
}

impl AgentState {
    /// Parses a JSON agent checkpoint.
    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Loads a JSON agent checkpoint. A missing file is an empty state.
    pub fn from_file(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_json(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes the checkpoint through a temporary file so readers never see
    /// a partial state.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        let temp = path.with_extension("tmp");
        std::fs::write(&temp, content)?;
        std::fs::rename(&temp, path)?;
        Ok(())
    }

    /// Iterates over every executor's latest run with its executor info.
    pub fn latest_runs(&self) -> impl Iterator<Item = (&ExecutorState, &RunState)> {
        self.frameworks
            .values()
            .flat_map(|framework| framework.executors.values())
            .filter_map(|executor| executor.latest.as_ref().map(|run| (executor, run)))
    }
}
