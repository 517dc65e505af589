//! Error types for the containerizer.

use std::path::PathBuf;

/// Result type alias for containerizer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while orchestrating containers.
///
/// "Not found" conditions on `wait`, `destroy` and `status` are NOT reported
/// through this type: those operations return `None`/`false` instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Container Lifecycle Errors
    // =========================================================================
    /// Container not found.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Container already exists.
    #[error("container already exists: {0}")]
    ContainerAlreadyExists(String),

    /// Container identifier failed validation.
    #[error("invalid container ID '{id}': {reason}")]
    InvalidContainerId { id: String, reason: String },

    /// Container is in wrong state for operation.
    #[error("container '{id}' is in state '{state}', expected '{expected}'")]
    InvalidState {
        id: String,
        state: String,
        expected: String,
    },

    // =========================================================================
    // Launch Errors
    // =========================================================================
    /// The launch did not reach the watching stage.
    #[error("failed to launch container '{id}': {reason}")]
    LaunchFailed { id: String, reason: String },

    /// Artifact fetch failed.
    #[error("failed to fetch artifacts for container '{id}': {reason}")]
    FetchFailed { id: String, reason: String },

    /// Image provisioning failed.
    #[error("failed to provision image for container '{id}': {reason}")]
    ProvisionFailed { id: String, reason: String },

    /// An isolator failed to prepare.
    #[error("isolator '{isolator}' failed to prepare container '{id}': {reason}")]
    PrepareFailed {
        id: String,
        isolator: String,
        reason: String,
    },

    /// The launcher could not create the container process.
    #[error("failed to fork container '{id}': {reason}")]
    ForkFailed { id: String, reason: String },

    /// A pre-exec command exited unsuccessfully.
    #[error("pre-exec command '{command}' for container '{id}' exited with status {status}")]
    PreExecFailed {
        id: String,
        command: String,
        status: i32,
    },

    /// An isolator failed to attach to the container process.
    #[error("isolator '{isolator}' failed to isolate container '{id}': {reason}")]
    IsolateFailed {
        id: String,
        isolator: String,
        reason: String,
    },

    // =========================================================================
    // Teardown Errors
    // =========================================================================
    /// The container could not be torn down completely.
    #[error("failed to destroy container '{id}': {reason}")]
    DestroyFailed { id: String, reason: String },

    /// An isolator failed to clean up.
    #[error("isolator '{isolator}' failed to clean up container '{id}': {reason}")]
    CleanupFailed {
        id: String,
        isolator: String,
        reason: String,
    },

    /// Signal delivery failed.
    #[error("failed to send signal to container '{id}': {reason}")]
    SignalFailed { id: String, reason: String },

    // =========================================================================
    // Checkpoint / Recovery Errors
    // =========================================================================
    /// A checkpoint file exists but could not be read.
    #[error("failed to read checkpoint {path}: {reason}")]
    CheckpointRead { path: PathBuf, reason: String },

    /// A checkpoint file exists but holds malformed content.
    #[error("malformed checkpoint {path}: '{content}'")]
    CheckpointParse { path: PathBuf, content: String },

    /// Recovery of a container failed.
    #[error("failed to recover container '{id}': {reason}")]
    RecoveryFailed { id: String, reason: String },

    /// A path does not belong to the expected directory tree.
    #[error("path {path} is not under {root}")]
    PathOutsideRoot { path: PathBuf, root: PathBuf },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid containerizer flags.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // =========================================================================
    // Generic Errors
    // =========================================================================
    /// Operation not supported by this collaborator.
    #[error("operation not supported: {0}")]
    NotSupported(String),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The control loop is no longer running.
    #[error("containerizer is not running")]
    ContainerizerStopped,

    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl Error {
    /// Exit status carried by the error, if the failure came from a process.
    pub fn exit_status(&self) -> Option<i32> {
        match self {
            Self::PreExecFailed { status, .. } => Some(*status),
            _ => None,
        }
    }
}
