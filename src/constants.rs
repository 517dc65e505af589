//! # Containerizer Constants
//!
//! On-disk layout names, defaults and validation bounds shared by the path
//! codec, the control loop and the built-in collaborators.
//!
//! ## On-Disk Layout
//!
//! ```text
//! <runtime_dir>/
//! └── containers/                     RUNTIME_CONTAINER_DIRECTORY
//!     └── <root-id>/
//!         ├── pid                     PID_FILE
//!         ├── status                  STATUS_FILE
//!         └── containers/
//!             └── <child-id>/
//!                 ├── pid
//!                 └── status
//!
//! <root-sandbox>/                     sandbox of the root container
//! └── containers/                     SANDBOX_CONTAINER_DIRECTORY
//!     └── <child-id>/                 sandbox of a nested container
//! ```
//!
//! The two nesting markers are independent constants. They currently hold the
//! same literal but nothing in the codec relies on that.

use std::time::Duration;

// =============================================================================
// Directory Layout
// =============================================================================

/// Nesting marker segment in the runtime (checkpoint) tree.
pub const RUNTIME_CONTAINER_DIRECTORY: &str = "containers";

/// Nesting marker segment in the sandbox (working directory) tree.
pub const SANDBOX_CONTAINER_DIRECTORY: &str = "containers";

/// Checkpoint file holding the forked pid of a container.
pub const PID_FILE: &str = "pid";

/// Checkpoint file holding the exit status of a container.
///
/// Empty while the container is running, integer text once it terminated.
pub const STATUS_FILE: &str = "status";

/// Sandbox file receiving the executor's standard output.
pub const STDOUT_FILE: &str = "stdout";

/// Sandbox file receiving the executor's standard error.
pub const STDERR_FILE: &str = "stderr";

// =============================================================================
// Defaults
// =============================================================================

/// Name of the built-in process launcher.
pub const POSIX_LAUNCHER: &str = "posix";

/// Name of the built-in pid bookkeeping isolator.
pub const POSIX_ISOLATOR: &str = "posix";

/// Agent environment variable carrying the agent's network address.
///
/// Forwarded into every container even when the caller supplies an explicit
/// environment, so executors can always reach the agent.
pub const AGENT_ADDRESS_ENV: &str = "MAGIKLET_IP";

/// Variable carrying the sandbox directory into the container.
pub const SANDBOX_ENV: &str = "MAGIKLET_SANDBOX";

/// `PATH` used when neither the caller nor the command sets one.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Default interval for polling recovered (non-child) processes.
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_millis(100);

/// Exit status reported for a process killed by a signal is `128 + signo`.
pub const SIGNAL_EXIT_OFFSET: i32 = 128;

// =============================================================================
// Validation Patterns
// =============================================================================

/// Valid characters for a single container ID segment.
///
/// Includes: `a-z`, `A-Z`, `0-9`, `-`, `_`
///
/// **Security**: Excludes `/`, `.`, and other characters that could be used
/// for path traversal, since every segment becomes a directory name.
pub const CONTAINER_NAME_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_";

/// Maximum length of a single container ID segment.
pub const MAX_CONTAINER_ID_LEN: usize = 128;

/// Maximum nesting depth of a container ID chain.
///
/// **Security**: Bounds path length and recursion depth in the codec.
pub const MAX_NESTING_DEPTH: usize = 32;

/// Validates a single container ID segment.
///
/// # Returns
///
/// `Ok(())` if valid, `Err(reason)` with a description of the failure.
#[inline]
#[must_use = "validation result must be checked to ensure container ID is safe"]
pub fn validate_container_id(id: &str) -> std::result::Result<(), &'static str> {
    if id.is_empty() {
        return Err("container ID cannot be empty");
    }
    if id.len() > MAX_CONTAINER_ID_LEN {
        return Err("container ID exceeds maximum length");
    }
    if !id.chars().all(|c| CONTAINER_NAME_VALID_CHARS.contains(c)) {
        return Err("container ID contains invalid characters");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_container_id() {
        assert!(validate_container_id("abc-123_X").is_ok());
        assert!(validate_container_id("").is_err());
        assert!(validate_container_id("..").is_err());
        assert!(validate_container_id("a/b").is_err());
        assert!(validate_container_id(&"x".repeat(MAX_CONTAINER_ID_LEN + 1)).is_err());
    }
}
