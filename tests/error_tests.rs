//! Tests for error types.
//!
//! Validates display formatting and the exit status carried by process
//! failures.

use magiklet::Error;
use std::path::PathBuf;

// =============================================================================
// Container Lifecycle Error Tests
// =============================================================================

#[test]
fn test_container_not_found_display() {
    let err = Error::ContainerNotFound("parent.child".to_string());
    let msg = format!("{}", err);

    assert!(msg.contains("parent.child"), "should include container ID");
    assert!(msg.contains("not found"), "should indicate not found");
}

#[test]
fn test_invalid_state_display() {
    let err = Error::InvalidState {
        id: "c1".to_string(),
        state: "destroying".to_string(),
        expected: "running".to_string(),
    };
    let msg = format!("{}", err);

    assert!(msg.contains("destroying"));
    assert!(msg.contains("running"));
}

#[test]
fn test_launch_failed_wraps_stage_error() {
    let stage = Error::FetchFailed {
        id: "c1".to_string(),
        reason: "connection refused".to_string(),
    };
    let err = Error::LaunchFailed {
        id: "c1".to_string(),
        reason: stage.to_string(),
    };
    let msg = format!("{}", err);

    assert!(msg.contains("failed to launch"));
    assert!(msg.contains("connection refused"), "should keep stage reason");
}

// =============================================================================
// Collaborator Error Tests
// =============================================================================

#[test]
fn test_isolator_errors_name_the_isolator() {
    let prepare = Error::PrepareFailed {
        id: "c1".to_string(),
        isolator: "cgroups".to_string(),
        reason: "no memory controller".to_string(),
    };
    let cleanup = Error::CleanupFailed {
        id: "c1".to_string(),
        isolator: "posix".to_string(),
        reason: "busy".to_string(),
    };

    assert!(prepare.to_string().contains("cgroups"));
    assert!(cleanup.to_string().contains("posix"));
}

#[test]
fn test_pre_exec_failure_carries_exit_status() {
    let err = Error::PreExecFailed {
        id: "c1".to_string(),
        command: "mount --bind a b".to_string(),
        status: 32,
    };

    assert_eq!(err.exit_status(), Some(32));
    assert!(err.to_string().contains("mount --bind a b"));
    assert_eq!(
        Error::ForkFailed {
            id: "c1".to_string(),
            reason: "EAGAIN".to_string(),
        }
        .exit_status(),
        None
    );
}

// =============================================================================
// Checkpoint Error Tests
// =============================================================================

#[test]
fn test_checkpoint_parse_display() {
    let err = Error::CheckpointParse {
        path: PathBuf::from("/run/containers/c1/pid"),
        content: "abc".to_string(),
    };
    let msg = format!("{}", err);

    assert!(msg.contains("/run/containers/c1/pid"), "should include path");
    assert!(msg.contains("abc"), "should include content");
}

#[test]
fn test_io_error_conversion() {
    let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
    let err: Error = io.into();
    assert!(matches!(err, Error::Io(_)));
}

#[test]
fn test_yaml_error_conversion() {
    let yaml_err = serde_yaml::from_str::<u32>("not: [a number").unwrap_err();
    let err: Error = yaml_err.into();
    assert!(matches!(err, Error::Serialization(_)));
}
