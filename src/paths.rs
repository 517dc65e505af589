//! Identity & path codec.
//!
//! Maps container identifier chains onto two directory trees:
//!
//! - the **runtime tree**, holding per-container checkpoint files
//!   (`<runtime_dir>/containers/<a>/containers/<b>/pid`), and
//! - the **sandbox tree**, holding working directories
//!   (`<root-sandbox>/containers/<b>` for a child `b` of the root container).
//!
//! Everything here is stateless. Reading a checkpoint distinguishes a missing
//! file (`Ok(None)`, an expected crash state) from unreadable or malformed
//! content (`Err`).

use crate::constants::{
    PID_FILE, RUNTIME_CONTAINER_DIRECTORY, SANDBOX_CONTAINER_DIRECTORY, STATUS_FILE,
};
use crate::error::{Error, Result};
use crate::id::ContainerId;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::warn;

// =============================================================================
// Runtime Tree
// =============================================================================

/// Returns the runtime directory of a container.
///
/// `<runtime_dir>/containers/<id_0>/containers/<id_1>/.../containers/<id_n>`
pub fn runtime_path(runtime_dir: &Path, id: &ContainerId) -> PathBuf {
    let mut path = runtime_dir.to_path_buf();
    for ancestor in id.ancestry() {
        path.push(RUNTIME_CONTAINER_DIRECTORY);
        path.push(ancestor.value());
    }
    path
}

/// Reads the checkpointed pid of a container.
///
/// Returns `Ok(None)` when the pid file does not exist: the runtime directory
/// and the pid file are not created atomically, so a restart between the two
/// steps leaves a directory without a pid.
pub fn read_pid(runtime_dir: &Path, id: &ContainerId) -> Result<Option<u32>> {
    let path = runtime_path(runtime_dir, id).join(PID_FILE);
    let Some(content) = read_checkpoint(&path)? else {
        return Ok(None);
    };

    content
        .trim()
        .parse::<u32>()
        .map(Some)
        .map_err(|_| Error::CheckpointParse { path, content })
}

/// Reads the checkpointed exit status of a container.
///
/// Returns `Ok(None)` when the status file is missing or empty (the container
/// has not terminated yet).
pub fn read_status(runtime_dir: &Path, id: &ContainerId) -> Result<Option<i32>> {
    let path = runtime_path(runtime_dir, id).join(STATUS_FILE);
    let Some(content) = read_checkpoint(&path)? else {
        return Ok(None);
    };

    if content.trim().is_empty() {
        return Ok(None);
    }

    content
        .trim()
        .parse::<i32>()
        .map(Some)
        .map_err(|_| Error::CheckpointParse { path, content })
}

/// Writes the pid checkpoint. The runtime directory must already exist.
pub fn write_pid(runtime_dir: &Path, id: &ContainerId, pid: u32) -> Result<()> {
    let path = runtime_path(runtime_dir, id).join(PID_FILE);
    fs::write(&path, pid.to_string())?;
    Ok(())
}

/// Writes the status checkpoint; `None` writes an empty file.
pub fn write_status(runtime_dir: &Path, id: &ContainerId, status: Option<i32>) -> Result<()> {
    let path = runtime_path(runtime_dir, id).join(STATUS_FILE);
    let content = status.map(|s| s.to_string()).unwrap_or_default();
    fs::write(&path, content)?;
    Ok(())
}

fn read_checkpoint(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }

    fs::read_to_string(path)
        .map(Some)
        .map_err(|e| Error::CheckpointRead {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

/// Lists every container identifier present in the runtime tree.
///
/// The walk is depth-first: each container is followed immediately by its
/// whole subtree, so a parent always precedes its descendants. Recovery
/// relies on this order when rebuilding the registry. Siblings are sorted by
/// name so the result is deterministic.
pub fn list_container_ids(runtime_dir: &Path) -> Result<Vec<ContainerId>> {
    let mut containers = Vec::new();
    collect_container_ids(runtime_dir, None, &mut containers)?;
    Ok(containers)
}

fn collect_container_ids(
    runtime_dir: &Path,
    parent: Option<&ContainerId>,
    containers: &mut Vec<ContainerId>,
) -> Result<()> {
    let path = match parent {
        Some(parent) => runtime_path(runtime_dir, parent),
        None => runtime_dir.to_path_buf(),
    }
    .join(RUNTIME_CONTAINER_DIRECTORY);

    if !path.exists() {
        return Ok(());
    }

    let entries = fs::read_dir(&path).map_err(|e| Error::CheckpointRead {
        path: path.clone(),
        reason: e.to_string(),
    })?;

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::CheckpointRead {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        // Only directories represent containers.
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            warn!("Ignoring non-directory entry {}", entry.path().display());
            continue;
        }

        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();

    for name in names {
        let id = match parent {
            Some(parent) => ContainerId::nested(parent, name),
            None => ContainerId::new(name),
        };

        containers.push(id.clone());
        collect_container_ids(runtime_dir, Some(&id), containers)?;
    }

    Ok(())
}

// =============================================================================
// Sandbox Tree
// =============================================================================

/// Returns the sandbox directory of a container.
///
/// The root container of the chain uses `root_sandbox` itself; each nested
/// level appends `containers/<value>`.
pub fn sandbox_path(root_sandbox: &Path, id: &ContainerId) -> PathBuf {
    let mut path = root_sandbox.to_path_buf();
    for ancestor in id.ancestry().into_iter().skip(1) {
        path.push(SANDBOX_CONTAINER_DIRECTORY);
        path.push(ancestor.value());
    }
    path
}

/// Maps a path inside a root container's sandbox back to the container it
/// belongs to.
///
/// Segments after `root_sandbox` are consumed in `(marker, value)` pairs, each
/// pair extending the chain by one level. The walk stops at the first pair
/// whose marker does not match and returns the chain built so far, so
/// truncated paths and paths into a container's own files resolve to the
/// deepest container they fall under.
///
/// # Errors
///
/// [`Error::PathOutsideRoot`] if `path` is not under `root_sandbox`.
pub fn parse_sandbox_path(
    root_id: &ContainerId,
    root_sandbox: &Path,
    path: &Path,
) -> Result<ContainerId> {
    let relative = path
        .strip_prefix(root_sandbox)
        .map_err(|_| Error::PathOutsideRoot {
            path: path.to_path_buf(),
            root: root_sandbox.to_path_buf(),
        })?;

    let tokens: Vec<String> = relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(segment) => Some(segment.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();

    let mut current = root_id.clone();
    for pair in tokens.chunks(2) {
        let [marker, value] = pair else {
            break;
        };
        if marker != SANDBOX_CONTAINER_DIRECTORY {
            break;
        }
        current = ContainerId::nested(&current, value.as_str());
    }

    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn chain(values: &[&str]) -> ContainerId {
        let mut id = ContainerId::new(values[0]);
        for value in &values[1..] {
            id = ContainerId::nested(&id, *value);
        }
        id
    }

    #[test]
    fn test_runtime_path_nesting() {
        let id = chain(&["a", "b", "c"]);
        assert_eq!(
            runtime_path(Path::new("/run"), &id),
            PathBuf::from("/run/containers/a/containers/b/containers/c")
        );
        assert_eq!(
            runtime_path(Path::new("/run"), &ContainerId::new("a")),
            PathBuf::from("/run/containers/a")
        );
    }

    #[test]
    fn test_sandbox_path_nesting() {
        let root = Path::new("/sandbox/runs/a");
        assert_eq!(sandbox_path(root, &chain(&["a"])), root.to_path_buf());
        assert_eq!(
            sandbox_path(root, &chain(&["a", "b", "c"])),
            PathBuf::from("/sandbox/runs/a/containers/b/containers/c")
        );
    }

    #[test]
    fn test_parse_sandbox_path_roundtrip() {
        let root_sandbox = Path::new("/sandbox/runs/a");
        let id = chain(&["a", "b", "c"]);
        let path = sandbox_path(root_sandbox, &id);

        let parsed = parse_sandbox_path(id.root(), root_sandbox, &path).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_parse_sandbox_path_truncated() {
        let root_sandbox = Path::new("/sandbox/runs/a");
        let root = ContainerId::new("a");

        // Dangling marker without a value.
        let parsed =
            parse_sandbox_path(&root, root_sandbox, Path::new("/sandbox/runs/a/containers/b/containers"))
                .unwrap();
        assert_eq!(parsed, chain(&["a", "b"]));

        // A file inside a nested sandbox.
        let parsed = parse_sandbox_path(
            &root,
            root_sandbox,
            Path::new("/sandbox/runs/a/containers/b/stdout"),
        )
        .unwrap();
        assert_eq!(parsed, chain(&["a", "b"]));

        // Unexpected marker stops the walk immediately.
        let parsed =
            parse_sandbox_path(&root, root_sandbox, Path::new("/sandbox/runs/a/tmp/x")).unwrap();
        assert_eq!(parsed, root);
    }

    #[test]
    fn test_parse_sandbox_path_outside_root() {
        let err = parse_sandbox_path(
            &ContainerId::new("a"),
            Path::new("/sandbox/runs/a"),
            Path::new("/sandbox/runs/ab/containers/x"),
        )
        .unwrap_err();
        assert!(matches!(err, Error::PathOutsideRoot { .. }));
    }

    #[test]
    fn test_read_pid_absent_vs_malformed() {
        let dir = TempDir::new().unwrap();
        let id = ContainerId::new("a");

        // No directory at all.
        assert!(read_pid(dir.path(), &id).unwrap().is_none());

        // Directory without the pid file.
        fs::create_dir_all(runtime_path(dir.path(), &id)).unwrap();
        assert!(read_pid(dir.path(), &id).unwrap().is_none());

        write_pid(dir.path(), &id, 4242).unwrap();
        assert_eq!(read_pid(dir.path(), &id).unwrap(), Some(4242));

        fs::write(runtime_path(dir.path(), &id).join(PID_FILE), "not-a-pid").unwrap();
        assert!(matches!(
            read_pid(dir.path(), &id),
            Err(Error::CheckpointParse { .. })
        ));
    }

    #[test]
    fn test_read_status_states() {
        let dir = TempDir::new().unwrap();
        let id = chain(&["a", "b"]);
        fs::create_dir_all(runtime_path(dir.path(), &id)).unwrap();

        assert!(read_status(dir.path(), &id).unwrap().is_none());

        write_status(dir.path(), &id, None).unwrap();
        assert!(read_status(dir.path(), &id).unwrap().is_none());

        write_status(dir.path(), &id, Some(3)).unwrap();
        assert_eq!(read_status(dir.path(), &id).unwrap(), Some(3));

        fs::write(runtime_path(dir.path(), &id).join(STATUS_FILE), "x").unwrap();
        assert!(read_status(dir.path(), &id).is_err());
    }

    #[test]
    fn test_list_container_ids_parent_first() {
        let dir = TempDir::new().unwrap();
        let ids = [
            chain(&["a"]),
            chain(&["a", "x"]),
            chain(&["a", "x", "deep"]),
            chain(&["a", "y"]),
            chain(&["b"]),
            chain(&["b", "z"]),
        ];
        // Create leaves only; intermediate directories come for free.
        for id in &ids {
            fs::create_dir_all(runtime_path(dir.path(), id)).unwrap();
        }
        // Checkpoint files must not be mistaken for containers.
        write_pid(dir.path(), &ids[0], 1).unwrap();

        let listed = list_container_ids(dir.path()).unwrap();
        assert_eq!(listed.len(), ids.len());
        for (index, id) in listed.iter().enumerate() {
            if let Some(parent) = id.parent() {
                let parent_index = listed.iter().position(|p| p == parent).unwrap();
                assert!(parent_index < index, "{parent} must precede {id}");
            }
        }
        assert_eq!(listed, ids.to_vec());
    }

    #[test]
    fn test_list_container_ids_empty_tree() {
        let dir = TempDir::new().unwrap();
        assert!(list_container_ids(dir.path()).unwrap().is_empty());
    }
}
