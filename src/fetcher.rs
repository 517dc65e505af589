//! Fetcher - artifacts into the sandbox before launch.
//!
//! The launch pipeline calls `fetch` first. If it fails, the pipeline calls
//! `cleanup` so partial sandbox content does not outlive the failed launch.
//! Files of a successful fetch belong to the sandbox and are not tracked.

use crate::error::{Error, Result};
use crate::id::ContainerId;
use crate::types::{CommandInfo, CommandUri};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Artifact fetching backend.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetches every URI of `command` into `sandbox`.
    async fn fetch(
        &self,
        id: &ContainerId,
        command: &CommandInfo,
        sandbox: &Path,
        user: Option<&str>,
    ) -> Result<()>;

    /// Removes whatever a (failed) fetch wrote for `id`.
    async fn cleanup(&self, id: &ContainerId) -> Result<()> {
        let _ = id;
        Ok(())
    }
}

/// Fetcher for local files (`file://` URIs and absolute paths).
///
/// Tracks the files written per container so `cleanup` can remove exactly
/// those and nothing else the sandbox holds.
#[derive(Debug, Default)]
pub struct LocalFetcher {
    fetched: Mutex<HashMap<ContainerId, Vec<PathBuf>>>,
}

impl LocalFetcher {
    /// Creates a new local fetcher.
    pub fn new() -> Self {
        Self::default()
    }

    fn source_path(id: &ContainerId, uri: &CommandUri) -> Result<PathBuf> {
        let raw = uri.value.strip_prefix("file://").unwrap_or(&uri.value);
        let path = PathBuf::from(raw);
        if !path.is_absolute() {
            return Err(Error::FetchFailed {
                id: id.to_string(),
                reason: format!("unsupported URI '{}'", uri.value),
            });
        }
        Ok(path)
    }

    fn destination(id: &ContainerId, sandbox: &Path, uri: &CommandUri, source: &Path) -> Result<PathBuf> {
        let name = match &uri.output_file {
            Some(name) => PathBuf::from(name),
            None => source
                .file_name()
                .map(PathBuf::from)
                .ok_or_else(|| Error::FetchFailed {
                    id: id.to_string(),
                    reason: format!("URI '{}' has no file name", uri.value),
                })?,
        };

        // Only plain relative names, never escaping the sandbox.
        if name.is_absolute() || name.components().any(|c| !matches!(c, std::path::Component::Normal(_))) {
            return Err(Error::FetchFailed {
                id: id.to_string(),
                reason: format!("invalid output file '{}'", name.display()),
            });
        }

        Ok(sandbox.join(name))
    }

    fn record(&self, id: &ContainerId, path: PathBuf) -> Result<()> {
        let mut fetched = self
            .fetched
            .lock()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?;
        fetched.entry(id.clone()).or_default().push(path);
        Ok(())
    }

    /// Drops the tracked files of `id`, leaving them on disk.
    fn forget(&self, id: &ContainerId) -> Result<()> {
        let mut fetched = self
            .fetched
            .lock()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?;
        fetched.remove(id);
        Ok(())
    }

    /// Number of containers with files tracked for cleanup.
    pub fn tracked(&self) -> usize {
        self.fetched.lock().map(|fetched| fetched.len()).unwrap_or(0)
    }

    async fn fetch_one(&self, id: &ContainerId, uri: &CommandUri, sandbox: &Path) -> Result<()> {
        let source = Self::source_path(id, uri)?;
        let destination = Self::destination(id, sandbox, uri, &source)?;

        debug!("Fetching {} into {}", source.display(), destination.display());
        // Recorded first: a failed copy may still leave a partial file.
        self.record(id, destination.clone())?;
        tokio::fs::copy(&source, &destination)
            .await
            .map_err(|e| Error::FetchFailed {
                id: id.to_string(),
                reason: format!("failed to copy '{}': {}", source.display(), e),
            })?;

        #[cfg(unix)]
        if uri.executable {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&destination, std::fs::Permissions::from_mode(0o755)).await?;
        }

        Ok(())
    }
}

#[async_trait]
impl Fetcher for LocalFetcher {
    async fn fetch(
        &self,
        id: &ContainerId,
        command: &CommandInfo,
        sandbox: &Path,
        _user: Option<&str>,
    ) -> Result<()> {
        if command.uris.is_empty() {
            return Ok(());
        }

        if !sandbox.is_dir() {
            return Err(Error::FetchFailed {
                id: id.to_string(),
                reason: format!("sandbox {} does not exist", sandbox.display()),
            });
        }

        // A new fetch never cleans up files of an earlier run.
        self.forget(id)?;
        for uri in &command.uris {
            self.fetch_one(id, uri, sandbox).await?;
        }
        self.forget(id)?;

        info!("Fetched {} URI(s) for container {}", command.uris.len(), id);
        Ok(())
    }

    async fn cleanup(&self, id: &ContainerId) -> Result<()> {
        let paths = self
            .fetched
            .lock()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?
            .remove(id)
            .unwrap_or_default();

        for path in paths {
            if let Err(e) = tokio::fs::remove_file(&path).await
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!("Failed to remove fetched file {}: {}", path.display(), e);
            }
        }
        Ok(())
    }
}
