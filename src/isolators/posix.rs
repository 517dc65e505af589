//! POSIX isolator - pid bookkeeping without enforcement.
//!
//! Works on any unix. It never restricts the container; it only remembers
//! which process belongs to which container so `usage` can report it.

use crate::constants::POSIX_ISOLATOR;
use crate::error::{Error, Result};
use crate::id::ContainerId;
use crate::isolator::Isolator;
use crate::types::{ContainerConfig, LaunchInfo, RecoveredContainer, ResourceStatistics};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use tracing::debug;

/// Isolator tracking container pids.
#[derive(Debug, Default)]
pub struct PosixIsolator {
    /// Container -> pid (`None` between prepare and isolate).
    pids: RwLock<HashMap<ContainerId, Option<u32>>>,
}

impl PosixIsolator {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned(e: impl std::fmt::Display) -> Error {
        Error::Internal(format!("lock poisoned: {}", e))
    }

    /// Returns the tracked pid of a container.
    pub fn pid(&self, id: &ContainerId) -> Option<u32> {
        self.pids.read().ok().and_then(|pids| pids.get(id).copied().flatten())
    }
}

fn is_alive(pid: u32) -> bool {
    // SAFETY: signal 0 performs only the existence/permission check.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[async_trait]
impl Isolator for PosixIsolator {
    fn name(&self) -> &str {
        POSIX_ISOLATOR
    }

    async fn recover(
        &self,
        states: &[RecoveredContainer],
        orphans: &HashSet<ContainerId>,
    ) -> Result<()> {
        let mut pids = self.pids.write().map_err(Self::poisoned)?;
        for state in states {
            pids.insert(state.container_id.clone(), state.pid);
        }
        // Orphans are destroyed right away; track them so cleanup is a no-op.
        for orphan in orphans {
            pids.entry(orphan.clone()).or_insert(None);
        }
        debug!("posix isolator recovered {} container(s)", states.len());
        Ok(())
    }

    async fn prepare(&self, id: &ContainerId, _config: &ContainerConfig) -> Result<Option<LaunchInfo>> {
        let mut pids = self.pids.write().map_err(Self::poisoned)?;
        if pids.contains_key(id) {
            return Err(Error::PrepareFailed {
                id: id.to_string(),
                isolator: POSIX_ISOLATOR.to_string(),
                reason: "container has already been prepared".to_string(),
            });
        }
        pids.insert(id.clone(), None);
        Ok(None)
    }

    async fn isolate(&self, id: &ContainerId, pid: u32) -> Result<()> {
        let mut pids = self.pids.write().map_err(Self::poisoned)?;
        match pids.get_mut(id) {
            Some(slot) => {
                *slot = Some(pid);
                Ok(())
            }
            None => Err(Error::IsolateFailed {
                id: id.to_string(),
                isolator: POSIX_ISOLATOR.to_string(),
                reason: "unknown container".to_string(),
            }),
        }
    }

    async fn usage(&self, id: &ContainerId) -> Result<ResourceStatistics> {
        let pid = {
            let pids = self.pids.read().map_err(Self::poisoned)?;
            *pids
                .get(id)
                .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?
        };

        Ok(ResourceStatistics {
            timestamp: chrono::Utc::now(),
            processes: pid.map(|p| u32::from(is_alive(p))).unwrap_or(0),
        })
    }

    async fn cleanup(&self, id: &ContainerId) -> Result<()> {
        let mut pids = self.pids.write().map_err(Self::poisoned)?;
        if pids.remove(id).is_none() {
            debug!("Ignoring cleanup of unknown container {}", id);
        }
        Ok(())
    }
}
