//! Containerizer counters.
//!
//! Owned by a single containerizer instance and shared through an `Arc`;
//! there is no process-global registry.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters of a containerizer.
#[derive(Debug, Default)]
pub struct Metrics {
    container_destroy_errors: AtomicU64,
    containers_launched: AtomicU64,
    launch_errors: AtomicU64,
    containers_recovered: AtomicU64,
}

/// Point-in-time copy of [`Metrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub container_destroy_errors: u64,
    pub containers_launched: u64,
    pub launch_errors: u64,
    pub containers_recovered: u64,
}

impl Metrics {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Teardowns that ended in failure.
    pub fn container_destroy_errors(&self) -> u64 {
        self.container_destroy_errors.load(Ordering::Relaxed)
    }

    /// Containers that reached the watching stage.
    pub fn containers_launched(&self) -> u64 {
        self.containers_launched.load(Ordering::Relaxed)
    }

    /// Launches that failed before reaching the watching stage.
    pub fn launch_errors(&self) -> u64 {
        self.launch_errors.load(Ordering::Relaxed)
    }

    /// Containers re-attached by recovery.
    pub fn containers_recovered(&self) -> u64 {
        self.containers_recovered.load(Ordering::Relaxed)
    }

    pub(crate) fn record_destroy_error(&self) {
        self.container_destroy_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_launch(&self) {
        self.containers_launched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_launch_error(&self) {
        self.launch_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_recovered(&self, count: u64) {
        self.containers_recovered.fetch_add(count, Ordering::Relaxed);
    }

    /// Copies all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            container_destroy_errors: self.container_destroy_errors(),
            containers_launched: self.containers_launched(),
            launch_errors: self.launch_errors(),
            containers_recovered: self.containers_recovered(),
        }
    }
}
