//! Launcher implementations.

pub mod posix;

pub use self::posix::PosixLauncher;

use crate::config::ContainerizerFlags;
use crate::constants::POSIX_LAUNCHER;
use crate::error::{Error, Result};
use crate::launcher::Launcher;
use std::sync::Arc;

/// Builds the launcher named by `flags.launcher`.
pub fn from_flags(flags: &ContainerizerFlags) -> Result<Arc<dyn Launcher>> {
    match flags.launcher.as_str() {
        POSIX_LAUNCHER => Ok(Arc::new(PosixLauncher::new(flags.reap_interval()))),
        other => Err(Error::InvalidConfig(format!("unknown launcher '{other}'"))),
    }
}
