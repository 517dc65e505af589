//! Containerizer flags.
//!
//! Flags can be built in code, or loaded from YAML:
//!
//! ```yaml
//! runtime_dir: /var/run/magiklet
//! isolation: [posix]
//! launcher: posix
//! reap_interval_ms: 100
//! forwarded_environment: [MAGIKLET_IP]
//! redirect_io: true
//! ```

use crate::constants::{AGENT_ADDRESS_ENV, DEFAULT_REAP_INTERVAL, POSIX_ISOLATOR, POSIX_LAUNCHER};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns the platform-appropriate base directory for runtime checkpoints.
///
/// - Linux: `/var/run/magiklet` (tmpfs, cleared on reboot)
/// - macOS: `~/.magiklet/run` (user-writable)
pub fn default_runtime_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/var/run/magiklet")
    }

    #[cfg(not(target_os = "linux"))]
    {
        dirs::home_dir()
            .map(|h| h.join(".magiklet").join("run"))
            .unwrap_or_else(|| PathBuf::from(".magiklet/run"))
    }
}

/// Configuration of a containerizer instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerizerFlags {
    /// Root of the runtime checkpoint tree.
    pub runtime_dir: PathBuf,
    /// Isolators built by [`crate::Containerizer::create`], by name.
    pub isolation: Vec<String>,
    /// Launcher built by [`crate::Containerizer::create`].
    pub launcher: String,
    /// Polling interval used to reap recovered processes.
    pub reap_interval_ms: u64,
    /// Agent environment variables forced into every container environment.
    pub forwarded_environment: Vec<String>,
    /// Redirect executor stdout/stderr into the sandbox.
    pub redirect_io: bool,
}

impl Default for ContainerizerFlags {
    fn default() -> Self {
        Self {
            runtime_dir: default_runtime_dir(),
            isolation: vec![POSIX_ISOLATOR.to_string()],
            launcher: POSIX_LAUNCHER.to_string(),
            reap_interval_ms: DEFAULT_REAP_INTERVAL.as_millis() as u64,
            forwarded_environment: vec![AGENT_ADDRESS_ENV.to_string()],
            redirect_io: true,
        }
    }
}

impl ContainerizerFlags {
    /// Creates default flags rooted at `runtime_dir`.
    pub fn with_runtime_dir(runtime_dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime_dir: runtime_dir.into(),
            ..Self::default()
        }
    }

    /// Parses flags from a YAML document. Missing keys take defaults.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let flags: Self = serde_yaml::from_str(yaml)?;
        flags.validate()?;
        Ok(flags)
    }

    /// Loads flags from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Reaping interval as a [`Duration`].
    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    /// Checks the flags for values the containerizer cannot work with.
    pub fn validate(&self) -> Result<()> {
        self.validate_runtime()?;
        if self.launcher != POSIX_LAUNCHER {
            return Err(Error::InvalidConfig(format!(
                "unknown launcher '{}'",
                self.launcher
            )));
        }
        if let Some(unknown) = self.isolation.iter().find(|name| *name != POSIX_ISOLATOR) {
            return Err(Error::InvalidConfig(format!("unknown isolator '{unknown}'")));
        }
        Ok(())
    }

    /// Checks only the settings used regardless of which collaborators are
    /// injected.
    pub(crate) fn validate_runtime(&self) -> Result<()> {
        if self.runtime_dir.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("runtime_dir cannot be empty".to_string()));
        }
        if self.reap_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "reap_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let flags = ContainerizerFlags::default();
        assert!(flags.validate().is_ok());
        assert_eq!(flags.reap_interval(), DEFAULT_REAP_INTERVAL);
        assert_eq!(flags.forwarded_environment, vec![AGENT_ADDRESS_ENV.to_string()]);
    }

    #[test]
    fn test_from_yaml_partial() {
        let flags = ContainerizerFlags::from_yaml("runtime_dir: /tmp/rt\nreap_interval_ms: 5\n").unwrap();
        assert_eq!(flags.runtime_dir, PathBuf::from("/tmp/rt"));
        assert_eq!(flags.reap_interval_ms, 5);
        assert_eq!(flags.launcher, POSIX_LAUNCHER);
        assert!(flags.redirect_io);
    }

    #[test]
    fn test_from_yaml_rejects_unknown_isolator() {
        let err = ContainerizerFlags::from_yaml("isolation: [cgroups/mem]\n").unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_zero_reap_interval_rejected() {
        let flags = ContainerizerFlags {
            reap_interval_ms: 0,
            ..ContainerizerFlags::default()
        };
        assert!(flags.validate().is_err());
    }
}
