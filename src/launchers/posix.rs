//! POSIX launcher - plain child processes.
//!
//! Each container is one process group led by the executor. Pre-exec
//! commands run to completion, in order, before the executor is spawned.
//!
//! ## Reaping
//!
//! | Process                  | How `reap` observes the exit           |
//! |--------------------------|----------------------------------------|
//! | Forked by this launcher  | `Child::wait` (exit code, 128+signal)  |
//! | Recovered after restart  | liveness poll every `reap_interval`    |
//!
//! A recovered process is not our child, so its exit status is unknown and
//! `reap` reports `None`.

use crate::constants::{POSIX_LAUNCHER, SIGNAL_EXIT_OFFSET};
use crate::error::{Error, Result};
use crate::id::ContainerId;
use crate::launcher::{ForkOptions, Launcher, LauncherStatus};
use crate::types::{CommandInfo, RecoveredContainer};
use async_trait::async_trait;
use std::collections::HashMap;
use std::ffi::CString;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::RwLock;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Poll interval while waiting for a killed process to disappear.
const KILL_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Internal tracking of a launched or recovered process.
#[derive(Debug)]
struct Tracked {
    pid: u32,
    /// Present for processes forked by this launcher until someone waits.
    child: Option<Child>,
}

/// Launcher running executors as process-group leaders.
#[derive(Debug)]
pub struct PosixLauncher {
    reap_interval: Duration,
    processes: RwLock<HashMap<ContainerId, Tracked>>,
}

impl PosixLauncher {
    /// Creates a launcher polling recovered processes every `reap_interval`.
    pub fn new(reap_interval: Duration) -> Self {
        Self {
            reap_interval,
            processes: RwLock::new(HashMap::new()),
        }
    }

    fn poisoned(e: impl std::fmt::Display) -> Error {
        Error::Internal(format!("lock poisoned: {}", e))
    }

    fn take_child(&self, id: &ContainerId) -> Result<Option<Child>> {
        let mut processes = self.processes.write().map_err(Self::poisoned)?;
        Ok(processes.get_mut(id).and_then(|tracked| tracked.child.take()))
    }

    fn command(info: &CommandInfo) -> Command {
        if info.shell {
            let mut command = Command::new("/bin/sh");
            command.arg("-c").arg(&info.value);
            command
        } else {
            let mut command = Command::new(&info.value);
            command.args(&info.arguments);
            command
        }
    }

    fn configure(
        command: &mut Command,
        environment: &HashMap<String, String>,
        working_dir: &Path,
        user: Option<(u32, u32)>,
    ) {
        command
            .env_clear()
            .envs(environment)
            .current_dir(working_dir)
            .stdin(Stdio::null());
        if let Some((uid, gid)) = user {
            command.uid(uid).gid(gid);
        }
    }

    fn output(id: &ContainerId, path: Option<&Path>) -> Result<Stdio> {
        let Some(path) = path else {
            return Ok(Stdio::inherit());
        };
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| Error::ForkFailed {
                id: id.to_string(),
                reason: format!("cannot open {}: {}", path.display(), e),
            })?;
        Ok(Stdio::from(file))
    }

    async fn run_pre_exec(
        id: &ContainerId,
        commands: &[CommandInfo],
        options: &ForkOptions,
        user: Option<(u32, u32)>,
    ) -> Result<()> {
        for pre_exec in commands {
            debug!("Running pre-exec command '{}' for container {}", pre_exec.value, id);
            let mut command = Self::command(pre_exec);
            Self::configure(&mut command, &options.environment, &options.working_dir, user);
            command
                .stdout(Self::output(id, options.stdout.as_deref())?)
                .stderr(Self::output(id, options.stderr.as_deref())?);

            let status = command.status().await.map_err(|e| Error::ForkFailed {
                id: id.to_string(),
                reason: format!("failed to run pre-exec command '{}': {}", pre_exec.value, e),
            })?;

            if !status.success() {
                return Err(Error::PreExecFailed {
                    id: id.to_string(),
                    command: pre_exec.value.clone(),
                    status: exit_code(status),
                });
            }
        }
        Ok(())
    }
}

/// Exit code of a process, with the shell convention for signals.
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => SIGNAL_EXIT_OFFSET + signal,
        (None, None) => -1,
    }
}

/// Resolves a user name to (uid, gid).
fn lookup_user(id: &ContainerId, name: &str) -> Result<(u32, u32)> {
    let c_name = CString::new(name).map_err(|_| Error::ForkFailed {
        id: id.to_string(),
        reason: format!("invalid user name '{}'", name),
    })?;

    // SAFETY: getpwnam returns a pointer into static storage or null; the
    // fields are copied out before any other passwd call.
    let entry = unsafe { libc::getpwnam(c_name.as_ptr()) };
    if entry.is_null() {
        return Err(Error::ForkFailed {
            id: id.to_string(),
            reason: format!("unknown user '{}'", name),
        });
    }
    // SAFETY: entry was checked for null above.
    let (uid, gid) = unsafe { ((*entry).pw_uid, (*entry).pw_gid) };
    Ok((uid, gid))
}

/// Sends `signal` to `pid`, treating a missing process as success.
fn signal(id: &ContainerId, pid: libc::pid_t, sig: libc::c_int) -> Result<()> {
    // SAFETY: kill has no memory-safety preconditions.
    let result = unsafe { libc::kill(pid, sig) };
    if result == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(Error::SignalFailed {
        id: id.to_string(),
        reason: format!("kill({}, {}) failed: {}", pid, sig, err),
    })
}

fn is_alive(pid: u32) -> bool {
    // SAFETY: signal 0 performs only the existence/permission check.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[async_trait]
impl Launcher for PosixLauncher {
    fn name(&self) -> &str {
        POSIX_LAUNCHER
    }

    async fn recover(&self, states: &[RecoveredContainer]) -> Result<()> {
        let mut processes = self.processes.write().map_err(Self::poisoned)?;
        for state in states {
            let Some(pid) = state.pid else {
                continue;
            };
            if processes.contains_key(&state.container_id) {
                return Err(Error::RecoveryFailed {
                    id: state.container_id.to_string(),
                    reason: "container already recovered".to_string(),
                });
            }
            processes.insert(state.container_id.clone(), Tracked { pid, child: None });
        }
        debug!("posix launcher recovered {} process(es)", processes.len());
        Ok(())
    }

    async fn fork(&self, id: &ContainerId, options: ForkOptions) -> Result<u32> {
        if !options.namespaces.is_empty() {
            return Err(Error::NotSupported(format!(
                "{} launcher cannot create namespaces {:?}",
                POSIX_LAUNCHER, options.namespaces
            )));
        }
        if options.rootfs.is_some() || !options.mounts.is_empty() {
            return Err(Error::NotSupported(format!(
                "{} launcher cannot change the root filesystem or mount",
                POSIX_LAUNCHER
            )));
        }

        {
            let processes = self.processes.read().map_err(Self::poisoned)?;
            if processes.contains_key(id) {
                return Err(Error::ContainerAlreadyExists(id.to_string()));
            }
        }

        let user = options
            .user
            .as_deref()
            .map(|name| lookup_user(id, name))
            .transpose()?;

        Self::run_pre_exec(id, &options.pre_exec_commands, &options, user).await?;

        let mut command = Self::command(&options.command);
        Self::configure(&mut command, &options.environment, &options.working_dir, user);
        command
            .stdout(Self::output(id, options.stdout.as_deref())?)
            .stderr(Self::output(id, options.stderr.as_deref())?)
            .process_group(0);

        let child = command.spawn().map_err(|e| Error::ForkFailed {
            id: id.to_string(),
            reason: e.to_string(),
        })?;
        let pid = child.id().ok_or_else(|| Error::ForkFailed {
            id: id.to_string(),
            reason: "process exited before its pid was read".to_string(),
        })?;

        self.processes
            .write()
            .map_err(Self::poisoned)?
            .insert(id.clone(), Tracked { pid, child: Some(child) });

        info!("Forked container {} with pid {}", id, pid);
        Ok(pid)
    }

    async fn destroy(&self, id: &ContainerId) -> Result<()> {
        let pid = {
            let processes = self.processes.read().map_err(Self::poisoned)?;
            processes
                .get(id)
                .map(|tracked| tracked.pid)
                .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?
        };

        debug!("Killing process group of container {} (pid {})", id, pid);
        let raw = pid as libc::pid_t;
        signal(id, -raw, libc::SIGKILL)?;
        signal(id, raw, libc::SIGKILL)?;

        // Our own child: collect it, otherwise someone else's wait (the
        // reaper) or init removes it.
        if let Some(mut child) = self.take_child(id)? {
            if let Err(e) = child.wait().await {
                warn!("Failed to wait for container {} (pid {}): {}", id, pid, e);
            }
        } else {
            while is_alive(pid) {
                tokio::time::sleep(KILL_POLL_INTERVAL).await;
            }
        }

        self.processes.write().map_err(Self::poisoned)?.remove(id);
        info!("Destroyed processes of container {}", id);
        Ok(())
    }

    async fn status(&self, id: &ContainerId) -> Result<LauncherStatus> {
        let processes = self.processes.read().map_err(Self::poisoned)?;
        processes
            .get(id)
            .map(|tracked| LauncherStatus {
                executor_pid: tracked.pid,
            })
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))
    }

    async fn reap(&self, id: &ContainerId, pid: u32) -> Result<Option<i32>> {
        if let Some(mut child) = self.take_child(id)? {
            let status = child.wait().await?;
            let code = exit_code(status);
            debug!("Container {} (pid {}) exited with {}", id, pid, code);
            return Ok(Some(code));
        }

        while is_alive(pid) {
            tokio::time::sleep(self.reap_interval).await;
        }
        debug!("Container {} (pid {}) is gone, exit status unknown", id, pid);
        Ok(None)
    }
}
