//! Destroy coordinator.
//!
//! Teardown runs at most once per container, in these steps:
//!
//! ```text
//! AwaitingChildren ─▶ KillingProcess ─▶ AwaitingExit ─▶ CleaningUp ─▶ finalize
//!  (cascade)          (launcher)        (reaper)        (isolators,
//!                                                        provisioner)
//! ```
//!
//! A destroy that arrives while a pipeline stage is in flight only marks the
//! container; the stage's completion handler starts the teardown once the
//! outstanding call has settled. A failed launcher destroy skips the wait for
//! the exit status; cleanup still runs and the failure ends up in the outcome.

use super::Message;
use super::process::Actor;
use super::registry::{Outcome, Teardown};
use crate::error::{Error, Result};
use crate::id::ContainerId;
use crate::isolator::Isolator;
use crate::types::{ContainerState, Termination};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

impl Actor {
    // =========================================================================
    // External Requests
    // =========================================================================

    pub(super) fn destroy(&mut self, id: ContainerId, reply: oneshot::Sender<Result<bool>>) {
        let Some(container) = self.registry.get_mut(&id) else {
            debug!("Ignoring destroy of unknown container {}", id);
            let _ = reply.send(Ok(false));
            return;
        };

        if let Some(result) = &container.outcome.result {
            let _ = reply.send(Outcome::destroy_reply(&id, result));
            self.registry.remove(&id);
            return;
        }

        container.outcome.destroyers.push(reply);
        self.request_destroy(&id);
    }

    pub(super) fn wait(&mut self, id: ContainerId, reply: oneshot::Sender<Result<Option<Termination>>>) {
        let Some(container) = self.registry.get_mut(&id) else {
            let _ = reply.send(Ok(None));
            return;
        };

        if let Some(result) = &container.outcome.result {
            let _ = reply.send(Outcome::wait_reply(&id, result));
            self.registry.remove(&id);
            return;
        }

        container.outcome.waiters.push(reply);
    }

    /// Marks a container for destruction and tears it down as soon as no
    /// stage is in flight.
    pub(super) fn request_destroy(&mut self, id: &ContainerId) {
        let Some(container) = self.registry.get_mut(id) else {
            return;
        };
        if container.destroy_requested {
            debug!("Container {} is already being destroyed", id);
            return;
        }
        container.destroy_requested = true;
        info!("Destroying container {} in state {}", id, container.state);

        if container.busy {
            debug!(
                "Deferring destroy of container {} until {} settles",
                id, container.state
            );
            return;
        }
        self.start_teardown(id);
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    pub(super) fn start_teardown(&mut self, id: &ContainerId) {
        let Some(container) = self.registry.get_mut(id) else {
            return;
        };
        if container.teardown.is_some() {
            return;
        }

        container.state = ContainerState::Destroying;
        container.teardown = Some(Teardown::AwaitingChildren);
        for watch in container.watches.drain(..) {
            watch.abort();
        }

        let children: Vec<ContainerId> = container.children.iter().cloned().collect();
        if !children.is_empty() {
            debug!("Destroying {} nested container(s) of {}", children.len(), id);
        }
        for child in &children {
            self.request_destroy(child);
        }

        self.advance_teardown(id);
    }

    /// Leaves `AwaitingChildren` once every nested container is gone.
    fn advance_teardown(&mut self, id: &ContainerId) {
        let Some(container) = self.registry.get_mut(id) else {
            return;
        };
        if container.teardown != Some(Teardown::AwaitingChildren) || !container.children.is_empty() {
            return;
        }

        let Some(pid) = container.pid else {
            self.cleanup(id);
            return;
        };
        container.teardown = Some(Teardown::KillingProcess);

        debug!("Killing container {} (pid {})", id, pid);
        let launcher = Arc::clone(&self.launcher);
        let task_id = id.clone();
        self.spawn(async move {
            let result = launcher.destroy(&task_id).await;
            Message::LauncherDestroyed { id: task_id, result }
        });
    }

    pub(super) fn launcher_destroyed(&mut self, id: ContainerId, result: Result<()>) {
        let Some(container) = self.registry.get_mut(&id) else {
            return;
        };

        if let Err(e) = result {
            error!("Failed to destroy processes of container {}: {}", id, e);
            container.destroy_errors.push(e.to_string());
            self.cleanup(&id);
            return;
        }

        if container.exited {
            self.cleanup(&id);
        } else {
            debug!("Waiting for container {} to be reaped", id);
            container.teardown = Some(Teardown::AwaitingExit);
        }
    }

    /// Releases fetcher, isolator and provisioner state.
    pub(super) fn cleanup(&mut self, id: &ContainerId) {
        let Some(container) = self.registry.get_mut(id) else {
            return;
        };
        container.teardown = Some(Teardown::CleaningUp);

        let fetcher = container.fetch_failed.then(|| Arc::clone(&self.fetcher));
        let provisioner = if container.provisioned {
            self.provisioner.clone()
        } else {
            None
        };
        let isolators: Vec<Arc<dyn Isolator>> = container
            .cleanup_set()
            .into_iter()
            .filter_map(|index| self.isolators.get(index).cloned())
            .collect();

        debug!(
            "Cleaning up container {} ({} isolator(s))",
            id,
            isolators.len()
        );
        let task_id = id.clone();
        self.spawn(async move {
            let mut errors = Vec::new();

            if let Some(fetcher) = fetcher
                && let Err(e) = fetcher.cleanup(&task_id).await
            {
                warn!("Failed to remove fetched artifacts of container {}: {}", task_id, e);
            }

            for isolator in isolators {
                if let Err(e) = isolator.cleanup(&task_id).await {
                    let e = Error::CleanupFailed {
                        id: task_id.to_string(),
                        isolator: isolator.name().to_string(),
                        reason: e.to_string(),
                    };
                    warn!("{}", e);
                    errors.push(e.to_string());
                }
            }

            if let Some(provisioner) = provisioner {
                match provisioner.destroy(&task_id).await {
                    Ok(removed) => debug!("Provisioner destroy of {} removed rootfs: {}", task_id, removed),
                    Err(e) => {
                        warn!("Failed to destroy provisioned rootfs of {}: {}", task_id, e);
                        errors.push(e.to_string());
                    }
                }
            }

            Message::CleanedUp { id: task_id, errors }
        });
    }

    pub(super) fn cleaned_up(&mut self, id: ContainerId, errors: Vec<String>) {
        let Some(container) = self.registry.get_mut(&id) else {
            return;
        };
        container.destroy_errors.extend(errors);
        self.finalize(&id);
    }

    // =========================================================================
    // Finalize
    // =========================================================================

    /// Resolves the outcome, answers every parked caller and resumes a parent
    /// waiting for its children.
    fn finalize(&mut self, id: &ContainerId) {
        let Some(container) = self.registry.get_mut(id) else {
            return;
        };

        if let Some(reaper) = container.reaper.take() {
            reaper.abort();
        }
        if let Err(e) = std::fs::remove_dir_all(&container.runtime_path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(
                "Failed to remove runtime directory {}: {}",
                container.runtime_path.display(),
                e
            );
        }

        container.state = ContainerState::Terminated;
        container.teardown = None;

        let termination = Termination {
            // A limitation kills the process; its signal status is not the
            // container's exit status.
            status: if container.limitation.is_some() {
                None
            } else {
                container.exit_status
            },
            limitation: container.limitation.clone(),
            message: container
                .launch_error
                .clone()
                .or_else(|| container.reason.clone()),
            finished_at: chrono::Utc::now(),
        };

        let result = if container.destroy_errors.is_empty() {
            Ok(termination)
        } else {
            self.metrics.record_destroy_error();
            let reason = container.destroy_errors.join("; ");
            error!("Teardown of container {} failed: {}", id, reason);
            Err(reason)
        };

        if let Some(reply) = container.launch_reply.take() {
            self.metrics.record_launch_error();
            let reason = container
                .launch_error
                .clone()
                .unwrap_or_else(|| "container was destroyed during launch".to_string());
            let _ = reply.send(Err(Error::LaunchFailed {
                id: id.to_string(),
                reason,
            }));
        }

        let waiters = std::mem::take(&mut container.outcome.waiters);
        let destroyers = std::mem::take(&mut container.outcome.destroyers);
        let delivered = !waiters.is_empty() || !destroyers.is_empty();
        for waiter in waiters {
            let _ = waiter.send(Outcome::wait_reply(id, &result));
        }
        for destroyer in destroyers {
            let _ = destroyer.send(Outcome::destroy_reply(id, &result));
        }

        info!("Container {} terminated", id);
        if delivered || container.orphan {
            self.registry.remove(id);
        } else {
            container.outcome.result = Some(result);
            if let Some(parent_id) = id.parent()
                && let Some(parent) = self.registry.get_mut(parent_id)
            {
                parent.children.remove(id);
            }
        }

        if let Some(parent_id) = id.parent() {
            self.advance_teardown(parent_id);
        }
    }
}
