//! The control loop.
//!
//! A single task owns the [`Registry`] and processes [`Message`]s in arrival
//! order. Handlers never await: anything slow is spawned with
//! [`Actor::spawn`] and comes back as another message.

use super::Message;
use super::registry::Registry;
use crate::config::ContainerizerFlags;
use crate::fetcher::Fetcher;
use crate::id::ContainerId;
use crate::isolator::Isolator;
use crate::launcher::Launcher;
use crate::metrics::Metrics;
use crate::provisioner::Provisioner;
use crate::types::ContainerStatus;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, WeakUnboundedSender};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// State of the control loop.
pub(crate) struct Actor {
    pub(super) flags: ContainerizerFlags,
    pub(super) fetcher: Arc<dyn Fetcher>,
    pub(super) provisioner: Option<Arc<dyn Provisioner>>,
    pub(super) isolators: Vec<Arc<dyn Isolator>>,
    pub(super) launcher: Arc<dyn Launcher>,
    pub(super) metrics: Arc<Metrics>,
    pub(super) registry: Registry,
    /// Weak so the loop ends once every handle and in-flight task is gone.
    tx: WeakUnboundedSender<Message>,
}

impl Actor {
    pub(super) fn new(
        flags: ContainerizerFlags,
        fetcher: Arc<dyn Fetcher>,
        provisioner: Option<Arc<dyn Provisioner>>,
        isolators: Vec<Arc<dyn Isolator>>,
        launcher: Arc<dyn Launcher>,
        metrics: Arc<Metrics>,
        tx: WeakUnboundedSender<Message>,
    ) -> Self {
        Self {
            flags,
            fetcher,
            provisioner,
            isolators,
            launcher,
            metrics,
            registry: Registry::new(),
            tx,
        }
    }

    pub(super) async fn run(mut self, mut rx: UnboundedReceiver<Message>) {
        while let Some(message) = rx.recv().await {
            self.handle(message);
        }
        debug!("Containerizer control loop stopped");
    }

    fn handle(&mut self, message: Message) {
        match message {
            Message::Launch { request, reply } => self.launch(*request, reply),
            Message::Wait { id, reply } => self.wait(id, reply),
            Message::Destroy { id, reply } => self.destroy(id, reply),
            Message::Recover { state, reply } => self.recover(*state, reply),
            Message::Containers { reply } => {
                let ids: HashSet<ContainerId> = self.registry.live_ids().cloned().collect();
                let _ = reply.send(ids);
            }
            Message::Status { id, reply } => {
                let status: Option<ContainerStatus> = self.registry.get(&id).map(|c| c.status());
                let _ = reply.send(status);
            }

            Message::Fetched { id, result } => self.fetched(id, result),
            Message::Provisioned { id, result } => self.provisioned(id, result),
            Message::Prepared { id, index, result } => self.prepared(id, index, result),
            Message::Forked { id, result } => self.forked(id, result),
            Message::Isolated { id, index, result } => self.isolated(id, index, result),
            Message::Exited { id, result } => self.exited(id, result),
            Message::Limited { id, index, result } => self.limited(id, index, result),
            Message::LauncherDestroyed { id, result } => self.launcher_destroyed(id, result),
            Message::CleanedUp { id, errors } => self.cleaned_up(id, errors),
            Message::RecoveryPlanned { result, reply } => self.recovery_planned(result, reply),
            Message::RecoveryDone { plan, result, reply } => self.recovery_done(plan, result, reply),
        }
    }

    /// Runs `task` off the loop and feeds its result back as a message.
    ///
    /// Returns `None` only while the loop is shutting down.
    pub(super) fn spawn<F>(&self, task: F) -> Option<AbortHandle>
    where
        F: Future<Output = Message> + Send + 'static,
    {
        let Some(tx) = self.tx.upgrade() else {
            warn!("Containerizer is shutting down, dropping collaborator call");
            return None;
        };
        let handle = tokio::spawn(async move {
            let message = task.await;
            let _ = tx.send(message);
        });
        Some(handle.abort_handle())
    }
}
