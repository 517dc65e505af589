//! # Containerizer - Container Lifecycle Orchestration
//!
//! Drives containers (and their nested sub-containers) through the launch
//! pipeline while destroys, waits and recovery race with it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐  Message::Launch / Wait / Destroy / ...
//! │ Containerizer handle │ ─────────────────────────────┐
//! │ (Clone, any task)    │ ◀── oneshot reply ─────┐     │
//! └──────────────────────┘                        │     ▼
//!                                        ┌─────────────────────────┐
//!                                        │ control loop (1 task)   │
//!                                        │  Registry (no locks)    │
//!                                        └─────────────────────────┘
//!                                           │ spawn            ▲
//!                                           ▼                  │ completion
//!                      Fetcher / Provisioner / Isolators / Launcher message
//! ```
//!
//! Every registry mutation happens on the control loop, one message at a
//! time. Collaborator calls run on their own tasks and report back with a
//! completion message, so the loop never blocks on them.
//!
//! ## Example
//!
//! ```rust,ignore
//! use magiklet::{CommandInfo, ContainerId, Containerizer, ContainerizerFlags, ExecutorInfo, LaunchRequest};
//!
//! let containerizer = Containerizer::create(ContainerizerFlags::default())?;
//! let id = ContainerId::random();
//! let executor = ExecutorInfo::new("executor", CommandInfo::shell("sleep 10"));
//!
//! containerizer.launch(LaunchRequest::new(id.clone(), executor, "/var/sandbox")).await?;
//! containerizer.destroy(&id).await?;
//! let termination = containerizer.wait(&id).await?;
//! ```

mod destroy;
mod launch;
mod process;
mod recover;
mod registry;

use self::process::Actor;
use self::recover::RecoveryPlan;
use crate::config::ContainerizerFlags;
use crate::error::{Error, Result};
use crate::fetcher::{Fetcher, LocalFetcher};
use crate::id::ContainerId;
use crate::isolator::Isolator;
use crate::launcher::Launcher;
use crate::metrics::Metrics;
use crate::provisioner::{ProvisionInfo, Provisioner};
use crate::types::{AgentState, ContainerStatus, LaunchInfo, LaunchRequest, Limitation, Termination};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

/// Messages processed by the control loop.
///
/// The first group comes from [`Containerizer`] callers, the second from
/// collaborator tasks spawned by the loop itself.
#[derive(Debug)]
pub(crate) enum Message {
    Launch {
        request: Box<LaunchRequest>,
        reply: oneshot::Sender<Result<bool>>,
    },
    Wait {
        id: ContainerId,
        reply: oneshot::Sender<Result<Option<Termination>>>,
    },
    Destroy {
        id: ContainerId,
        reply: oneshot::Sender<Result<bool>>,
    },
    Recover {
        state: Box<AgentState>,
        reply: oneshot::Sender<Result<()>>,
    },
    Containers {
        reply: oneshot::Sender<HashSet<ContainerId>>,
    },
    Status {
        id: ContainerId,
        reply: oneshot::Sender<Option<ContainerStatus>>,
    },

    Fetched {
        id: ContainerId,
        result: Result<()>,
    },
    Provisioned {
        id: ContainerId,
        result: Result<ProvisionInfo>,
    },
    Prepared {
        id: ContainerId,
        index: usize,
        result: Result<Option<LaunchInfo>>,
    },
    Forked {
        id: ContainerId,
        result: Result<u32>,
    },
    Isolated {
        id: ContainerId,
        index: usize,
        result: Result<()>,
    },
    Exited {
        id: ContainerId,
        result: Result<Option<i32>>,
    },
    Limited {
        id: ContainerId,
        index: usize,
        result: Result<Limitation>,
    },
    LauncherDestroyed {
        id: ContainerId,
        result: Result<()>,
    },
    CleanedUp {
        id: ContainerId,
        errors: Vec<String>,
    },
    RecoveryPlanned {
        result: Result<RecoveryPlan>,
        reply: oneshot::Sender<Result<()>>,
    },
    RecoveryDone {
        plan: RecoveryPlan,
        result: Result<()>,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Handle to a running containerizer.
///
/// Cheap to clone; all clones talk to the same control loop.
#[derive(Clone)]
pub struct Containerizer {
    tx: mpsc::UnboundedSender<Message>,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for Containerizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Containerizer")
            .field("running", &!self.tx.is_closed())
            .finish()
    }
}

/// Builder wiring collaborators into a [`Containerizer`].
pub struct ContainerizerBuilder {
    flags: ContainerizerFlags,
    fetcher: Option<Arc<dyn Fetcher>>,
    launcher: Option<Arc<dyn Launcher>>,
    provisioner: Option<Arc<dyn Provisioner>>,
    isolators: Vec<Arc<dyn Isolator>>,
}

impl ContainerizerBuilder {
    /// Replaces the default [`LocalFetcher`].
    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Replaces the launcher named by the flags.
    pub fn launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Sets the provisioner. Without one, image launches fail.
    pub fn provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    /// Appends an isolator. Isolators keep their insertion order.
    pub fn isolator(mut self, isolator: Arc<dyn Isolator>) -> Self {
        self.isolators.push(isolator);
        self
    }

    /// Creates the runtime directory and starts the control loop.
    ///
    /// # Errors
    ///
    /// Fails outside a tokio runtime, on invalid flags, or if the runtime
    /// directory cannot be created.
    pub fn build(self) -> Result<Containerizer> {
        self.flags.validate_runtime()?;
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Internal(format!("no tokio runtime: {}", e)))?;

        std::fs::create_dir_all(&self.flags.runtime_dir)?;

        let launcher = match self.launcher {
            Some(launcher) => launcher,
            None => crate::launchers::from_flags(&self.flags)?,
        };
        let fetcher = self.fetcher.unwrap_or_else(|| Arc::new(LocalFetcher::new()));

        let (tx, rx) = mpsc::unbounded_channel();
        let metrics = Arc::new(Metrics::new());

        info!(
            "Starting containerizer (runtime dir {}, launcher {}, {} isolator(s))",
            self.flags.runtime_dir.display(),
            launcher.name(),
            self.isolators.len()
        );

        let actor = Actor::new(
            self.flags,
            fetcher,
            self.provisioner,
            self.isolators,
            launcher,
            Arc::clone(&metrics),
            tx.downgrade(),
        );
        handle.spawn(actor.run(rx));

        Ok(Containerizer { tx, metrics })
    }
}

impl Containerizer {
    /// Starts building a containerizer with custom collaborators.
    pub fn builder(flags: ContainerizerFlags) -> ContainerizerBuilder {
        ContainerizerBuilder {
            flags,
            fetcher: None,
            launcher: None,
            provisioner: None,
            isolators: Vec::new(),
        }
    }

    /// Creates a containerizer from flags alone, using the built-in
    /// collaborators they name.
    pub fn create(flags: ContainerizerFlags) -> Result<Self> {
        flags.validate()?;
        let isolators = crate::isolators::from_names(&flags.isolation)?;
        isolators
            .into_iter()
            .fold(Self::builder(flags), ContainerizerBuilder::isolator)
            .build()
    }

    async fn request<T>(&self, message: impl FnOnce(oneshot::Sender<T>) -> Message) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(message(reply))
            .map_err(|_| Error::ContainerizerStopped)?;
        rx.await.map_err(|_| Error::ContainerizerStopped)
    }

    /// Launches a container.
    ///
    /// # Returns
    ///
    /// `Ok(true)` once the container is running and watched.
    ///
    /// # Errors
    ///
    /// Any stage failure, or a destroy before the container started. The
    /// container is torn down before the error is returned.
    pub async fn launch(&self, request: LaunchRequest) -> Result<bool> {
        self.request(|reply| Message::Launch {
            request: Box::new(request),
            reply,
        })
        .await?
    }

    /// Waits for a container to terminate.
    ///
    /// # Returns
    ///
    /// `Ok(None)` for unknown containers.
    ///
    /// # Errors
    ///
    /// `DestroyFailed` if the teardown failed.
    pub async fn wait(&self, id: &ContainerId) -> Result<Option<Termination>> {
        let id = id.clone();
        self.request(|reply| Message::Wait { id, reply }).await?
    }

    /// Destroys a container (and its nested containers).
    ///
    /// # Returns
    ///
    /// `Ok(false)` for unknown containers, `Ok(true)` once the teardown is
    /// complete.
    pub async fn destroy(&self, id: &ContainerId) -> Result<bool> {
        let id = id.clone();
        self.request(|reply| Message::Destroy { id, reply }).await?
    }

    /// Recovers containers left running by a previous agent.
    pub async fn recover(&self, state: AgentState) -> Result<()> {
        self.request(|reply| Message::Recover {
            state: Box::new(state),
            reply,
        })
        .await?
    }

    /// Returns every container that has not terminated.
    pub async fn containers(&self) -> Result<HashSet<ContainerId>> {
        self.request(|reply| Message::Containers { reply }).await
    }

    /// Returns a point-in-time status of a container.
    pub async fn status(&self, id: &ContainerId) -> Result<Option<ContainerStatus>> {
        let id = id.clone();
        self.request(|reply| Message::Status { id, reply }).await
    }

    /// Counters of this containerizer.
    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }
}
