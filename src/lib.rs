//! # magiklet
//!
//! **Container Lifecycle Orchestration for a Node Agent**
//!
//! This crate launches, watches, destroys and recovers containers on a single
//! node. A container runs one executor process plus, optionally, nested
//! containers launched under it. The actual work is delegated to pluggable
//! collaborators; the containerizer only sequences them and keeps per-container
//! state consistent while launches, destroys and exits race with each other.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                            magiklet                                 │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │                 Containerizer (control loop)                │    │
//! │  │   launch(req) → wait(id) → destroy(id) → recover(state)     │    │
//! │  │                containers() │ status(id)                    │    │
//! │  └─────────────────────────────────────────────────────────────┘    │
//! │                              │                                      │
//! │  ┌───────────────────────────┼───────────────────────────────┐      │
//! │  │                  Runtime Directory                        │      │
//! │  │  <runtime_dir>/containers/<id>/containers/<child>/pid     │      │
//! │  │  pid + status checkpoints │ parent-first tree walk        │      │
//! │  └───────────────────────────┼───────────────────────────────┘      │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                         Collaborators                               │
//! │  ┌──────────┐  ┌─────────────┐  ┌────────────┐  ┌──────────────┐    │
//! │  │ Fetcher  │  │ Provisioner │  │ Isolator*  │  │   Launcher   │    │
//! │  │ (URIs)   │  │  (rootfs)   │  │ (ordered)  │  │ (fork/kill)  │    │
//! │  └──────────┘  └─────────────┘  └────────────┘  └──────────────┘    │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Container Lifecycle
//!
//! ```text
//!   Fetching ─▶ Provisioning ─▶ Preparing ─▶ Launching ─▶ Isolating ─▶ Watching
//!      │             │              │            │            │           │
//!      └─────────────┴──────────────┴────────────┴────────────┴───────────┴─▶ Destroying ─▶ Terminated
//! ```
//!
//! A destroy may arrive at any stage. It never interrupts a collaborator
//! call; the container is torn down once the in-flight call settles, and the
//! teardown releases only what the container actually acquired.
//!
//! # Recovery
//!
//! The runtime directory survives an agent restart. [`Containerizer::recover`]
//! re-attaches to every container the checkpointed [`AgentState`] knows about
//! and destroys the orphans it does not.
//!
//! # Example
//!
//! ```rust,ignore
//! use magiklet::{CommandInfo, ContainerId, Containerizer, ContainerizerFlags, ExecutorInfo, LaunchRequest};
//!
//! #[tokio::main]
//! async fn main() -> magiklet::Result<()> {
//!     let containerizer = Containerizer::create(ContainerizerFlags::default())?;
//!
//!     let id = ContainerId::random();
//!     let executor = ExecutorInfo::new("executor", CommandInfo::shell("echo hello"));
//!     containerizer
//!         .launch(LaunchRequest::new(id.clone(), executor, "/var/lib/magiklet/sandbox"))
//!         .await?;
//!
//!     let termination = containerizer.wait(&id).await?;
//!     println!("exited with {:?}", termination.and_then(|t| t.status));
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod constants;
pub mod containerizer;
pub mod error;
pub mod fetcher;
pub mod id;
pub mod isolator;
pub mod isolators;
pub mod launcher;
pub mod launchers;
pub mod metrics;
pub mod paths;
pub mod provisioner;
pub mod types;

// Re-exports
pub use config::ContainerizerFlags;
pub use containerizer::{Containerizer, ContainerizerBuilder};
pub use error::{Error, Result};
pub use fetcher::{Fetcher, LocalFetcher};
pub use id::ContainerId;
pub use isolator::Isolator;
pub use isolators::PosixIsolator;
pub use launcher::{ForkOptions, Launcher, LauncherStatus};
pub use launchers::PosixLauncher;
pub use metrics::{Metrics, MetricsSnapshot};
pub use provisioner::{ProvisionInfo, Provisioner};
pub use types::{
    AgentState, CommandInfo, CommandUri, ContainerConfig, ContainerInfo, ContainerState,
    ContainerStatus, ContainerType, ExecutorInfo, ExecutorState, FrameworkState, Image, ImageKind,
    LaunchInfo, LaunchRequest, Limitation, Mount, Namespace, RecoveredContainer, ResourceStatistics,
    Resources, RunState, TaskInfo, Termination,
};
