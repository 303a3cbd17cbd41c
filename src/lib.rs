//! # condenser
//!
//! **High-Level Container Runtime Control Plane**
//!
//! This crate orchestrates containers above the lower-level `droplet`
//! OCI executor. It pulls images, lays out per-container state on disk,
//! generates the runtime specification the executor consumes, wires
//! containers into a host bridge with optional port forwarding, and
//! receives the executor's hook callbacks at each OCI lifecycle stage.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          condenser                               │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  HTTP front (axum)                                               │
//! │  /v1/containers · /v1/images          /v1/hooks/droplet          │
//! │          │                                   ▲                   │
//! │          ▼                                   │ curl (in-container)│
//! │  ┌───────────────────┐               ┌──────────────┐            │
//! │  │ ContainerService  │               │ HookService  │            │
//! │  │ create/start/stop │               │ state machine│            │
//! │  │ delete/exec       │               └──────────────┘            │
//! │  └───┬─────┬─────┬───┘                                           │
//! │      │     │     │                                               │
//! │      ▼     ▼     ▼                                               │
//! │  ┌──────┐┌──────┐┌─────────┐   ┌──────────────┐                  │
//! │  │ IPAM ││ ILM  ││ Registry│   │ NetworkHandler│ (iptables)      │
//! │  │store ││store ││ client  │   └──────────────┘                  │
//! │  └──────┘└──────┘└─────────┘                                     │
//! │      dual-locked JSON state, atomic rename commits               │
//! ├──────────────────────────────────────────────────────────────────┤
//! │             RuntimeHandler → droplet executor                    │
//! │   spec (config.json) · create · start · stop · delete · exec     │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! Create runs seven ordered steps: id generation, container directory
//! layout (`diff/`, `work/`, `merged/`, `etc/`), etc files, cgroup
//! subtree, runtime spec (which allocates the bridge address and embeds
//! the hook curl commands), port-forward rules, and finally the
//! executor's create. Delete reverses the recorded effects in the
//! opposite order. There is no automatic rollback mid-create; delete of
//! the same id cleans up whatever was installed.
//!
//! # Shared State
//!
//! The IPAM and ILM ledgers are JSON files guarded by an in-process
//! mutex plus an advisory file lock, committed by write–fsync–rename.
//! Cooperating processes (the daemon and CLI utilities) can share one
//! state file safely; a reader always sees either the pre- or
//! post-image of a commit, never a torn write.

pub mod api;
pub mod config;
pub mod constants;
pub mod container;
pub mod error;
pub mod fs;
pub mod hook;
pub mod ilm;
pub mod image;
pub mod ipam;
pub mod network;
pub mod registry;
pub mod runtime;

mod statefile;

pub use config::Config;
pub use container::{ContainerService, CreateRequest};
pub use error::{Error, Result};
pub use hook::{ContainerStatus, DropletState, HookEvent, HookService};
pub use image::{ImageReference, ImageService, PullRequest};
pub use ipam::{IpamManager, IpamStore};
pub use network::{ForwardRule, Protocol};
pub use runtime::{RuntimeHandler, RuntimeSpec};
