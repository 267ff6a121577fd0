//! cdbox engine.
//!
//! The lifecycle engine ([`lifecycle::ContainerManager`]) turns create
//! options into OCI bundles and drives them through the runtime
//! collaborators in [`client`]. Around it sit the identifier resolver, the
//! volume and network stores, the logging pipeline, the detached task
//! monitor and the compose orchestrator.

#![allow(clippy::result_large_err)]

pub mod client;
pub mod compose;
pub mod context;
pub mod filters;
pub mod fs;
pub mod hook;
pub mod ids;
pub mod lifecycle;
pub mod logging;
pub mod monitor;
pub mod network;
pub mod resolve;
pub mod spec;
pub mod volume;

pub use client::Services;
pub use compose::{Orchestrator, Project};
pub use lifecycle::{Container, ContainerManager};
pub use network::NetworkStore;
pub use volume::VolumeStore;

/// cdbox runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
