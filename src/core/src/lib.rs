//! cdbox core - foundational types shared by the runtime and the CLI.
//!
//! Holds the error taxonomy, the container label schema, global
//! configuration and the data-root layout, and the value types decoded
//! from labels (ports, mounts, restart policy, log config, networks,
//! volumes). Nothing here talks to a runtime.

pub mod config;
pub mod container;
pub mod error;
pub mod labels;
pub mod log;
pub mod network;
pub mod signal;
pub mod units;
pub mod volume;

// Re-export commonly used types
pub use config::{CgroupManager, DataStore, GlobalConfig};
pub use container::{
    ContainerStatus, HealthCheck, MountRecord, MountType, PortMapping, RestartPolicy,
};
pub use error::{BoxError, Result};
pub use labels::ContainerLabels;
pub use log::{LogConfig, LogDriver, LogEntry, LogStream};
pub use network::{Ipam, NetworkMode};
pub use volume::{VolumeInfo, VolumeMeta};

/// cdbox version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
