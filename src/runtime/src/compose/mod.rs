//! Multi-container projects described by a compose file.
//!
//! Loading resolves files, variables and defaults into a [`Project`]; the
//! [`Orchestrator`] then drives the lifecycle engine to make the running
//! containers match it.

pub mod fingerprint;
pub mod graph;
pub mod interpolate;
pub mod loader;
pub mod model;
pub mod orchestrator;
pub mod project;

pub use loader::{load, LoadOptions};
pub use model::ComposeFile;
pub use orchestrator::{Action, Change, ComposeImageRow, ComposePsRow, DownOptions, Orchestrator, Report, UpOptions};
pub use project::Project;
