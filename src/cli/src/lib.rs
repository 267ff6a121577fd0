//! cdbox CLI: Docker-compatible container management on a local OCI runtime.

pub mod app;
pub mod commands;
pub mod output;
