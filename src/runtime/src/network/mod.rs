//! Container networking configuration.
//!
//! Provides [`NetworkStore`] for CNI config lists. Plugin execution lives in
//! [`crate::client::cni`] and is driven from the OCI hooks in [`crate::hook`].

mod store;

pub use store::{NetworkCreate, NetworkInfo, NetworkStore, CNI_VERSION, FILTER_KEYS};
