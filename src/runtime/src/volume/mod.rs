//! Named volumes.
//!
//! Provides [`VolumeStore`], the directory-backed volume store of one
//! namespace.

mod store;

pub use store::{RemoveOutcome, VolumeStore, FILTER_KEYS};
