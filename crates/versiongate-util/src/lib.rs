//! Shared utilities for versiongate
//!
//! This crate provides:
//! - The error taxonomy shared by every crate
//! - Dotted-numeric OS version comparison
//! - Wall-clock helpers (mock time, user-local due times, deadline parsing)
//! - ID types (RunId, ClientId)
//! - Default paths for config, data, and socket

mod error;
mod ids;
mod paths;
mod time;
mod version;

pub use error::*;
pub use ids::*;
pub use paths::*;
pub use time::*;
pub use version::*;
