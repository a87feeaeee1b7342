//! Protocol types for the versiongate control socket
//!
//! This crate defines the stable API between versiongated and local clients:
//! - Commands (start/stop/reload/status)
//! - Responses
//! - The status read model
//! - Versioning

mod commands;
mod types;

pub use commands::*;
pub use types::*;

/// Current API version
pub const API_VERSION: u32 = 1;
