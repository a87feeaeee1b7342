//! Control socket for versiongated
//!
//! Operators talk to the daemon over a Unix domain socket, one JSON
//! request per line and one JSON response per line. The peer's uid decides
//! whether it may control the daemon or only read its status.

mod client;
mod server;

pub use client::*;
pub use server::*;

use thiserror::Error;
use versiongate_api::ErrorCode;

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Request rejected ({code:?}): {message}")]
    Rejected { code: ErrorCode, message: String },

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

pub type IpcResult<T> = Result<T, IpcError>;
