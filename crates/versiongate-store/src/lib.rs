//! Persistence layer for versiongate
//!
//! Provides:
//! - Users and devices mirrored from the directory and MDM
//! - The compliance ledger (`bot_results`)
//! - Exclusions
//! - Audit log (append-only)

mod audit;
mod models;
mod sqlite;
mod traits;

pub use audit::*;
pub use models::*;
pub use sqlite::*;
pub use traits::*;

use thiserror::Error;
use versiongate_util::ComplianceError;

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0} is not a table")]
    UnknownTable(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<StoreError> for ComplianceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => ComplianceError::NotFound(what),
            StoreError::UnknownTable(name) => {
                ComplianceError::Validation(format!("{name} is not a table"))
            }
            other => ComplianceError::Store(other.to_string()),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
