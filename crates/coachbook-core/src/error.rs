//! Error types for coachbook-core

use thiserror::Error;

/// Result type alias using coachbook-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in coachbook-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Local database error
    #[error("Database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Local store would exceed its byte budget
    #[error("Local storage full: writing {attempted} bytes would exceed the {budget} byte budget")]
    LocalStorageFull {
        /// Size of the write that was rejected
        attempted: usize,
        /// Configured store ceiling in bytes
        budget: usize,
    },

    /// Client not found
    #[error("Client not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
