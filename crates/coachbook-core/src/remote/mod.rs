//! Remote backup client
//!
//! Authenticated read/write of the single serialized backup document against
//! a generic blob-storage remote: one named container (folder) holding one
//! named document. The [`BackupStore`] trait is the seam the sync coordinator
//! works against; [`DriveBackupClient`] is the HTTP implementation.

mod drive;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::BackupDocument;

pub use drive::DriveBackupClient;

/// Errors from remote backup operations.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// No credential available; the remote step must be skipped
    #[error("Not authenticated with the backup remote")]
    NotAuthenticated,
    /// Credential was rejected (401-class); retries must halt until refresh
    #[error("Backup credential expired or was rejected")]
    AuthExpired,
    /// A cached handle went stale (404-class); handles should be invalidated
    #[error("Remote item not found: {0}")]
    StaleHandle(String),
    /// Network failure or 5xx-class response; recoverable via retry
    #[error("Backup remote unavailable: {0}")]
    Unavailable(String),
    /// Response did not carry the fields we need
    #[error("Invalid remote payload: {0}")]
    InvalidPayload(String),
    /// Bad client-side configuration
    #[error("Invalid backup configuration: {0}")]
    InvalidConfiguration(String),
}

impl From<reqwest::Error> for RemoteError {
    fn from(error: reqwest::Error) -> Self {
        Self::Unavailable(error.to_string())
    }
}

/// Result alias for remote operations.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Opaque handle to the remote container (folder).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle(pub String);

/// Opaque handle to the remote backup document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentHandle(pub String);

/// Cheap metadata about the remote document, used for conflict probing.
///
/// Deliberately excludes the body: probing must never transfer the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentMetadata {
    /// Remote document id
    pub id: String,
    /// Remote last-modified time
    pub modified_at: DateTime<Utc>,
}

/// Remote storage operations for the backup document.
#[async_trait]
pub trait BackupStore: Send + Sync {
    /// Find the named container, creating it when absent. Idempotent; the
    /// handle is cached for the session.
    async fn locate_or_create_container(&self) -> RemoteResult<ContainerHandle>;

    /// Find the backup document inside the container, if it exists.
    async fn locate_document(
        &self,
        container: &ContainerHandle,
    ) -> RemoteResult<Option<DocumentHandle>>;

    /// Fetch id + modified time without transferring the body.
    async fn get_metadata(
        &self,
        container: &ContainerHandle,
    ) -> RemoteResult<Option<DocumentMetadata>>;

    /// Download and deserialize the backup document.
    async fn download(&self, container: &ContainerHandle) -> RemoteResult<Option<BackupDocument>>;

    /// Upload the document, creating it when absent, and return the new
    /// remote modified time for bookkeeping.
    async fn upload(
        &self,
        container: &ContainerHandle,
        doc: &BackupDocument,
    ) -> RemoteResult<DateTime<Utc>>;

    /// Tombstone the remote document by renaming it, preserving
    /// recoverability. Clears any cached document handle.
    async fn soft_delete(&self, container: &ContainerHandle) -> RemoteResult<()>;
}
