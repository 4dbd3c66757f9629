//! Events emitted by the sync coordinator.
//!
//! Remote outcomes never surface as return values to the caller that made
//! the edit; they arrive asynchronously on a broadcast channel so the UI can
//! show a banner instead of a blocking error dialog.

use chrono::{DateTime, Utc};

/// Asynchronous sync outcome delivered to subscribed callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Remote document diverged; manual resolution required. Carries both
    /// sides' timestamps so the UI can present the choice.
    Conflict {
        /// When the local side last saved
        local_saved_at: DateTime<Utc>,
        /// The remote document's modified time
        remote_modified_at: DateTime<Utc>,
    },
    /// A background refresh replaced the cached client collection.
    ClientsUpdated,
    /// The backup credential was rejected; retries are halted until refresh.
    TokenExpired,
    /// A fresh credential was supplied; queued work resumes.
    TokenRefreshed,
}
