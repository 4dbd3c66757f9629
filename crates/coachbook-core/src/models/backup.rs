//! Backup document model
//!
//! The backup document is the single serialized snapshot of all clients plus
//! the trainer profile. It is the unit of remote storage: uploads and
//! downloads always move the whole document, never deltas.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Client, TrainerProfile};

/// Serialized snapshot of the full client collection at a point in time.
///
/// Wire shape (JSON): `{ "clients": [...], "userProfile": ..., "lastUpdated": "ISO-8601" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupDocument {
    /// All client records
    pub clients: Vec<Client>,
    /// Trainer profile, when one has been set up
    #[serde(rename = "userProfile", default)]
    pub trainer: Option<TrainerProfile>,
    /// When this snapshot was assembled
    #[serde(rename = "lastUpdated")]
    pub last_updated: DateTime<Utc>,
}

impl BackupDocument {
    /// Assemble a new snapshot from the current collection and profile.
    #[must_use]
    pub fn new(clients: Vec<Client>, trainer: Option<TrainerProfile>) -> Self {
        Self {
            clients,
            trainer,
            last_updated: Utc::now(),
        }
    }

    /// Total note count across all clients, for diagnostic logging.
    #[must_use]
    pub fn total_notes(&self) -> usize {
        self.clients.iter().map(Client::note_count).sum()
    }
}
