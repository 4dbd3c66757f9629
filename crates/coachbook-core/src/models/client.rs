//! Client model

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unique identifier for a client, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Create a new unique client ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ClientId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// A client coached by the trainer.
///
/// The sync layer treats clients as opaque records: only `id` and the note
/// count (diagnostic logging) are ever inspected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    /// Unique identifier
    pub id: ClientId,
    /// Display name
    pub name: String,
    /// Contact email, when known
    #[serde(default)]
    pub email: Option<String>,
    /// Free-form training goal
    #[serde(default)]
    pub goal: Option<String>,
    /// Session notes attached to this client
    #[serde(default)]
    pub notes: Vec<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl Client {
    /// Create a new client with the given display name
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ClientId::new(),
            name: name.into(),
            email: None,
            goal: None,
            notes: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Number of notes on this client, used for diagnostic logging only
    #[must_use]
    pub fn note_count(&self) -> usize {
        self.notes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn client_id_round_trips_through_string() {
        let id = ClientId::new();
        let parsed: ClientId = id.as_str().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn new_client_has_no_notes() {
        let client = Client::new("Ada");
        assert_eq!(client.note_count(), 0);
        assert_eq!(client.name, "Ada");
    }
}
