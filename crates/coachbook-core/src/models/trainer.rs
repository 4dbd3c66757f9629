//! Trainer profile model

use serde::{Deserialize, Serialize};

/// Profile of the trainer who owns the backup document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainerProfile {
    /// Display name shown in the app header
    pub display_name: String,
    /// Contact email, when known
    #[serde(default)]
    pub email: Option<String>,
    /// Studio or business name
    #[serde(default)]
    pub business_name: Option<String>,
}
