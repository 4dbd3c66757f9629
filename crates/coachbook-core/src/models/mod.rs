//! Data models for Coachbook

mod backup;
mod client;
mod trainer;

pub use backup::BackupDocument;
pub use client::{Client, ClientId};
pub use trainer::TrainerProfile;
