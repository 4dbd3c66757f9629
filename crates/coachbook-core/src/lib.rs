//! coachbook-core - Core library for Coachbook
//!
//! This crate contains the shared models, the local cache that is the source of
//! truth for client data, the remote backup client, and the sync coordinator
//! that ties them together for all Coachbook interfaces.

pub mod cache;
pub mod error;
pub mod models;
pub mod remote;
pub mod session;
pub mod sync;
pub mod util;

pub use error::{Error, Result};
pub use models::{BackupDocument, Client, ClientId, TrainerProfile};
