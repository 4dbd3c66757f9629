//! Local cache - the synchronous source of truth for client data
//!
//! A small namespaced key-value store over `SQLite`. Every save lands here
//! before any network activity happens, and reads never wait on the remote.
//! The store carries a byte budget; exceeding it is a fatal local error that
//! is surfaced to the caller rather than silently dropped.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};
use crate::models::{BackupDocument, TrainerProfile};

/// Backup document blob
const KEY_DOCUMENT: &str = "coachbook.backup.document";
/// Trainer profile blob, stored separately so profile edits survive a
/// document wipe-and-reseed
const KEY_TRAINER: &str = "coachbook.backup.trainer";
/// Last successful local save (ISO-8601)
const KEY_LAST_LOCAL_SAVE: &str = "coachbook.sync.last_local_save_at";
/// Last remote modified time we synced against (ISO-8601)
const KEY_LAST_REMOTE_MODIFIED: &str = "coachbook.sync.last_remote_modified_at";
/// Cached bearer credential
const KEY_CACHED_TOKEN: &str = "coachbook.auth.cached_token";

/// Default store ceiling: a few MB, matching what browser-style local
/// storage would have allowed the data to grow to.
const DEFAULT_BYTE_BUDGET: usize = 4 * 1024 * 1024;

/// Sync bookkeeping fields persisted alongside the document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncBookkeeping {
    /// When the local cache last accepted a save
    pub last_local_save_at: Option<DateTime<Utc>>,
    /// Remote modified time recorded at the last successful push or pull
    pub last_known_remote_modified_at: Option<DateTime<Utc>>,
}

/// Synchronous key-value store for the backup document and sync bookkeeping.
pub struct LocalCache {
    conn: Connection,
    byte_budget: usize,
}

impl LocalCache {
    /// Open (or create) the cache at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Open an in-memory cache (useful for testing).
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             CREATE TABLE IF NOT EXISTS kv (
                 key   TEXT PRIMARY KEY,
                 value TEXT NOT NULL
             );",
        )?;
        Ok(Self {
            conn,
            byte_budget: DEFAULT_BYTE_BUDGET,
        })
    }

    /// Override the store byte budget (tests use small budgets).
    #[must_use]
    pub const fn with_byte_budget(mut self, budget: usize) -> Self {
        self.byte_budget = budget;
        self
    }

    /// Read the cached backup document, if any.
    pub fn read_document(&self) -> Result<Option<BackupDocument>> {
        match self.read_raw(KEY_DOCUMENT)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Persist the backup document.
    pub fn write_document(&self, doc: &BackupDocument) -> Result<()> {
        let raw = serde_json::to_string(doc)?;
        self.write_raw(KEY_DOCUMENT, &raw)
    }

    /// Read the trainer profile blob.
    pub fn read_trainer(&self) -> Result<Option<TrainerProfile>> {
        match self.read_raw(KEY_TRAINER)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Persist the trainer profile blob.
    pub fn write_trainer(&self, trainer: &TrainerProfile) -> Result<()> {
        let raw = serde_json::to_string(trainer)?;
        self.write_raw(KEY_TRAINER, &raw)
    }

    /// Read the sync bookkeeping timestamps.
    pub fn read_sync_state(&self) -> Result<SyncBookkeeping> {
        Ok(SyncBookkeeping {
            last_local_save_at: self.read_timestamp(KEY_LAST_LOCAL_SAVE)?,
            last_known_remote_modified_at: self.read_timestamp(KEY_LAST_REMOTE_MODIFIED)?,
        })
    }

    /// Persist the sync bookkeeping timestamps.
    pub fn write_sync_state(&self, state: &SyncBookkeeping) -> Result<()> {
        self.write_timestamp(KEY_LAST_LOCAL_SAVE, state.last_local_save_at)?;
        self.write_timestamp(KEY_LAST_REMOTE_MODIFIED, state.last_known_remote_modified_at)
    }

    /// Read the cached credential, if one was stored.
    pub fn read_cached_token(&self) -> Result<Option<String>> {
        self.read_raw(KEY_CACHED_TOKEN)
    }

    /// Cache the current credential for the next app start.
    pub fn write_cached_token(&self, token: &str) -> Result<()> {
        self.write_raw(KEY_CACHED_TOKEN, token)
    }

    /// Drop everything. Called on logout.
    pub fn clear(&self) -> Result<()> {
        self.conn.execute("DELETE FROM kv", [])?;
        Ok(())
    }

    /// Total bytes currently stored across all keys.
    pub fn used_bytes(&self) -> Result<usize> {
        let used: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(LENGTH(key) + LENGTH(value)), 0) FROM kv",
            [],
            |row| row.get(0),
        )?;
        usize::try_from(used).map_err(|_| Error::Database("negative store size".to_string()))
    }

    fn read_raw(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row("SELECT value FROM kv WHERE key = ?", params![key], |row| {
                row.get(0)
            })
            .optional()
            .map_err(Error::from)
    }

    fn write_raw(&self, key: &str, value: &str) -> Result<()> {
        self.check_budget(key, value)?;
        self.conn.execute(
            "INSERT INTO kv (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// Reject writes that would push the store past its byte budget.
    fn check_budget(&self, key: &str, value: &str) -> Result<()> {
        let replaced: Option<i64> = self
            .conn
            .query_row(
                "SELECT LENGTH(value) FROM kv WHERE key = ?",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        // A replaced entry releases its key bytes as well as its value bytes.
        let released = replaced.map_or(0, |len| {
            key.len().saturating_add(usize::try_from(len).unwrap_or(0))
        });
        let projected = self
            .used_bytes()?
            .saturating_sub(released)
            .saturating_add(key.len())
            .saturating_add(value.len());

        if projected > self.byte_budget {
            return Err(Error::LocalStorageFull {
                attempted: value.len(),
                budget: self.byte_budget,
            });
        }
        Ok(())
    }

    fn read_timestamp(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        let Some(raw) = self.read_raw(key)? else {
            return Ok(None);
        };
        let parsed = DateTime::parse_from_rfc3339(&raw)
            .map_err(|error| Error::Database(format!("bad timestamp under {key}: {error}")))?;
        Ok(Some(parsed.with_timezone(&Utc)))
    }

    fn write_timestamp(&self, key: &str, value: Option<DateTime<Utc>>) -> Result<()> {
        match value {
            Some(ts) => self.write_raw(key, &ts.to_rfc3339()),
            None => {
                self.conn
                    .execute("DELETE FROM kv WHERE key = ?", params![key])?;
                Ok(())
            }
        }
    }
}
