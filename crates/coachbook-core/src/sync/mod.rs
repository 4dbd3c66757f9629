//! Sync coordinator - the save/load protocol core
//!
//! Owns the local-first save path (synchronous cache write, debounced remote
//! push), metadata-based conflict detection, the backoff retry queue, and
//! session teardown. Remote I/O is fire-and-forget from the caller's
//! perspective; outcomes are delivered as [`SyncEvent`]s.
//!
//! Save cycle: `Idle -> LocalPersisted -> PendingPush -> {Pushed | Conflict | Failed}`.

mod events;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::cache::{LocalCache, SyncBookkeeping};
use crate::error::Result;
use crate::models::{BackupDocument, Client};
use crate::remote::{BackupStore, RemoteError};
use crate::session::SessionProvider;

pub use events::SyncEvent;

const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Timing knobs for the sync coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Idle period after the last save before a remote push is attempted
    pub debounce_window: Duration,
    /// Clock-skew tolerance when comparing remote modified times
    pub conflict_tolerance: Duration,
    /// First retry delay after a failed upload
    pub retry_base_delay: Duration,
    /// Ceiling for the doubling retry delay
    pub retry_max_delay: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_window: Duration::from_secs(2),
            conflict_tolerance: Duration::from_secs(5),
            retry_base_delay: Duration::from_secs(2),
            retry_max_delay: Duration::from_secs(60),
        }
    }
}

impl SyncConfig {
    /// Set the debounce window.
    #[must_use]
    pub const fn with_debounce_window(mut self, window: Duration) -> Self {
        self.debounce_window = window;
        self
    }

    /// Set the conflict tolerance window.
    #[must_use]
    pub const fn with_conflict_tolerance(mut self, tolerance: Duration) -> Self {
        self.conflict_tolerance = tolerance;
        self
    }

    /// Set the retry backoff base and ceiling.
    #[must_use]
    pub const fn with_retry_delays(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base_delay = base;
        self.retry_max_delay = max;
        self
    }
}

/// Snapshot of the coordinator's bookkeeping, for status displays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    /// Whether a payload is waiting for the debounce timer or a conflict
    pub pending_push: bool,
    /// Failed payloads waiting in the retry queue
    pub queued_retries: usize,
    /// Delay the next retry attempt will wait
    pub retry_delay: Duration,
    /// Whether retries are halted on an expired credential
    pub auth_halted: bool,
    /// When the local cache last accepted a save
    pub last_local_save_at: Option<DateTime<Utc>>,
    /// Remote modified time recorded at the last successful sync
    pub last_known_remote_modified_at: Option<DateTime<Utc>>,
}

/// Coordinator-owned mutable state, one per session.
struct SyncState {
    last_local_save_at: Option<DateTime<Utc>>,
    last_known_remote_modified_at: Option<DateTime<Utc>>,
    /// Latest unsynced collection; replaced (not appended) by each save
    pending_push: Option<Vec<Client>>,
    /// Bumped on every save so a finishing push can tell whether the
    /// payload it uploaded is still the latest one
    push_seq: u64,
    /// Failed payloads tagged with their save sequence, oldest first.
    /// Entries older than `push_seq` are superseded whole-document
    /// snapshots and are dropped, never re-uploaded.
    retry_queue: VecDeque<(u64, Vec<Client>)>,
    retry_delay: Duration,
    auth_halted: bool,
    debounce_timer: Option<JoinHandle<()>>,
    retry_task: Option<JoinHandle<()>>,
    shutting_down: bool,
}

/// Outcome of one remote push attempt.
enum PushAttempt {
    Pushed(DateTime<Utc>),
    Conflict {
        local_saved_at: DateTime<Utc>,
        remote_modified_at: DateTime<Utc>,
    },
    /// No credential; the remote step is skipped silently
    Skipped,
    AuthExpired,
    Failed(String),
}

struct Inner {
    cache: Mutex<LocalCache>,
    store: Arc<dyn BackupStore>,
    session: Arc<dyn SessionProvider>,
    config: SyncConfig,
    state: Mutex<SyncState>,
    /// Serializes every remote upload: the debounce timer, the retry loop,
    /// and flush never race each other to the remote.
    push_gate: AsyncMutex<()>,
    events: broadcast::Sender<SyncEvent>,
}

/// Local-first save/load coordinator.
///
/// Cheap to clone; clones share one session's state.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<Inner>,
}

impl SyncCoordinator {
    /// Build a coordinator over an opened cache, remote store, and session.
    pub fn new(
        cache: LocalCache,
        store: Arc<dyn BackupStore>,
        session: Arc<dyn SessionProvider>,
    ) -> Result<Self> {
        Self::with_config(cache, store, session, SyncConfig::default())
    }

    /// Build a coordinator with explicit timing configuration.
    pub fn with_config(
        cache: LocalCache,
        store: Arc<dyn BackupStore>,
        session: Arc<dyn SessionProvider>,
        config: SyncConfig,
    ) -> Result<Self> {
        let bookkeeping = cache.read_sync_state()?;
        let retry_delay = config.retry_base_delay;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            inner: Arc::new(Inner {
                cache: Mutex::new(cache),
                store,
                session,
                config,
                state: Mutex::new(SyncState {
                    last_local_save_at: bookkeeping.last_local_save_at,
                    last_known_remote_modified_at: bookkeeping.last_known_remote_modified_at,
                    pending_push: None,
                    push_seq: 0,
                    retry_queue: VecDeque::new(),
                    retry_delay,
                    auth_halted: false,
                    debounce_timer: None,
                    retry_task: None,
                    shutting_down: false,
                }),
                push_gate: AsyncMutex::new(()),
                events,
            }),
        })
    }

    /// Subscribe to sync outcome events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// Persist the full replacement collection locally, then schedule a
    /// debounced remote push.
    ///
    /// The local write completes before this returns; only local failures
    /// (storage full, serialization) surface here. Remote outcomes arrive
    /// later as events.
    pub fn save(&self, clients: Vec<Client>) -> Result<()> {
        let inner = &self.inner;

        // Guard rail: never let a caller bug wipe a previously non-empty set.
        if clients.is_empty() {
            let had_clients = {
                let cache = inner.lock_cache();
                cache
                    .read_document()?
                    .is_some_and(|doc| !doc.clients.is_empty())
            };
            if had_clients {
                tracing::warn!("empty_save_rejected: refusing to overwrite non-empty collection");
                return Ok(());
            }
        }

        let doc = inner.build_document(&clients)?;
        let now = doc.last_updated;
        {
            let cache = inner.lock_cache();
            cache.write_document(&doc)?;
            cache.write_sync_state(&SyncBookkeeping {
                last_local_save_at: Some(now),
                last_known_remote_modified_at: inner.lock_state().last_known_remote_modified_at,
            })?;
        }

        tracing::debug!(
            clients = clients.len(),
            notes = doc.total_notes(),
            "local_persisted"
        );

        let window = inner.config.debounce_window;
        let task_inner = Arc::clone(inner);
        let mut state = inner.lock_state();
        state.last_local_save_at = Some(now);
        state.pending_push = Some(clients);
        state.push_seq += 1;
        if state.shutting_down {
            return Ok(());
        }
        // One timer per session: a save inside the window replaces the
        // payload and restarts the clock instead of stacking timers.
        if let Some(timer) = state.debounce_timer.take() {
            timer.abort();
        }
        state.debounce_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            Inner::run_push_cycle(&task_inner).await;
        }));

        Ok(())
    }

    /// Return the cached collection immediately, reconciling with the remote
    /// in the background. Only an empty cache may block on the network.
    pub async fn load(&self) -> Result<Vec<Client>> {
        let cached = {
            let cache = self.inner.lock_cache();
            cache.read_document()?
        };

        if let Some(doc) = cached {
            if !doc.clients.is_empty() {
                let task_inner = Arc::clone(&self.inner);
                tokio::spawn(async move {
                    Inner::run_background_sync(&task_inner).await;
                });
                return Ok(doc.clients);
            }
        }

        // Empty cache: the one path allowed to wait on the remote. Failures
        // degrade to an empty collection rather than an error.
        Ok(self.inner.seed_from_remote().await.unwrap_or_default())
    }

    /// Probe the remote and apply a newer document to the cache.
    ///
    /// Triggered on reconnect or manual refresh. Whole-document
    /// last-write-wins; no merging.
    pub async fn background_sync(&self) {
        Inner::run_background_sync(&self.inner).await;
    }

    /// Handle a connectivity-restored signal: reconcile with the remote,
    /// push any pending payload once, and resume the retry queue.
    pub async fn network_restored(&self) {
        Inner::run_background_sync(&self.inner).await;
        {
            let mut state = self.inner.lock_state();
            if let Some(timer) = state.debounce_timer.take() {
                timer.abort();
            }
        }
        Inner::run_push_cycle(&self.inner).await;
        Inner::schedule_retry(&self.inner);
    }

    /// A fresh credential was supplied: lift the auth halt and resume
    /// queued work.
    pub fn credential_refreshed(&self) {
        {
            let mut state = self.inner.lock_state();
            state.auth_halted = false;
        }
        self.inner.emit(SyncEvent::TokenRefreshed);
        Inner::schedule_retry(&self.inner);
    }

    /// Cancel the debounce timer and push any pending payload once,
    /// best-effort. Failure is logged, not retried - the session is ending.
    pub async fn flush_pending(&self) {
        let (payload, seq) = {
            let mut state = self.inner.lock_state();
            if let Some(timer) = state.debounce_timer.take() {
                timer.abort();
            }
            (state.pending_push.clone(), state.push_seq)
        };

        let Some(payload) = payload else {
            return;
        };
        if !self.inner.session.is_online() {
            tracing::debug!("flush skipped: offline");
            return;
        }

        let _gate = self.inner.push_gate.lock().await;
        match self.inner.push_payload(&payload).await {
            PushAttempt::Pushed(modified_at) => {
                {
                    let mut state = self.inner.lock_state();
                    if state.push_seq == seq {
                        state.pending_push = None;
                    }
                    state.retry_queue.retain(|(s, _)| *s > seq);
                }
                self.inner.record_remote_sync(modified_at);
                tracing::info!(clients = payload.len(), "flushed pending payload");
            }
            PushAttempt::Skipped => tracing::debug!("flush skipped: not authenticated"),
            PushAttempt::Conflict { .. } => {
                tracing::warn!("flush aborted: remote document is newer");
            }
            PushAttempt::AuthExpired => tracing::warn!("flush failed: credential expired"),
            PushAttempt::Failed(error) => tracing::warn!(%error, "flush failed"),
        }
    }

    /// Flush, then tear everything down: abort timers, clear queues.
    /// No orphaned callbacks may fire after this returns.
    pub async fn shutdown(&self) {
        self.flush_pending().await;

        let mut state = self.inner.lock_state();
        state.shutting_down = true;
        if let Some(timer) = state.debounce_timer.take() {
            timer.abort();
        }
        if let Some(task) = state.retry_task.take() {
            task.abort();
        }
        state.pending_push = None;
        state.retry_queue.clear();
        tracing::debug!("sync coordinator shut down");
    }

    /// Snapshot the coordinator's bookkeeping.
    pub fn status(&self) -> SyncStatus {
        let state = self.inner.lock_state();
        SyncStatus {
            pending_push: state.pending_push.is_some(),
            queued_retries: state.retry_queue.len(),
            retry_delay: state.retry_delay,
            auth_halted: state.auth_halted,
            last_local_save_at: state.last_local_save_at,
            last_known_remote_modified_at: state.last_known_remote_modified_at,
        }
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_cache(&self) -> MutexGuard<'_, LocalCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SyncEvent) {
        // Send only fails when nobody is subscribed, which is fine.
        let _ = self.events.send(event);
    }

    /// Assemble a fresh snapshot, carrying the trainer profile forward.
    fn build_document(&self, clients: &[Client]) -> Result<BackupDocument> {
        let cache = self.lock_cache();
        let trainer = match cache.read_document()? {
            Some(existing) if existing.trainer.is_some() => existing.trainer,
            _ => cache.read_trainer()?,
        };
        Ok(BackupDocument::new(clients.to_vec(), trainer))
    }

    /// Update bookkeeping after a successful push or pull.
    fn record_remote_sync(&self, modified_at: DateTime<Utc>) {
        let last_local_save_at = {
            let mut state = self.lock_state();
            state.last_known_remote_modified_at = Some(modified_at);
            state.retry_delay = self.config.retry_base_delay;
            state.last_local_save_at
        };
        let cache = self.lock_cache();
        if let Err(error) = cache.write_sync_state(&SyncBookkeeping {
            last_local_save_at,
            last_known_remote_modified_at: Some(modified_at),
        }) {
            tracing::warn!(%error, "failed to persist sync bookkeeping");
        }
    }

    /// The debounced push: probe for conflicts, then upload.
    async fn run_push_cycle(inner: &Arc<Self>) {
        // One in-flight upload at a time; the payload is read only after the
        // gate is held so it is always the latest snapshot.
        let _gate = inner.push_gate.lock().await;

        let (payload, seq) = {
            let state = inner.lock_state();
            match &state.pending_push {
                Some(payload) => (payload.clone(), state.push_seq),
                None => return,
            }
        };

        if !inner.session.is_online() {
            // Online gate: nothing touches the network while offline. The
            // payload stays pending until connectivity returns.
            tracing::debug!("push deferred: offline");
            return;
        }

        match inner.push_payload(&payload).await {
            PushAttempt::Pushed(modified_at) => {
                {
                    let mut state = inner.lock_state();
                    if state.push_seq == seq {
                        state.pending_push = None;
                        state.debounce_timer = None;
                    }
                    // Everything queued so far is an older snapshot.
                    state.retry_queue.retain(|(s, _)| *s > seq);
                }
                inner.record_remote_sync(modified_at);
                tracing::info!(clients = payload.len(), "pushed");
            }
            PushAttempt::Skipped => {
                // Not authenticated: local save already succeeded, remote
                // step is skipped silently per the error policy.
                tracing::debug!("push skipped: not authenticated");
            }
            PushAttempt::Conflict {
                local_saved_at,
                remote_modified_at,
            } => {
                tracing::warn!(
                    %local_saved_at,
                    %remote_modified_at,
                    "sync_conflict: remote is newer, payload left pending"
                );
                inner.emit(SyncEvent::Conflict {
                    local_saved_at,
                    remote_modified_at,
                });
            }
            PushAttempt::AuthExpired => {
                {
                    let mut state = inner.lock_state();
                    state.auth_halted = true;
                    // A superseded payload is not queued; the save that
                    // replaced it runs its own cycle.
                    if state.push_seq == seq {
                        state.pending_push = None;
                        state.retry_queue.push_back((seq, payload));
                    }
                }
                tracing::warn!("push failed: credential expired, retries halted");
                inner.emit(SyncEvent::TokenExpired);
            }
            PushAttempt::Failed(error) => {
                {
                    let mut state = inner.lock_state();
                    if state.push_seq == seq {
                        state.pending_push = None;
                        state.retry_queue.push_back((seq, payload));
                    }
                }
                tracing::warn!(%error, "push failed, retry_scheduled");
                Self::schedule_retry(inner);
            }
        }
    }

    /// One conflict-checked upload of the given collection.
    async fn push_payload(&self, clients: &[Client]) -> PushAttempt {
        if self.session.token().is_none() {
            return PushAttempt::Skipped;
        }

        let container = match self.store.locate_or_create_container().await {
            Ok(container) => container,
            Err(error) => return Self::attempt_from_error(&error),
        };

        // Conflict probe: metadata only, never the body.
        match self.store.get_metadata(&container).await {
            Ok(Some(meta)) => {
                let (baseline, local_saved_at) = {
                    let state = self.lock_state();
                    (
                        state
                            .last_known_remote_modified_at
                            .or(state.last_local_save_at),
                        state.last_local_save_at,
                    )
                };
                if let Some(baseline) = baseline {
                    let tolerance = chrono::Duration::from_std(self.config.conflict_tolerance)
                        .unwrap_or_else(|_| chrono::Duration::seconds(5));
                    if meta.modified_at > baseline + tolerance {
                        return PushAttempt::Conflict {
                            local_saved_at: local_saved_at.unwrap_or(baseline),
                            remote_modified_at: meta.modified_at,
                        };
                    }
                }
            }
            Ok(None) => {}
            Err(error) => return Self::attempt_from_error(&error),
        }

        let doc = match self.build_document(clients) {
            Ok(doc) => doc,
            Err(error) => return PushAttempt::Failed(error.to_string()),
        };
        match self.store.upload(&container, &doc).await {
            Ok(modified_at) => PushAttempt::Pushed(modified_at),
            Err(error) => Self::attempt_from_error(&error),
        }
    }

    fn attempt_from_error(error: &RemoteError) -> PushAttempt {
        match error {
            RemoteError::NotAuthenticated => PushAttempt::Skipped,
            RemoteError::AuthExpired => PushAttempt::AuthExpired,
            other => PushAttempt::Failed(other.to_string()),
        }
    }

    /// Block on the remote once to seed an empty cache.
    async fn seed_from_remote(&self) -> Option<Vec<Client>> {
        if !self.session.is_online() || self.session.token().is_none() {
            return None;
        }

        let container = match self.store.locate_or_create_container().await {
            Ok(container) => container,
            Err(error) => {
                tracing::debug!(%error, "seed skipped: container lookup failed");
                return None;
            }
        };
        let meta = match self.store.get_metadata(&container).await {
            Ok(meta) => meta,
            Err(error) => {
                tracing::debug!(%error, "seed skipped: metadata probe failed");
                return None;
            }
        };
        let doc = match self.store.download(&container).await {
            Ok(Some(doc)) => doc,
            Ok(None) => return None,
            Err(error) => {
                tracing::warn!(%error, "seed failed: download error");
                return None;
            }
        };

        {
            let cache = self.lock_cache();
            if let Err(error) = cache.write_document(&doc) {
                tracing::warn!(%error, "seed failed: could not cache downloaded document");
                return None;
            }
        }
        if let Some(meta) = meta {
            self.record_remote_sync(meta.modified_at);
        }
        tracing::info!(clients = doc.clients.len(), "seeded cache from remote");
        Some(doc.clients)
    }

    /// Probe the remote and apply a strictly-newer document to the cache.
    async fn run_background_sync(inner: &Arc<Self>) {
        if !inner.session.is_online() || inner.session.token().is_none() {
            return;
        }

        let container = match inner.store.locate_or_create_container().await {
            Ok(container) => container,
            Err(error) => {
                tracing::debug!(%error, "background sync skipped: container lookup failed");
                return;
            }
        };
        let meta = match inner.store.get_metadata(&container).await {
            Ok(Some(meta)) => meta,
            Ok(None) => return,
            Err(RemoteError::AuthExpired) => {
                inner.lock_state().auth_halted = true;
                inner.emit(SyncEvent::TokenExpired);
                return;
            }
            Err(error) => {
                tracing::debug!(%error, "background sync skipped: metadata probe failed");
                return;
            }
        };

        let baseline = {
            let state = inner.lock_state();
            state
                .last_known_remote_modified_at
                .or(state.last_local_save_at)
        };
        let tolerance = chrono::Duration::from_std(inner.config.conflict_tolerance)
            .unwrap_or_else(|_| chrono::Duration::seconds(5));
        let is_newer = baseline.map_or(true, |baseline| meta.modified_at > baseline + tolerance);
        if !is_newer {
            return;
        }

        let doc = match inner.store.download(&container).await {
            Ok(Some(doc)) => doc,
            Ok(None) => return,
            Err(error) => {
                tracing::warn!(%error, "background sync failed: download error");
                return;
            }
        };

        {
            let cache = inner.lock_cache();
            if let Err(error) = cache.write_document(&doc) {
                tracing::warn!(%error, "background sync failed: could not cache document");
                return;
            }
        }
        inner.record_remote_sync(meta.modified_at);
        tracing::info!(
            clients = doc.clients.len(),
            remote_modified_at = %meta.modified_at,
            "background_refresh_applied"
        );
        inner.emit(SyncEvent::ClientsUpdated);
    }

    /// Start the retry loop unless one is already running or halted.
    fn schedule_retry(inner: &Arc<Self>) {
        let mut state = inner.lock_state();
        if state.auth_halted
            || state.shutting_down
            || state.retry_task.is_some()
            || state.retry_queue.is_empty()
        {
            return;
        }
        let task_inner = Arc::clone(inner);
        state.retry_task = Some(tokio::spawn(async move {
            Self::run_retry_loop(&task_inner).await;
        }));
    }

    /// Process the retry queue FIFO, one in-flight upload at a time, with
    /// exponential backoff. Entries superseded by a newer save are dropped
    /// unsent. An auth failure halts the loop with the queue preserved;
    /// anything else doubles the delay up to the cap.
    async fn run_retry_loop(inner: &Arc<Self>) {
        loop {
            let delay = {
                let mut state = inner.lock_state();
                if state.auth_halted || state.shutting_down || state.retry_queue.is_empty() {
                    state.retry_task = None;
                    return;
                }
                state.retry_delay
            };

            tokio::time::sleep(delay).await;

            if !inner.session.is_online() {
                // Wait out the outage without touching the delay; reconnect
                // handling will kick the queue anyway.
                continue;
            }

            let gate = inner.push_gate.lock().await;

            // Drop snapshots a later save has already replaced; re-uploading
            // one would regress the remote document.
            let entry = {
                let mut state = inner.lock_state();
                while state
                    .retry_queue
                    .front()
                    .is_some_and(|(seq, _)| *seq < state.push_seq)
                {
                    tracing::debug!("dropping superseded retry payload");
                    state.retry_queue.pop_front();
                }
                state.retry_queue.front().cloned()
            };
            let Some((seq, payload)) = entry else {
                inner.lock_state().retry_task = None;
                return;
            };

            let attempt = inner.push_payload(&payload).await;
            drop(gate);

            match attempt {
                PushAttempt::Pushed(modified_at) => {
                    {
                        let mut state = inner.lock_state();
                        state.retry_queue.retain(|(s, _)| *s > seq);
                    }
                    // record_remote_sync also resets the delay to base.
                    inner.record_remote_sync(modified_at);
                    tracing::info!(clients = payload.len(), "retry pushed");
                }
                PushAttempt::Skipped => {
                    // Signed out mid-retry; keep the queue for later.
                    inner.lock_state().retry_task = None;
                    return;
                }
                PushAttempt::AuthExpired => {
                    {
                        let mut state = inner.lock_state();
                        state.auth_halted = true;
                        state.retry_task = None;
                    }
                    tracing::warn!("retry halted: credential expired");
                    inner.emit(SyncEvent::TokenExpired);
                    return;
                }
                PushAttempt::Conflict {
                    local_saved_at,
                    remote_modified_at,
                } => {
                    // Divergence needs a human decision; stop retrying.
                    inner.lock_state().retry_task = None;
                    inner.emit(SyncEvent::Conflict {
                        local_saved_at,
                        remote_modified_at,
                    });
                    return;
                }
                PushAttempt::Failed(error) => {
                    let next = {
                        let mut state = inner.lock_state();
                        state.retry_delay =
                            next_retry_delay(state.retry_delay, inner.config.retry_max_delay);
                        state.retry_delay
                    };
                    tracing::warn!(%error, next_delay_ms = next.as_millis() as u64, "retry_scheduled");
                }
            }
        }
    }
}

/// Double the delay, capped.
fn next_retry_delay(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use tokio::time::timeout;

    use super::*;
    use crate::models::TrainerProfile;
    use crate::remote::{ContainerHandle, DocumentHandle, DocumentMetadata, RemoteResult};
    use crate::session::StaticSession;

    /// In-memory backup store with scriptable failures.
    struct MockStore {
        remote_doc: Mutex<Option<BackupDocument>>,
        metadata: Mutex<Option<DocumentMetadata>>,
        uploads: Mutex<Vec<BackupDocument>>,
        fail_uploads: AtomicUsize,
        auth_expired: AtomicBool,
        upload_calls: AtomicUsize,
    }

    impl MockStore {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                remote_doc: Mutex::new(None),
                metadata: Mutex::new(None),
                uploads: Mutex::new(Vec::new()),
                fail_uploads: AtomicUsize::new(0),
                auth_expired: AtomicBool::new(false),
                upload_calls: AtomicUsize::new(0),
            })
        }

        fn set_remote(&self, doc: BackupDocument, modified_at: DateTime<Utc>) {
            *self.metadata.lock().unwrap() = Some(DocumentMetadata {
                id: "doc-1".to_string(),
                modified_at,
            });
            *self.remote_doc.lock().unwrap() = Some(doc);
        }

        fn uploads(&self) -> Vec<BackupDocument> {
            self.uploads.lock().unwrap().clone()
        }

        fn upload_calls(&self) -> usize {
            self.upload_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BackupStore for MockStore {
        async fn locate_or_create_container(&self) -> RemoteResult<ContainerHandle> {
            Ok(ContainerHandle("container-1".to_string()))
        }

        async fn locate_document(
            &self,
            _container: &ContainerHandle,
        ) -> RemoteResult<Option<DocumentHandle>> {
            Ok(self
                .remote_doc
                .lock()
                .unwrap()
                .as_ref()
                .map(|_| DocumentHandle("doc-1".to_string())))
        }

        async fn get_metadata(
            &self,
            _container: &ContainerHandle,
        ) -> RemoteResult<Option<DocumentMetadata>> {
            if self.auth_expired.load(Ordering::SeqCst) {
                return Err(RemoteError::AuthExpired);
            }
            Ok(self.metadata.lock().unwrap().clone())
        }

        async fn download(
            &self,
            _container: &ContainerHandle,
        ) -> RemoteResult<Option<BackupDocument>> {
            Ok(self.remote_doc.lock().unwrap().clone())
        }

        async fn upload(
            &self,
            _container: &ContainerHandle,
            doc: &BackupDocument,
        ) -> RemoteResult<DateTime<Utc>> {
            self.upload_calls.fetch_add(1, Ordering::SeqCst);
            if self.auth_expired.load(Ordering::SeqCst) {
                return Err(RemoteError::AuthExpired);
            }
            if self.fail_uploads.load(Ordering::SeqCst) > 0 {
                self.fail_uploads.fetch_sub(1, Ordering::SeqCst);
                return Err(RemoteError::Unavailable("mock outage".to_string()));
            }
            let modified_at = Utc::now();
            self.uploads.lock().unwrap().push(doc.clone());
            self.set_remote(doc.clone(), modified_at);
            Ok(modified_at)
        }

        async fn soft_delete(&self, _container: &ContainerHandle) -> RemoteResult<()> {
            *self.remote_doc.lock().unwrap() = None;
            *self.metadata.lock().unwrap() = None;
            Ok(())
        }
    }

    fn fast_config() -> SyncConfig {
        SyncConfig::default()
            .with_debounce_window(Duration::from_millis(30))
            .with_conflict_tolerance(Duration::from_millis(500))
            .with_retry_delays(Duration::from_millis(20), Duration::from_millis(80))
    }

    fn coordinator(
        store: &Arc<MockStore>,
        session: Arc<StaticSession>,
        config: SyncConfig,
    ) -> SyncCoordinator {
        let cache = LocalCache::open_in_memory().unwrap();
        SyncCoordinator::with_config(
            cache,
            Arc::clone(store) as Arc<dyn BackupStore>,
            session,
            config,
        )
        .unwrap()
    }

    fn online_session() -> Arc<StaticSession> {
        Arc::new(StaticSession::new(Some("token".to_string())))
    }

    fn clients(names: &[&str]) -> Vec<Client> {
        names.iter().map(|name| Client::new(*name)).collect()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn save_then_load_returns_records_before_debounce_fires() {
        let store = MockStore::new();
        let config = fast_config().with_debounce_window(Duration::from_secs(30));
        let coord = coordinator(&store, online_session(), config);

        let records = clients(&["Ada", "Grace", "Mae"]);
        coord.save(records.clone()).unwrap();

        let loaded = coord.load().await.unwrap();
        assert_eq!(loaded, records);
        assert_eq!(store.upload_calls(), 0, "local durability must not wait on the network");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_save_after_nonempty_is_a_noop() {
        let store = MockStore::new();
        let coord = coordinator(&store, online_session(), fast_config());

        let records = clients(&["Ada"]);
        coord.save(records.clone()).unwrap();
        coord.save(Vec::new()).unwrap();

        let loaded = coord.load().await.unwrap();
        assert_eq!(loaded, records);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn two_saves_in_window_produce_one_upload_with_second_payload() {
        let store = MockStore::new();
        let coord = coordinator(&store, online_session(), fast_config());

        coord.save(clients(&["Ada"])).unwrap();
        coord.save(clients(&["Ada", "Grace"])).unwrap();
        settle().await;

        let uploads = store.uploads();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].clients.len(), 2);
        assert!(!coord.status().pending_push);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn newer_remote_aborts_push_and_emits_conflict() {
        let store = MockStore::new();
        let coord = coordinator(&store, online_session(), fast_config());
        let mut events = coord.subscribe();

        // First push establishes the remote baseline.
        coord.save(clients(&["Ada"])).unwrap();
        settle().await;
        assert_eq!(store.upload_calls(), 1);

        // Another device moves the remote well past the tolerance window.
        let remote_time = Utc::now() + chrono::Duration::seconds(10);
        let foreign = BackupDocument::new(clients(&["Zoe"]), None);
        store.set_remote(foreign, remote_time);

        coord.save(clients(&["Ada", "Grace"])).unwrap();
        settle().await;

        assert_eq!(store.upload_calls(), 1, "remote document must be left unmodified");
        assert!(coord.status().pending_push, "payload stays pending for manual resolution");

        let event = timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
        match event {
            SyncEvent::Conflict {
                local_saved_at,
                remote_modified_at,
            } => {
                assert_eq!(remote_modified_at, remote_time);
                assert!(local_saved_at < remote_modified_at);
            }
            other => panic!("expected conflict event, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_upload_is_retried_until_success() {
        let store = MockStore::new();
        store.fail_uploads.store(2, Ordering::SeqCst);
        let coord = coordinator(&store, online_session(), fast_config());

        coord.save(clients(&["Ada"])).unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(store.upload_calls(), 3, "two failures plus the final success");
        assert_eq!(store.uploads().len(), 1);
        let status = coord.status();
        assert_eq!(status.queued_retries, 0);
        assert_eq!(status.retry_delay, Duration::from_millis(20), "delay resets on success");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn superseded_queued_payload_is_dropped_not_reuploaded() {
        let store = MockStore::new();
        store.fail_uploads.store(1, Ordering::SeqCst);
        // Long retry delay so the newer save lands while the retry sleeps.
        let config = fast_config().with_retry_delays(
            Duration::from_millis(150),
            Duration::from_millis(300),
        );
        let coord = coordinator(&store, online_session(), config);

        // First snapshot fails its push and enters the retry queue.
        coord.save(clients(&["Ada"])).unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(coord.status().queued_retries, 1);

        // A newer snapshot pushes successfully before the retry wakes up.
        coord.save(clients(&["Ada", "Grace"])).unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        let uploads = store.uploads();
        assert_eq!(uploads.len(), 1, "stale snapshot must never reach the remote");
        assert_eq!(
            uploads.last().unwrap().clients.len(),
            2,
            "remote must end at the newest snapshot"
        );
        assert_eq!(coord.status().queued_retries, 0);
    }

    #[test]
    fn retry_delay_doubles_and_caps() {
        let max = Duration::from_secs(60);
        let mut delay = Duration::from_secs(2);
        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(delay);
            delay = next_retry_delay(delay, max);
        }
        assert_eq!(
            seen,
            [2u64, 4, 8, 16, 32, 60, 60]
                .into_iter()
                .map(Duration::from_secs)
                .collect::<Vec<_>>()
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn auth_failure_halts_retries_until_credential_refresh() {
        let store = MockStore::new();
        store.auth_expired.store(true, Ordering::SeqCst);
        let coord = coordinator(&store, online_session(), fast_config());
        let mut events = coord.subscribe();

        coord.save(clients(&["Ada"])).unwrap();
        settle().await;

        let status = coord.status();
        assert!(status.auth_halted);
        assert_eq!(status.queued_retries, 1, "queue preserved, not drained");
        let event = timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
        assert_eq!(event, SyncEvent::TokenExpired);

        let calls_while_halted = store.upload_calls();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            store.upload_calls(),
            calls_while_halted,
            "no busy-looping against a known-bad credential"
        );

        // Fresh credential resumes the queue.
        store.auth_expired.store(false, Ordering::SeqCst);
        coord.credential_refreshed();
        let event = timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
        assert_eq!(event, SyncEvent::TokenRefreshed);
        settle().await;
        assert_eq!(coord.status().queued_retries, 0);
        assert_eq!(store.uploads().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn offline_save_uploads_once_on_reconnect() {
        let store = MockStore::new();
        let session = online_session();
        let coord = coordinator(&store, Arc::clone(&session), fast_config());

        // Start with 3 cached records.
        coord.save(clients(&["Ada", "Grace", "Mae"])).unwrap();
        settle().await;
        assert_eq!(store.upload_calls(), 1);

        // Go offline, then save 5.
        session.set_online(false);
        coord.save(clients(&["Ada", "Grace", "Mae", "Ida", "Joan"])).unwrap();
        settle().await;

        assert_eq!(coord.load().await.unwrap().len(), 5);
        assert_eq!(store.upload_calls(), 1, "no network attempted while offline");
        assert_eq!(coord.status().queued_retries, 0);

        // Reconnect: exactly one upload with the 5-record payload.
        session.set_online(true);
        coord.network_restored().await;
        settle().await;

        assert_eq!(store.upload_calls(), 2);
        let uploads = store.uploads();
        assert_eq!(uploads.last().unwrap().clients.len(), 5);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn load_with_empty_cache_seeds_from_remote() {
        let store = MockStore::new();
        let remote = BackupDocument::new(clients(&["Remote A", "Remote B"]), None);
        store.set_remote(remote, Utc::now());
        let coord = coordinator(&store, online_session(), fast_config());

        let loaded = coord.load().await.unwrap();
        assert_eq!(loaded.len(), 2);

        // Seed landed in the cache and bookkeeping.
        let status = coord.status();
        assert!(status.last_known_remote_modified_at.is_some());
        let again = coord.load().await.unwrap();
        assert_eq!(again.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn load_with_empty_cache_and_dead_remote_returns_empty() {
        let store = MockStore::new();
        let coord = coordinator(&store, Arc::new(StaticSession::offline()), fast_config());
        assert!(coord.load().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn background_sync_applies_newer_remote_and_notifies() {
        let store = MockStore::new();
        let coord = coordinator(&store, online_session(), fast_config());
        let mut events = coord.subscribe();

        coord.save(clients(&["Ada"])).unwrap();
        settle().await;

        let remote_time = Utc::now() + chrono::Duration::seconds(30);
        let foreign = BackupDocument::new(clients(&["Zoe", "Yves"]), None);
        store.set_remote(foreign, remote_time);

        coord.background_sync().await;

        let event = timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
        assert_eq!(event, SyncEvent::ClientsUpdated);
        assert_eq!(coord.load().await.unwrap().len(), 2);
        assert_eq!(
            coord.status().last_known_remote_modified_at,
            Some(remote_time)
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn background_sync_leaves_cache_alone_when_remote_is_not_newer() {
        let store = MockStore::new();
        let coord = coordinator(&store, online_session(), fast_config());

        coord.save(clients(&["Ada"])).unwrap();
        settle().await;

        coord.background_sync().await;
        assert_eq!(coord.load().await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn downloaded_document_reuploads_with_identical_content() {
        let store = MockStore::new();
        let trainer = TrainerProfile {
            display_name: "Coach".to_string(),
            ..TrainerProfile::default()
        };
        let original = BackupDocument::new(clients(&["Ada", "Grace"]), Some(trainer));
        store.set_remote(original.clone(), Utc::now());

        let container = store.locate_or_create_container().await.unwrap();
        let downloaded = store.download(&container).await.unwrap().unwrap();
        store.upload(&container, &downloaded).await.unwrap();

        let roundtripped = store.download(&container).await.unwrap().unwrap();
        assert_eq!(roundtripped.clients, original.clients);
        assert_eq!(roundtripped.trainer, original.trainer);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn flush_pushes_pending_payload_without_waiting_for_debounce() {
        let store = MockStore::new();
        let config = fast_config().with_debounce_window(Duration::from_secs(30));
        let coord = coordinator(&store, online_session(), config);

        coord.save(clients(&["Ada"])).unwrap();
        coord.flush_pending().await;

        assert_eq!(store.uploads().len(), 1);
        assert!(!coord.status().pending_push);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_cancels_timers_and_leaves_no_orphans() {
        let store = MockStore::new();
        let config = fast_config().with_debounce_window(Duration::from_millis(100));
        let coord = coordinator(&store, online_session(), config);

        coord.save(clients(&["Ada"])).unwrap();
        coord.shutdown().await;
        let after_shutdown = store.upload_calls();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(
            store.upload_calls(),
            after_shutdown,
            "no timer may fire after teardown"
        );
        let status = coord.status();
        assert_eq!(status.queued_retries, 0);
        assert!(!status.pending_push);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn trainer_profile_is_carried_into_uploads() {
        let store = MockStore::new();
        let coord = coordinator(&store, online_session(), fast_config());
        {
            let cache = coord.inner.lock_cache();
            cache
                .write_trainer(&TrainerProfile {
                    display_name: "Coach".to_string(),
                    ..TrainerProfile::default()
                })
                .unwrap();
        }

        coord.save(clients(&["Ada"])).unwrap();
        settle().await;

        let uploads = store.uploads();
        assert_eq!(
            uploads[0].trainer.as_ref().map(|t| t.display_name.as_str()),
            Some("Coach")
        );
    }
}
