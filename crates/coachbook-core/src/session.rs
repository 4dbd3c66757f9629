//! Session/token provider interface.
//!
//! The sync layer never refreshes credentials itself; it only consumes the
//! current token and the online/offline signal. The host application (UI,
//! CLI) owns the actual auth flow and swaps tokens behind this trait.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

/// Supplies the current access credential and connectivity signal.
pub trait SessionProvider: Send + Sync + 'static {
    /// Current bearer token, or `None` when signed out / expired.
    fn token(&self) -> Option<String>;

    /// Whether the host believes the network is reachable.
    fn is_online(&self) -> bool;
}

/// Simple in-process session used by the CLI and by tests.
pub struct StaticSession {
    token: RwLock<Option<String>>,
    online: AtomicBool,
}

impl StaticSession {
    /// Create a session with the given token; online by default.
    #[must_use]
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: RwLock::new(token),
            online: AtomicBool::new(true),
        }
    }

    /// Create a signed-out, offline session.
    #[must_use]
    pub fn offline() -> Self {
        Self {
            token: RwLock::new(None),
            online: AtomicBool::new(false),
        }
    }

    /// Replace the current token.
    pub fn set_token(&self, token: Option<String>) {
        if let Ok(mut guard) = self.token.write() {
            *guard = token;
        }
    }

    /// Flip the connectivity signal.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

impl SessionProvider for StaticSession {
    fn token(&self) -> Option<String> {
        self.token.read().ok().and_then(|guard| guard.clone())
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for StaticSession {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("StaticSession")
            .field("token", &"[REDACTED]")
            .field("online", &self.online.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_session_swaps_token_and_connectivity() {
        let session = StaticSession::offline();
        assert!(!session.is_online());
        assert_eq!(session.token(), None);

        session.set_token(Some("bearer-123".to_string()));
        session.set_online(true);
        assert!(session.is_online());
        assert_eq!(session.token(), Some("bearer-123".to_string()));
    }

    #[test]
    fn debug_redacts_token() {
        let session = StaticSession::new(Some("secret".to_string()));
        let rendered = format!("{session:?}");
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("[REDACTED]"));
    }
}
