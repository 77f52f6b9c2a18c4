//! # Readiness Tracker
//!
//! Records which servers have announced themselves. A server is addressed by
//! the normalized URL it was loaded from; an absent entry means nothing has
//! been heard from it yet.
//!
//! ```text
//! Unknown --init--> Ready --de-init--> Unready --init--> Ready ...
//! ```

use dashmap::DashMap;
use xqwire::normalize_destination;

/// The identity a URL is tracked under. Unparseable URLs are kept verbatim
/// and match only themselves.
pub(crate) fn identity(url: &str) -> String {
    normalize_destination(url).unwrap_or_else(|_| url.to_string())
}

/// Readiness of one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessState {
    Unknown,
    Ready,
    Unready,
}

/// Concurrent map of server URL to readiness.
#[derive(Debug, Default)]
pub struct Readiness {
    servers: DashMap<String, bool>,
}

impl Readiness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, server: &str) -> ReadinessState {
        match self.servers.get(&identity(server)).map(|entry| *entry.value()) {
            None => ReadinessState::Unknown,
            Some(true) => ReadinessState::Ready,
            Some(false) => ReadinessState::Unready,
        }
    }

    pub fn is_ready(&self, server: &str) -> bool {
        self.state(server) == ReadinessState::Ready
    }

    /// Marks a server ready. Returns `true` if it was not ready before, which
    /// is the transition that releases queued requests.
    pub fn mark_ready(&self, server: &str) -> bool {
        let was_ready = self.servers.insert(identity(server), true);
        was_ready != Some(true)
    }

    pub fn mark_unready(&self, server: &str) {
        self.servers.insert(identity(server), false);
    }
}
