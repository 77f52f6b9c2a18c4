//! # Shared Key-Value Store
//!
//! The persistent store both contexts can reach when there is no direct
//! channel between them, plus its change notification. The fallback bridge is
//! the only user.
//!
//! `MemoryStore` is an in-process implementation for tests and for hosts that
//! run both sides in one process. Like browser storage events, a write is
//! announced to every *other* view of the store, never to the writer.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use tokio::sync::mpsc;

/// Notification that a key was written or removed by another context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub key: String,
}

/// The shared store capability: get/set/remove by key, plus change notification.
pub trait Store: Send + Sync + 'static {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);

    /// Subscribes to changes made by other contexts.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<StoreChange>;

    /// Reads a key and removes it.
    fn take(&self, key: &str) -> Option<String> {
        let value = self.get(key)?;
        self.remove(key);
        Some(value)
    }
}

/// In-memory store shared between any number of views.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

#[derive(Debug, Default)]
struct Shared {
    entries: Mutex<HashMap<String, String>>,
    subscribers: Mutex<Vec<(u64, mpsc::UnboundedSender<StoreChange>)>>,
    next_view: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a handle for one context. Writes through it notify all other views.
    pub fn view(&self) -> StoreView {
        StoreView {
            shared: self.shared.clone(),
            id: self.shared.next_view.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Returns a snapshot of all key-value pairs in the store.
    pub fn snapshot(&self) -> HashMap<String, String> {
        lock(&self.shared.entries).clone()
    }
}

/// One context's handle onto a [`MemoryStore`].
#[derive(Clone, Debug)]
pub struct StoreView {
    shared: Arc<Shared>,
    id: u64,
}

impl StoreView {
    fn announce(&self, key: &str) {
        let mut subscribers = lock(&self.shared.subscribers);
        subscribers.retain(|(view, tx)| {
            *view == self.id || tx.send(StoreChange { key: key.to_string() }).is_ok()
        });
    }
}

impl Store for StoreView {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.shared.entries).get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        lock(&self.shared.entries).insert(key.to_string(), value.to_string());
        self.announce(key);
    }

    fn remove(&self, key: &str) {
        let removed = lock(&self.shared.entries).remove(key);
        if removed.is_some() {
            self.announce(key);
        }
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<StoreChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.shared.subscribers).push((self.id, tx));
        rx
    }
}
