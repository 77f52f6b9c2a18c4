//! The throttled single-slot writer.
//!
//! A write stores the body under its entry key, then names the entry under the
//! pointer key, then locks the mailbox for the throttle window. Letters posted
//! while locked or before the peer is ready wait in FIFO order; each unlock
//! writes at most one of them.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use tracing::trace;

use crate::store::Store;

/// What happened to a posted letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Posted {
    Written,
    Queued,
}

#[derive(Debug)]
struct Letter {
    entry: String,
    body: String,
}

#[derive(Debug, Default)]
struct MailboxState {
    ready: bool,
    locked: bool,
    queue: VecDeque<Letter>,
}

#[derive(Clone)]
pub(crate) struct Mailbox {
    inner: Arc<MailboxInner>,
}

struct MailboxInner {
    store: Arc<dyn Store>,
    pointer: String,
    throttle: Duration,
    state: Mutex<MailboxState>,
}

impl Mailbox {
    pub(crate) fn new(store: Arc<dyn Store>, pointer: impl Into<String>, throttle: Duration, ready: bool) -> Self {
        Self {
            inner: Arc::new(MailboxInner {
                store,
                pointer: pointer.into(),
                throttle,
                state: Mutex::new(MailboxState { ready, ..MailboxState::default() }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MailboxState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn post(&self, entry: impl Into<String>, body: impl Into<String>) -> Posted {
        let letter = Letter { entry: entry.into(), body: body.into() };
        let mut state = self.lock();
        if !state.ready || state.locked {
            trace!(pointer = %self.inner.pointer, entry = %letter.entry, "letter queued");
            state.queue.push_back(letter);
            return Posted::Queued;
        }
        self.write(&mut state, letter);
        Posted::Written
    }

    /// Opens or closes the mailbox. Opening an unlocked mailbox writes the
    /// oldest waiting letter.
    pub(crate) fn set_ready(&self, ready: bool) {
        let mut state = self.lock();
        state.ready = ready;
        if ready && !state.locked {
            if let Some(letter) = state.queue.pop_front() {
                self.write(&mut state, letter);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn is_locked(&self) -> bool {
        self.lock().locked
    }

    pub(crate) fn queued(&self) -> usize {
        self.lock().queue.len()
    }

    fn write(&self, state: &mut MailboxState, letter: Letter) {
        let store = &self.inner.store;
        trace!(pointer = %self.inner.pointer, entry = %letter.entry, "writing letter");
        store.set(&letter.entry, &letter.body);
        store.set(&self.inner.pointer, &letter.entry);

        state.locked = true;
        let mailbox = self.clone();
        let throttle = self.inner.throttle;
        tokio::spawn(async move {
            tokio::time::sleep(throttle).await;
            mailbox.unlock();
        });
    }

    fn unlock(&self) {
        let mut state = self.lock();
        state.locked = false;
        if !state.ready {
            return;
        }
        if let Some(letter) = state.queue.pop_front() {
            self.write(&mut state, letter);
        }
    }
}
