//! # Endpoints
//!
//! Per-destination correlator state. One endpoint exists per distinct
//! destination URL; it is created on first use and lives as long as the client.
//!
//! Requests are stored by correlation key rather than as per-request closures:
//! the timer task and the inbound router both look the record up here, so a
//! request that has already settled simply is not found.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use serde_json::Value;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::debug;
use xqwire::Status;

use crate::frame::Frame;
use crate::frame::FrameOptions;
use crate::handle::Outcome;
use crate::handle::QueryError;
use crate::handle::ResponseHandle;
use crate::handle::Settler;
use crate::pump::Outbox;

/// A request waiting to be transmitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct QueuedItem {
    pub key: String,
    pub timeout: Duration,
}

/// A single in-flight request.
#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub id: u64,
    pub handle: ResponseHandle,
    pub created_at: Instant,
    settler: Settler,
    /// Handles of earlier requests with the same key, replaced by this one.
    superseded: Vec<Settler>,
}

impl PendingRequest {
    pub(crate) fn new(id: u64, settler: Settler, handle: ResponseHandle) -> Self {
        Self {
            id,
            handle,
            created_at: Instant::now(),
            settler,
            superseded: Vec::new(),
        }
    }

    /// Takes over the waiters of a request this one replaces.
    pub(crate) fn supersede(&mut self, old: PendingRequest) {
        self.superseded.extend(old.superseded);
        self.superseded.push(old.settler);
    }

    fn notify(&self, data: Value) {
        for s in self.superseded.iter().chain(std::iter::once(&self.settler)) {
            s.notify(data.clone());
        }
    }

    fn settle(self, outcome: Outcome) {
        for s in self.superseded.iter().chain(std::iter::once(&self.settler)) {
            s.settle(outcome.clone());
        }
    }
}

/// A running timeout for one pending request.
#[derive(Debug)]
pub(crate) struct TimerHandle {
    pub id: u64,
    pub abort: AbortHandle,
}

/// The open channel into an endpoint's child context.
pub(crate) struct Link {
    pub frame: Arc<dyn Frame>,
    pub outbox: Outbox,
}

impl Link {
    /// Whether the frame is open and its writer is still running.
    pub(crate) fn is_live(&self) -> bool {
        !self.frame.is_closed() && !self.outbox.is_closed()
    }
}

pub(crate) struct EndpointState {
    pub pending: HashMap<String, PendingRequest>,
    /// Settled handles, kept so cached queries can return them.
    pub settled: HashMap<String, ResponseHandle>,
    pub timeouts: HashMap<String, TimerHandle>,
    pub queue: VecDeque<QueuedItem>,
    pub paused: bool,
    pub link: Option<Link>,
    next_id: u64,
}

impl EndpointState {
    pub(crate) fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub(crate) fn clear_timeout(&mut self, key: &str) {
        if let Some(timer) = self.timeouts.remove(key) {
            timer.abort.abort();
        }
    }
}

/// Correlator state for one destination.
pub struct Endpoint {
    url: String,
    origin: String,
    path: String,
    default_timeout: Duration,
    frame_options: FrameOptions,
    state: Mutex<EndpointState>,
}

impl Endpoint {
    pub(crate) fn new(
        url: String,
        origin: String,
        path: String,
        default_timeout: Duration,
        frame_options: FrameOptions,
    ) -> Self {
        Self {
            url,
            origin,
            path,
            default_timeout,
            frame_options,
            state: Mutex::new(EndpointState {
                pending: HashMap::new(),
                settled: HashMap::new(),
                timeouts: HashMap::new(),
                queue: VecDeque::new(),
                paused: false,
                link: None,
                next_id: 0,
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub(crate) fn frame_options(&self) -> &FrameOptions {
        &self.frame_options
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, EndpointState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies a response to the pending request with this key.
    ///
    /// Any response cancels the request's timer. `Notify` leaves the request
    /// open; `Success` and `Fail` settle and remove it. Returns `false` when no
    /// request is pending under the key (late, duplicate or foreign responses).
    pub(crate) fn resolve(&self, status: Status, key: &str, data: Value) -> bool {
        let mut state = self.lock();
        if !state.pending.contains_key(key) {
            return false;
        }
        state.clear_timeout(key);

        if status == Status::Notify {
            if let Some(pending) = state.pending.get(key) {
                pending.notify(data);
            }
            return true;
        }

        let Some(pending) = state.pending.remove(key) else {
            return false;
        };
        debug!(endpoint = %self.url, elapsed = ?pending.created_at.elapsed(), ?status, "request settled");
        let handle = pending.handle.clone();
        let outcome = match status {
            Status::Success => Ok(data),
            _ => Err(QueryError::Failed(data)),
        };
        pending.settle(outcome);
        state.settled.insert(key.to_string(), handle);
        true
    }

    /// Fires the timeout of request `id`, unless it has settled or been replaced.
    pub(crate) fn expire(&self, key: &str, id: u64) {
        let mut state = self.lock();
        if state.timeouts.get(key).is_some_and(|t| t.id == id) {
            state.timeouts.remove(key);
        }
        if !state.pending.get(key).is_some_and(|p| p.id == id) {
            return;
        }
        let Some(pending) = state.pending.remove(key) else {
            return;
        };
        debug!(endpoint = %self.url, key, "request timed out");
        let handle = pending.handle.clone();
        pending.settle(Err(QueryError::TimedOut));
        state.settled.insert(key.to_string(), handle);
    }
}
