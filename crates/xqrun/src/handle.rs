//! # Response Handles
//!
//! The caller's view of one request. A handle settles exactly once, with the
//! data of a terminal response or with a local timeout, and may observe any
//! number of progress notifications before that.
//!
//! Handles are cheap to clone and every clone observes the same request; the
//! client hands out a clone of the existing handle for cached queries.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;
use xqwire::ERR_TIMED_OUT;
use xqwire::error_data;

/// Why a request did not succeed.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryError {
    /// The server answered with a failure. Carries the failure data.
    Failed(Value),
    /// No terminal response arrived in time. The server was not told.
    TimedOut,
    /// The client was dropped before the request settled.
    Dropped,
}

impl QueryError {
    /// The rejection payload, as the server (or the local timer) reported it.
    pub fn data(&self) -> Value {
        match self {
            Self::Failed(data) => data.clone(),
            Self::TimedOut => error_data(ERR_TIMED_OUT),
            Self::Dropped => error_data("The client was dropped"),
        }
    }
}

impl std::fmt::Display for QueryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed(data) => write!(f, "Request failed: {}", data),
            Self::TimedOut => write!(f, "{}", ERR_TIMED_OUT),
            Self::Dropped => write!(f, "Client dropped before the request settled"),
        }
    }
}

impl std::error::Error for QueryError {}

pub type Outcome = std::result::Result<Value, QueryError>;

#[derive(Debug, Clone, Default)]
struct Progress {
    notifications: Vec<Value>,
    outcome: Option<Outcome>,
}

/// The resolving side of a handle, owned by the pending request.
#[derive(Debug)]
pub(crate) struct Settler {
    tx: watch::Sender<Progress>,
}

impl Settler {
    pub(crate) fn new(key: &str) -> (Self, ResponseHandle) {
        let (tx, rx) = watch::channel(Progress::default());
        let handle = ResponseHandle {
            inner: Arc::new(HandleInner { key: key.to_string(), rx }),
        };
        (Self { tx }, handle)
    }

    pub(crate) fn notify(&self, data: Value) {
        self.tx.send_modify(|p| {
            if p.outcome.is_none() {
                p.notifications.push(data);
            }
        });
    }

    /// Settles the handle. Later calls are ignored.
    pub(crate) fn settle(&self, outcome: Outcome) {
        self.tx.send_modify(|p| {
            if p.outcome.is_none() {
                p.outcome = Some(outcome);
            }
        });
    }
}

#[derive(Debug)]
struct HandleInner {
    key: String,
    rx: watch::Receiver<Progress>,
}

/// A clonable promise for the outcome of one query.
#[derive(Debug, Clone)]
pub struct ResponseHandle {
    inner: Arc<HandleInner>,
}

impl ResponseHandle {
    /// The correlation key of the request.
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Whether two handles refer to the same request.
    pub fn same_as(&self, other: &ResponseHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_settled(&self) -> bool {
        self.inner.rx.borrow().outcome.is_some()
    }

    /// Returns the outcome if the request has already settled.
    pub fn try_outcome(&self) -> Option<Outcome> {
        self.inner.rx.borrow().outcome.clone()
    }

    /// Waits for the request to settle.
    pub async fn settled(&self) -> Outcome {
        let mut rx = self.inner.rx.clone();
        loop {
            if let Some(outcome) = rx.borrow_and_update().outcome.clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return rx.borrow().outcome.clone().unwrap_or(Err(QueryError::Dropped));
            }
        }
    }

    /// Streams progress notifications, starting from the first one received.
    pub fn notifications(&self) -> Notifications {
        Notifications { rx: self.inner.rx.clone(), seen: 0 }
    }
}

/// Progress notifications of one request, in arrival order.
#[derive(Debug)]
pub struct Notifications {
    rx: watch::Receiver<Progress>,
    seen: usize,
}

impl Notifications {
    /// Returns the next notification, or `None` once the request has settled
    /// and every notification has been seen.
    pub async fn next(&mut self) -> Option<Value> {
        loop {
            {
                let progress = self.rx.borrow_and_update();
                if let Some(data) = progress.notifications.get(self.seen) {
                    self.seen += 1;
                    return Some(data.clone());
                }
                if progress.outcome.is_some() {
                    return None;
                }
            }
            if self.rx.changed().await.is_err() {
                let progress = self.rx.borrow();
                let data = progress.notifications.get(self.seen).cloned();
                if data.is_some() {
                    self.seen += 1;
                }
                return data;
            }
        }
    }
}
