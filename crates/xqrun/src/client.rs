//! # Query Client
//!
//! The host-side correlator. Turns fire-and-forget posts into addressable
//! [`ResponseHandle`]s with timeouts, queueing and pausing.
//!
//! ## Data Flow
//!
//! `query` encodes its arguments into a correlation key, records a pending
//! request under it, and either posts the key to the child context (when the
//! server there has announced itself and the endpoint is not paused) or queues
//! it. Every inbound message from any child context goes through the single
//! routine [`Client::handle_message`], which updates readiness, flushes queues
//! and resolves pending requests by key.
//!
//! ## Invariants
//!
//! - At most one pending request per (endpoint, key).
//! - Queues flush strictly FIFO, and only while the server is ready and the
//!   endpoint is unpaused.
//! - A request's timer starts when it is issued, queued or not. A timeout is
//!   final: once it fires the record is gone and a late response is dropped.

use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use tracing::debug;
use tracing::trace;
use tracing::warn;
use xqwire::ACTION_PING;
use xqwire::Message;
use xqwire::Request;
use xqwire::Signal;
use xqwire::correlation_key;
use xqwire::normalize_destination;
use xqwire::split_destination;

use crate::endpoint::Endpoint;
use crate::endpoint::EndpointState;
use crate::endpoint::Link;
use crate::endpoint::PendingRequest;
use crate::endpoint::QueuedItem;
use crate::endpoint::TimerHandle;
use crate::frame::DestinationRef;
use crate::frame::Frame;
use crate::frame::FrameKind;
use crate::frame::FrameOpener;
use crate::frame::FrameOptions;
use crate::handle::ResponseHandle;
use crate::handle::Settler;
use crate::pump;
use crate::readiness::Readiness;
use crate::readiness::identity;
use crate::transport::Inbound;

/// Default time a request may stay unanswered once sent.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

#[derive(Debug, Clone)]
pub enum Error {
    /// The destination is not an `http(s)` URL.
    Destination(xqwire::Error),
    /// Query arguments could not be encoded into a key.
    Args(xqwire::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Destination(e) => write!(f, "Invalid destination: {}", e),
            Self::Args(e) => write!(f, "Invalid query arguments: {}", e),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Per-endpoint options given at setup.
#[derive(Debug, Clone, Default)]
pub struct SetupOptions {
    /// Replaces the client's default request timeout for this endpoint.
    pub timeout: Option<Duration>,
    pub frame: FrameOptions,
}

impl SetupOptions {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn frame(mut self, frame: FrameOptions) -> Self {
        self.frame = frame;
        self
    }
}

/// Per-request options.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryOptions {
    /// Reuse the handle of an earlier request with identical arguments.
    pub cache: bool,
    /// Overrides the endpoint timeout. Zero disables the timer.
    pub timeout: Option<Duration>,
}

impl QueryOptions {
    pub fn cached() -> Self {
        Self { cache: true, timeout: None }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// The correlator context: endpoint registry, readiness and frame creation.
///
/// Cloning is cheap; clones share all state. Must be used from within a
/// Tokio runtime, since frames get writer and pump tasks.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    opener: Arc<dyn FrameOpener>,
    readiness: Readiness,
    endpoints: DashMap<String, Arc<Endpoint>>,
    default_timeout: Duration,
}

impl Client {
    pub fn new(opener: Arc<dyn FrameOpener>) -> Self {
        Self::with_timeout(opener, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(opener: Arc<dyn FrameOpener>, default_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                opener,
                readiness: Readiness::new(),
                endpoints: DashMap::new(),
                default_timeout,
            }),
        }
    }

    pub fn readiness(&self) -> &Readiness {
        &self.inner.readiness
    }

    /// Returns the endpoint for a destination, creating it on first use.
    ///
    /// Destinations are matched on their normalized URL, so
    /// `https://a.example` and `https://A.example/` share one endpoint.
    /// An existing context whose server has not announced itself is pinged so
    /// that a server which loaded before us announces itself again.
    pub fn setup(&self, dest: impl Into<DestinationRef>, options: SetupOptions) -> Result<EndpointHandle> {
        let dest = dest.into();
        let url = normalize_destination(&dest.url()).map_err(Error::Destination)?;

        let endpoint = match self.inner.endpoints.entry(url.clone()) {
            Entry::Occupied(entry) => return Ok(self.handle(entry.get().clone())),
            Entry::Vacant(entry) => {
                let (origin, path) = split_destination(&url).map_err(Error::Destination)?;
                let timeout = options.timeout.unwrap_or(self.inner.default_timeout);
                let endpoint = Arc::new(Endpoint::new(url.clone(), origin, path, timeout, options.frame));
                entry.insert(endpoint.clone());
                endpoint
            }
        };
        debug!(endpoint = %url, "endpoint created");

        {
            let mut state = endpoint.lock();
            match dest {
                DestinationRef::Existing(frame) => {
                    self.attach(&endpoint, &mut state, frame);
                    if !self.inner.readiness.is_ready(&url) {
                        let ping = Request::new(ACTION_PING, Value::Null).to_value().to_string();
                        if let Some(link) = &state.link {
                            link.outbox.post(ping, endpoint.origin());
                        }
                    }
                }
                DestinationRef::Url(_) => {
                    self.frame(&endpoint, &mut state);
                }
            }
        }

        Ok(self.handle(endpoint))
    }

    fn handle(&self, endpoint: Arc<Endpoint>) -> EndpointHandle {
        EndpointHandle { client: self.clone(), endpoint }
    }

    /// Central routine for every message arriving from any child context.
    pub fn handle_message(&self, inbound: &Inbound) {
        let msg = match Message::parse(&inbound.data) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(origin = %inbound.origin, "ignoring unrecognized message: {}", e);
                return;
            }
        };

        match msg {
            Message::Handshake(h) if h.init == Signal::Init => {
                debug!(server = %h.server, "server ready");
                if !self.inner.readiness.mark_ready(&h.server) {
                    return;
                }
                let Some(endpoint) = self.endpoint(&h.server) else { return };
                let mut state = endpoint.lock();
                self.fire_queue(&endpoint, &mut state);
            }
            Message::Handshake(h) => {
                debug!(server = %h.server, "server unready");
                self.inner.readiness.mark_unready(&h.server);
            }
            Message::Response(resp) => {
                let Some(endpoint) = self.endpoint(&resp.url) else {
                    debug!(url = %resp.url, "response for unknown endpoint");
                    return;
                };
                if !endpoint.resolve(resp.success, &resp.key, resp.data) {
                    debug!(url = %resp.url, key = %resp.key, "dropping response with no pending request");
                }
            }
        }
    }

    fn endpoint(&self, url: &str) -> Option<Arc<Endpoint>> {
        self.inner.endpoints.get(&identity(url)).map(|entry| entry.value().clone())
    }

    /// Returns the endpoint's frame, (re)creating it if it is missing or closed.
    fn frame(&self, endpoint: &Arc<Endpoint>, state: &mut EndpointState) -> Arc<dyn Frame> {
        if let Some(link) = state.link.as_ref().filter(|link| link.is_live()) {
            return link.frame.clone();
        }
        let frame = self.inner.opener.open(endpoint.url(), endpoint.frame_options());
        self.attach(endpoint, state, frame.clone());
        frame
    }

    /// Starts the writer and pump for a frame and makes it the endpoint's link.
    fn attach(&self, endpoint: &Arc<Endpoint>, state: &mut EndpointState, frame: Arc<dyn Frame>) {
        let transport = frame.transport();
        let outbox = pump::spawn_writer(endpoint.url().to_string(), transport.clone());

        let weak: Weak<ClientInner> = Arc::downgrade(&self.inner);
        pump::spawn_pump(endpoint.url().to_string(), transport, move |msg| {
            let Some(inner) = weak.upgrade() else { return false };
            Client { inner }.handle_message(&msg);
            true
        });

        state.link = Some(Link { frame, outbox });
    }

    fn refresh(&self, endpoint: &Arc<Endpoint>, state: &mut EndpointState) {
        let frame = self.frame(endpoint, state);
        trace!(endpoint = %endpoint.url(), kind = ?frame.kind(), "refreshing frame");
        frame.navigate(endpoint.url());
    }

    /// Sends every queued request, in order, if the endpoint may transmit.
    fn fire_queue(&self, endpoint: &Arc<Endpoint>, state: &mut EndpointState) {
        if !self.inner.readiness.is_ready(endpoint.url()) || state.paused {
            return;
        }
        let mut items = std::mem::take(&mut state.queue).into_iter();
        while let Some(item) = items.next() {
            if !self.send_message(endpoint, state, item) {
                state.queue.extend(items);
                break;
            }
        }
    }

    /// Posts one request. Without a live link to the frame the request goes
    /// back to the front of the queue and the frame is reopened; nothing more
    /// is sent until the reopened server announces itself.
    fn send_message(&self, endpoint: &Arc<Endpoint>, state: &mut EndpointState, item: QueuedItem) -> bool {
        if !state.pending.contains_key(&item.key) {
            trace!(endpoint = %endpoint.url(), key = %item.key, "skipping request that timed out in the queue");
            return true;
        }
        let ready = self.inner.readiness.is_ready(endpoint.url());
        let posted = ready
            && state
                .link
                .as_ref()
                .filter(|link| link.is_live())
                .is_some_and(|link| link.outbox.post(item.key.clone(), endpoint.origin()));

        if !posted {
            if ready {
                warn!(endpoint = %endpoint.url(), "lost the link to the frame, reopening");
                state.link = None;
                self.inner.readiness.mark_unready(endpoint.url());
            }
            state.queue.push_front(item);
            self.refresh(endpoint, state);
            return false;
        }

        trace!(endpoint = %endpoint.url(), key = %item.key, "request sent");
        true
    }

    fn arm_timeout(&self, endpoint: &Arc<Endpoint>, state: &mut EndpointState, key: String, timeout: Duration, id: u64) {
        let target = endpoint.clone();
        let timer_key = key.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            target.expire(&timer_key, id);
        });
        state.clear_timeout(&key);
        state.timeouts.insert(key, TimerHandle { id, abort: task.abort_handle() });
    }

    fn query(&self, endpoint: &Arc<Endpoint>, args: &Value, options: QueryOptions) -> Result<ResponseHandle> {
        let key = correlation_key(args).map_err(Error::Args)?;
        let mut state = endpoint.lock();

        if options.cache {
            let cached = state
                .pending
                .get(&key)
                .map(|p| p.handle.clone())
                .or_else(|| state.settled.get(&key).cloned());
            if let Some(handle) = cached {
                trace!(endpoint = %endpoint.url(), %key, "cache hit");
                return Ok(handle);
            }
        }

        let (settler, handle) = Settler::new(&key);
        let id = state.next_id();
        let mut pending = PendingRequest::new(id, settler, handle.clone());
        if let Some(old) = state.pending.remove(&key) {
            state.clear_timeout(&key);
            pending.supersede(old);
        }
        state.pending.insert(key.clone(), pending);

        let item = QueuedItem {
            key,
            timeout: options.timeout.unwrap_or(endpoint.default_timeout()),
        };
        // The timer covers time spent queued as well as in flight.
        if !item.timeout.is_zero() {
            self.arm_timeout(endpoint, &mut state, item.key.clone(), item.timeout, id);
        }
        if self.inner.readiness.is_ready(endpoint.url()) && !state.paused {
            self.send_message(endpoint, &mut state, item);
        } else {
            trace!(endpoint = %endpoint.url(), key = %item.key, "request queued");
            state.queue.push_back(item);
            let frame = self.frame(endpoint, &mut state);
            if frame.kind() == FrameKind::Embedded && identity(&frame.location()) != endpoint.url() {
                self.refresh(endpoint, &mut state);
            }
        }

        Ok(handle)
    }
}

/// The public face of one endpoint.
#[derive(Clone)]
pub struct EndpointHandle {
    client: Client,
    endpoint: Arc<Endpoint>,
}

impl EndpointHandle {
    /// Issues a request. `args` must be a JSON object.
    pub fn query(&self, args: &Value, options: QueryOptions) -> Result<ResponseHandle> {
        self.client.query(&self.endpoint, args, options)
    }

    /// Returns the child context, reopening it if it is missing or closed.
    pub fn get(&self) -> Arc<dyn Frame> {
        let mut state = self.endpoint.lock();
        self.client.frame(&self.endpoint, &mut state)
    }

    /// Holds new and queued requests back. In-flight requests are unaffected.
    pub fn pause(&self) {
        self.endpoint.lock().paused = true;
    }

    /// Resumes and flushes the queue.
    pub fn play(&self) {
        let mut state = self.endpoint.lock();
        state.paused = false;
        self.client.fire_queue(&self.endpoint, &mut state);
    }

    /// Re-navigates the child context to the endpoint URL.
    pub fn refresh(&self) {
        let mut state = self.endpoint.lock();
        self.client.refresh(&self.endpoint, &mut state);
    }

    pub fn url(&self) -> &str {
        self.endpoint.url()
    }

    pub fn origin(&self) -> &str {
        self.endpoint.origin()
    }

    pub fn path(&self) -> &str {
        self.endpoint.path()
    }

    pub fn is_paused(&self) -> bool {
        self.endpoint.lock().paused
    }

    /// Number of requests waiting to be transmitted.
    pub fn queued(&self) -> usize {
        self.endpoint.lock().queue.len()
    }

    /// Number of requests sent or queued that have not settled.
    pub fn pending(&self) -> usize {
        self.endpoint.lock().pending.len()
    }
}
