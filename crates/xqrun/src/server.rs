//! # Action Server
//!
//! The dispatcher running inside the child context. It answers requests from
//! the host by routing them to registered actions, subject to an origin
//! allow-list, and announces its readiness to the host.
//!
//! ## Philosophy
//!
//! - **Silent Rejection**: Messages from origins outside the allow-list get no
//!   answer at all, so unexpected origins learn nothing.
//! - **Late Binding**: The action table is looked up at dispatch time, so
//!   actions may be added or removed while requests are in flight.
//! - **Asynchronous Handlers**: A handler receives a [`Responder`] it may keep,
//!   clone, or move into a task. Nothing waits for it to answer.
//!
//! ## Invariants
//!
//! - Each request gets at most one terminal response (success or fail).
//!   Notifications may precede it in any number.
//! - Shutdown hooks run once, in registration order, before the de-init signal.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;
use tracing::trace;
use tracing::warn;
use xqwire::ACTION_PING;
use xqwire::ERR_DECODE;
use xqwire::ERR_NO_ACTION;
use xqwire::Handshake;
use xqwire::Response;
use xqwire::Signal;
use xqwire::Status;
use xqwire::decode_request;
use xqwire::error_data;
use xqwire::origin_of;

use crate::pump;
use crate::pump::Outbox;
use crate::transport::Inbound;
use crate::transport::Transport;

/// Where the server lives and whom it talks to.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// The URL the server was loaded from. Sent in every envelope.
    pub url: String,
    /// The page that loaded the server. Its origin receives the handshake.
    pub referrer: Option<String>,
    /// Origins whose requests are answered.
    pub allowed_origins: Vec<String>,
}

impl ServerConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), ..Self::default() }
    }

    pub fn referrer(mut self, referrer: impl Into<String>) -> Self {
        self.referrer = Some(referrer.into());
        self
    }

    pub fn allow(mut self, origin: impl Into<String>) -> Self {
        self.allowed_origins.push(origin.into());
        self
    }

    /// Target origin for handshake signals: the referrer's origin, or any.
    fn handshake_target(&self) -> String {
        self.referrer
            .as_deref()
            .and_then(|r| origin_of(r).ok())
            .unwrap_or_else(|| "*".to_string())
    }
}

/// What a handler is given about the request it serves.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub data: Value,
    /// Origin of the requesting context.
    pub origin: String,
}

/// A request handler.
pub trait Action: Send + Sync + 'static {
    fn invoke(&self, call: Invocation, responder: Responder);
}

impl<F> Action for F
where
    F: Fn(Invocation, Responder) + Send + Sync + 'static,
{
    fn invoke(&self, call: Invocation, responder: Responder) {
        self(call, responder)
    }
}

/// The initial action table handed to [`Server::setup`].
#[derive(Default)]
pub struct Actions {
    table: Vec<(String, Arc<dyn Action>)>,
}

impl Actions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, action: impl Action) -> Self {
        self.table.push((name.into(), Arc::new(action)));
        self
    }
}

type ShutdownHook = Box<dyn FnOnce(&Value) + Send>;

/// The dispatcher. Cloning is cheap; clones share all state.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: ServerConfig,
    handshake_target: String,
    actions: DashMap<String, Arc<dyn Action>>,
    shutdown: Mutex<Vec<(ShutdownHook, Value)>>,
    initialized: AtomicBool,
    outbox: Outbox,
}

impl Server {
    /// Registers `actions`, starts listening on `transport` and announces
    /// readiness to the host.
    pub fn setup(transport: Arc<dyn Transport>, config: ServerConfig, actions: Actions) -> Self {
        let outbox = pump::spawn_writer(config.url.clone(), transport.clone());
        let table = DashMap::new();
        for (name, action) in actions.table {
            table.insert(name, action);
        }

        let inner = Arc::new(ServerInner {
            handshake_target: config.handshake_target(),
            config,
            actions: table,
            shutdown: Mutex::new(Vec::new()),
            initialized: AtomicBool::new(false),
            outbox,
        });

        let weak: Weak<ServerInner> = Arc::downgrade(&inner);
        pump::spawn_pump(inner.config.url.clone(), transport, move |msg| {
            let Some(inner) = weak.upgrade() else { return false };
            Server { inner }.handle_message(&msg);
            true
        });

        let server = Self { inner };
        server.announce();
        server
    }

    pub fn url(&self) -> &str {
        &self.inner.config.url
    }

    /// Adds or replaces an action.
    pub fn add_action(&self, name: impl Into<String>, action: impl Action) {
        self.inner.actions.insert(name.into(), Arc::new(action));
    }

    pub fn remove_action(&self, name: &str) {
        self.inner.actions.remove(name);
    }

    pub fn has_action(&self, name: &str) -> bool {
        self.inner.actions.contains_key(name)
    }

    /// Appends a hook to run, with `data`, when the server unloads.
    pub fn register_shutdown<F>(&self, hook: F, data: Value)
    where
        F: FnOnce(&Value) + Send + 'static,
    {
        self.inner
            .shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((Box::new(hook), data));
    }

    /// Tells the host this server is ready for requests.
    pub fn announce(&self) {
        self.inner.initialized.store(true, Ordering::Release);
        let signal = Handshake::new(Signal::Init, self.url()).encode();
        debug!(server = %self.url(), target = %self.inner.handshake_target, "announcing");
        self.inner.outbox.post(signal, self.inner.handshake_target.as_str());
    }

    /// Runs the shutdown hooks and tells the host this server is going away.
    ///
    /// Does nothing if the server never announced itself or already unloaded.
    pub fn unload(&self) {
        if !self.inner.initialized.swap(false, Ordering::AcqRel) {
            return;
        }
        let hooks = std::mem::take(&mut *self.inner.shutdown.lock().unwrap_or_else(PoisonError::into_inner));
        debug!(server = %self.url(), hooks = hooks.len(), "unloading");
        for (hook, data) in hooks {
            hook(&data);
        }
        let signal = Handshake::new(Signal::DeInit, self.url()).encode();
        self.inner.outbox.post(signal, self.inner.handshake_target.as_str());
    }

    /// Dispatches one inbound message.
    pub fn handle_message(&self, inbound: &Inbound) {
        let config = &self.inner.config;
        if !config.allowed_origins.iter().any(|o| *o == inbound.origin) {
            debug!(origin = %inbound.origin, "dropping message from disallowed origin");
            return;
        }

        let responder = Responder::new(
            self.inner.outbox.clone(),
            inbound.data.clone(),
            config.url.clone(),
            inbound.origin.clone(),
        );

        let request = match decode_request(&inbound.data) {
            Ok(request) => request,
            Err(e) => {
                debug!(origin = %inbound.origin, "undecodable request: {}", e);
                responder.send_fail(error_data(ERR_DECODE));
                return;
            }
        };

        if request.action == ACTION_PING {
            self.announce();
            return;
        }

        // Clone out of the table so handlers may edit it.
        let action = self.inner.actions.get(&request.action).map(|a| a.value().clone());
        let Some(action) = action else {
            debug!(action = %request.action, "no callable action");
            responder.send_fail(error_data(ERR_NO_ACTION));
            return;
        };

        trace!(action = %request.action, origin = %inbound.origin, "dispatching");
        action.invoke(Invocation { data: request.data, origin: inbound.origin.clone() }, responder);
    }
}

/// Sends the answers for one request.
#[derive(Clone)]
pub struct Responder {
    inner: Arc<ResponderInner>,
}

struct ResponderInner {
    outbox: Outbox,
    key: String,
    url: String,
    origin: String,
    finished: AtomicBool,
}

impl Responder {
    fn new(outbox: Outbox, key: String, url: String, origin: String) -> Self {
        Self {
            inner: Arc::new(ResponderInner {
                outbox,
                key,
                url,
                origin,
                finished: AtomicBool::new(false),
            }),
        }
    }

    /// The correlation key of the request being answered.
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Whether a terminal response has been sent.
    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::Acquire)
    }

    pub fn send_success(&self, data: Value) {
        self.finish(Status::Success, data);
    }

    pub fn send_fail(&self, data: Value) {
        self.finish(Status::Fail, data);
    }

    /// Reports progress. The request stays open.
    pub fn send_notification(&self, data: Value) {
        if self.is_finished() {
            debug!(key = %self.inner.key, "ignoring notification after terminal response");
            return;
        }
        self.post(Status::Notify, data);
    }

    fn finish(&self, status: Status, data: Value) {
        if self.inner.finished.swap(true, Ordering::AcqRel) {
            warn!(key = %self.inner.key, ?status, "request already answered, ignoring");
            return;
        }
        self.post(status, data);
    }

    fn post(&self, status: Status, data: Value) {
        let response = Response {
            success: status,
            key: self.inner.key.clone(),
            url: self.inner.url.clone(),
            data,
        };
        if !self.inner.outbox.post(response.encode(), self.inner.origin.as_str()) {
            warn!(key = %self.inner.key, "channel to host is closed, response lost");
        }
    }
}
