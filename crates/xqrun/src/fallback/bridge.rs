//! The requesting side of the fallback: a transport for the [`Client`].
//!
//! Requests posted by the correlator become call records in the store;
//! replies read back from the store become response envelopes on `recv`.
//! The bridge announces the destination as ready (a synthesized init signal)
//! once the responder has written the activation sentinel.
//!
//! When the responder goes away it answers the `xqDeactivate` watch call.
//! The bridge then closes its mailbox and re-sends the activation request on
//! the next send, so requests made meanwhile wait in the mailbox.
//!
//! [`Client`]: crate::client::Client

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::Weak;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::trace;
use tracing::warn;
use xqwire::ACTION_ACTIVATE;
use xqwire::ACTION_DEACTIVATE;
use xqwire::ACTION_PING;
use xqwire::ACTIVE_SENTINEL;
use xqwire::CallRecord;
use xqwire::ERR_DECODE;
use xqwire::Handshake;
use xqwire::RETURN_SUFFIX;
use xqwire::Request;
use xqwire::Response;
use xqwire::ReturnRecord;
use xqwire::Signal;
use xqwire::Status;
use xqwire::decode_request;
use xqwire::error_data;
use xqwire::origin_of;

use super::Cipher;
use super::Error;
use super::FallbackConfig;
use super::Mailbox;
use super::Posted;
use super::Result;
use super::SessionKeys;
use crate::frame::FrameOptions;
use crate::store::Store;
use crate::transport;
use crate::transport::Inbound;
use crate::transport::Transport;

/// What a call in the store is waiting for.
#[derive(Debug, Clone)]
enum Call {
    /// A correlator request, by correlation key.
    Request(String),
    /// The watch call the responder answers when it unloads.
    Watch,
}

#[derive(Debug, Default)]
struct BridgeState {
    /// The activation request has been sent for the current session.
    active: bool,
    /// The responder's sentinel has been seen.
    ready: bool,
    next_call: u64,
    calls: HashMap<String, Call>,
}

struct BridgeInner {
    config: FallbackConfig,
    origin: String,
    keys: SessionKeys,
    store: Arc<dyn Store>,
    bootstrap: Arc<dyn Transport>,
    cipher: Arc<dyn Cipher>,
    mailbox: Mailbox,
    state: Mutex<BridgeState>,
    inbound: mpsc::UnboundedSender<Inbound>,
}

/// Store-backed transport for the requesting context.
pub struct FallbackBridge {
    inner: Arc<BridgeInner>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>,
}

impl FallbackBridge {
    /// Generates session keys, starts watching the store and sends the
    /// activation request over `bootstrap`.
    pub async fn open(
        config: FallbackConfig,
        store: Arc<dyn Store>,
        bootstrap: Arc<dyn Transport>,
        cipher: Arc<dyn Cipher>,
    ) -> Result<Self> {
        let origin = origin_of(&config.url).map_err(Error::Destination)?;
        let keys = SessionKeys::generate();
        let mailbox = Mailbox::new(store.clone(), keys.message_key(), config.throttle, false);
        let (tx, rx) = mpsc::unbounded_channel();

        let inner = Arc::new(BridgeInner {
            config,
            origin,
            keys,
            store,
            bootstrap,
            cipher,
            mailbox,
            state: Mutex::new(BridgeState::default()),
            inbound: tx,
        });

        let mut changes = inner.store.subscribe();
        let weak: Weak<BridgeInner> = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while changes.recv().await.is_some() {
                let Some(inner) = weak.upgrade() else { break };
                inner.on_store_change();
            }
        });

        inner.lock().active = true;
        inner.activate().await?;

        Ok(Self { inner, rx: tokio::sync::Mutex::new(rx) })
    }

    pub fn keys(&self) -> &SessionKeys {
        &self.inner.keys
    }

    /// Options for opening the destination window. The window is named after
    /// the session key material so the page can start its responder with
    /// [`FallbackResponder::from_window_name`] before any activation request
    /// reaches it.
    ///
    /// [`FallbackResponder::from_window_name`]: super::FallbackResponder::from_window_name
    pub fn window_options(&self) -> FrameOptions {
        FrameOptions::window().name(self.inner.keys.material())
    }

    /// Whether the responder is known to be listening.
    pub fn is_ready(&self) -> bool {
        self.inner.lock().ready
    }

    /// Calls waiting for the mailbox.
    pub fn queued(&self) -> usize {
        self.inner.mailbox.queued()
    }

    /// Calls written or waiting that have not had a terminal reply.
    pub fn outstanding(&self) -> usize {
        self.inner.lock().calls.len()
    }
}

impl BridgeInner {
    fn lock(&self) -> MutexGuard<'_, BridgeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn activate(&self) -> transport::Result<()> {
        debug!(url = %self.config.url, "sending activation");
        let request = Request::new(ACTION_ACTIVATE, Value::String(self.keys.material().to_string()));
        self.bootstrap.send(&request.to_value().to_string(), &self.origin).await
    }

    fn emit(&self, data: String) {
        if self.inbound.send(Inbound::new(self.origin.as_str(), data)).is_err() {
            trace!(url = %self.config.url, "bridge reader gone");
        }
    }

    /// Writes a call record, or queues it until the responder is ready.
    fn post_call(&self, state: &mut BridgeState, action: &str, data: Value, call: Call) -> transport::Result<Posted> {
        let record = CallRecord::new(action, state.next_call, data);
        state.next_call += 1;
        let body = record
            .encode()
            .map_err(|e| transport::Error::Io(format!("Failed to encode call: {}", e)))?;
        state.calls.insert(record.call_id.clone(), call);
        let body = self.cipher.encrypt(&body, self.keys.crypt_key());
        Ok(self.mailbox.post(action, body))
    }

    fn on_store_change(&self) {
        let mut state = self.lock();
        if !state.ready {
            if self.store.get(self.keys.activation_key()).as_deref() != Some(ACTIVE_SENTINEL) {
                return;
            }
            debug!(url = %self.config.url, "responder active");
            state.ready = true;
            self.emit(Handshake::new(Signal::Init, self.config.url.as_str()).encode());
            self.mailbox.set_ready(true);
            if let Err(e) = self.post_call(&mut state, ACTION_DEACTIVATE, Value::Null, Call::Watch) {
                warn!(url = %self.config.url, "failed to post deactivation watch: {}", e);
            }
        }

        let pointer = format!("{}{}", self.keys.message_key(), RETURN_SUFFIX);
        let Some(entry) = self.store.take(&pointer) else { return };
        let raw = self.store.take(&entry);
        let call_id = entry.strip_suffix(RETURN_SUFFIX).unwrap_or(&entry);

        let Some(call) = state.calls.get(call_id).cloned() else {
            debug!(call = %call_id, "reply for unknown call");
            return;
        };

        let reply = raw
            .and_then(|raw| self.cipher.decrypt(&raw, self.keys.crypt_key()))
            .and_then(|plain| ReturnRecord::decode(&plain).ok())
            .unwrap_or_else(|| {
                debug!(call = %call_id, "undecodable reply");
                ReturnRecord::new(Status::Fail, error_data(ERR_DECODE))
            });
        if reply.success.is_terminal() {
            state.calls.remove(call_id);
        }

        match call {
            Call::Watch if reply.success.is_terminal() => self.deactivate(&mut state),
            Call::Watch => {}
            Call::Request(key) => {
                trace!(call = %call_id, status = ?reply.success, "reply");
                let response = Response {
                    success: reply.success,
                    key,
                    url: self.config.url.clone(),
                    data: reply.data,
                };
                self.emit(response.encode());
            }
        }
    }

    fn deactivate(&self, state: &mut BridgeState) {
        debug!(url = %self.config.url, "responder deactivated");
        state.ready = false;
        state.active = false;
        self.mailbox.set_ready(false);
        self.store.remove(self.keys.activation_key());
    }
}

#[async_trait::async_trait]
impl Transport for FallbackBridge {
    async fn send(&self, payload: &str, _target_origin: &str) -> transport::Result<()> {
        let request = match decode_request(payload) {
            Ok(request) => request,
            Err(e) => {
                debug!("dropping undecodable request: {}", e);
                return Ok(());
            }
        };

        let reactivate = {
            let mut state = self.inner.lock();
            if request.action == ACTION_PING {
                if state.ready {
                    self.inner.emit(Handshake::new(Signal::Init, self.inner.config.url.as_str()).encode());
                }
            } else {
                let posted = self.inner.post_call(
                    &mut state,
                    &request.action,
                    request.data,
                    Call::Request(payload.to_string()),
                )?;
                trace!(action = %request.action, ?posted, "call posted");
            }
            !std::mem::replace(&mut state.active, true)
        };

        if reactivate {
            if let Err(e) = self.inner.activate().await {
                warn!(url = %self.inner.config.url, "reactivation failed: {}", e);
                self.inner.lock().active = false;
            }
        }
        Ok(())
    }

    async fn recv(&self) -> transport::Result<Option<Inbound>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }
}
