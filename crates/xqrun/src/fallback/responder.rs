//! The destination side of the fallback: a transport for the [`Server`].
//!
//! Call records read from the store are handed to the server as request
//! envelopes from the bootstrap peer's origin. The server's answers go back
//! through a throttled mailbox, its init signal becomes the activation
//! sentinel, and its de-init signal answers the host's watch call and closes
//! the responder.
//!
//! [`Server`]: crate::server::Server

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::trace;
use tracing::warn;
use xqwire::ACTION_ACTIVATE;
use xqwire::ACTION_DEACTIVATE;
use xqwire::ACTIVE_SENTINEL;
use xqwire::CallRecord;
use xqwire::Message;
use xqwire::RETURN_SUFFIX;
use xqwire::Request;
use xqwire::ReturnRecord;
use xqwire::Signal;
use xqwire::Status;
use xqwire::decode_request;

use super::Cipher;
use super::Error;
use super::FallbackConfig;
use super::Mailbox;
use super::Result;
use super::SessionKeys;
use crate::store::Store;
use crate::transport;
use crate::transport::Inbound;
use crate::transport::Transport;

#[derive(Debug, Default)]
struct ResponderState {
    /// Open calls by the request key the server answers to, oldest first.
    ///
    /// Responses carry only the key, so calls sharing a key cannot be told
    /// apart: notifications go to the oldest open call and each terminal
    /// response closes the oldest. The host maps every one of these calls
    /// back to the same correlation key, so the misattribution never reaches
    /// the client.
    calls: HashMap<String, VecDeque<String>>,
    /// The host's deactivation watch call, answered on de-init.
    watch: Option<String>,
}

struct ResponderInner {
    keys: SessionKeys,
    peer_origin: String,
    store: Arc<dyn Store>,
    cipher: Arc<dyn Cipher>,
    mailbox: Mailbox,
    state: Mutex<ResponderState>,
    inbound: Mutex<Option<mpsc::UnboundedSender<Inbound>>>,
    closed: AtomicBool,
}

/// Store-backed transport for the destination context.
pub struct FallbackResponder {
    inner: Arc<ResponderInner>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>,
}

impl FallbackResponder {
    /// Waits on `bootstrap` for the host's activation request, then starts
    /// reading calls from the store.
    ///
    /// A page opened by the host as a named window can skip the wait with
    /// [`from_window_name`](Self::from_window_name).
    pub async fn accept(
        bootstrap: Arc<dyn Transport>,
        store: Arc<dyn Store>,
        cipher: Arc<dyn Cipher>,
        config: FallbackConfig,
    ) -> Result<Self> {
        let (keys, peer_origin) = loop {
            let Some(msg) = bootstrap.recv().await? else {
                return Err(Error::Closed);
            };
            match decode_request(&msg.data) {
                Ok(request) if request.action == ACTION_ACTIVATE => {
                    let material = request
                        .data
                        .as_str()
                        .ok_or_else(|| Error::BadKeys(format!("not a string: {}", request.data)))?;
                    break (SessionKeys::from_material(material)?, msg.origin);
                }
                _ => debug!(origin = %msg.origin, "ignoring bootstrap message before activation"),
            }
        };
        debug!(url = %config.url, peer = %peer_origin, "fallback session accepted");
        Ok(Self::start(keys, peer_origin, store, cipher, config))
    }

    /// Derives the session keys from the window name the host gave this page
    /// and starts reading calls from the store. `peer_origin` is the host's
    /// origin; inbound requests are attributed to it.
    pub fn from_window_name(
        name: &str,
        peer_origin: impl Into<String>,
        store: Arc<dyn Store>,
        cipher: Arc<dyn Cipher>,
        config: FallbackConfig,
    ) -> Result<Self> {
        let keys = SessionKeys::from_material(name)?;
        let peer_origin = peer_origin.into();
        debug!(url = %config.url, peer = %peer_origin, "fallback session keyed from window name");
        Ok(Self::start(keys, peer_origin, store, cipher, config))
    }

    fn start(
        keys: SessionKeys,
        peer_origin: String,
        store: Arc<dyn Store>,
        cipher: Arc<dyn Cipher>,
        config: FallbackConfig,
    ) -> Self {
        let pointer = format!("{}{}", keys.message_key(), RETURN_SUFFIX);
        let mailbox = Mailbox::new(store.clone(), pointer, config.throttle, true);
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ResponderInner {
            keys,
            peer_origin,
            store,
            cipher,
            mailbox,
            state: Mutex::new(ResponderState::default()),
            inbound: Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
        });

        let mut changes = inner.store.subscribe();
        let weak: Weak<ResponderInner> = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while changes.recv().await.is_some() {
                let Some(inner) = weak.upgrade() else { break };
                if inner.closed.load(Ordering::Acquire) {
                    break;
                }
                inner.on_store_change();
            }
        });

        Self { inner, rx: tokio::sync::Mutex::new(rx) }
    }

    pub fn keys(&self) -> &SessionKeys {
        &self.inner.keys
    }

    /// Whether the server has unloaded through this responder.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl ResponderInner {
    fn lock(&self) -> MutexGuard<'_, ResponderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_store_change(&self) {
        let Some(entry) = self.store.take(self.keys.message_key()) else { return };
        let Some(raw) = self.store.take(&entry) else {
            debug!(%entry, "pointer names a missing entry");
            return;
        };
        let record = match self
            .cipher
            .decrypt(&raw, self.keys.crypt_key())
            .map(|plain| CallRecord::decode(&plain))
        {
            Some(Ok(record)) => record,
            Some(Err(e)) => {
                warn!(%entry, "dropping undecodable call: {}", e);
                return;
            }
            None => {
                warn!(%entry, "dropping call that failed to decrypt");
                return;
            }
        };

        let action = if record.action.is_empty() { entry } else { record.action };
        let mut state = self.lock();
        if action == ACTION_DEACTIVATE {
            trace!(call = %record.call_id, "deactivation watch registered");
            state.watch = Some(record.call_id);
            return;
        }

        let key = Request::new(action, record.data).to_value().to_string();
        state.calls.entry(key.clone()).or_default().push_back(record.call_id);
        drop(state);

        let inbound = self.inbound.lock().unwrap_or_else(PoisonError::into_inner);
        if !inbound.as_ref().is_some_and(|tx| tx.send(Inbound::new(self.peer_origin.as_str(), key)).is_ok()) {
            trace!("responder reader gone");
        }
    }

    /// Stops reading the store and ends the server's inbound stream.
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.inbound.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    fn reply(&self, call_id: &str, status: Status, data: Value) -> transport::Result<()> {
        let body = ReturnRecord::new(status, data)
            .encode()
            .map_err(|e| transport::Error::Io(format!("Failed to encode reply: {}", e)))?;
        let body = self.cipher.encrypt(&body, self.keys.crypt_key());
        let posted = self.mailbox.post(format!("{}{}", call_id, RETURN_SUFFIX), body);
        trace!(call = %call_id, ?status, ?posted, "reply posted");
        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for FallbackResponder {
    async fn send(&self, payload: &str, _target_origin: &str) -> transport::Result<()> {
        let inner = &self.inner;
        match Message::parse(payload) {
            Ok(Message::Handshake(h)) if h.init == Signal::Init => {
                inner.store.set(inner.keys.activation_key(), ACTIVE_SENTINEL);
                Ok(())
            }
            Ok(Message::Handshake(_)) => {
                let watch = inner.lock().watch.take();
                let result = match watch {
                    Some(call_id) => inner.reply(&call_id, Status::Success, Value::Null),
                    None => {
                        debug!("de-init with no deactivation watch");
                        Ok(())
                    }
                };
                inner.close();
                result
            }
            Ok(Message::Response(resp)) => {
                let call_id = {
                    let mut state = inner.lock();
                    let Some(ids) = state.calls.get_mut(&resp.key) else {
                        debug!(key = %resp.key, "response for unknown call");
                        return Ok(());
                    };
                    // Oldest open call; see `ResponderState::calls`.
                    let call_id = if resp.success.is_terminal() { ids.pop_front() } else { ids.front().cloned() };
                    if ids.is_empty() {
                        state.calls.remove(&resp.key);
                    }
                    call_id
                };
                match call_id {
                    Some(call_id) => inner.reply(&call_id, resp.success, resp.data),
                    None => Ok(()),
                }
            }
            Err(e) => {
                debug!("dropping unrecognized outbound message: {}", e);
                Ok(())
            }
        }
    }

    async fn recv(&self) -> transport::Result<Option<Inbound>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }
}
