//! Mock collaborators for testing.
//!
//! These are used by the test suites and are not part of the stable API.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use tokio::sync::mpsc;

use crate::frame::Frame;
use crate::frame::FrameKind;
use crate::frame::FrameOpener;
use crate::frame::FrameOptions;
use crate::transport;
use crate::transport::Inbound;
use crate::transport::Transport;

/// A duplex channel transport using tokio mpsc channels.
///
/// Each side has an origin. A send is delivered to the peer only if its target
/// origin is `"*"` or the peer's origin; otherwise it is silently dropped, the
/// way a mistargeted post would be. Every send is recorded.
pub struct DuplexChannelTransport {
    origin: String,
    peer_origin: String,
    tx: mpsc::UnboundedSender<Inbound>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>,
    sent: Mutex<Vec<(String, String)>>,
    closed: AtomicBool,
}

impl DuplexChannelTransport {
    /// Creates a pair of transports connected to each other.
    ///
    /// Messages sent on `a` are received by `b` and vice versa.
    pub fn pair_with_origins(a_origin: &str, b_origin: &str) -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();

        let a = Self::new(a_origin, b_origin, tx_a, rx_b);
        let b = Self::new(b_origin, a_origin, tx_b, rx_a);

        (a, b)
    }

    fn new(
        origin: &str,
        peer_origin: &str,
        tx: mpsc::UnboundedSender<Inbound>,
        rx: mpsc::UnboundedReceiver<Inbound>,
    ) -> Self {
        Self {
            origin: origin.to_string(),
            peer_origin: peer_origin.to_string(),
            tx,
            rx: tokio::sync::Mutex::new(rx),
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Every `(payload, target_origin)` passed to `send`, delivered or not.
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Payloads sent so far, in order.
    pub fn sent_payloads(&self) -> Vec<String> {
        self.sent().into_iter().map(|(payload, _)| payload).collect()
    }

    /// Breaks this side of the channel: later sends fail.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[async_trait::async_trait]
impl Transport for DuplexChannelTransport {
    async fn send(&self, payload: &str, target_origin: &str) -> transport::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(transport::Error::ConnectionLost("Channel closed".into()));
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((payload.to_string(), target_origin.to_string()));

        if target_origin != "*" && target_origin != self.peer_origin {
            return Ok(());
        }
        self.tx
            .send(Inbound::new(self.origin.as_str(), payload))
            .map_err(|_| transport::Error::ConnectionLost("Channel closed".into()))
    }

    async fn recv(&self) -> transport::Result<Option<Inbound>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }
}

/// A child context backed by any transport.
pub struct MockFrame {
    kind: FrameKind,
    location: Mutex<String>,
    navigations: AtomicUsize,
    closed: AtomicBool,
    transport: Arc<dyn Transport>,
}

impl MockFrame {
    pub fn new(kind: FrameKind, location: &str, transport: Arc<dyn Transport>) -> Self {
        Self {
            kind,
            location: Mutex::new(location.to_string()),
            navigations: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            transport,
        }
    }

    /// Number of times the frame was navigated.
    pub fn navigations(&self) -> usize {
        self.navigations.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Moves the frame without counting a navigation, as when the page
    /// follows a link on its own.
    pub fn set_location(&self, url: &str) {
        *self.location.lock().unwrap_or_else(PoisonError::into_inner) = url.to_string();
    }
}

impl Frame for MockFrame {
    fn kind(&self) -> FrameKind {
        self.kind
    }

    fn location(&self) -> String {
        self.location.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn navigate(&self, url: &str) {
        *self.location.lock().unwrap_or_else(PoisonError::into_inner) = url.to_string();
        self.navigations.fetch_add(1, Ordering::AcqRel);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }
}

type FrameFactory = Box<dyn Fn(&str, &FrameOptions) -> Arc<MockFrame> + Send + Sync>;

/// Opens frames through a factory and remembers what it opened.
pub struct MockOpener {
    factory: FrameFactory,
    opened: Mutex<Vec<(String, FrameOptions, Arc<MockFrame>)>>,
}

impl MockOpener {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&str, &FrameOptions) -> Arc<MockFrame> + Send + Sync + 'static,
    {
        Self { factory: Box::new(factory), opened: Mutex::new(Vec::new()) }
    }

    /// Number of frames opened so far.
    pub fn opened(&self) -> usize {
        self.opened.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// The most recently opened frame and the options it was opened with.
    pub fn last(&self) -> Option<(FrameOptions, Arc<MockFrame>)> {
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .map(|(_, options, frame)| (options.clone(), frame.clone()))
    }
}

impl FrameOpener for MockOpener {
    fn open(&self, url: &str, options: &FrameOptions) -> Arc<dyn Frame> {
        let frame = (self.factory)(url, options);
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((url.to_string(), options.clone(), frame.clone()));
        frame
    }
}
