#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Once;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use xqrun::FrameKind;
use xqrun::mock_transport::DuplexChannelTransport;
use xqrun::mock_transport::MockFrame;
use xqrun::mock_transport::MockOpener;

pub const HOST: &str = "https://host.example";
pub const SERVER_ORIGIN: &str = "https://a.example";
pub const SERVER_URL: &str = "https://a.example/server.html";

static TRACING: Once = Once::new();

/// Installs a test subscriber filtered by `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// An opener whose frames are backed by duplex channels. The child side of
/// every opened frame is kept so tests can run a server on it or drive it
/// by hand.
pub struct Pairing {
    pub opener: Arc<MockOpener>,
    remotes: Arc<Mutex<Vec<Arc<DuplexChannelTransport>>>>,
}

impl Pairing {
    pub fn new(kind: FrameKind) -> Self {
        let remotes: Arc<Mutex<Vec<Arc<DuplexChannelTransport>>>> = Arc::default();
        let sink = remotes.clone();
        let opener = MockOpener::new(move |url, _options| {
            let (host, child) = DuplexChannelTransport::pair_with_origins(HOST, SERVER_ORIGIN);
            sink.lock().unwrap().push(Arc::new(child));
            Arc::new(MockFrame::new(kind, url, Arc::new(host)))
        });
        Self { opener: Arc::new(opener), remotes }
    }

    /// The child side of the most recently opened frame.
    pub fn remote(&self) -> Arc<DuplexChannelTransport> {
        self.remotes.lock().unwrap().last().cloned().expect("no frame opened yet")
    }
}

/// Lets spawned writer and pump tasks run.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

/// Advances paused time, then lets woken tasks run.
pub async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
    settle().await;
}
