//! The client and server talking through the shared store.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use xqrun::Actions;
use xqrun::Client;
use xqrun::EndpointHandle;
use xqrun::Frame;
use xqrun::FrameKind;
use xqrun::Invocation;
use xqrun::MemoryStore;
use xqrun::QueryError;
use xqrun::QueryOptions;
use xqrun::Responder;
use xqrun::Server;
use xqrun::ServerConfig;
use xqrun::SetupOptions;
use xqrun::Transport;
use xqrun::fallback::Cipher;
use xqrun::fallback::Error as FallbackError;
use xqrun::fallback::FallbackBridge;
use xqrun::fallback::FallbackConfig;
use xqrun::fallback::FallbackResponder;
use xqrun::fallback::Passthrough;
use xqrun::mock_transport::DuplexChannelTransport;
use xqrun::mock_transport::MockFrame;
use xqrun::mock_transport::MockOpener;

use common::HOST;
use common::SERVER_ORIGIN;
use common::SERVER_URL;

fn echo(call: Invocation, responder: Responder) {
    responder.send_success(call.data);
}

fn work(_call: Invocation, responder: Responder) {
    responder.send_notification(json!({ "progress": 1 }));
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        responder.send_success(json!({ "done": true }));
    });
}

fn actions() -> Actions {
    Actions::new().with("echo", echo).with("work", work)
}

/// Fails to decrypt anything.
struct Garbled;

impl Cipher for Garbled {
    fn encrypt(&self, plain: &str, _key: &str) -> String {
        plain.to_string()
    }

    fn decrypt(&self, _data: &str, _key: &str) -> Option<String> {
        None
    }
}

struct Session {
    store: MemoryStore,
    bridge: Arc<FallbackBridge>,
    child_boot: Arc<DuplexChannelTransport>,
    client: Client,
    endpoint: EndpointHandle,
}

impl Session {
    async fn open(cipher: Arc<dyn Cipher>) -> anyhow::Result<Self> {
        common::init_tracing();
        let store = MemoryStore::new();
        let (host_boot, child_boot) = DuplexChannelTransport::pair_with_origins(HOST, SERVER_ORIGIN);

        let bridge = FallbackBridge::open(
            FallbackConfig::new(SERVER_URL),
            Arc::new(store.view()),
            Arc::new(host_boot),
            cipher,
        )
        .await?;
        let bridge = Arc::new(bridge);

        let transport: Arc<dyn Transport> = bridge.clone();
        let frame: Arc<dyn Frame> = Arc::new(MockFrame::new(FrameKind::Window, SERVER_URL, transport));
        let reopen = frame.clone();
        let opener = MockOpener::new(move |url, _options| {
            Arc::new(MockFrame::new(FrameKind::Window, url, reopen.transport()))
        });
        let client = Client::new(Arc::new(opener));
        let endpoint = client.setup(frame, SetupOptions::default())?;

        Ok(Self { store, bridge, child_boot: Arc::new(child_boot), client, endpoint })
    }

    /// Starts a destination page: accepts activation and runs a server.
    async fn serve(&self) -> anyhow::Result<(Server, Arc<FallbackResponder>)> {
        let responder = FallbackResponder::accept(
            self.child_boot.clone(),
            Arc::new(self.store.view()),
            Arc::new(Passthrough),
            FallbackConfig::new(SERVER_URL),
        )
        .await?;
        let responder = Arc::new(responder);
        let server = Server::setup(responder.clone(), ServerConfig::new(SERVER_URL).allow(HOST), actions());
        Ok((server, responder))
    }
}

#[tokio::test(start_paused = true)]
async fn test_round_trip_over_store() -> anyhow::Result<()> {
    let s = Session::open(Arc::new(Passthrough)).await?;
    let (_server, responder) = s.serve().await?;
    assert_eq!(responder.keys(), s.bridge.keys());

    let handle = s.endpoint.query(&json!({ "action": "echo", "data": [1, "two"] }), QueryOptions::default())?;
    assert_eq!(handle.settled().await, Ok(json!([1, "two"])));
    assert!(s.bridge.is_ready());
    assert!(s.client.readiness().is_ready(SERVER_URL));

    let missing = s.endpoint.query(&json!({ "action": "nope" }), QueryOptions::default())?;
    assert_eq!(
        missing.settled().await,
        Err(QueryError::Failed(json!({ "error": "No callable action" })))
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_notifications_over_store() -> anyhow::Result<()> {
    let s = Session::open(Arc::new(Passthrough)).await?;
    let (_server, _responder) = s.serve().await?;

    let handle = s.endpoint.query(&json!({ "action": "work" }), QueryOptions::default())?;
    let mut notes = handle.notifications();
    assert_eq!(notes.next().await, Some(json!({ "progress": 1 })));
    assert_eq!(handle.settled().await, Ok(json!({ "done": true })));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_requests_wait_for_activation() -> anyhow::Result<()> {
    let s = Session::open(Arc::new(Passthrough)).await?;
    let handle = s.endpoint.query(&json!({ "action": "echo", "data": 1 }), QueryOptions::default())?;
    common::settle().await;
    assert!(!s.bridge.is_ready());
    assert_eq!(s.endpoint.queued(), 1, "the client holds requests until the bridge announces");

    let (_server, _responder) = s.serve().await?;
    assert_eq!(handle.settled().await, Ok(json!(1)));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_mailbox_is_single_slot() -> anyhow::Result<()> {
    let s = Session::open(Arc::new(Passthrough)).await?;
    let (_server, _responder) = s.serve().await?;
    common::settle().await;
    assert!(s.bridge.is_ready());

    // The deactivation watch was just written, so the mailbox is locked.
    let a = s.endpoint.query(&json!({ "action": "echo", "data": "a" }), QueryOptions::default())?;
    let b = s.endpoint.query(&json!({ "action": "echo", "data": "b" }), QueryOptions::default())?;
    common::settle().await;
    assert_eq!(s.bridge.queued(), 2);

    common::advance(81).await;
    assert_eq!(s.bridge.queued(), 1);
    common::advance(80).await;
    assert_eq!(s.bridge.queued(), 0);

    assert_eq!(a.settled().await, Ok(json!("a")));
    assert_eq!(b.settled().await, Ok(json!("b")));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_undecodable_reply_fails_request() -> anyhow::Result<()> {
    let s = Session::open(Arc::new(Garbled)).await?;
    let (_server, _responder) = s.serve().await?;

    let handle = s.endpoint.query(&json!({ "action": "echo", "data": 1 }), QueryOptions::default())?;
    assert_eq!(
        handle.settled().await,
        Err(QueryError::Failed(json!({ "error": "Unable to decode data" })))
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_deactivation_and_lazy_reactivation() -> anyhow::Result<()> {
    let s = Session::open(Arc::new(Passthrough)).await?;
    let (server, responder) = s.serve().await?;
    let first = s.endpoint.query(&json!({ "action": "echo", "data": 1 }), QueryOptions::default())?;
    assert_eq!(first.settled().await, Ok(json!(1)));

    // The destination page goes away.
    // The watch reply may wait out the throttle behind the echo reply.
    server.unload();
    common::advance(100).await;
    assert!(responder.is_closed());
    assert!(!s.bridge.is_ready());
    assert!(s.store.snapshot().get(s.bridge.keys().activation_key()).is_none());

    // The next call waits in the bridge and re-sends the activation request.
    let second = s.endpoint.query(&json!({ "action": "echo", "data": 2 }), QueryOptions::default())?;
    common::settle().await;
    assert_eq!(s.bridge.queued(), 1);

    // A reloaded page picks up the same session keys.
    let (_server, reloaded) = s.serve().await?;
    assert_eq!(reloaded.keys(), s.bridge.keys());
    assert_eq!(second.settled().await, Ok(json!(2)));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_window_name_carries_session_keys() -> anyhow::Result<()> {
    let s = Session::open(Arc::new(Passthrough)).await?;
    let options = s.bridge.window_options();
    assert!(options.window);
    let name = options.name.expect("window name");

    // The page keys itself from its window name instead of waiting for the
    // activation request.
    let responder = FallbackResponder::from_window_name(
        &name,
        HOST,
        Arc::new(s.store.view()),
        Arc::new(Passthrough),
        FallbackConfig::new(SERVER_URL),
    )?;
    let responder = Arc::new(responder);
    assert_eq!(responder.keys(), s.bridge.keys());
    let _server = Server::setup(responder.clone(), ServerConfig::new(SERVER_URL).allow(HOST), actions());

    let handle = s.endpoint.query(&json!({ "action": "echo", "data": 5 }), QueryOptions::default())?;
    assert_eq!(handle.settled().await, Ok(json!(5)));

    let bad = FallbackResponder::from_window_name(
        "popup",
        HOST,
        Arc::new(s.store.view()),
        Arc::new(Passthrough),
        FallbackConfig::new(SERVER_URL),
    );
    assert!(matches!(bad, Err(FallbackError::BadKeys(_))));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_calls_sharing_a_key_all_close() -> anyhow::Result<()> {
    let s = Session::open(Arc::new(Passthrough)).await?;
    let args = json!({ "action": "work" });
    let first = s.endpoint.query(&args, QueryOptions::default())?;
    let second = s.endpoint.query(&args, QueryOptions::default())?;
    common::settle().await;
    assert_eq!(s.endpoint.queued(), 2);

    // Both queued copies go out as separate store calls with one key.
    let (_server, _responder) = s.serve().await?;
    let mut notes = second.notifications();
    assert_eq!(notes.next().await, Some(json!({ "progress": 1 })));
    assert_eq!(first.settled().await, Ok(json!({ "done": true })));
    assert_eq!(second.settled().await, Ok(json!({ "done": true })));

    common::advance(500).await;
    assert_eq!(s.bridge.outstanding(), 1, "only the deactivation watch is still open");
    Ok(())
}
