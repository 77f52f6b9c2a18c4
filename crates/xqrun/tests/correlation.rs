//! Client-side correlation: matching, timeouts, caching, queueing.

mod common;

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;

use xqrun::Actions;
use xqrun::Client;
use xqrun::Frame;
use xqrun::FrameKind;
use xqrun::Invocation;
use xqrun::QueryError;
use xqrun::QueryOptions;
use xqrun::ReadinessState;
use xqrun::Responder;
use xqrun::Server;
use xqrun::ServerConfig;
use xqrun::SetupOptions;
use xqrun::client::Error as ClientError;
use xqrun::mock_transport::DuplexChannelTransport;
use xqrun::mock_transport::MockFrame;

use common::HOST;
use common::Pairing;
use common::SERVER_ORIGIN;
use common::SERVER_URL;

fn config() -> ServerConfig {
    ServerConfig::new(SERVER_URL).referrer(format!("{}/index.html", HOST)).allow(HOST)
}

fn echo(call: Invocation, responder: Responder) {
    responder.send_success(call.data);
}

/// Records every invocation and keeps the responders for the test to answer.
#[derive(Clone, Default)]
struct Held {
    calls: Arc<Mutex<Vec<(serde_json::Value, Responder)>>>,
}

impl Held {
    fn action(&self) -> impl Fn(Invocation, Responder) + Send + Sync + 'static {
        let calls = self.calls.clone();
        move |call, responder| calls.lock().unwrap().push((call.data, responder))
    }

    fn count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn data(&self) -> Vec<serde_json::Value> {
        self.calls.lock().unwrap().iter().map(|(d, _)| d.clone()).collect()
    }

    fn responder(&self, i: usize) -> Responder {
        self.calls.lock().unwrap()[i].1.clone()
    }
}

// --- Scenario A ---

#[tokio::test(start_paused = true)]
async fn test_unknown_action_rejects() -> anyhow::Result<()> {
    common::init_tracing();
    let pairing = Pairing::new(FrameKind::Embedded);
    let client = Client::new(pairing.opener.clone());
    let endpoint = client.setup(SERVER_URL, SetupOptions::default())?;
    let _server = Server::setup(pairing.remote(), config(), Actions::new());

    let handle = endpoint.query(&json!({ "a": 1 }), QueryOptions::default())?;
    let outcome = handle.settled().await;

    assert_eq!(outcome, Err(QueryError::Failed(json!({ "error": "No callable action" }))));
    Ok(())
}

// --- Scenario B ---

#[tokio::test(start_paused = true)]
async fn test_times_out_when_server_never_announces() -> anyhow::Result<()> {
    common::init_tracing();
    let pairing = Pairing::new(FrameKind::Embedded);
    let client = Client::new(pairing.opener.clone());
    let endpoint = client.setup(SERVER_URL, SetupOptions::default())?;

    let start = Instant::now();
    let options = QueryOptions::default().timeout(Duration::from_millis(100));
    let handle = endpoint.query(&json!({ "a": 1 }), options)?;
    let err = handle.settled().await.unwrap_err();

    assert_eq!(err, QueryError::TimedOut);
    assert_eq!(err.data(), json!({ "error": "The request timed out" }));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(100) && elapsed < Duration::from_millis(110));
    assert_eq!(endpoint.pending(), 0);
    Ok(())
}

// --- Scenario C ---

#[tokio::test(start_paused = true)]
async fn test_notification_then_success() -> anyhow::Result<()> {
    common::init_tracing();
    let pairing = Pairing::new(FrameKind::Embedded);
    let client = Client::new(pairing.opener.clone());
    let endpoint = client.setup(SERVER_URL, SetupOptions::default())?;

    let work = |_call: Invocation, responder: Responder| {
        responder.send_notification(json!({ "progress": 1 }));
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            responder.send_success(json!({ "done": true }));
        });
    };
    let _server = Server::setup(pairing.remote(), config(), Actions::new().with("work", work));

    let handle = endpoint.query(&json!({ "action": "work" }), QueryOptions::default())?;
    let mut notes = handle.notifications();

    assert_eq!(notes.next().await, Some(json!({ "progress": 1 })));
    assert_eq!(handle.settled().await, Ok(json!({ "done": true })));
    assert_eq!(notes.next().await, None);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_cached_query_shares_handle() -> anyhow::Result<()> {
    common::init_tracing();
    let pairing = Pairing::new(FrameKind::Embedded);
    let client = Client::new(pairing.opener.clone());
    let endpoint = client.setup(SERVER_URL, SetupOptions::default())?;
    let held = Held::default();
    let _server = Server::setup(pairing.remote(), config(), Actions::new().with("slow", held.action()));
    common::settle().await;

    let args = json!({ "action": "slow", "data": [1, 2] });
    let first = endpoint.query(&args, QueryOptions::cached())?;
    let second = endpoint.query(&args, QueryOptions::cached())?;
    assert!(first.same_as(&second));
    common::settle().await;
    assert_eq!(held.count(), 1, "only one message is transmitted");

    held.responder(0).send_success(json!("ok"));
    assert_eq!(second.settled().await, Ok(json!("ok")));

    // A cached query after settling returns the settled handle.
    let third = endpoint.query(&args, QueryOptions::cached())?;
    assert!(third.same_as(&first));
    assert!(third.is_settled());

    // An uncached query always goes out again.
    let fourth = endpoint.query(&args, QueryOptions::default())?;
    assert!(!fourth.same_as(&first));
    common::settle().await;
    assert_eq!(held.count(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_queue_flushes_in_order_on_init() -> anyhow::Result<()> {
    common::init_tracing();
    let pairing = Pairing::new(FrameKind::Embedded);
    let client = Client::new(pairing.opener.clone());
    let endpoint = client.setup(SERVER_URL, SetupOptions::default())?;

    let handles = (1..=3)
        .map(|n| endpoint.query(&json!({ "action": "echo", "data": n }), QueryOptions::default()))
        .collect::<Result<Vec<_>, _>>()?;
    assert_eq!(endpoint.queued(), 3);
    assert_eq!(client.readiness().state(SERVER_URL), ReadinessState::Unknown);

    let held = Held::default();
    let _server = Server::setup(pairing.remote(), config(), Actions::new().with("echo", held.action()));
    common::settle().await;

    assert_eq!(endpoint.queued(), 0);
    assert_eq!(held.data(), vec![json!(1), json!(2), json!(3)]);

    for i in 0..3 {
        held.responder(i).send_success(json!(i));
    }
    for (i, handle) in handles.iter().enumerate() {
        assert_eq!(handle.settled().await, Ok(json!(i)));
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_pause_holds_requests_until_play() -> anyhow::Result<()> {
    common::init_tracing();
    let pairing = Pairing::new(FrameKind::Embedded);
    let client = Client::new(pairing.opener.clone());
    let endpoint = client.setup(SERVER_URL, SetupOptions::default())?;
    let held = Held::default();
    let _server = Server::setup(pairing.remote(), config(), Actions::new().with("echo", held.action()));
    common::settle().await;

    endpoint.pause();
    assert!(endpoint.is_paused());
    let a = endpoint.query(&json!({ "action": "echo", "data": "a" }), QueryOptions::default())?;
    let b = endpoint.query(&json!({ "action": "echo", "data": "b" }), QueryOptions::default())?;
    common::settle().await;
    assert_eq!(held.count(), 0);
    assert_eq!(endpoint.queued(), 2);

    endpoint.play();
    common::settle().await;
    assert_eq!(held.data(), vec![json!("a"), json!("b")]);

    held.responder(1).send_success(json!(2));
    held.responder(0).send_fail(json!(1));
    assert_eq!(b.settled().await, Ok(json!(2)));
    assert_eq!(a.settled().await, Err(QueryError::Failed(json!(1))));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_late_response_is_dropped() -> anyhow::Result<()> {
    common::init_tracing();
    let pairing = Pairing::new(FrameKind::Embedded);
    let client = Client::new(pairing.opener.clone());
    let endpoint = client.setup(SERVER_URL, SetupOptions::default().timeout(Duration::from_millis(50)))?;
    let held = Held::default();
    let _server = Server::setup(pairing.remote(), config(), Actions::new().with("hold", held.action()));
    common::settle().await;

    let handle = endpoint.query(&json!({ "action": "hold" }), QueryOptions::default())?;
    common::advance(60).await;
    assert_eq!(handle.try_outcome(), Some(Err(QueryError::TimedOut)));

    held.responder(0).send_success(json!("too late"));
    common::settle().await;
    assert_eq!(handle.try_outcome(), Some(Err(QueryError::TimedOut)));
    assert_eq!(endpoint.pending(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_response_cancels_timer() -> anyhow::Result<()> {
    common::init_tracing();
    let pairing = Pairing::new(FrameKind::Embedded);
    let client = Client::new(pairing.opener.clone());
    let endpoint = client.setup(SERVER_URL, SetupOptions::default().timeout(Duration::from_millis(50)))?;
    let _server = Server::setup(pairing.remote(), config(), Actions::new().with("echo", echo));

    let handle = endpoint.query(&json!({ "action": "echo", "data": 9 }), QueryOptions::default())?;
    assert_eq!(handle.settled().await, Ok(json!(9)));

    common::advance(100).await;
    assert_eq!(handle.try_outcome(), Some(Ok(json!(9))));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_de_init_queues_until_next_init() -> anyhow::Result<()> {
    common::init_tracing();
    let pairing = Pairing::new(FrameKind::Embedded);
    let client = Client::new(pairing.opener.clone());
    let endpoint = client.setup(SERVER_URL, SetupOptions::default())?;
    let server = Server::setup(pairing.remote(), config(), Actions::new().with("echo", echo));
    common::settle().await;
    assert!(client.readiness().is_ready(SERVER_URL));

    server.unload();
    common::settle().await;
    assert_eq!(client.readiness().state(SERVER_URL), ReadinessState::Unready);

    let handle = endpoint.query(&json!({ "action": "echo", "data": "x" }), QueryOptions::default())?;
    assert_eq!(endpoint.queued(), 1);

    server.announce();
    assert_eq!(handle.settled().await, Ok(json!("x")));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_existing_frame_is_pinged() -> anyhow::Result<()> {
    common::init_tracing();
    let (host, child) = DuplexChannelTransport::pair_with_origins(HOST, SERVER_ORIGIN);
    let frame: Arc<dyn Frame> = Arc::new(MockFrame::new(FrameKind::Embedded, SERVER_URL, Arc::new(host)));
    let pairing = Pairing::new(FrameKind::Embedded);
    let client = Client::new(pairing.opener.clone());

    let endpoint = client.setup(frame, SetupOptions::default())?;
    assert_eq!(endpoint.origin(), SERVER_ORIGIN);
    assert_eq!(endpoint.path(), "/server.html");

    let ping = xqrun::Transport::recv(&child).await?.expect("ping");
    assert_eq!(ping.origin, HOST);
    assert_eq!(serde_json::from_str::<serde_json::Value>(&ping.data)?["action"], "ping");
    assert_eq!(pairing.opener.opened(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_setup_reuses_endpoint_and_reopens_closed_frames() -> anyhow::Result<()> {
    common::init_tracing();
    let pairing = Pairing::new(FrameKind::Window);
    let client = Client::new(pairing.opener.clone());

    let options = SetupOptions::default().frame(xqrun::FrameOptions::window().attrs("width=200"));
    let endpoint = client.setup(SERVER_URL, options)?;
    let again = client.setup(SERVER_URL, SetupOptions::default())?;
    assert_eq!(pairing.opener.opened(), 1);
    assert_eq!(again.url(), endpoint.url());

    let (opened_with, frame) = pairing.opener.last().expect("frame");
    assert!(opened_with.window);
    assert_eq!(opened_with.attrs.as_deref(), Some("width=200"));

    frame.close();
    let reopened = endpoint.get();
    assert!(!reopened.is_closed());
    assert_eq!(pairing.opener.opened(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_destination_spellings_share_one_endpoint() -> anyhow::Result<()> {
    common::init_tracing();
    let pairing = Pairing::new(FrameKind::Embedded);
    let client = Client::new(pairing.opener.clone());
    let endpoint = client.setup("https://A.example", SetupOptions::default())?;
    assert_eq!(endpoint.url(), "https://a.example/");
    assert_eq!(endpoint.path(), "/");

    let again = client.setup("https://a.example/", SetupOptions::default())?;
    assert_eq!(again.url(), endpoint.url());
    assert_eq!(pairing.opener.opened(), 1);

    // The server spells its own URL differently from the caller.
    let config = ServerConfig::new("https://a.example/").referrer(format!("{}/index.html", HOST)).allow(HOST);
    let _server = Server::setup(pairing.remote(), config, Actions::new().with("echo", echo));

    let options = QueryOptions::default().timeout(Duration::from_millis(200));
    let handle = endpoint.query(&json!({ "action": "echo", "data": "hi" }), options)?;
    assert_eq!(handle.settled().await, Ok(json!("hi")));
    assert!(client.readiness().is_ready("https://a.example"));
    assert!(client.readiness().is_ready("HTTPS://A.EXAMPLE/"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_queued_query_renavigates_stray_embedded_frame() -> anyhow::Result<()> {
    common::init_tracing();
    let pairing = Pairing::new(FrameKind::Embedded);
    let client = Client::new(pairing.opener.clone());
    let endpoint = client.setup(SERVER_URL, SetupOptions::default())?;
    let (_, frame) = pairing.opener.last().expect("frame");
    assert_eq!(frame.navigations(), 0);

    frame.set_location("https://a.example/elsewhere.html");
    let _first = endpoint.query(&json!({ "action": "echo", "data": 1 }), QueryOptions::default())?;
    assert_eq!(frame.navigations(), 1);
    assert_eq!(frame.location(), SERVER_URL);

    // Back on the endpoint URL, so further queued queries leave it alone.
    let _second = endpoint.query(&json!({ "action": "echo", "data": 2 }), QueryOptions::default())?;
    assert_eq!(frame.navigations(), 1);
    assert_eq!(endpoint.queued(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_refresh_renavigates_to_endpoint_url() -> anyhow::Result<()> {
    common::init_tracing();
    let pairing = Pairing::new(FrameKind::Embedded);
    let client = Client::new(pairing.opener.clone());
    let endpoint = client.setup(SERVER_URL, SetupOptions::default())?;
    let (_, frame) = pairing.opener.last().expect("frame");

    frame.set_location("https://a.example/elsewhere.html");
    endpoint.refresh();
    assert_eq!(frame.navigations(), 1);
    assert_eq!(frame.location(), SERVER_URL);
    assert_eq!(pairing.opener.opened(), 1, "a live frame is navigated, not reopened");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_lost_frame_requeues_at_front_and_reopens() -> anyhow::Result<()> {
    common::init_tracing();
    let pairing = Pairing::new(FrameKind::Window);
    let client = Client::new(pairing.opener.clone());
    let endpoint = client.setup(SERVER_URL, SetupOptions::default())?;
    let first = Held::default();
    let _first_server = Server::setup(pairing.remote(), config(), Actions::new().with("echo", first.action()));
    common::settle().await;
    assert!(client.readiness().is_ready(SERVER_URL));

    endpoint.pause();
    let a = endpoint.query(&json!({ "action": "echo", "data": "a" }), QueryOptions::default())?;
    let b = endpoint.query(&json!({ "action": "echo", "data": "b" }), QueryOptions::default())?;
    let (_, lost) = pairing.opener.last().expect("frame");
    lost.close();

    // The first send finds no live frame: it goes back to the head of the
    // queue and the window is reopened.
    endpoint.play();
    assert_eq!(endpoint.queued(), 2);
    assert_eq!(pairing.opener.opened(), 2);
    assert_eq!(client.readiness().state(SERVER_URL), ReadinessState::Unready);
    let (_, reopened) = pairing.opener.last().expect("frame");
    assert_eq!(reopened.navigations(), 1);

    let second = Held::default();
    let _second_server = Server::setup(pairing.remote(), config(), Actions::new().with("echo", second.action()));
    common::settle().await;
    assert_eq!(endpoint.queued(), 0);
    assert_eq!(second.data(), vec![json!("a"), json!("b")]);
    assert_eq!(first.count(), 0);

    second.responder(0).send_success(json!("A"));
    second.responder(1).send_success(json!("B"));
    assert_eq!(a.settled().await, Ok(json!("A")));
    assert_eq!(b.settled().await, Ok(json!("B")));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_bad_arguments() -> anyhow::Result<()> {
    common::init_tracing();
    let pairing = Pairing::new(FrameKind::Embedded);
    let client = Client::new(pairing.opener.clone());

    assert!(matches!(
        client.setup("ftp://a.example/x", SetupOptions::default()),
        Err(ClientError::Destination(_))
    ));

    let endpoint = client.setup(SERVER_URL, SetupOptions::default())?;
    assert!(matches!(
        endpoint.query(&json!([1, 2]), QueryOptions::default()),
        Err(ClientError::Args(_))
    ));
    Ok(())
}
