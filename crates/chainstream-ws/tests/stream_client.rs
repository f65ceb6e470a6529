//! End-to-end client tests over an in-memory transport.
//!
//! `MockTransport` hands the test the node's end of every connection the
//! client opens, so each test plays the node: it reads requests, answers
//! them and injects pushes.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time;

use chainstream_core::error::{CloseReason, StreamError, SubscriptionError, TransportError};
use chainstream_core::transport::{Connection, InboundFrame, OutboundFrame, PeerEnd, Transport};
use chainstream_core::{AttributeEncoding, ReconnectConfig};
use chainstream_ws::{
    ConnectionState, Notification, StreamClient, StreamClientConfig, Termination,
};

// ─── Helpers ──────────────────────────────────────────────────────────────────

struct MockTransport {
    opens: AtomicUsize,
    fail: AtomicBool,
    invalid: AtomicBool,
    capacity: AtomicUsize,
    peers: mpsc::UnboundedSender<PeerEnd>,
}

impl MockTransport {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<PeerEnd>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            opens: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            invalid: AtomicBool::new(false),
            capacity: AtomicUsize::new(64),
            peers,
        });
        (transport, rx)
    }

    fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Reject every endpoint as unusable, which no reconnect can fix.
    fn set_invalid(&self) {
        self.invalid.store(true, Ordering::SeqCst);
    }

    fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, endpoint: &str) -> Result<Connection, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.invalid.load(Ordering::SeqCst) {
            return Err(TransportError::InvalidEndpoint(endpoint.to_string()));
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectFailed {
                url: endpoint.to_string(),
                reason: "connection refused".into(),
            });
        }
        let (connection, peer) = Connection::pair(self.capacity.load(Ordering::SeqCst));
        let _ = self.peers.send(peer);
        Ok(connection)
    }
}

fn fast_config() -> StreamClientConfig {
    StreamClientConfig {
        reconnect: ReconnectConfig {
            base_delay_ms: 1,
            multiplier: 2,
            max_delay_ms: 8,
            max_attempts: 5,
        },
        heartbeat_interval_ms: 60_000,
        heartbeat_timeout_ms: 1_000,
        connect_timeout_ms: 1_000,
        request_timeout_ms: 2_000,
        attribute_encoding: AttributeEncoding::Base64,
        channel_capacity: 64,
    }
}

async fn start(config: StreamClientConfig) -> (StreamClient, Arc<MockTransport>, mpsc::UnboundedReceiver<PeerEnd>) {
    let (transport, peers) = MockTransport::new();
    let client = StreamClient::connect_with("mock://node/websocket", config, transport.clone())
        .await
        .unwrap();
    (client, transport, peers)
}

async fn next_peer(peers: &mut mpsc::UnboundedReceiver<PeerEnd>) -> PeerEnd {
    time::timeout(Duration::from_secs(2), peers.recv())
        .await
        .expect("timed out waiting for a connection")
        .expect("transport dropped")
}

/// Next JSON-RPC request the client wrote, skipping liveness pings.
async fn next_request(peer: &mut PeerEnd) -> Value {
    loop {
        let frame = time::timeout(Duration::from_secs(2), peer.outbound.recv())
            .await
            .expect("timed out waiting for a request")
            .expect("connection closed");
        if let OutboundFrame::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Returns `true` if no request arrives within `wait`.
async fn no_request_within(peer: &mut PeerEnd, wait: Duration) -> bool {
    let deadline = time::Instant::now() + wait;
    loop {
        match time::timeout_at(deadline, peer.outbound.recv()).await {
            Err(_) => return true,
            Ok(Some(OutboundFrame::Ping)) => continue,
            Ok(_) => return false,
        }
    }
}

async fn send(peer: &PeerEnd, frame: Value) {
    send_raw(peer, frame.to_string().into_bytes()).await;
}

async fn send_raw(peer: &PeerEnd, frame: Vec<u8>) {
    peer.inbound.send(InboundFrame::Data(Bytes::from(frame))).await.unwrap();
}

async fn ack(peer: &PeerEnd, id: &Value) {
    send(peer, json!({"jsonrpc": "2.0", "id": id, "result": {}})).await;
}

/// Poll until the transport has been opened `n` times.
async fn wait_for_opens(transport: &MockTransport, n: usize) -> bool {
    let deadline = time::Instant::now() + Duration::from_secs(2);
    while time::Instant::now() < deadline {
        if transport.opens() >= n {
            return true;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    transport.opens() >= n
}

fn b64(s: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(s)
}

fn tx_push(query: &str, attributes: &[(&str, &str)]) -> Value {
    let attributes: Vec<Value> = attributes
        .iter()
        .map(|(k, v)| json!({"key": b64(k), "value": b64(v)}))
        .collect();
    json!({
        "jsonrpc": "2.0",
        "result": {
            "query": query,
            "data": {
                "type": "tendermint/event/Tx",
                "value": {"attributes": attributes}
            }
        }
    })
}

fn collector() -> (
    impl Fn(&Notification) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<Notification>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (move |n: &Notification| {
        let _ = tx.send(n.clone());
    }, rx)
}

async fn next_notification(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Notification {
    time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a notification")
        .expect("subscription dropped")
}

// ─── Event delivery ───────────────────────────────────────────────────────────

#[tokio::test]
async fn push_with_base64_attributes_reaches_callback() {
    let (client, _transport, mut peers) = start(fast_config()).await;
    let (callback, mut events) = collector();
    client.subscribe("tm.event='Tx'", callback).unwrap();

    let mut peer = next_peer(&mut peers).await;
    let request = next_request(&mut peer).await;
    assert_eq!(request["jsonrpc"], "2.0");
    assert_eq!(request["method"], "subscribe");
    assert_eq!(request["params"]["query"], "tm.event='Tx'");
    assert_eq!(request["id"].as_str().map(str::len), Some(9));
    ack(&peer, &request["id"]).await;

    send(
        &peer,
        tx_push("tm.event='Tx'", &[("sender", "akash1abc"), ("amount", "100uakt")]),
    )
    .await;

    let Notification::Event(event) = next_notification(&mut events).await else {
        panic!("expected an event");
    };
    assert_eq!(event.kind, "tendermint/event/Tx");
    assert_eq!(
        event.attributes,
        vec![
            ("sender".to_string(), "akash1abc".to_string()),
            ("amount".to_string(), "100uakt".to_string()),
        ]
    );
    assert!(client.registry().is_confirmed("tm.event='Tx'"));
}

#[tokio::test]
async fn push_for_unknown_query_is_dropped() {
    let (client, _transport, mut peers) = start(fast_config()).await;
    let (callback, mut events) = collector();
    client.subscribe("tm.event='NewBlock'", callback).unwrap();

    let mut peer = next_peer(&mut peers).await;
    let request = next_request(&mut peer).await;
    ack(&peer, &request["id"]).await;

    send(&peer, tx_push("tm.event='Tx'", &[("stale", "1")])).await;
    send(&peer, tx_push("tm.event='NewBlock'", &[("fresh", "2")])).await;

    let Notification::Event(event) = next_notification(&mut events).await else {
        panic!("expected an event");
    };
    assert_eq!(event.attribute("fresh"), Some("2"));
    assert!(events.try_recv().is_err());
    assert_eq!(client.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn malformed_frames_do_not_break_the_stream() {
    let (client, transport, mut peers) = start(fast_config()).await;
    let (callback, mut events) = collector();
    client.subscribe("q", callback).unwrap();

    let mut peer = next_peer(&mut peers).await;
    next_request(&mut peer).await;

    send_raw(&peer, vec![0x00, 0xff, 0x13, 0x37]).await;
    send_raw(&peer, b"[1, 2, 3]".to_vec()).await;
    send(&peer, json!({"jsonrpc": "1.0", "id": 1, "result": {}})).await;
    send(&peer, json!({"jsonrpc": "2.0"})).await;
    send(&peer, tx_push("q", &[("ok", "yes")])).await;

    let Notification::Event(event) = next_notification(&mut events).await else {
        panic!("expected an event");
    };
    assert_eq!(event.attribute("ok"), Some("yes"));
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(transport.opens(), 1);
}

#[tokio::test]
async fn rejected_subscription_notifies_its_callbacks_and_is_removed() {
    let (client, _transport, mut peers) = start(fast_config()).await;
    let (first, mut first_rx) = collector();
    let (second, mut second_rx) = collector();
    let (other, mut other_rx) = collector();
    client.subscribe("bad query", first).unwrap();
    client.subscribe("bad query", second).unwrap();
    client.subscribe("tm.event='Tx'", other).unwrap();

    let mut peer = next_peer(&mut peers).await;
    let bad = next_request(&mut peer).await;
    assert_eq!(bad["params"]["query"], "bad query");
    next_request(&mut peer).await;

    send(
        &peer,
        json!({
            "jsonrpc": "2.0",
            "id": bad["id"],
            "error": {"code": -32603, "message": "failed to parse query"}
        }),
    )
    .await;

    let expected = Notification::Error(SubscriptionError::Rejected {
        query: "bad query".into(),
        code: -32603,
        message: "failed to parse query".into(),
    });
    assert_eq!(next_notification(&mut first_rx).await, expected);
    assert_eq!(next_notification(&mut second_rx).await, expected);
    assert!(!client.registry().contains("bad query"));
    assert!(client.registry().contains("tm.event='Tx'"));
    assert!(other_rx.try_recv().is_err());
}

// ─── Reconnection ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn reconnect_replays_one_request_per_query_in_order() {
    let (client, transport, mut peers) = start(fast_config()).await;
    let mut handles = vec![
        client.subscribe("q1", |_: &Notification| {}).unwrap(),
        client.subscribe("q1", |_: &Notification| {}).unwrap(),
        client.subscribe("q2", |_: &Notification| {}).unwrap(),
        client.subscribe("q3", |_: &Notification| {}).unwrap(),
    ];

    let mut first = next_peer(&mut peers).await;
    for expected in ["q1", "q2", "q3"] {
        let request = next_request(&mut first).await;
        assert_eq!(request["params"]["query"], expected);
        ack(&first, &request["id"]).await;
    }

    // Drop q3 while connected; it must not come back.
    assert!(handles.pop().unwrap().unsubscribe());
    let unsubscribe = next_request(&mut first).await;
    assert_eq!(unsubscribe["method"], "unsubscribe");
    assert_eq!(unsubscribe["params"]["query"], "q3");

    first
        .inbound
        .send(InboundFrame::Closed(CloseReason::NetworkReset("reset by peer".into())))
        .await
        .unwrap();
    drop(first);

    let mut second = next_peer(&mut peers).await;
    let mut replayed = Vec::new();
    for _ in 0..2 {
        let request = next_request(&mut second).await;
        assert_eq!(request["method"], "subscribe");
        replayed.push(request["params"]["query"].as_str().unwrap().to_string());
    }
    assert_eq!(replayed, vec!["q1", "q2"]);
    assert!(no_request_within(&mut second, Duration::from_millis(100)).await);
    assert_eq!(transport.opens(), 2);
    assert_eq!(client.registry().callback_count("q1"), 2);
}

#[tokio::test]
async fn exhausted_budget_fails_every_subscription_exactly_once() {
    let (transport, _peers) = MockTransport::new();
    transport.set_failing(true);

    let failures = Arc::new(AtomicUsize::new(0));
    let seen_attempts = Arc::new(AtomicUsize::new(0));
    let client = StreamClient::connect_with("mock://down", fast_config(), transport.clone())
        .await
        .unwrap();

    for query in ["q1", "q1", "q2"] {
        let failures = Arc::clone(&failures);
        let seen_attempts = Arc::clone(&seen_attempts);
        client
            .subscribe(query, move |n: &Notification| {
                if let Notification::Error(SubscriptionError::PermanentFailure { attempts }) = n {
                    failures.fetch_add(1, Ordering::SeqCst);
                    seen_attempts.store(*attempts as usize, Ordering::SeqCst);
                }
            })
            .unwrap();
    }

    let termination = time::timeout(Duration::from_secs(5), client.terminated())
        .await
        .expect("client should give up");
    assert_eq!(termination, Termination::PermanentFailure { attempts: 5 });

    time::sleep(Duration::from_millis(50)).await;
    assert_eq!(failures.load(Ordering::SeqCst), 3);
    assert_eq!(seen_attempts.load(Ordering::SeqCst), 5);
    assert_eq!(transport.opens(), 5);
    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(client.registry().is_empty());

    assert!(matches!(
        client.wait_connected().await,
        Err(StreamError::Subscription(SubscriptionError::PermanentFailure { attempts: 5 }))
    ));
    assert!(matches!(
        client.subscribe("q3", |_: &Notification| {}),
        Err(StreamError::Closed)
    ));
}

#[tokio::test]
async fn silent_connection_is_replaced_by_heartbeat() {
    let config = StreamClientConfig {
        heartbeat_interval_ms: 20,
        heartbeat_timeout_ms: 20,
        ..fast_config()
    };
    let (client, transport, mut peers) = start(config).await;
    client.subscribe("q", |_: &Notification| {}).unwrap();

    let mut first = next_peer(&mut peers).await;
    assert_eq!(next_request(&mut first).await["params"]["query"], "q");

    // Never answer the ping; the controller must give up on this connection.
    let mut second = next_peer(&mut peers).await;
    assert_eq!(next_request(&mut second).await["params"]["query"], "q");
    assert!(transport.opens() >= 2);
    assert!(client.termination().is_none());
}

#[tokio::test]
async fn peer_that_stops_reading_is_replaced() {
    let config = StreamClientConfig {
        heartbeat_interval_ms: 20,
        heartbeat_timeout_ms: 20,
        ..fast_config()
    };
    let (transport, _peers) = MockTransport::new();
    transport.set_capacity(1);
    let client = StreamClient::connect_with("mock://stuck", config, transport.clone())
        .await
        .unwrap();
    client.subscribe("q", |_: &Notification| {}).unwrap();

    // `_peers` holds every node end unread. The subscribe request fills the
    // one-frame buffer, so the next liveness ping cannot be queued.
    assert!(
        wait_for_opens(&transport, 2).await,
        "a connection nobody reads from was never dropped"
    );
    assert!(client.termination().is_none());
    assert!(client.registry().contains("q"));
}

#[tokio::test]
async fn responsive_connection_survives_heartbeats() {
    let config = StreamClientConfig {
        heartbeat_interval_ms: 10,
        heartbeat_timeout_ms: 30,
        ..fast_config()
    };
    let (client, transport, mut peers) = start(config).await;
    let mut peer = next_peer(&mut peers).await;

    let answered = tokio::spawn(async move {
        let mut pings = 0;
        while let Some(frame) = peer.outbound.recv().await {
            if frame == OutboundFrame::Ping {
                pings += 1;
                if peer.inbound.send(InboundFrame::Pong).await.is_err() || pings == 10 {
                    break;
                }
            }
        }
        (pings, peer)
    });

    let (pings, _peer) = time::timeout(Duration::from_secs(5), answered)
        .await
        .expect("pings should keep coming")
        .unwrap();
    assert_eq!(pings, 10);
    assert_eq!(transport.opens(), 1);
    assert_eq!(client.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn subscription_made_while_down_is_sent_on_connect() {
    let config = StreamClientConfig {
        reconnect: ReconnectConfig {
            base_delay_ms: 5,
            multiplier: 1,
            max_delay_ms: 5,
            max_attempts: 1_000,
        },
        ..fast_config()
    };
    let (transport, mut peers) = MockTransport::new();
    transport.set_failing(true);
    let client = StreamClient::connect_with("mock://flaky", config, transport.clone())
        .await
        .unwrap();

    let handle = client.subscribe("tm.event='Tx'", |_: &Notification| {}).unwrap();
    time::sleep(Duration::from_millis(20)).await;
    assert_ne!(client.state(), ConnectionState::Connected);
    transport.set_failing(false);

    let mut peer = next_peer(&mut peers).await;
    let request = next_request(&mut peer).await;
    assert_eq!(request["params"]["query"], "tm.event='Tx'");
    assert_eq!(request["id"].as_str(), Some(handle.id().as_str()));
    client.wait_connected().await.unwrap();
}

// ─── Calls and lifecycle ──────────────────────────────────────────────────────

#[tokio::test]
async fn call_round_trips_and_decodes_result() {
    let (client, _transport, mut peers) = start(fast_config()).await;
    let mut peer = next_peer(&mut peers).await;
    client.wait_connected().await.unwrap();

    let node = async move {
        let request = next_request(&mut peer).await;
        assert_eq!(request["method"], "status");
        assert!(request["id"].is_u64());
        send(
            &peer,
            json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "result": {"node_info": {"network": "akashnet-2"}}
            }),
        )
        .await;
        peer
    };

    let (result, _peer) = tokio::join!(client.call::<Value>("status", json!({})), node);
    assert_eq!(result.unwrap()["node_info"]["network"], "akashnet-2");
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn call_error_reply_is_surfaced() {
    let (client, _transport, mut peers) = start(fast_config()).await;
    let mut peer = next_peer(&mut peers).await;
    client.wait_connected().await.unwrap();

    let node = async move {
        let request = next_request(&mut peer).await;
        send(
            &peer,
            json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "error": {"code": -32601, "message": "Method not found"}
            }),
        )
        .await;
        peer
    };

    let (result, _peer) = tokio::join!(client.call::<Value>("nope", json!({})), node);
    match result {
        Err(StreamError::Rpc(error)) => assert_eq!(error.code, -32601),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn timed_out_calls_leave_nothing_pending() {
    let config = StreamClientConfig {
        request_timeout_ms: 50,
        ..fast_config()
    };
    let (client, transport, mut peers) = start(config).await;
    let mut peer = next_peer(&mut peers).await;
    client.wait_connected().await.unwrap();

    // Read every request, answer none.
    let drained = tokio::spawn(async move {
        let mut requests = 0;
        while let Some(frame) = peer.outbound.recv().await {
            if matches!(frame, OutboundFrame::Text(_)) {
                requests += 1;
            }
        }
        requests
    });

    for _ in 0..20 {
        let result = client.call::<Value>("status", json!({})).await;
        assert!(
            matches!(result, Err(StreamError::Timeout { ms: 50 })),
            "unexpected result: {result:?}"
        );
    }
    assert_eq!(client.pending_requests(), 0);
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(transport.opens(), 1);

    client.close();
    let requests = time::timeout(Duration::from_secs(2), drained)
        .await
        .expect("peer should see the connection close")
        .unwrap();
    assert_eq!(requests, 20);
}

#[tokio::test]
async fn unusable_endpoint_fails_without_retrying() {
    let (transport, _peers) = MockTransport::new();
    transport.set_invalid();
    let client = StreamClient::connect_with("mock://nowhere", fast_config(), transport.clone())
        .await
        .unwrap();
    let (callback, mut events) = collector();
    client.subscribe("q", callback).unwrap();

    let termination = time::timeout(Duration::from_secs(2), client.terminated())
        .await
        .expect("client should give up");
    assert_eq!(termination, Termination::PermanentFailure { attempts: 1 });
    assert_eq!(transport.opens(), 1);
    assert_eq!(
        next_notification(&mut events).await,
        Notification::Error(SubscriptionError::PermanentFailure { attempts: 1 })
    );
}

#[tokio::test]
async fn call_requires_a_connection() {
    let (transport, _peers) = MockTransport::new();
    transport.set_failing(true);
    let client = StreamClient::connect_with("mock://down", fast_config(), transport)
        .await
        .unwrap();

    let result = client.call::<Value>("status", json!({})).await;
    assert!(matches!(
        result,
        Err(StreamError::Transport(TransportError::NotConnected))
    ));
}

#[tokio::test]
async fn wait_for_tx_resolves_and_unsubscribes() {
    let (client, _transport, mut peers) = start(fast_config()).await;
    let mut peer = next_peer(&mut peers).await;
    client.wait_connected().await.unwrap();

    let node = async move {
        let request = next_request(&mut peer).await;
        let query = "tm.event='Tx' AND tx.hash='ABC123'";
        assert_eq!(request["params"]["query"], query);
        ack(&peer, &request["id"]).await;
        send(
            &peer,
            json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "result": {
                    "query": query,
                    "data": {
                        "type": "tendermint/event/Tx",
                        "value": {"TxResult": {"height": "42", "result": {"events": [
                            {"type": "transfer", "attributes": [{"key": b64("amount"), "value": b64("5uakt")}]}
                        ]}}}
                    },
                    "events": {"tx.hash": ["ABC123"]}
                }
            }),
        )
        .await;
        let unsubscribe = next_request(&mut peer).await;
        (unsubscribe, peer)
    };

    let (event, (unsubscribe, _peer)) =
        tokio::join!(client.wait_for_tx("abc123", Duration::from_secs(2)), node);
    let event = event.unwrap();
    assert_eq!(event.source_height, Some(42));
    assert_eq!(event.source_tx_hash.as_deref(), Some("ABC123"));
    assert_eq!(event.attribute("amount"), Some("5uakt"));
    assert_eq!(unsubscribe["method"], "unsubscribe");
    assert!(client.registry().is_empty());
}

#[tokio::test]
async fn close_is_idempotent_and_fails_pending_calls() {
    let (client, _transport, mut peers) = start(fast_config()).await;
    let (callback, mut events) = collector();
    client.subscribe("q", callback).unwrap();
    let mut peer = next_peer(&mut peers).await;
    next_request(&mut peer).await;
    client.wait_connected().await.unwrap();

    let closer = async {
        let request = next_request(&mut peer).await;
        assert_eq!(request["method"], "status");
        client.close();
        client.close();
    };
    let (result, ()) = tokio::join!(client.call::<Value>("status", json!({})), closer);

    assert!(matches!(result, Err(StreamError::Closed)));
    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(client.termination(), Some(Termination::Closed));
    assert!(client.registry().is_empty());
    assert_eq!(client.pending_requests(), 0);
    assert!(matches!(
        client.subscribe("q", |_: &Notification| {}),
        Err(StreamError::Closed)
    ));
    // Close clears subscriptions silently.
    assert!(time::timeout(Duration::from_millis(50), events.recv())
        .await
        .map_or(true, |n| n.is_none()));
}
