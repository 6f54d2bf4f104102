//! Integration tests for the client lifecycle.
//!
//! Every test drives the far end of the socket through a `MemoryPeer`, so
//! connection opening, replies, errors and closes happen exactly when the test
//! says so. Timing-sensitive tests run with tokio's paused clock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use connectme::transport::memory::MemoryListener;
use connectme::transport::MemoryPeer;
use connectme::{
    Client, ClientConfig, ClientError, Codec, ConnectionState, Handler, HandlerFuture, Inbound,
    JsonCodec, Kind, MemoryTransport, Message, Payload, QueryError, ReconnectPolicy, Schema,
    TransactionId,
};

const SETTLE: Duration = Duration::from_millis(10);

#[derive(Debug, Serialize, Deserialize)]
struct Ping {
    id: TransactionId,
}

impl Message for Ping {
    fn transaction_id(&self) -> TransactionId {
        self.id
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Pong {
    id: TransactionId,
    note: String,
}

impl Message for Pong {
    fn transaction_id(&self) -> TransactionId {
        self.id
    }
}

/// Message type the client never registers.
#[derive(Debug)]
struct Unregistered;

impl Message for Unregistered {
    fn transaction_id(&self) -> TransactionId {
        0
    }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn peer_codec() -> JsonCodec {
    let mut codec = JsonCodec::new();
    codec.register(Schema::of::<Ping>("ping"));
    codec.register(Schema::of::<Pong>("pong"));
    codec
}

/// Client wired to a memory transport with recorded callbacks.
struct Harness {
    client: Client,
    listener: MemoryListener,
    errors: Arc<Mutex<Vec<ClientError>>>,
    connects: Arc<AtomicUsize>,
    disconnects: Arc<AtomicUsize>,
}

impl Harness {
    fn new(config: ClientConfig) -> Self {
        init_logging();
        let (transport, listener) = MemoryTransport::pair();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let connects = Arc::new(AtomicUsize::new(0));
        let disconnects = Arc::new(AtomicUsize::new(0));

        let client = Client::builder(config)
            .transport(transport)
            .on_error({
                let errors = Arc::clone(&errors);
                move |e| errors.lock().unwrap().push(e.clone())
            })
            .on_connect({
                let connects = Arc::clone(&connects);
                move || {
                    connects.fetch_add(1, Ordering::SeqCst);
                }
            })
            .on_disconnect({
                let disconnects = Arc::clone(&disconnects);
                move || {
                    disconnects.fetch_add(1, Ordering::SeqCst);
                }
            })
            .build();
        client.register(Schema::of::<Ping>("ping"));
        client.register(Schema::of::<Pong>("pong"));

        Self {
            client,
            listener,
            errors,
            connects,
            disconnects,
        }
    }

    /// Connect and return the opened peer.
    async fn connect(&mut self) -> MemoryPeer {
        let connecting = tokio::spawn({
            let client = self.client.clone();
            async move { client.connect().await }
        });
        let peer = self.listener.accept().await.unwrap();
        assert!(peer.open());
        connecting.await.unwrap().unwrap();
        peer
    }

    fn errors(&self) -> Vec<ClientError> {
        self.errors.lock().unwrap().clone()
    }
}

/// Handler that records `name:text` synchronously, in invocation order.
fn recorder(log: &Arc<Mutex<Vec<String>>>, name: &'static str) -> Handler {
    let log = Arc::clone(log);
    Arc::new(move |inbound: Inbound| -> HandlerFuture {
        let label = match &inbound {
            Inbound::Text(text) => text.clone(),
            Inbound::Binary(data) => format!("{} bytes", data.len()),
            Inbound::Message(message) => format!("message {}", message.transaction_id()),
        };
        log.lock().unwrap().push(format!("{name}:{label}"));
        Box::pin(async { Ok::<(), anyhow::Error>(()) })
    })
}

async fn recv_ping(peer: &mut MemoryPeer, codec: &JsonCodec) -> TransactionId {
    match peer.recv().await {
        Some(Payload::Binary(bytes)) => {
            let message = codec.decode(&bytes).expect("client sent an undecodable frame");
            message.downcast_ref::<Ping>().expect("expected a ping").id
        }
        other => panic!("expected a binary frame, got {other:?}"),
    }
}

fn pong(codec: &JsonCodec, id: TransactionId, note: &str) -> bytes::Bytes {
    codec
        .encode(&Pong {
            id,
            note: note.to_string(),
        })
        .unwrap()
}

#[tokio::test]
async fn test_query_end_to_end() {
    let mut harness = Harness::new(ClientConfig::new("mem://server"));
    let mut peer = harness.connect().await;
    let codec = peer_codec();

    let handle = harness.client.query::<Pong>(&Ping { id: 7 });
    assert_eq!(handle.transaction_id(), Some(7));
    assert!(harness.client.is_pending(7));

    assert_eq!(recv_ping(&mut peer, &codec).await, 7);
    peer.send_binary(pong(&codec, 7, "hello"));

    let reply = handle.await.unwrap();
    assert_eq!(reply.id, 7);
    assert_eq!(reply.note, "hello");
    assert!(!harness.client.is_pending(7));
    assert_eq!(harness.client.pending_queries(), 0);
}

#[tokio::test]
async fn test_reply_is_not_dispatched() {
    let mut harness = Harness::new(ClientConfig::new("mem://server"));
    let mut peer = harness.connect().await;
    let codec = peer_codec();
    let log = Arc::new(Mutex::new(Vec::new()));
    harness
        .client
        .listen(Kind::of::<Pong>(), recorder(&log, "pong"));

    let handle = harness.client.query::<Pong>(&Ping { id: 3 });
    recv_ping(&mut peer, &codec).await;
    peer.send_binary(pong(&codec, 3, "reply"));
    handle.await.unwrap();

    peer.send_binary(pong(&codec, 99, "unsolicited"));
    tokio::time::sleep(SETTLE).await;

    assert_eq!(*log.lock().unwrap(), vec!["pong:message 99"]);
}

#[tokio::test]
async fn test_query_while_disconnected_fails_immediately() {
    let harness = Harness::new(ClientConfig::new("mem://server"));

    let result = harness.client.query::<Pong>(&Ping { id: 1 }).await;

    assert!(matches!(result, Err(QueryError::NotSent(_))));
    assert!(!harness.client.is_pending(1));
    assert_eq!(harness.client.pending_queries(), 0);
    assert!(matches!(
        harness.errors().as_slice(),
        [ClientError::Query(QueryError::NotSent(_))]
    ));
}

#[tokio::test]
async fn test_duplicate_transaction_rejected() {
    let mut harness = Harness::new(ClientConfig::new("mem://server"));
    let _peer = harness.connect().await;

    let first = harness.client.query::<Pong>(&Ping { id: 4 });
    let second = harness.client.query::<Pong>(&Ping { id: 4 }).await;

    assert_eq!(second.unwrap_err(), QueryError::DuplicateTransaction(4));
    assert!(harness.client.is_pending(4));
    drop(first);
}

#[tokio::test(start_paused = true)]
async fn test_query_times_out() {
    let mut harness = Harness::new(ClientConfig::new("mem://server").with_query_timeout_secs(1));
    let _peer = harness.connect().await;

    let mut handle = harness.client.query::<Pong>(&Ping { id: 1 });
    assert!(
        tokio::time::timeout(Duration::from_millis(500), &mut handle)
            .await
            .is_err(),
        "query resolved before its timeout"
    );

    let result = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("query was never swept");
    assert_eq!(result.unwrap_err(), QueryError::Timeout(1));
    assert!(!harness.client.is_pending(1));
}

#[tokio::test(start_paused = true)]
async fn test_close_event_cancels_queries_before_reconnect() {
    let mut harness = Harness::new(ClientConfig::new("mem://server"));
    let peer = harness.connect().await;

    let a = harness.client.query::<Pong>(&Ping { id: 1 });
    let b = harness.client.query::<Pong>(&Ping { id: 2 });
    peer.close(1006, "connection lost");

    assert_eq!(a.await.unwrap_err(), QueryError::Cancelled(1));
    assert_eq!(b.await.unwrap_err(), QueryError::Cancelled(2));
    assert!(harness.listener.try_accept().is_none());
    assert_eq!(harness.disconnects.load(Ordering::SeqCst), 1);
    assert!(matches!(
        harness.client.state(),
        ConnectionState::Reconnecting { attempt: 1, .. }
    ));
    assert!(harness.errors().iter().any(|e| matches!(
        e,
        ClientError::Reconnecting { delay_ms: 3000, .. }
    )));

    tokio::time::sleep(Duration::from_secs(3)).await;
    let second = harness.listener.accept().await.unwrap();
    assert!(second.open());
    tokio::time::sleep(SETTLE).await;

    assert_eq!(harness.client.state(), ConnectionState::Connected);
    assert_eq!(harness.connects.load(Ordering::SeqCst), 2);
    assert_eq!(harness.disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_retries_until_open() {
    let mut harness = Harness::new(
        ClientConfig::new("mem://server").with_reconnect(ReconnectPolicy::Fixed { delay_ms: 100 }),
    );
    let peer = harness.connect().await;
    peer.close(1006, "lost");

    for _ in 0..3 {
        let attempt = harness.listener.accept().await.unwrap();
        attempt.close(1006, "still down");
    }
    let last = harness.listener.accept().await.unwrap();
    assert!(last.open());
    tokio::time::sleep(SETTLE).await;

    assert_eq!(harness.client.state(), ConnectionState::Connected);
    assert_eq!(harness.disconnects.load(Ordering::SeqCst), 4);
}

#[tokio::test(start_paused = true)]
async fn test_close_suppresses_scheduled_reconnect() {
    let mut harness = Harness::new(ClientConfig::new("mem://server"));
    let peer = harness.connect().await;

    peer.close(1006, "connection lost");
    tokio::time::sleep(SETTLE).await;
    assert!(matches!(
        harness.client.state(),
        ConnectionState::Reconnecting { .. }
    ));

    harness.client.close().await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert!(harness.listener.try_accept().is_none());
    assert_eq!(harness.client.state(), ConnectionState::Closed);
    assert_eq!(harness.disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_close_waits_for_acknowledgment() {
    let mut harness = Harness::new(ClientConfig::new("mem://server"));
    let peer = harness.connect().await;
    peer.set_auto_close_ack(false);
    let pending = harness.client.query::<Pong>(&Ping { id: 8 });

    let closing = tokio::spawn({
        let client = harness.client.clone();
        async move { client.close().await }
    });
    tokio::time::sleep(SETTLE).await;
    assert_eq!(harness.client.state(), ConnectionState::Closing);
    assert!(!closing.is_finished());

    assert!(peer.close(1000, "bye"));
    closing.await.unwrap();

    assert_eq!(harness.client.state(), ConnectionState::Closed);
    assert_eq!(pending.await.unwrap_err(), QueryError::Cancelled(8));
    assert_eq!(harness.disconnects.load(Ordering::SeqCst), 1);
    assert!(harness.listener.try_accept().is_none());
}

#[tokio::test]
async fn test_concurrent_close_waits_for_same_acknowledgment() {
    let mut harness = Harness::new(ClientConfig::new("mem://server"));
    let peer = harness.connect().await;
    peer.set_auto_close_ack(false);

    let first = tokio::spawn({
        let client = harness.client.clone();
        async move { client.close().await }
    });
    tokio::time::sleep(SETTLE).await;
    let second = tokio::spawn({
        let client = harness.client.clone();
        async move { client.close().await }
    });
    tokio::time::sleep(SETTLE).await;

    assert!(!first.is_finished());
    assert!(!second.is_finished());
    assert_eq!(harness.client.state(), ConnectionState::Closing);

    assert!(peer.close(1000, "bye"));
    first.await.unwrap();
    second.await.unwrap();
    assert_eq!(harness.client.state(), ConnectionState::Closed);
    assert_eq!(harness.disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_late_close_of_previous_socket_leaves_new_connection_alone() {
    let mut harness = Harness::new(ClientConfig::new("mem://server"));
    let old_peer = harness.connect().await;

    // The drop is still queued when close() finds the socket already closed.
    old_peer.close(1006, "dropped");
    harness.client.close().await;

    let client = harness.client.clone();
    let listener = &mut harness.listener;
    let (connected, new_peer) = tokio::join!(client.connect(), async {
        let peer = listener.accept().await.unwrap();
        assert!(peer.open());
        peer
    });
    connected.unwrap();
    let pending = harness.client.query::<Pong>(&Ping { id: 5 });
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(harness.client.state(), ConnectionState::Connected);
    assert!(harness.client.is_pending(5));
    assert!(!harness
        .errors()
        .iter()
        .any(|e| matches!(e, ClientError::Reconnecting { .. })));
    assert!(harness.listener.try_accept().is_none());
    assert_eq!(new_peer.ready_state(), connectme::ReadyState::Open);
    drop(pending);
}

#[tokio::test]
async fn test_close_without_reconnect_goes_disconnected() {
    let mut harness = Harness::new(ClientConfig::new("mem://server").with_auto_reconnect(false));
    let peer = harness.connect().await;

    peer.close(1001, "going away");
    tokio::time::sleep(SETTLE).await;

    assert_eq!(harness.client.state(), ConnectionState::Disconnected);
    assert_eq!(harness.disconnects.load(Ordering::SeqCst), 1);
    assert!(harness.listener.try_accept().is_none());

    let _again = harness.connect().await;
    assert_eq!(harness.client.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_dispatch_order_and_cancel() {
    let mut harness = Harness::new(ClientConfig::new("mem://server"));
    let peer = harness.connect().await;
    let log = Arc::new(Mutex::new(Vec::new()));
    let h1 = recorder(&log, "h1");
    let h2 = recorder(&log, "h2");
    harness.client.listen(Kind::Text, Arc::clone(&h1));
    harness.client.listen(Kind::Text, Arc::clone(&h2));

    peer.send_text("a");
    peer.send_text("b");
    tokio::time::sleep(SETTLE).await;
    assert_eq!(*log.lock().unwrap(), vec!["h1:a", "h2:a", "h1:b", "h2:b"]);

    assert!(harness.client.cancel(Kind::Text, &h1));
    assert!(!harness.client.cancel(Kind::Text, &h1));
    peer.send_text("c");
    tokio::time::sleep(SETTLE).await;
    assert_eq!(log.lock().unwrap().last().map(String::as_str), Some("h2:c"));
    assert_eq!(log.lock().unwrap().len(), 5);
}

#[tokio::test]
async fn test_inbound_routed_by_kind() {
    let mut harness = Harness::new(ClientConfig::new("mem://server"));
    let peer = harness.connect().await;
    let codec = peer_codec();
    let log = Arc::new(Mutex::new(Vec::new()));
    harness.client.listen(Kind::Text, recorder(&log, "text"));
    harness.client.listen(Kind::Binary, recorder(&log, "binary"));
    harness
        .client
        .listen(Kind::of::<Pong>(), recorder(&log, "pong"));
    harness
        .client
        .listen(Kind::of::<Ping>(), recorder(&log, "ping"));

    peer.send_text("hi");
    peer.send_binary(vec![0xde, 0xad, 0xbe]);
    peer.send_binary(pong(&codec, 12, "push"));
    tokio::time::sleep(SETTLE).await;

    assert_eq!(
        *log.lock().unwrap(),
        vec!["text:hi", "binary:3 bytes", "pong:message 12"]
    );
}

#[tokio::test]
async fn test_failing_handler_is_reported_and_isolated() {
    let mut harness = Harness::new(ClientConfig::new("mem://server"));
    let peer = harness.connect().await;
    let log = Arc::new(Mutex::new(Vec::new()));
    harness.client.listen(
        Kind::Text,
        connectme::handler(|_| async { Err::<(), _>(anyhow::anyhow!("handler broke")) }),
    );
    harness.client.listen(Kind::Text, recorder(&log, "after"));

    peer.send_text("x");
    peer.send_text("y");
    tokio::time::sleep(SETTLE).await;

    assert_eq!(*log.lock().unwrap(), vec!["after:x", "after:y"]);
    let failures = harness
        .errors()
        .into_iter()
        .filter(|e| matches!(e, ClientError::HandlerFailed { kind: Kind::Text, .. }))
        .count();
    assert_eq!(failures, 2);
}

#[tokio::test]
async fn test_send_variants() {
    let mut harness = Harness::new(ClientConfig::new("mem://server"));
    let mut peer = harness.connect().await;
    let codec = peer_codec();

    harness.client.send("plain");
    harness.client.send(&[1u8, 2, 3][..]);
    harness.client.send_message(&Ping { id: 21 });
    harness.client.send_message(&Unregistered);

    assert_eq!(peer.recv().await, Some(Payload::Text("plain".to_string())));
    assert_eq!(
        peer.recv().await,
        Some(Payload::Binary(bytes::Bytes::from_static(&[1, 2, 3])))
    );
    assert_eq!(recv_ping(&mut peer, &codec).await, 21);
    assert!(peer.try_recv().is_none());
    assert!(matches!(
        harness.errors().as_slice(),
        [ClientError::UnsupportedPayload(_)]
    ));
}

#[tokio::test]
async fn test_send_while_disconnected_is_reported() {
    let harness = Harness::new(ClientConfig::new("mem://server"));
    harness.client.send("nobody home");
    assert!(matches!(
        harness.errors().as_slice(),
        [ClientError::SendFailed(_)]
    ));
}

#[tokio::test]
async fn test_transport_error_surfaces_without_state_change() {
    let mut harness = Harness::new(ClientConfig::new("mem://server"));
    let peer = harness.connect().await;

    peer.error("frame too large");
    tokio::time::sleep(SETTLE).await;

    assert_eq!(
        harness.errors(),
        vec![ClientError::Transport("frame too large".to_string())]
    );
    assert_eq!(harness.client.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_protocols_and_address_reach_transport() {
    let mut harness = Harness::new(
        ClientConfig::new("mem://server/socket").with_protocols(["chat.v2", "chat.v1"]),
    );
    let peer = harness.connect().await;
    assert_eq!(peer.address(), "mem://server/socket");
    assert_eq!(
        peer.protocols().to_vec(),
        vec!["chat.v2".to_string(), "chat.v1".to_string()]
    );
}

#[tokio::test]
async fn test_close_clears_listeners() {
    let mut harness = Harness::new(ClientConfig::new("mem://server"));
    let _peer = harness.connect().await;
    let log = Arc::new(Mutex::new(Vec::new()));
    harness.client.listen(Kind::Text, recorder(&log, "old"));
    harness.client.close().await;

    let peer = harness.connect().await;
    peer.send_text("z");
    tokio::time::sleep(SETTLE).await;
    assert!(log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_log_callback_sees_lifecycle() {
    init_logging();
    let (transport, mut listener) = MemoryTransport::pair();
    let lines = Arc::new(Mutex::new(Vec::new()));
    let client = Client::builder(ClientConfig::new("mem://server").with_auto_reconnect(false))
        .transport(transport)
        .on_log({
            let lines = Arc::clone(&lines);
            move |line| lines.lock().unwrap().push(line.to_string())
        })
        .build();

    let connecting = tokio::spawn({
        let client = client.clone();
        async move { client.connect().await }
    });
    let peer = listener.accept().await.unwrap();
    peer.open();
    connecting.await.unwrap().unwrap();
    peer.close(1000, "done");
    tokio::time::sleep(SETTLE).await;

    let lines = lines.lock().unwrap();
    assert_eq!(lines[0], "Connecting to mem://server...");
    assert_eq!(lines[1], "Connection established");
    assert_eq!(lines[2], "Disconnected from mem://server");
}
