//! Integration tests for peerlink.
//!
//! These tests run real sessions over loopback TCP, with the test acting as
//! the peer that dials from the agreed source port.

use std::collections::BTreeMap;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use peerlink::codec::Frame;
use peerlink::handler::{DataHandler, FrameRouter, HandlerResult};
use peerlink::transport::dial;
use peerlink::{
    CloseReason, EndpointConfig, FrameCodec, LinkError, Session, SessionState,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(5);

/// Reserve `N` distinct free ports.
fn free_ports<const N: usize>() -> [u16; N] {
    let listeners: Vec<StdTcpListener> = (0..N)
        .map(|_| StdTcpListener::bind("127.0.0.1:0").unwrap())
        .collect();
    let mut ports = [0u16; N];
    for (port, listener) in ports.iter_mut().zip(&listeners) {
        *port = listener.local_addr().unwrap().port();
    }
    ports
}

fn config(local_port: u16, peer_port: u16) -> peerlink::EndpointConfigBuilder {
    EndpointConfig::builder()
        .local_port(local_port)
        .peer_port(peer_port)
        .build_timeout(WAIT)
        .receive_timeout(WAIT)
}

fn local_addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Dial until the session's listener is up.
async fn dial_retry(source_port: u16, local_port: u16) -> TcpStream {
    for _ in 0..250 {
        if let Ok(stream) = dial(source_port, local_addr(local_port)).await {
            return stream;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("could not connect to port {local_port}");
}

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("channel closed")
}

/// Read one frame's worth of text from the peer side.
async fn read_text(stream: &mut TcpStream) -> String {
    let mut buf = vec![0u8; 8192];
    let n = tokio::time::timeout(WAIT, stream.read(&mut buf))
        .await
        .expect("timed out reading")
        .expect("read failed");
    String::from_utf8(buf[..n].to_vec()).unwrap()
}

fn label(e: &LinkError) -> &'static str {
    match e {
        LinkError::Protocol(_) => "protocol",
        LinkError::PeerClosed => "peer_closed",
        LinkError::Io(_) => "io",
        LinkError::UnknownFrameType(_) => "unknown_type",
        LinkError::Json(_) => "json",
        _ => "other",
    }
}

/// Observes every hook of a session.
struct Probe {
    frames: mpsc::UnboundedReceiver<(String, Value)>,
    stopped: mpsc::UnboundedReceiver<()>,
    timed_out: mpsc::UnboundedReceiver<()>,
    errors: mpsc::UnboundedReceiver<&'static str>,
    stopped_count: Arc<AtomicUsize>,
    timeout_count: Arc<AtomicUsize>,
}

fn session_with_probe(
    builder: peerlink::EndpointConfigBuilder,
) -> (Session, Probe, impl DataHandler + Clone) {
    let (frame_tx, frames) = mpsc::unbounded_channel();
    let (stopped_tx, stopped) = mpsc::unbounded_channel();
    let (timeout_tx, timed_out) = mpsc::unbounded_channel();
    let (error_tx, errors) = mpsc::unbounded_channel();
    let stopped_count = Arc::new(AtomicUsize::new(0));
    let timeout_count = Arc::new(AtomicUsize::new(0));

    let (sc, tc) = (stopped_count.clone(), timeout_count.clone());
    let session = Session::builder(builder.build().unwrap())
        .on_stopped(move || {
            sc.fetch_add(1, Ordering::SeqCst);
            let _ = stopped_tx.send(());
        })
        .on_timeout(move || {
            tc.fetch_add(1, Ordering::SeqCst);
            let _ = timeout_tx.send(());
        })
        .on_error(move |e| {
            let _ = error_tx.send(label(e));
        })
        .build();

    let handler = move |frame_type: &str, payload: Value| -> HandlerResult {
        let _ = frame_tx.send((frame_type.to_string(), payload));
        Ok(())
    };

    let probe = Probe {
        frames,
        stopped,
        timed_out,
        errors,
        stopped_count,
        timeout_count,
    };

    (session, probe, handler)
}

/// Start listening in the background and connect as the peer.
async fn establish<H: DataHandler>(session: &Session, handler: H, source_port: u16) -> TcpStream {
    let listening = {
        let session = session.clone();
        tokio::spawn(async move { session.start_listening(handler, false).await })
    };

    let stream = dial_retry(source_port, session.config().local_port()).await;
    assert!(listening.await.unwrap().unwrap(), "handshake failed");
    stream
}

async fn wait_for_state(session: &Session, state: SessionState) {
    tokio::time::timeout(WAIT, async {
        while session.state() != state {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("session never reached {state:?}"));
}

/// Peer says hello, then ends the session with the sentinel.
#[tokio::test]
async fn test_hello_then_sentinel() {
    let [local, peer] = free_ports::<2>();
    let (session, mut probe, handler) = session_with_probe(config(local, peer).sentinel("end!"));

    let mut stream = establish(&session, handler, peer).await;
    assert_eq!(session.state(), SessionState::Established);
    assert_eq!(session.peer_addr().map(|a| a.port()), Some(peer));

    stream.write_all(br#"hello!{"x":1}"#).await.unwrap();
    assert_eq!(
        recv(&mut probe.frames).await,
        ("hello".to_string(), json!({"x": 1}))
    );

    stream.write_all(b"end!").await.unwrap();
    recv(&mut probe.stopped).await;

    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(session.close_reason(), Some(CloseReason::Sentinel));
    assert_eq!(probe.stopped_count.load(Ordering::SeqCst), 1);
    assert_eq!(probe.timeout_count.load(Ordering::SeqCst), 0);

    // Sentinel echoed back, then the connection closes
    assert_eq!(read_text(&mut stream).await, "end!");
    assert_eq!(read_text(&mut stream).await, "");
}

/// Nothing is dispatched after the sentinel.
#[tokio::test]
async fn test_no_dispatch_after_sentinel() {
    let [local, peer] = free_ports::<2>();
    let (session, mut probe, handler) = session_with_probe(config(local, peer));

    let mut stream = establish(&session, handler, peer).await;

    stream.write_all(b"end!").await.unwrap();
    recv(&mut probe.stopped).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    let _ = stream.write_all(br#"late!{}"#).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(probe.frames.try_recv().is_err());
    assert_eq!(probe.stopped_count.load(Ordering::SeqCst), 1);
}

/// A connection from another source port is discarded; the matching one
/// arriving second is selected.
#[tokio::test]
async fn test_handshake_filters_source_port() {
    let [local, peer, stranger] = free_ports::<3>();
    let (session, mut probe, handler) = session_with_probe(config(local, peer));

    let listening = {
        let session = session.clone();
        tokio::spawn(async move { session.start_listening(handler, false).await })
    };

    let mut rejected = dial_retry(stranger, local).await;
    let mut accepted = dial(peer, local_addr(local)).await.unwrap();

    assert!(listening.await.unwrap().unwrap());
    assert_eq!(session.peer_addr().map(|a| a.port()), Some(peer));

    // The stranger sees its connection closed
    let mut buf = [0u8; 16];
    let closed = tokio::time::timeout(WAIT, rejected.read(&mut buf))
        .await
        .expect("rejected connection left open");
    assert!(matches!(closed, Ok(0) | Err(_)));

    accepted.write_all(br#"ping!{"n":2}"#).await.unwrap();
    assert_eq!(
        recv(&mut probe.frames).await,
        ("ping".to_string(), json!({"n": 2}))
    );
}

/// No matching peer within the build timeout.
#[tokio::test]
async fn test_handshake_timeout() {
    let [local, peer] = free_ports::<2>();
    let strangers = free_ports::<12>();
    let (session, mut probe, handler) = session_with_probe(
        config(local, peer).build_timeout(Duration::from_millis(400)),
    );

    let started = Instant::now();
    let listening = {
        let session = session.clone();
        tokio::spawn(async move { session.start_listening(handler, false).await })
    };

    // Keep rejected connections arriving well past the deadline
    let dialer = tokio::spawn(async move {
        let mut rejected = Vec::new();
        for port in strangers {
            if let Ok(stream) = dial(port, local_addr(local)).await {
                rejected.push(stream);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        rejected
    });

    let established = tokio::time::timeout(WAIT, listening)
        .await
        .expect("handshake did not time out")
        .unwrap()
        .unwrap();
    let elapsed = started.elapsed();

    assert!(!established);
    assert!(
        elapsed < Duration::from_millis(900),
        "rejections extended the wait to {elapsed:?}"
    );
    assert!(!dialer.is_finished());

    recv(&mut probe.timed_out).await;
    assert_eq!(probe.timeout_count.load(Ordering::SeqCst), 1);
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(session.peer_addr(), None);

    let rejected = dialer.await.unwrap();
    assert!(!rejected.is_empty());
    assert_eq!(probe.timeout_count.load(Ordering::SeqCst), 1);
}

/// Frames inside the window re-arm the receive timeout; silence closes the session.
#[tokio::test]
async fn test_receive_timeout_rearms_then_closes() {
    let [local, peer] = free_ports::<2>();
    let (session, mut probe, handler) = session_with_probe(
        config(local, peer).receive_timeout(Duration::from_millis(600)),
    );

    let mut stream = establish(&session, handler, peer).await;

    for i in 0..3 {
        tokio::time::sleep(Duration::from_millis(300)).await;
        stream
            .write_all(format!(r#"tick!{{"i":{i}}}"#).as_bytes())
            .await
            .unwrap();
        assert_eq!(recv(&mut probe.frames).await.1, json!({"i": i}));
    }

    // 900ms since establishment, still alive
    assert_eq!(session.state(), SessionState::Established);
    assert_eq!(probe.timeout_count.load(Ordering::SeqCst), 0);

    recv(&mut probe.timed_out).await;
    wait_for_state(&session, SessionState::Closed).await;

    assert_eq!(session.close_reason(), Some(CloseReason::ReceiveTimeout));
    assert_eq!(probe.timeout_count.load(Ordering::SeqCst), 1);
    assert_eq!(probe.stopped_count.load(Ordering::SeqCst), 0);

    // Timeout shutdown sends the sentinel like stop()
    assert_eq!(read_text(&mut stream).await, "end!");
}

/// `start_listening` without overwrite leaves a live session untouched.
#[tokio::test]
async fn test_already_connecting_keeps_session() {
    let [local, peer] = free_ports::<2>();
    let (session, mut probe, handler) = session_with_probe(config(local, peer));

    let mut stream = establish(&session, handler.clone(), peer).await;

    let err = session.start_listening(handler, false).await.unwrap_err();
    assert!(matches!(err, LinkError::AlreadyConnecting));
    assert_eq!(session.state(), SessionState::Established);

    assert!(session.send("ping", &json!({})).await.unwrap());
    assert_eq!(read_text(&mut stream).await, "ping!{}");

    stream.write_all(br#"pong!{"ok":true}"#).await.unwrap();
    assert_eq!(
        recv(&mut probe.frames).await,
        ("pong".to_string(), json!({"ok": true}))
    );
}

/// `stop()` sends the sentinel, closes, and only succeeds once.
#[tokio::test]
async fn test_stop_is_idempotent() {
    let [local, peer] = free_ports::<2>();
    let (session, probe, handler) = session_with_probe(config(local, peer).sentinel("bye"));

    let mut stream = establish(&session, handler, peer).await;

    assert!(session.stop().await);
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(session.close_reason(), Some(CloseReason::Stopped));

    assert_eq!(read_text(&mut stream).await, "bye");
    assert_eq!(read_text(&mut stream).await, "");

    assert!(!session.stop().await);
    assert!(!session.send("late", &json!({})).await.unwrap());

    // A local stop is not a peer stop
    assert_eq!(probe.stopped_count.load(Ordering::SeqCst), 0);
}

/// Park the writer behind a send the peer never reads, then stop.
///
/// The sentinel waits on the writer, so `stop()` stays in flight until its
/// write timeout expires.
async fn stop_behind_stalled_writer(session: &Session) -> tokio::task::JoinHandle<bool> {
    let bulk = "x".repeat(32 << 20);
    let sender = session.clone();
    tokio::spawn(async move {
        let _ = sender.send("bulk", &json!(bulk)).await;
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stopper = session.clone();
    let stopping = tokio::spawn(async move { stopper.stop().await });
    wait_for_state(session, SessionState::Closed).await;
    stopping
}

/// Frames arriving while `stop()` is in flight are not dispatched.
#[tokio::test]
async fn test_no_dispatch_while_stopping() {
    let [local, peer] = free_ports::<2>();
    let (session, mut probe, handler) = session_with_probe(config(local, peer));

    let mut stream = establish(&session, handler, peer).await;
    let stopping = stop_behind_stalled_writer(&session).await;

    stream.write_all(br#"late!{"after":"stop"}"#).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(probe.frames.try_recv().is_err());
    assert_eq!(session.close_reason(), Some(CloseReason::Stopped));
    assert!(tokio::time::timeout(WAIT, stopping).await.unwrap().unwrap());
    assert!(probe.frames.try_recv().is_err());
}

/// A peer sentinel racing a local `stop()` does not fire `on_stopped`.
#[tokio::test]
async fn test_sentinel_during_stop_is_not_a_peer_stop() {
    let [local, peer] = free_ports::<2>();
    let (session, probe, handler) = session_with_probe(config(local, peer));

    let mut stream = establish(&session, handler, peer).await;
    let stopping = stop_behind_stalled_writer(&session).await;

    stream.write_all(b"end!").await.unwrap();
    assert!(tokio::time::timeout(WAIT, stopping).await.unwrap().unwrap());
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(session.close_reason(), Some(CloseReason::Stopped));
    assert_eq!(probe.stopped_count.load(Ordering::SeqCst), 0);
    assert_eq!(probe.timeout_count.load(Ordering::SeqCst), 0);
}

/// Malformed frames are reported and the loop keeps going.
#[tokio::test]
async fn test_malformed_frame_reported() {
    let [local, peer] = free_ports::<2>();
    let (session, mut probe, handler) = session_with_probe(config(local, peer));

    let mut stream = establish(&session, handler, peer).await;

    stream.write_all(b"no separator here").await.unwrap();
    assert_eq!(recv(&mut probe.errors).await, "protocol");

    stream.write_all(b"bad!{json").await.unwrap();
    assert_eq!(recv(&mut probe.errors).await, "protocol");

    stream.write_all(&[0xff, 0xfe, b'!', b'1']).await.unwrap();
    assert_eq!(recv(&mut probe.errors).await, "protocol");

    stream.write_all(br#"ok!{"still":"alive"}"#).await.unwrap();
    assert_eq!(
        recv(&mut probe.frames).await,
        ("ok".to_string(), json!({"still": "alive"}))
    );
    assert_eq!(session.state(), SessionState::Established);
}

/// Losing the peer closes the session without a timeout.
#[tokio::test]
async fn test_peer_disconnect() {
    let [local, peer] = free_ports::<2>();
    let (session, mut probe, handler) = session_with_probe(config(local, peer));

    let stream = establish(&session, handler, peer).await;
    drop(stream);

    assert_eq!(recv(&mut probe.errors).await, "peer_closed");
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(session.close_reason(), Some(CloseReason::PeerClosed));
    assert_eq!(probe.timeout_count.load(Ordering::SeqCst), 0);
    assert_eq!(probe.stopped_count.load(Ordering::SeqCst), 0);
}

/// Unserializable payloads fail instead of being coerced.
#[tokio::test]
async fn test_send_unserializable_payload() {
    let [local, peer] = free_ports::<2>();
    let (session, _probe, handler) = session_with_probe(config(local, peer));

    let _stream = establish(&session, handler, peer).await;

    let mut map = BTreeMap::new();
    map.insert((1, 2), "tuple keys are not JSON");

    let err = session.send("bad", &map).await.unwrap_err();
    assert!(matches!(err, LinkError::Encode(_)));

    let err = session.send("a!b", &json!({})).await.unwrap_err();
    assert!(matches!(err, LinkError::Encode(_)));

    assert_eq!(session.state(), SessionState::Established);
}

/// Overwriting replaces the live connection with a new handshake.
#[tokio::test]
async fn test_overwrite_replaces_connection() {
    let [local, first, second] = free_ports::<3>();
    let (frame_tx, mut frames) = mpsc::unbounded_channel();

    let session = Session::builder(config(local, first).build().unwrap())
        .peer_matcher(move |addr: &SocketAddr| addr.port() == first || addr.port() == second)
        .build();

    let handler = move |frame_type: &str, payload: Value| -> HandlerResult {
        let _ = frame_tx.send((frame_type.to_string(), payload));
        Ok(())
    };

    let mut old = establish(&session, handler.clone(), first).await;

    let relisten = {
        let session = session.clone();
        tokio::spawn(async move { session.start_listening(handler, true).await })
    };

    // Old connection is dropped without the sentinel
    assert_eq!(read_text(&mut old).await, "");

    let mut new = dial_retry(second, local).await;
    assert!(relisten.await.unwrap().unwrap());
    assert_eq!(session.peer_addr().map(|a| a.port()), Some(second));

    new.write_all(br#"fresh!{"v":2}"#).await.unwrap();
    assert_eq!(
        recv(&mut frames).await,
        ("fresh".to_string(), json!({"v": 2}))
    );
}

/// A pending handshake can be superseded by an overwriting call.
#[tokio::test]
async fn test_overwrite_cancels_pending_handshake() {
    let [local, peer] = free_ports::<2>();
    let (session, mut probe, handler) = session_with_probe(config(local, peer));

    let first = {
        let session = session.clone();
        let handler = handler.clone();
        tokio::spawn(async move { session.start_listening(handler, false).await })
    };
    wait_for_state(&session, SessionState::Listening).await;

    assert!(matches!(
        session.start_listening(handler.clone(), false).await,
        Err(LinkError::AlreadyConnecting)
    ));

    let second = {
        let session = session.clone();
        tokio::spawn(async move { session.start_listening(handler, true).await })
    };

    assert!(matches!(
        first.await.unwrap(),
        Err(LinkError::Cancelled)
    ));

    let mut stream = dial_retry(peer, local).await;
    assert!(second.await.unwrap().unwrap());

    stream.write_all(br#"hi!{}"#).await.unwrap();
    assert_eq!(recv(&mut probe.frames).await.0, "hi");
}

/// The session can listen again after a connection closes.
#[tokio::test]
async fn test_restart_after_close() {
    let [local, first, second] = free_ports::<3>();
    let (frame_tx, mut frames) = mpsc::unbounded_channel();

    let session = Session::builder(config(local, first).build().unwrap())
        .peer_matcher(move |addr: &SocketAddr| addr.port() == first || addr.port() == second)
        .build();

    let handler = move |frame_type: &str, _payload: Value| -> HandlerResult {
        let _ = frame_tx.send(frame_type.to_string());
        Ok(())
    };

    let _old = establish(&session, handler.clone(), first).await;
    assert!(session.stop().await);

    let mut stream = establish(&session, handler, second).await;
    assert_eq!(session.state(), SessionState::Established);
    assert_eq!(session.close_reason(), None);

    stream.write_all(br#"again!{}"#).await.unwrap();
    assert_eq!(recv(&mut frames).await, "again");
}

/// Typed routing end to end.
#[tokio::test]
async fn test_router_handler() {
    #[derive(Deserialize)]
    struct TestData {
        #[serde(rename = "testValue0")]
        value0: i32,
        #[serde(rename = "testValue1")]
        value1: Vec<f64>,
    }

    let [local, peer] = free_ports::<2>();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (error_tx, mut errors) = mpsc::unbounded_channel();

    let session = Session::builder(config(local, peer).build().unwrap())
        .on_error(move |e| {
            let _ = error_tx.send(label(e));
        })
        .build();

    let router = FrameRouter::new().route("test", move |d: TestData| {
        let _ = tx.send((d.value0, d.value1));
        Ok(())
    });

    let mut stream = establish(&session, router, peer).await;

    stream
        .write_all(br#"test!{"testValue0":334,"testValue1":[0.54,0.23,0.12]}"#)
        .await
        .unwrap();
    assert_eq!(recv(&mut rx).await, (334, vec![0.54, 0.23, 0.12]));

    stream.write_all(br#"other!{}"#).await.unwrap();
    assert_eq!(recv(&mut errors).await, "unknown_type");
}

/// A pipe-separated wire format swapped in without touching the session.
struct PipeCodec;

impl FrameCodec for PipeCodec {
    fn encode(&self, frame_type: &str, payload: &Value) -> peerlink::Result<String> {
        Ok(format!("{frame_type}|{payload}"))
    }

    fn decode(&self, wire: &str) -> peerlink::Result<Frame> {
        let (frame_type, json) = wire
            .split_once('|')
            .ok_or_else(|| LinkError::Decode("missing '|'".into()))?;
        let payload = serde_json::from_str(json).map_err(|e| LinkError::Decode(e.to_string()))?;
        Ok(Frame::new(frame_type, payload))
    }
}

#[tokio::test]
async fn test_custom_codec() {
    let [local, peer] = free_ports::<2>();
    let (frame_tx, mut frames) = mpsc::unbounded_channel();

    let session = Session::builder(config(local, peer).build().unwrap())
        .codec(PipeCodec)
        .build();

    let handler = move |frame_type: &str, payload: Value| -> HandlerResult {
        let _ = frame_tx.send((frame_type.to_string(), payload));
        Ok(())
    };

    let mut stream = establish(&session, handler, peer).await;

    stream.write_all(br#"greet|{"n":1}"#).await.unwrap();
    assert_eq!(
        recv(&mut frames).await,
        ("greet".to_string(), json!({"n": 1}))
    );

    assert!(session.send("reply", &json!([1, 2])).await.unwrap());
    assert_eq!(read_text(&mut stream).await, "reply|[1,2]");
}

/// Concurrent senders never interleave bytes within a frame.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sends_are_serialized() {
    let [local, peer] = free_ports::<2>();
    let (session, _probe, handler) = session_with_probe(config(local, peer));

    let mut stream = establish(&session, handler, peer).await;

    let payload = "x".repeat(512);
    let mut tasks = Vec::new();
    for i in 0..8 {
        let session = session.clone();
        let payload = payload.clone();
        tasks.push(tokio::spawn(async move {
            session.send(&format!("t{i}"), &json!({ "p": payload })).await
        }));
    }
    for task in tasks {
        assert!(task.await.unwrap().unwrap());
    }

    let mut received = String::new();
    let expected_len: usize = (0..8)
        .map(|i| format!("t{i}!").len() + payload.len() + r#"{"p":""}"#.len())
        .sum();
    while received.len() < expected_len {
        received.push_str(&read_text(&mut stream).await);
    }

    for i in 0..8 {
        let frame = format!(r#"t{i}!{{"p":"{payload}"}}"#);
        assert!(received.contains(&frame), "frame t{i} was split or interleaved");
    }
}
