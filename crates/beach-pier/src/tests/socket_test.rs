use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, RawQuery, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use futures_util::{stream, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::support::FakeFactory;
use crate::config::PeerOptions;
use crate::connection::CallOptions;
use crate::error::ErrorKind;
use crate::logging::{self, LogLevel};
use crate::native::MediaStream;
use crate::protocol::{ControlMessage, MessageType};
use crate::session::{Peer, PeerEvent};
use crate::transport::{ServerTransport, Socket, TransportEvent};

enum ServerPush {
    Text(String),
    Close,
}

#[derive(Debug, Clone)]
struct RecordedPost {
    id: String,
    token: String,
    kind: String,
    body: Value,
}

#[derive(Default)]
struct ServerState {
    websocket: bool,
    id_queries: Mutex<Vec<String>>,
    streams_opened: Mutex<Vec<u32>>,
    streams_closed: Mutex<Vec<u32>>,
    stream_lines: Mutex<HashMap<u32, mpsc::UnboundedSender<String>>>,
    posts: Mutex<Vec<RecordedPost>>,
    ws_query: Mutex<Option<HashMap<String, String>>>,
    ws_frames: Mutex<Vec<String>>,
    ws_push: Mutex<Option<mpsc::UnboundedSender<ServerPush>>>,
    ws_closed_by_client: AtomicBool,
}

/// Rendezvous server stand-in: identity endpoint, chunked streams, post
/// sink and an optional websocket.
#[derive(Clone)]
struct TestServer {
    state: Arc<ServerState>,
}

struct StreamGuard {
    index: u32,
    server: TestServer,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.server.state.streams_closed.lock().push(self.index);
    }
}

impl TestServer {
    fn open_stream(&self, index: u32) -> Response {
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        self.state.streams_opened.lock().push(index);
        self.state.stream_lines.lock().insert(index, tx);
        let guard = StreamGuard {
            index,
            server: self.clone(),
        };
        let padding = stream::once(async { Ok::<_, Infallible>(Bytes::from("pppppppppp\n")) });
        // Blank keepalive lines make a vanished client show up as a write error.
        let lines = stream::unfold((rx, guard), |(mut rx, guard)| async move {
            let line = tokio::select! {
                line = rx.recv() => Some(line),
                _ = tokio::time::sleep(Duration::from_millis(50)) => None,
            };
            let chunk = match line {
                Some(Some(line)) => format!("{line}\n"),
                Some(None) => return None,
                None => "\n".to_string(),
            };
            Some((Ok::<_, Infallible>(Bytes::from(chunk)), (rx, guard)))
        });
        Response::new(Body::from_stream(padding.chain(lines)))
    }

    fn push_line(&self, index: u32, message: Value) {
        let lines = self.state.stream_lines.lock();
        let tx = lines.get(&index).expect("stream is open");
        tx.send(message.to_string()).expect("stream reader alive");
    }

    fn push_ws(&self, push: ServerPush) {
        let ws = self.state.ws_push.lock();
        let tx = ws.as_ref().expect("websocket connected");
        let _ = tx.send(push);
    }

    fn websocket_connected(&self) -> bool {
        self.state.ws_push.lock().is_some()
    }

    async fn serve_websocket(self, mut socket: WebSocket) {
        let (push_tx, mut push_rx) = mpsc::unbounded_channel();
        *self.state.ws_push.lock() = Some(push_tx);
        loop {
            tokio::select! {
                push = push_rx.recv() => match push {
                    Some(ServerPush::Text(text)) => {
                        if socket.send(WsMessage::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Some(ServerPush::Close) | None => {
                        let _ = socket.send(WsMessage::Close(None)).await;
                        break;
                    }
                },
                frame = socket.recv() => match frame {
                    Some(Ok(WsMessage::Text(text))) => self.state.ws_frames.lock().push(text),
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => {
                        self.state.ws_closed_by_client.store(true, Ordering::SeqCst);
                        break;
                    }
                    Some(Ok(_)) => {}
                },
            }
        }
    }
}

async fn assign_id(State(server): State<TestServer>, RawQuery(query): RawQuery) -> &'static str {
    server.state.id_queries.lock().push(query.unwrap_or_default());
    "srv-7\n"
}

async fn post_kind(
    State(server): State<TestServer>,
    Path((id, token, kind)): Path<(String, String, String)>,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    if kind == "id" {
        let index = query
            .get("i")
            .and_then(|value| value.parse().ok())
            .unwrap_or_default();
        return server.open_stream(index);
    }
    let body = serde_json::from_slice(&body).unwrap_or(Value::Null);
    server.state.posts.lock().push(RecordedPost {
        id,
        token,
        kind,
        body,
    });
    StatusCode::OK.into_response()
}

async fn websocket_route(
    State(server): State<TestServer>,
    Query(query): Query<HashMap<String, String>>,
    upgrade: WebSocketUpgrade,
) -> Response {
    if !server.state.websocket {
        return StatusCode::NOT_FOUND.into_response();
    }
    *server.state.ws_query.lock() = Some(query);
    upgrade.on_upgrade(move |socket| server.serve_websocket(socket))
}

async fn spawn_server(websocket: bool) -> (TestServer, PeerOptions) {
    logging::init(LogLevel::All);
    let server = TestServer {
        state: Arc::new(ServerState {
            websocket,
            ..ServerState::default()
        }),
    };
    let app = Router::new()
        .route("/peerjs", get(websocket_route))
        .route("/peerjs/id", get(assign_id))
        .route("/peerjs/:id/:token/:kind", post(post_kind))
        .with_state(server.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test server");
    let port = listener.local_addr().expect("local addr").port();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let options = PeerOptions::default()
        .with_host("127.0.0.1")
        .with_port(port)
        .with_secure(false)
        .with_token("tok3n")
        .with_stream_timeout(Duration::from_millis(300));
    (server, options)
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Next server message, skipping transport errors from the disabled websocket.
async fn next_message(events: &mut mpsc::UnboundedReceiver<TransportEvent>) -> ControlMessage {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(3), events.recv())
            .await
            .expect("timed out waiting for transport event")
            .expect("transport event channel closed");
        match event {
            TransportEvent::Message(message) => return message,
            TransportEvent::Error(_) => continue,
            TransportEvent::Disconnected => panic!("unexpected disconnect"),
        }
    }
}

fn count_disconnects(events: &mut mpsc::UnboundedReceiver<TransportEvent>) -> usize {
    let mut count = 0;
    while let Ok(event) = events.try_recv() {
        if event == TransportEvent::Disconnected {
            count += 1;
        }
    }
    count
}

#[test_timeout::tokio_timeout_test(10)]
async fn retrieve_id_asks_the_identity_endpoint() -> anyhow::Result<()> {
    let (server, options) = spawn_server(false).await;
    let (socket, _events) = Socket::new(&options);
    let id = socket.retrieve_id().await?;
    assert_eq!(id, "srv-7");
    let queries = server.state.id_queries.lock().clone();
    assert_eq!(queries.len(), 1);
    assert!(queries[0].starts_with("ts="), "{queries:?}");
    Ok(())
}

#[test_timeout::tokio_timeout_test(10)]
async fn retrieve_id_surfaces_http_failures() {
    let (_server, options) = spawn_server(false).await;
    let (socket, _events) = Socket::new(&options.with_key("missing"));
    let error = socket.retrieve_id().await.expect_err("unknown key path");
    assert!(error.to_string().contains("404"), "{error}");
}

#[test_timeout::tokio_timeout_test(15)]
async fn http_streams_deliver_messages_and_rotate() {
    let (server, options) = spawn_server(false).await;
    let (socket, mut events) = Socket::new(&options);
    socket.start("alice", "tok3n");

    eventually("first stream", || !server.state.streams_opened.lock().is_empty()).await;
    server.push_line(0, json!({"type": "OPEN"}));
    server.push_line(0, json!({"type": "EXPIRE", "src": "bob"}));
    assert_eq!(next_message(&mut events).await.kind, MessageType::Open);
    let expired = next_message(&mut events).await;
    assert_eq!(expired.kind, MessageType::Expire);
    assert_eq!(expired.src.as_deref(), Some("bob"));

    eventually("second stream", || {
        server.state.streams_opened.lock().contains(&1)
    })
    .await;
    eventually("first stream released", || {
        server.state.streams_closed.lock().contains(&0)
    })
    .await;
    assert!(!server.state.streams_closed.lock().contains(&1));

    server.push_line(1, json!({"type": "LEAVE", "src": "carol"}));
    let left = next_message(&mut events).await;
    assert_eq!(left.kind, MessageType::Leave);
    assert_eq!(left.src.as_deref(), Some("carol"));
}

#[test_timeout::tokio_timeout_test(10)]
async fn sends_fall_back_to_http_posts() -> anyhow::Result<()> {
    let (server, options) = spawn_server(false).await;
    let (socket, _events) = Socket::new(&options);
    socket.start("alice", "tok3n");

    let message = ControlMessage::to_peer(
        MessageType::Candidate,
        "bob",
        &json!({"connectionId": "mc_1"}),
    )?;
    socket.send(&message);
    eventually("candidate post", || !server.state.posts.lock().is_empty()).await;

    let posts = server.state.posts.lock().clone();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].id, "alice");
    assert_eq!(posts[0].token, "tok3n");
    assert_eq!(posts[0].kind, "candidate");
    assert_eq!(posts[0].body["type"], json!("CANDIDATE"));
    assert_eq!(posts[0].body["dst"], json!("bob"));
    Ok(())
}

#[test_timeout::tokio_timeout_test(10)]
async fn messages_without_type_are_rejected() {
    let (server, options) = spawn_server(false).await;
    let (socket, mut events) = Socket::new(&options);
    socket.send_raw(json!({"payload": {}}));
    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("error event");
    assert_eq!(event, Some(TransportEvent::Error("Invalid message".into())));
    assert!(server.state.posts.lock().is_empty());
}

#[test_timeout::tokio_timeout_test(10)]
async fn websocket_flushes_queue_in_order_and_reports_one_disconnect() -> anyhow::Result<()> {
    let (server, options) = spawn_server(true).await;
    let (socket, mut events) = Socket::new(&options);

    socket.send(&ControlMessage::to_peer(MessageType::Offer, "bob", &json!({"n": 1}))?);
    socket.send(&ControlMessage::to_peer(MessageType::Answer, "bob", &json!({"n": 2}))?);
    socket.start("alice", "tok3n");

    eventually("websocket", || server.websocket_connected() && socket.is_websocket_open()).await;
    let query = server.state.ws_query.lock().clone().unwrap_or_default();
    assert_eq!(query.get("key").map(String::as_str), Some("peerjs"));
    assert_eq!(query.get("id").map(String::as_str), Some("alice"));
    assert_eq!(query.get("token").map(String::as_str), Some("tok3n"));

    socket.send(&ControlMessage::to_peer(MessageType::Candidate, "bob", &json!({"n": 3}))?);
    eventually("three frames", || server.state.ws_frames.lock().len() == 3).await;
    let kinds: Vec<String> = server
        .state
        .ws_frames
        .lock()
        .iter()
        .map(|frame| {
            serde_json::from_str::<Value>(frame).unwrap_or_default()["type"]
                .as_str()
                .unwrap_or_default()
                .to_string()
        })
        .collect();
    assert_eq!(kinds, vec!["OFFER", "ANSWER", "CANDIDATE"]);
    assert!(server.state.posts.lock().is_empty());

    server.push_ws(ServerPush::Text(json!({"type": "OPEN"}).to_string()));
    assert_eq!(next_message(&mut events).await.kind, MessageType::Open);

    server.push_ws(ServerPush::Close);
    eventually("socket disconnect", || socket.is_disconnected()).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(count_disconnects(&mut events), 1);
    assert!(!socket.is_websocket_open());

    // Nothing leaves after the server hung up.
    socket.send(&ControlMessage::to_peer(MessageType::Candidate, "bob", &json!({"n": 4}))?);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(server.state.posts.lock().is_empty());
    Ok(())
}

#[test_timeout::tokio_timeout_test(10)]
async fn local_close_is_not_reported_as_disconnect() {
    let (server, options) = spawn_server(true).await;
    let (socket, mut events) = Socket::new(&options);
    socket.start("alice", "tok3n");
    eventually("websocket", || server.websocket_connected() && socket.is_websocket_open()).await;

    socket.close();
    assert!(socket.is_disconnected());
    eventually("server saw close", || {
        server.state.ws_closed_by_client.load(Ordering::SeqCst)
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(count_disconnects(&mut events), 0);
}

#[test_timeout::tokio_timeout_test(10)]
async fn close_before_websocket_stops_http_streams() {
    let (server, options) = spawn_server(false).await;
    let (socket, _events) = Socket::new(&options.with_stream_timeout(Duration::from_millis(500)));
    socket.start("alice", "tok3n");
    eventually("first stream", || !server.state.streams_opened.lock().is_empty()).await;

    socket.close();
    assert!(socket.is_disconnected());
    eventually("first stream released", || {
        server.state.streams_closed.lock().contains(&0)
    })
    .await;

    socket.send(&ControlMessage::new(MessageType::Leave));
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(*server.state.streams_opened.lock(), vec![0]);
    assert!(server.state.posts.lock().is_empty());
}

#[test_timeout::tokio_timeout_test(15)]
async fn peer_session_over_websocket() -> anyhow::Result<()> {
    let (server, options) = spawn_server(true).await;
    let factory = Arc::new(FakeFactory::default());
    let (peer, mut events) = Peer::new(Some("alice"), options, factory.clone())?;
    eventually("websocket", || server.websocket_connected()).await;

    server.push_ws(ServerPush::Text(json!({"type": "OPEN"}).to_string()));
    let event = tokio::time::timeout(Duration::from_secs(2), events.recv()).await?;
    assert!(matches!(event, Some(PeerEvent::Open(id)) if id == "alice"));

    let connection = peer
        .call("bob", Some(MediaStream::new("cam")), CallOptions::default())
        .await?;
    eventually("offer frame", || !server.state.ws_frames.lock().is_empty()).await;
    let offer: ControlMessage = serde_json::from_str(&server.state.ws_frames.lock()[0])?;
    assert_eq!(offer.kind, MessageType::Offer);
    assert_eq!(offer.dst.as_deref(), Some("bob"));
    assert_eq!(offer.connection_id(), Some(connection.id()));

    server.push_ws(ServerPush::Close);
    let event = tokio::time::timeout(Duration::from_secs(2), events.recv()).await?;
    assert!(matches!(event, Some(PeerEvent::Error(error)) if error.kind == ErrorKind::Network));
    let event = tokio::time::timeout(Duration::from_secs(2), events.recv()).await?;
    assert!(matches!(event, Some(PeerEvent::Disconnected(Some(id))) if id == "alice"));
    assert!(peer.is_disconnected());
    Ok(())
}
