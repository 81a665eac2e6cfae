use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{error::ProtocolError, Error as WsError, Message};
use url::Url;

use super::stream::StreamSupervisor;
use super::{ServerTransport, TransportEvent};
use crate::config::PeerOptions;
use crate::error::TransportError;
use crate::protocol::ControlMessage;
use crate::util;

/// Websocket-first channel to the rendezvous server with a chunked HTTP
/// fallback for receiving and discrete HTTP posts for sending.
pub struct Socket {
    shared: Arc<SocketShared>,
    tasks: Mutex<SocketTasks>,
}

#[derive(Default)]
struct SocketTasks {
    streams: Option<JoinHandle<()>>,
    websocket: Option<JoinHandle<()>>,
}

impl SocketTasks {
    fn abort_streams(&mut self) {
        if let Some(handle) = self.streams.take() {
            handle.abort();
        }
    }

    fn abort_websocket(&mut self) {
        if let Some(handle) = self.websocket.take() {
            handle.abort();
        }
    }
}

struct SocketShared {
    http: reqwest::Client,
    http_base: String,
    ws_base: String,
    key: String,
    stream_timeout: Duration,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Mutex<SocketState>,
    disconnected: AtomicBool,
    ws_open: watch::Sender<bool>,
}

#[derive(Default)]
struct SocketState {
    /// `(id, token)` once started.
    session: Option<(String, String)>,
    ws_tx: Option<mpsc::UnboundedSender<Message>>,
    queue: Vec<Value>,
}

impl Socket {
    pub fn new(options: &PeerOptions) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (ws_open, _) = watch::channel(false);
        let shared = Arc::new(SocketShared {
            http: reqwest::Client::new(),
            http_base: options.http_base(),
            ws_base: options.ws_base(),
            key: options.key.clone(),
            stream_timeout: options.stream_timeout,
            events,
            state: Mutex::new(SocketState::default()),
            disconnected: AtomicBool::new(false),
            ws_open,
        });
        let socket = Self {
            shared,
            tasks: Mutex::new(SocketTasks::default()),
        };
        (socket, rx)
    }

    pub fn is_websocket_open(&self) -> bool {
        *self.shared.ws_open.borrow()
    }

    fn websocket_url(&self, id: &str, token: &str) -> Result<Url, TransportError> {
        Url::parse_with_params(
            &self.shared.ws_base,
            &[("key", self.shared.key.as_str()), ("id", id), ("token", token)],
        )
        .map_err(|err| TransportError::Setup(format!("invalid websocket url: {err}")))
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        let mut tasks = self.tasks.lock();
        tasks.abort_streams();
        tasks.abort_websocket();
    }
}

#[async_trait]
impl ServerTransport for Socket {
    async fn retrieve_id(&self) -> Result<String, TransportError> {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or_default();
        let url = format!(
            "{}/id?ts={millis}{}",
            self.shared.http_base,
            util::random_token()
        );
        tracing::debug!(target = "pier", url = %url, "requesting identity");
        let response = self.shared.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(TransportError::Status(response.status().as_u16()));
        }
        let id = response.text().await?;
        Ok(id.trim().to_string())
    }

    fn start(&self, id: &str, token: &str) {
        {
            let mut state = self.shared.state.lock();
            if state.session.is_some() {
                tracing::warn!(target = "pier", id, "transport already started");
                return;
            }
            state.session = Some((id.to_string(), token.to_string()));
        }

        let supervisor = StreamSupervisor {
            http: self.shared.http.clone(),
            url: format!("{}/{id}/{token}/id", self.shared.http_base),
            timeout: self.shared.stream_timeout,
            events: self.shared.events.clone(),
            ws_open: self.shared.ws_open.subscribe(),
        };
        let mut tasks = self.tasks.lock();
        tasks.streams = Some(tokio::spawn(supervisor.run()));

        match self.websocket_url(id, token) {
            Ok(url) => {
                tasks.websocket = Some(tokio::spawn(run_websocket(Arc::clone(&self.shared), url)));
            }
            Err(err) => {
                tracing::error!(target = "pier", error = %err, "websocket not started");
                let _ = self
                    .shared
                    .events
                    .send(TransportEvent::Error(err.to_string()));
            }
        }
    }

    fn send_raw(&self, message: Value) {
        self.shared.send(message);
    }

    /// Stops both channels. An open websocket gets a close frame; one still
    /// connecting is abandoned.
    fn close(&self) {
        let state = self.shared.state.lock();
        if self.shared.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tasks = self.tasks.lock();
        tasks.abort_streams();
        match state.ws_tx.as_ref() {
            Some(tx) if *self.shared.ws_open.borrow() => {
                let _ = tx.send(Message::Close(None));
            }
            _ => tasks.abort_websocket(),
        }
        tracing::debug!(target = "pier", "rendezvous transport closed");
    }

    fn is_disconnected(&self) -> bool {
        self.shared.disconnected.load(Ordering::SeqCst)
    }
}

impl SocketShared {
    fn send(&self, message: Value) {
        if self.disconnected.load(Ordering::SeqCst) {
            tracing::debug!(target = "pier", "dropping message after disconnect");
            return;
        }
        let Some(kind) = message.get("type").and_then(Value::as_str).map(str::to_lowercase) else {
            let _ = self
                .events
                .send(TransportEvent::Error("Invalid message".into()));
            return;
        };

        let mut state = self.state.lock();
        let Some((id, token)) = state.session.clone() else {
            state.queue.push(message);
            return;
        };

        if let Some(tx) = state.ws_tx.as_ref() {
            match tx.send(Message::Text(message.to_string())) {
                Ok(()) => return,
                Err(_) => {
                    state.ws_tx = None;
                }
            }
        }
        drop(state);

        let url = format!("{}/{id}/{token}/{kind}", self.http_base);
        let request = self.http.post(url).json(&message);
        tokio::spawn(async move {
            match request.send().await {
                Ok(response) if !response.status().is_success() => {
                    tracing::warn!(
                        target = "pier",
                        kind = %kind,
                        status = response.status().as_u16(),
                        "http send rejected"
                    );
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(target = "pier", kind = %kind, error = %err, "http send failed");
                }
            }
        });
    }

    fn deliver(&self, text: &str) {
        match serde_json::from_str::<ControlMessage>(text) {
            Ok(message) => {
                let _ = self.events.send(TransportEvent::Message(message));
            }
            Err(err) => {
                tracing::warn!(target = "pier", error = %err, len = text.len(), "invalid server message");
            }
        }
    }
}

async fn run_websocket(shared: Arc<SocketShared>, url: Url) {
    let (ws_stream, _) = match connect_async(url.as_str()).await {
        Ok(connected) => connected,
        Err(err) => {
            tracing::warn!(target = "pier", error = %err, "websocket connect failed");
            let _ = shared
                .events
                .send(TransportEvent::Error(format!("websocket connect failed: {err}")));
            return;
        }
    };
    tracing::debug!(target = "pier", "rendezvous websocket open");
    let (mut ws_write, mut ws_read) = ws_stream.split();
    let (tx, mut outbound) = mpsc::unbounded_channel::<Message>();

    {
        let mut state = shared.state.lock();
        for queued in state.queue.drain(..) {
            let _ = tx.send(Message::Text(queued.to_string()));
        }
        state.ws_tx = Some(tx);
        shared.ws_open.send_replace(true);
    }

    loop {
        tokio::select! {
            next = outbound.recv() => {
                let Some(message) = next else { break };
                let closing = matches!(message, Message::Close(_));
                if let Err(err) = ws_write.send(message).await {
                    tracing::warn!(target = "pier", error = %err, "websocket send failed");
                    break;
                }
                if closing {
                    break;
                }
            }
            inbound = ws_read.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    tracing::trace!(target = "pier", event = "ws_in", len = text.len());
                    shared.deliver(&text);
                }
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => shared.deliver(&text),
                    Err(_) => tracing::warn!(target = "pier", "non-utf8 websocket frame"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    match &err {
                        WsError::ConnectionClosed
                        | WsError::AlreadyClosed
                        | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                            tracing::debug!(target = "pier", "rendezvous websocket closed: {err}");
                        }
                        _ => {
                            tracing::warn!(target = "pier", "rendezvous websocket error: {err}");
                        }
                    }
                    break;
                }
            }
        }
    }

    {
        let mut state = shared.state.lock();
        state.ws_tx = None;
        shared.ws_open.send_replace(false);
    }
    if !shared.disconnected.swap(true, Ordering::SeqCst) {
        tracing::info!(target = "pier", "rendezvous websocket closed by server");
        let _ = shared.events.send(TransportEvent::Disconnected);
    }
}
