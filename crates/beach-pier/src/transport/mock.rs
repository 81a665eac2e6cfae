use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, Notify};

use super::{ServerTransport, TransportEvent};
use crate::error::TransportError;
use crate::protocol::{ControlMessage, MessageType};

/// In-memory transport: records what the session sends and lets tests play
/// the server side.
pub struct MockTransport {
    events: mpsc::UnboundedSender<TransportEvent>,
    sent: Mutex<Vec<Value>>,
    sent_notify: Notify,
    assigned_id: Mutex<Option<String>>,
    started: Mutex<Option<(String, String)>>,
    disconnected: AtomicBool,
}

impl MockTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            events,
            sent: Mutex::new(Vec::new()),
            sent_notify: Notify::new(),
            assigned_id: Mutex::new(None),
            started: Mutex::new(None),
            disconnected: AtomicBool::new(false),
        });
        (transport, rx)
    }

    /// Identity returned by `retrieve_id`; without one the request fails.
    pub fn assign_id(&self, id: &str) {
        *self.assigned_id.lock() = Some(id.to_string());
    }

    pub fn inject(&self, message: ControlMessage) {
        let _ = self.events.send(TransportEvent::Message(message));
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn started(&self) -> Option<(String, String)> {
        self.started.lock().clone()
    }

    pub fn sent(&self) -> Vec<ControlMessage> {
        self.sent
            .lock()
            .iter()
            .filter_map(|value| serde_json::from_value(value.clone()).ok())
            .collect()
    }

    pub fn sent_of(&self, kind: MessageType) -> Vec<ControlMessage> {
        self.sent()
            .into_iter()
            .filter(|message| message.kind == kind)
            .collect()
    }

    /// Waits until at least `count` messages of `kind` were sent.
    pub async fn wait_for_sent(&self, kind: MessageType, count: usize) -> Vec<ControlMessage> {
        loop {
            let notified = self.sent_notify.notified();
            let matching = self.sent_of(kind);
            if matching.len() >= count {
                return matching;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl ServerTransport for MockTransport {
    async fn retrieve_id(&self) -> Result<String, TransportError> {
        self.assigned_id
            .lock()
            .clone()
            .ok_or(TransportError::Status(500))
    }

    fn start(&self, id: &str, token: &str) {
        *self.started.lock() = Some((id.to_string(), token.to_string()));
    }

    fn send_raw(&self, message: Value) {
        if self.disconnected.load(Ordering::SeqCst) {
            return;
        }
        if message.get("type").and_then(Value::as_str).is_none() {
            let _ = self
                .events
                .send(TransportEvent::Error("Invalid message".into()));
            return;
        }
        self.sent.lock().push(message);
        self.sent_notify.notify_waiters();
    }

    fn close(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}
