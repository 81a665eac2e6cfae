use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};

use super::{ConnectOptions, ConnectionState};
use crate::error::PeerError;
use crate::native::{OfferConstraints, SessionDescription};
use crate::negotiation::{ConnectionRef, Role};
use crate::protocol::{ConnectionType, ControlMessage, OfferPayload, Serialization};
use crate::session::driver::{Command, SessionContext};
use crate::util;

#[derive(Debug, Clone, PartialEq)]
pub enum DataConnectionEvent {
    /// The native data channel opened.
    Open,
    Close,
    Error(PeerError),
}

/// Driver-side state of one data connection. Payload transfer is left to
/// the native data channel; only the lifecycle is tracked here.
pub(crate) struct DataSession {
    id: String,
    peer: String,
    label: String,
    reliable: bool,
    serialization: Serialization,
    metadata: Option<Value>,
    offer: Option<SessionDescription>,
    native: Option<String>,
    state: Arc<RwLock<ConnectionState>>,
    events: mpsc::UnboundedSender<DataConnectionEvent>,
    handle: DataConnection,
}

impl DataSession {
    pub(crate) fn outbound(
        peer: &str,
        options: ConnectOptions,
        commands: mpsc::UnboundedSender<Command>,
    ) -> (Self, DataConnection) {
        let id = util::prefixed_id("dc_");
        let label = options.label.unwrap_or_else(|| id.clone());
        Self::build(
            id,
            peer,
            label,
            options.reliable,
            options.serialization,
            options.metadata,
            None,
            commands,
        )
    }

    pub(crate) fn inbound(
        peer: &str,
        offer: OfferPayload,
        commands: mpsc::UnboundedSender<Command>,
    ) -> (Self, DataConnection) {
        let label = offer.label.unwrap_or_else(|| offer.connection_id.clone());
        Self::build(
            offer.connection_id,
            peer,
            label,
            offer.reliable.unwrap_or(false),
            offer.serialization.unwrap_or_default(),
            offer.metadata,
            Some(offer.sdp),
            commands,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        id: String,
        peer: &str,
        label: String,
        reliable: bool,
        serialization: Serialization,
        metadata: Option<Value>,
        offer: Option<SessionDescription>,
        commands: mpsc::UnboundedSender<Command>,
    ) -> (Self, DataConnection) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let state = Arc::new(RwLock::new(ConnectionState::Created));
        let handle = DataConnection {
            id: id.clone(),
            peer: peer.to_string(),
            label: label.clone(),
            reliable,
            serialization,
            metadata: metadata.clone(),
            state: Arc::clone(&state),
            commands,
            events: Arc::new(AsyncMutex::new(events_rx)),
        };
        let session = Self {
            id,
            peer: peer.to_string(),
            label,
            reliable,
            serialization,
            metadata,
            offer,
            native: None,
            state,
            events,
            handle: handle.clone(),
        };
        (session, handle)
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn peer(&self) -> &str {
        &self.peer
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub(crate) fn handle(&self) -> DataConnection {
        self.handle.clone()
    }

    fn reference(&self) -> ConnectionRef {
        ConnectionRef {
            kind: ConnectionType::Data,
            peer: self.peer.clone(),
            connection_id: self.id.clone(),
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.write();
        if *state != ConnectionState::Closed {
            *state = next;
        }
    }

    /// Runs the handshake for either side: originators open the channel and
    /// offer, answerers reply to the stored offer.
    pub(crate) async fn start(&mut self, ctx: &mut SessionContext<'_>) {
        let role = match self.offer.take() {
            Some(offer) => Role::Answerer { offer },
            None => Role::Originator {
                label: Some(self.label.clone()),
                reliable: Some(self.reliable),
                serialization: Some(self.serialization),
                metadata: self.metadata.clone(),
                constraints: OfferConstraints::default(),
            },
        };
        self.set_state(ConnectionState::Negotiating);
        let connection = self.reference();
        let entry_id = match ctx.negotiator.acquire(&connection).await {
            Ok(entry_id) => entry_id,
            Err(err) => {
                ctx.report(err);
                return;
            }
        };
        self.native = Some(entry_id.clone());
        if let Err(err) = ctx
            .negotiator
            .handshake(&entry_id, &connection, None, role)
            .await
        {
            ctx.report(err);
        }
    }

    pub(crate) async fn handle_message(
        &mut self,
        message: ControlMessage,
        ctx: &mut SessionContext<'_>,
    ) {
        let Some(entry_id) = self.native.clone() else {
            tracing::warn!(
                target = "pier",
                connection = %self.id,
                kind = message.kind.as_str(),
                "data connection has no peer connection; message dropped"
            );
            return;
        };
        if let Err(err) = ctx.negotiator.apply(&entry_id, &message).await {
            ctx.report(err);
        }
    }

    pub(crate) fn mark_open(&mut self) {
        if self.state() == ConnectionState::Open || self.state() == ConnectionState::Closed {
            return;
        }
        self.set_state(ConnectionState::Open);
        let _ = self.events.send(DataConnectionEvent::Open);
    }

    pub(crate) async fn fail(&mut self, error: PeerError, ctx: &mut SessionContext<'_>) {
        let _ = self.events.send(DataConnectionEvent::Error(error));
        self.close(ctx).await;
    }

    pub(crate) async fn close(&mut self, ctx: &mut SessionContext<'_>) {
        {
            let mut state = self.state.write();
            if *state == ConnectionState::Closed {
                return;
            }
            *state = ConnectionState::Closed;
        }
        if let Some(entry_id) = self.native.take() {
            let connection = self.reference();
            ctx.negotiator.cleanup(&entry_id, &connection).await;
        }
        let _ = self.events.send(DataConnectionEvent::Close);
    }
}

#[derive(Clone)]
pub struct DataConnection {
    id: String,
    peer: String,
    label: String,
    reliable: bool,
    serialization: Serialization,
    metadata: Option<Value>,
    state: Arc<RwLock<ConnectionState>>,
    commands: mpsc::UnboundedSender<Command>,
    events: Arc<AsyncMutex<mpsc::UnboundedReceiver<DataConnectionEvent>>>,
}

impl DataConnection {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn reliable(&self) -> bool {
        self.reliable
    }

    pub fn serialization(&self) -> Serialization {
        self.serialization
    }

    pub fn metadata(&self) -> Option<&Value> {
        self.metadata.as_ref()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub async fn close(&self) {
        let (reply, done) = oneshot::channel();
        let command = Command::CloseConnection {
            peer: self.peer.clone(),
            connection_id: self.id.clone(),
            reply,
        };
        if self.commands.send(command).is_ok() {
            let _ = done.await;
        }
    }

    pub async fn recv(&self) -> Option<DataConnectionEvent> {
        self.events.lock().await.recv().await
    }
}

impl fmt::Debug for DataConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataConnection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("label", &self.label)
            .field("state", &self.state())
            .finish()
    }
}
