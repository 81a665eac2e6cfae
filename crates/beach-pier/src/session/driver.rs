use std::ops::ControlFlow;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};

use super::registry::{ConnectionEntry, ConnectionRegistry};
use super::{PeerEvent, PeerStatus};
use crate::config::PeerOptions;
use crate::connection::data::DataSession;
use crate::connection::media::{missing_media, MediaSession};
use crate::connection::{
    CallOptions, ConnectOptions, Connection, DataConnection, MediaConnection,
};
use crate::error::{ErrorKind, PeerError, TransportError};
use crate::native::{MediaStream, NativeEvent};
use crate::negotiation::{NativeOutcome, NegotiationError, Negotiator};
use crate::protocol::{ConnectionType, ControlMessage, MessageType, OfferPayload};
use crate::transport::{ServerTransport, TransportEvent};

pub(crate) enum Command {
    IdAssigned(Result<String, TransportError>),
    Call {
        peer: String,
        stream: Option<MediaStream>,
        options: CallOptions,
        reply: oneshot::Sender<Result<MediaConnection, PeerError>>,
    },
    Connect {
        peer: String,
        options: ConnectOptions,
        reply: oneshot::Sender<Result<DataConnection, PeerError>>,
    },
    Answer {
        peer: String,
        connection_id: String,
        stream: MediaStream,
        reply: oneshot::Sender<()>,
    },
    CloseConnection {
        peer: String,
        connection_id: String,
        reply: oneshot::Sender<()>,
    },
    GetConnection {
        peer: String,
        connection_id: String,
        reply: oneshot::Sender<Option<Connection>>,
    },
    Connections {
        peer: String,
        reply: oneshot::Sender<Vec<Connection>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Destroy {
        reply: oneshot::Sender<()>,
    },
    /// The last `Peer` handle went away.
    Shutdown,
}

/// What a connection needs from the session while handling a step.
pub(crate) struct SessionContext<'a> {
    pub(crate) negotiator: &'a mut Negotiator,
    pub(crate) events: &'a mpsc::UnboundedSender<PeerEvent>,
}

impl SessionContext<'_> {
    /// Surfaces a negotiation failure on the session.
    pub(crate) fn report(&self, err: NegotiationError) {
        tracing::warn!(target = "pier", error = %err, "negotiation failed");
        let _ = self.events.send(PeerEvent::Error(PeerError::new(
            ErrorKind::Negotiation,
            err.to_string(),
        )));
    }
}

pub(crate) struct SessionDriver {
    options: PeerOptions,
    transport: Arc<dyn ServerTransport>,
    negotiator: Negotiator,
    registry: ConnectionRegistry,
    status: Arc<RwLock<PeerStatus>>,
    events: mpsc::UnboundedSender<PeerEvent>,
    commands: mpsc::UnboundedSender<Command>,
}

impl SessionDriver {
    pub(crate) fn new(
        options: PeerOptions,
        transport: Arc<dyn ServerTransport>,
        negotiator: Negotiator,
        status: Arc<RwLock<PeerStatus>>,
        events: mpsc::UnboundedSender<PeerEvent>,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            options,
            transport,
            negotiator,
            registry: ConnectionRegistry::new(),
            status,
            events,
            commands,
        }
    }

    /// Binds `id` and opens the server channels.
    pub(crate) fn initialize(&mut self, id: String) {
        tracing::debug!(target = "pier", id = %id, "starting session");
        self.transport.start(&id, &self.options.token);
        self.status.write().id = Some(id);
    }

    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        mut native_events: mpsc::UnboundedReceiver<(String, NativeEvent)>,
    ) {
        loop {
            tokio::select! {
                biased;
                Some((entry_id, event)) = native_events.recv() => {
                    self.on_native_event(&entry_id, event).await;
                }
                Some(event) = transport_events.recv() => {
                    self.on_transport_event(event).await;
                }
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    if self.on_command(command).await.is_break() {
                        break;
                    }
                }
            }
        }
        self.destroy().await;
    }

    fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    fn context(&mut self) -> SessionContext<'_> {
        SessionContext {
            negotiator: &mut self.negotiator,
            events: &self.events,
        }
    }

    /// Breaks once the last `Peer` handle is gone.
    async fn on_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::IdAssigned(Ok(id)) => {
                if self.status.read().disconnected {
                    return ControlFlow::Continue(());
                }
                self.initialize(id);
            }
            Command::IdAssigned(Err(err)) => {
                tracing::error!(target = "pier", error = %err, "identity request failed");
                self.abort(ErrorKind::ServerError, "Could not get an ID from the server.")
                    .await;
            }
            Command::Call {
                peer,
                stream,
                options,
                reply,
            } => {
                let _ = reply.send(self.call(&peer, stream, options).await);
            }
            Command::Connect {
                peer,
                options,
                reply,
            } => {
                let _ = reply.send(self.connect(&peer, options).await);
            }
            Command::Answer {
                peer,
                connection_id,
                stream,
                reply,
            } => {
                let mut ctx = SessionContext {
                    negotiator: &mut self.negotiator,
                    events: &self.events,
                };
                match self.registry.get_mut(&peer, &connection_id) {
                    Some(ConnectionEntry::Media(session)) => session.answer(stream, &mut ctx).await,
                    _ => tracing::warn!(
                        target = "pier",
                        peer = %peer,
                        connection = %connection_id,
                        "answer for unknown media connection"
                    ),
                }
                let _ = reply.send(());
            }
            Command::CloseConnection {
                peer,
                connection_id,
                reply,
            } => {
                if let Some(mut entry) = self.registry.remove(&peer, &connection_id) {
                    entry.close(&mut self.context()).await;
                }
                let _ = reply.send(());
            }
            Command::GetConnection {
                peer,
                connection_id,
                reply,
            } => {
                let connection = self
                    .registry
                    .get(&peer, &connection_id)
                    .map(ConnectionEntry::handle);
                let _ = reply.send(connection);
            }
            Command::Connections { peer, reply } => {
                let _ = reply.send(self.registry.handles(&peer));
            }
            Command::Disconnect { reply } => {
                self.disconnect();
                let _ = reply.send(());
            }
            Command::Destroy { reply } => {
                self.destroy().await;
                let _ = reply.send(());
            }
            Command::Shutdown => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    fn ensure_connected(&self) -> Result<(), PeerError> {
        if self.status.read().disconnected {
            let error = PeerError::new(
                ErrorKind::Disconnected,
                "You cannot connect to a new Peer because you called .disconnect() on this Peer \
                 and ended your connection with the server. You can create a new Peer to reconnect.",
            );
            tracing::warn!(target = "pier", "{}", error.detail);
            return Err(error);
        }
        Ok(())
    }

    async fn call(
        &mut self,
        peer: &str,
        stream: Option<MediaStream>,
        options: CallOptions,
    ) -> Result<MediaConnection, PeerError> {
        self.ensure_connected()?;
        let Some(stream) = stream else {
            let error = missing_media();
            tracing::error!(target = "pier", "{}", error.detail);
            return Err(error);
        };
        let (mut session, handle) =
            MediaSession::outbound(peer, stream, options, self.commands.clone());
        session.start(&mut self.context()).await;
        tracing::debug!(target = "pier", peer, connection = %handle.id(), "calling peer");
        self.registry.add(ConnectionEntry::Media(session));
        Ok(handle)
    }

    async fn connect(
        &mut self,
        peer: &str,
        options: ConnectOptions,
    ) -> Result<DataConnection, PeerError> {
        self.ensure_connected()?;
        let (mut session, handle) = DataSession::outbound(peer, options, self.commands.clone());
        session.start(&mut self.context()).await;
        tracing::debug!(target = "pier", peer, connection = %handle.id(), "connecting to peer");
        self.registry.add(ConnectionEntry::Data(session));
        Ok(handle)
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Message(message) => self.handle_message(message).await,
            TransportEvent::Error(detail) => {
                self.abort(ErrorKind::SocketError, detail).await;
            }
            TransportEvent::Disconnected => {
                let (open, disconnected) = {
                    let status = self.status.read();
                    (status.open, status.disconnected)
                };
                if disconnected {
                    return;
                }
                if open {
                    self.emit(PeerEvent::Error(PeerError::new(
                        ErrorKind::Network,
                        "Lost connection to server.",
                    )));
                    self.disconnect();
                } else {
                    self.abort(
                        ErrorKind::SocketClosed,
                        "Underlying socket is already closed.",
                    )
                    .await;
                }
            }
        }
    }

    async fn handle_message(&mut self, message: ControlMessage) {
        if self.status.read().disconnected {
            tracing::debug!(target = "pier", kind = message.kind.as_str(), "message after disconnect dropped");
            return;
        }
        match message.kind {
            MessageType::Open => {
                let id = {
                    let mut status = self.status.write();
                    status.open = true;
                    status.id.clone().unwrap_or_default()
                };
                tracing::info!(target = "pier", id = %id, "session open");
                self.emit(PeerEvent::Open(id));
            }
            MessageType::Error => {
                let detail = message
                    .error_message()
                    .unwrap_or("unknown server error")
                    .to_string();
                self.abort(ErrorKind::ServerError, detail).await;
            }
            MessageType::IdTaken => {
                let id = self.status.read().id.clone().unwrap_or_default();
                self.abort(ErrorKind::UnavailableId, format!("ID \"{id}\" is taken"))
                    .await;
            }
            MessageType::InvalidKey => {
                let detail = format!("API KEY \"{}\" is invalid", self.options.key);
                self.abort(ErrorKind::InvalidKey, detail).await;
            }
            MessageType::Leave => {
                let Some(peer) = message.src else {
                    tracing::warn!(target = "pier", "LEAVE without source");
                    return;
                };
                tracing::debug!(target = "pier", peer = %peer, "peer left");
                self.cleanup_peer(&peer).await;
            }
            MessageType::Expire => {
                let peer = message.src.unwrap_or_default();
                self.emit(PeerEvent::Error(PeerError::new(
                    ErrorKind::PeerUnavailable,
                    format!("Could not connect to peer {peer}"),
                )));
            }
            MessageType::Offer => self.on_offer(message).await,
            MessageType::Answer | MessageType::Candidate => self.route(message).await,
        }
    }

    async fn on_offer(&mut self, message: ControlMessage) {
        let Some(peer) = message.src.clone() else {
            tracing::warn!(target = "pier", "OFFER without source");
            return;
        };
        let offer: OfferPayload = match message.decode_payload() {
            Ok(offer) => offer,
            Err(err) => {
                tracing::warn!(target = "pier", peer = %peer, error = %err, "dropping offer");
                return;
            }
        };
        let connection_id = offer.connection_id.clone();

        if let Some(mut existing) = self.registry.remove(&peer, &connection_id) {
            tracing::warn!(
                target = "pier",
                peer = %peer,
                connection = %connection_id,
                "offer received for existing connection id; replacing it"
            );
            existing.close(&mut self.context()).await;
        }

        match offer.connection_type {
            ConnectionType::Media => {
                let (session, handle) = MediaSession::inbound(&peer, offer, self.commands.clone());
                self.registry.add(ConnectionEntry::Media(session));
                self.emit(PeerEvent::Call(handle));
            }
            ConnectionType::Data => {
                let (mut session, handle) =
                    DataSession::inbound(&peer, offer, self.commands.clone());
                session.start(&mut self.context()).await;
                self.registry.add(ConnectionEntry::Data(session));
                self.emit(PeerEvent::Connection(handle));
            }
        }

        let buffered = self.registry.take_messages(&connection_id);
        if buffered.is_empty() {
            return;
        }
        tracing::debug!(
            target = "pier",
            connection = %connection_id,
            count = buffered.len(),
            "replaying buffered messages"
        );
        let mut ctx = SessionContext {
            negotiator: &mut self.negotiator,
            events: &self.events,
        };
        if let Some(entry) = self.registry.get_mut(&peer, &connection_id) {
            for buffered_message in buffered {
                entry.handle_message(buffered_message, &mut ctx).await;
            }
        }
    }

    async fn route(&mut self, message: ControlMessage) {
        let Some(peer) = message.src.clone() else {
            tracing::warn!(target = "pier", kind = message.kind.as_str(), "message without source");
            return;
        };
        if message.payload.is_none() {
            tracing::warn!(
                target = "pier",
                kind = message.kind.as_str(),
                peer = %peer,
                "malformed message without payload"
            );
            return;
        }
        let Some(connection_id) = message.connection_id().map(str::to_string) else {
            tracing::warn!(
                target = "pier",
                kind = message.kind.as_str(),
                peer = %peer,
                "unrecognized message without connection id"
            );
            return;
        };

        let mut ctx = SessionContext {
            negotiator: &mut self.negotiator,
            events: &self.events,
        };
        match self.registry.get_mut(&peer, &connection_id) {
            Some(entry) => entry.handle_message(message, &mut ctx).await,
            None => {
                tracing::debug!(
                    target = "pier",
                    kind = message.kind.as_str(),
                    connection = %connection_id,
                    "buffering message for unknown connection"
                );
                self.registry.store_message(&connection_id, message);
            }
        }
    }

    async fn on_native_event(&mut self, entry_id: &str, event: NativeEvent) {
        let Some(outcome) = self.negotiator.on_native_event(entry_id, event) else {
            return;
        };
        match outcome {
            NativeOutcome::Failed(connection) => {
                let Some(mut entry) = self
                    .registry
                    .remove(&connection.peer, &connection.connection_id)
                else {
                    return;
                };
                let error = PeerError::new(
                    ErrorKind::Negotiation,
                    format!("Negotiation of connection to {} failed.", connection.peer),
                );
                entry.fail(error, &mut self.context()).await;
            }
            NativeOutcome::Track(connection, stream) => {
                if let Some(entry) = self
                    .registry
                    .get_mut(&connection.peer, &connection.connection_id)
                {
                    entry.add_remote_stream(stream);
                }
            }
            NativeOutcome::DataChannelOpened(connection) => {
                if let Some(entry) = self
                    .registry
                    .get_mut(&connection.peer, &connection.connection_id)
                {
                    entry.mark_open();
                }
            }
        }
    }

    async fn cleanup_peer(&mut self, peer: &str) {
        let entries = self.registry.take_peer(peer);
        let mut ctx = self.context();
        for mut entry in entries {
            tracing::debug!(
                target = "pier",
                connection = %entry.id(),
                kind = ?entry.kind(),
                state = ?entry.state(),
                "closing connection of departed peer"
            );
            entry.close(&mut ctx).await;
        }
    }

    fn disconnect(&mut self) {
        let last_id = {
            let mut status = self.status.write();
            if status.disconnected {
                return;
            }
            status.disconnected = true;
            status.open = false;
            let last_id = status.id.take();
            if last_id.is_some() {
                status.last_server_id = last_id.clone();
            }
            last_id
        };
        self.transport.close();
        tracing::info!(target = "pier", id = ?last_id, "session disconnected");
        self.emit(PeerEvent::Disconnected(last_id));
    }

    async fn destroy(&mut self) {
        if self.status.read().destroyed {
            return;
        }
        let entries = self.registry.drain_all();
        {
            let mut ctx = self.context();
            for mut entry in entries {
                entry.close(&mut ctx).await;
            }
        }
        self.emit(PeerEvent::Close);
        self.disconnect();
        self.status.write().destroyed = true;
    }

    async fn abort(&mut self, kind: ErrorKind, detail: impl Into<String>) {
        debug_assert!(kind.is_session_fatal());
        let error = PeerError::new(kind, detail);
        if self.status.read().destroyed {
            tracing::debug!(target = "pier", kind = kind.as_str(), detail = %error.detail, "session already destroyed; error dropped");
            return;
        }
        tracing::error!(target = "pier", kind = kind.as_str(), detail = %error.detail, "aborting session");
        self.destroy().await;
        self.emit(PeerEvent::Error(error));
    }
}
