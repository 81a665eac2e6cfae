use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};

use super::{session_gone, CallOptions, ConnectionState};
use crate::error::{ErrorKind, PeerError};
use crate::native::{MediaStream, OfferConstraints, SessionDescription};
use crate::negotiation::{Applied, ConnectionRef, Role};
use crate::protocol::{ConnectionType, ControlMessage, OfferPayload};
use crate::session::driver::{Command, SessionContext};
use crate::util;

#[derive(Debug, Clone, PartialEq)]
pub enum MediaConnectionEvent {
    /// Remote media arrived; reported once per stream id.
    Stream(MediaStream),
    Close,
    Error(PeerError),
}

#[derive(Debug, Default)]
struct MediaStatus {
    state: ConnectionState,
    local_stream: Option<MediaStream>,
    remote_stream: Option<MediaStream>,
}

/// Driver-side state of one media connection.
pub(crate) struct MediaSession {
    id: String,
    peer: String,
    /// SDP of the inbound offer, waiting for `answer`.
    offer: Option<SessionDescription>,
    metadata: Option<Value>,
    constraints: OfferConstraints,
    native: Option<String>,
    pending: Vec<ControlMessage>,
    seen_streams: HashSet<String>,
    status: Arc<RwLock<MediaStatus>>,
    events: mpsc::UnboundedSender<MediaConnectionEvent>,
    handle: MediaConnection,
}

impl MediaSession {
    /// Connection we originate; `start` runs the offer.
    pub(crate) fn outbound(
        peer: &str,
        stream: MediaStream,
        options: CallOptions,
        commands: mpsc::UnboundedSender<Command>,
    ) -> (Self, MediaConnection) {
        let status = MediaStatus {
            local_stream: Some(stream),
            ..MediaStatus::default()
        };
        Self::build(
            util::prefixed_id("mc_"),
            peer,
            None,
            options.metadata,
            options.constraints,
            status,
            commands,
        )
    }

    /// Connection offered by `peer`; inert until answered.
    pub(crate) fn inbound(
        peer: &str,
        offer: OfferPayload,
        commands: mpsc::UnboundedSender<Command>,
    ) -> (Self, MediaConnection) {
        Self::build(
            offer.connection_id,
            peer,
            Some(offer.sdp),
            offer.metadata,
            OfferConstraints::default(),
            MediaStatus::default(),
            commands,
        )
    }

    fn build(
        id: String,
        peer: &str,
        offer: Option<SessionDescription>,
        metadata: Option<Value>,
        constraints: OfferConstraints,
        status: MediaStatus,
        commands: mpsc::UnboundedSender<Command>,
    ) -> (Self, MediaConnection) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let status = Arc::new(RwLock::new(status));
        let handle = MediaConnection {
            id: id.clone(),
            peer: peer.to_string(),
            metadata: metadata.clone(),
            status: Arc::clone(&status),
            commands,
            events: Arc::new(AsyncMutex::new(events_rx)),
        };
        let session = Self {
            id,
            peer: peer.to_string(),
            offer,
            metadata,
            constraints,
            native: None,
            pending: Vec::new(),
            seen_streams: HashSet::new(),
            status,
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
        self.status.read().state
    }

    fn reference(&self) -> ConnectionRef {
        ConnectionRef {
            kind: ConnectionType::Media,
            peer: self.peer.clone(),
            connection_id: self.id.clone(),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let mut status = self.status.write();
        if status.state != ConnectionState::Closed {
            status.state = state;
        }
    }

    /// Starts the outbound handshake.
    pub(crate) async fn start(&mut self, ctx: &mut SessionContext<'_>) {
        let Some(stream) = self.status.read().local_stream.clone() else {
            return;
        };
        self.set_state(ConnectionState::Negotiating);
        let role = Role::Originator {
            label: None,
            reliable: None,
            serialization: None,
            metadata: self.metadata.clone(),
            constraints: self.constraints,
        };
        self.negotiate(Some(&stream), role, ctx).await;
    }

    /// Returns `false` when the handshake could not be run; the failure has
    /// already been reported on the session.
    async fn negotiate(
        &mut self,
        stream: Option<&MediaStream>,
        role: Role,
        ctx: &mut SessionContext<'_>,
    ) -> bool {
        let connection = self.reference();
        let entry_id = match ctx.negotiator.acquire(&connection).await {
            Ok(entry_id) => entry_id,
            Err(err) => {
                ctx.report(err);
                return false;
            }
        };
        self.native = Some(entry_id.clone());
        match ctx
            .negotiator
            .handshake(&entry_id, &connection, stream, role)
            .await
        {
            Ok(()) => true,
            Err(err) => {
                ctx.report(err);
                false
            }
        }
    }

    pub(crate) async fn answer(&mut self, stream: MediaStream, ctx: &mut SessionContext<'_>) {
        {
            let mut status = self.status.write();
            if status.state == ConnectionState::Closed {
                tracing::warn!(target = "pier", connection = %self.id, "answer on closed media connection ignored");
                return;
            }
            if status.local_stream.is_some() {
                tracing::warn!(
                    target = "pier",
                    connection = %self.id,
                    "local stream already exists on this media connection; answer ignored"
                );
                return;
            }
            status.local_stream = Some(stream.clone());
            status.state = ConnectionState::Negotiating;
        }

        let answered = match self.offer.take() {
            Some(offer) => {
                self.negotiate(Some(&stream), Role::Answerer { offer }, ctx)
                    .await
            }
            None => {
                tracing::warn!(target = "pier", connection = %self.id, "no offer to answer");
                false
            }
        };
        if !answered {
            // Stays negotiating; buffered messages wait for a native instance.
            return;
        }

        let pending = std::mem::take(&mut self.pending);
        for message in pending {
            self.handle_message(message, ctx).await;
        }
        self.set_state(ConnectionState::Open);
    }

    pub(crate) async fn handle_message(
        &mut self,
        message: ControlMessage,
        ctx: &mut SessionContext<'_>,
    ) {
        let Some(entry_id) = self.native.clone() else {
            self.pending.push(message);
            return;
        };
        match ctx.negotiator.apply(&entry_id, &message).await {
            Ok(Applied::Answer) => self.set_state(ConnectionState::Open),
            Ok(_) => {}
            Err(err) => ctx.report(err),
        }
    }

    pub(crate) fn add_remote_stream(&mut self, stream: MediaStream) {
        if !self.seen_streams.insert(stream.id().to_string()) {
            return;
        }
        tracing::debug!(target = "pier", connection = %self.id, stream = stream.id(), "remote stream");
        self.status.write().remote_stream = Some(stream.clone());
        let _ = self.events.send(MediaConnectionEvent::Stream(stream));
    }

    /// Reports `error` on the connection, then closes it.
    pub(crate) async fn fail(&mut self, error: PeerError, ctx: &mut SessionContext<'_>) {
        let _ = self.events.send(MediaConnectionEvent::Error(error));
        self.close(ctx).await;
    }

    pub(crate) async fn close(&mut self, ctx: &mut SessionContext<'_>) {
        {
            let mut status = self.status.write();
            if status.state == ConnectionState::Closed {
                return;
            }
            status.state = ConnectionState::Closed;
        }
        if let Some(entry_id) = self.native.take() {
            let connection = self.reference();
            ctx.negotiator.cleanup(&entry_id, &connection).await;
        }
        self.pending.clear();
        let _ = self.events.send(MediaConnectionEvent::Close);
    }

    pub(crate) fn handle(&self) -> MediaConnection {
        self.handle.clone()
    }
}

/// Application handle to a media connection. Clones share state and the
/// event stream.
#[derive(Clone)]
pub struct MediaConnection {
    id: String,
    peer: String,
    metadata: Option<Value>,
    status: Arc<RwLock<MediaStatus>>,
    commands: mpsc::UnboundedSender<Command>,
    events: Arc<AsyncMutex<mpsc::UnboundedReceiver<MediaConnectionEvent>>>,
}

impl MediaConnection {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn metadata(&self) -> Option<&Value> {
        self.metadata.as_ref()
    }

    pub fn state(&self) -> ConnectionState {
        self.status.read().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn local_stream(&self) -> Option<MediaStream> {
        self.status.read().local_stream.clone()
    }

    pub fn remote_stream(&self) -> Option<MediaStream> {
        self.status.read().remote_stream.clone()
    }

    /// Accepts an inbound call with `stream`. A second answer is ignored.
    pub async fn answer(&self, stream: MediaStream) -> Result<(), PeerError> {
        let (reply, done) = oneshot::channel();
        self.commands
            .send(Command::Answer {
                peer: self.peer.clone(),
                connection_id: self.id.clone(),
                stream,
                reply,
            })
            .map_err(|_| session_gone())?;
        done.await.map_err(|_| session_gone())
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

    /// Next connection event; `None` once the session is gone.
    pub async fn recv(&self) -> Option<MediaConnectionEvent> {
        self.events.lock().await.recv().await
    }
}

impl fmt::Debug for MediaConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaConnection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}

pub(crate) fn missing_media() -> PeerError {
    PeerError::new(
        ErrorKind::MissingMedia,
        "To call a peer, you must provide a stream",
    )
}
