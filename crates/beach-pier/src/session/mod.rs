//! The local endpoint: identity, connections and message routing.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};

use crate::config::PeerOptions;
use crate::connection::{
    session_gone, CallOptions, ConnectOptions, Connection, DataConnection, MediaConnection,
};
use crate::error::{ErrorKind, PeerError};
use crate::native::{MediaStream, PeerConnectionFactory};
use crate::negotiation::Negotiator;
use crate::transport::{ServerTransport, Socket, TransportEvent};
use crate::util;

pub(crate) mod driver;
pub(crate) mod registry;

use driver::{Command, SessionDriver};

#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// The server confirmed the identity.
    Open(String),
    /// A remote peer is calling; answer it to start media.
    Call(MediaConnection),
    /// A remote peer opened a data connection.
    Connection(DataConnection),
    Error(PeerError),
    /// Carries the identity the session had, if any.
    Disconnected(Option<String>),
    Close,
}

#[derive(Debug, Default)]
pub(crate) struct PeerStatus {
    pub(crate) id: Option<String>,
    pub(crate) last_server_id: Option<String>,
    pub(crate) open: bool,
    pub(crate) disconnected: bool,
    pub(crate) destroyed: bool,
}

struct PeerInner {
    status: Arc<RwLock<PeerStatus>>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Drop for PeerInner {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

/// Handle to a signaling session. Clones share the session; it is torn
/// down when the last clone is dropped.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl Peer {
    /// Starts a session against the server in `options`.
    ///
    /// With no `id` (or an empty one) the server assigns the identity in
    /// the background. Must be called within a tokio runtime.
    pub fn new(
        id: Option<&str>,
        options: PeerOptions,
        factory: Arc<dyn PeerConnectionFactory>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<PeerEvent>), PeerError> {
        check_id(id)?;
        let (socket, transport_events) = Socket::new(&options);
        Self::with_transport(id, options, Arc::new(socket), transport_events, factory)
    }

    /// Like [`Peer::new`] over a caller-supplied transport.
    pub fn with_transport(
        id: Option<&str>,
        options: PeerOptions,
        transport: Arc<dyn ServerTransport>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        factory: Arc<dyn PeerConnectionFactory>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<PeerEvent>), PeerError> {
        check_id(id)?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (native_tx, native_rx) = mpsc::unbounded_channel();
        let status = Arc::new(RwLock::new(PeerStatus::default()));

        let negotiator = Negotiator::new(
            factory,
            Arc::clone(&transport),
            options.config.clone(),
            native_tx,
        );
        let mut driver = SessionDriver::new(
            options,
            Arc::clone(&transport),
            negotiator,
            Arc::clone(&status),
            events_tx,
            commands_tx.clone(),
        );

        match id.filter(|id| !id.is_empty()) {
            Some(id) => driver.initialize(id.to_string()),
            None => {
                let commands = commands_tx.clone();
                tokio::spawn(async move {
                    let assigned = transport.retrieve_id().await;
                    let _ = commands.send(Command::IdAssigned(assigned));
                });
            }
        }
        tokio::spawn(driver.run(commands_rx, transport_events, native_rx));

        let peer = Self {
            inner: Arc::new(PeerInner {
                status,
                commands: commands_tx,
            }),
        };
        Ok((peer, events_rx))
    }

    /// Current identity; `None` before assignment and after disconnect.
    pub fn id(&self) -> Option<String> {
        self.inner.status.read().id.clone()
    }

    pub fn last_server_id(&self) -> Option<String> {
        self.inner.status.read().last_server_id.clone()
    }

    pub fn is_open(&self) -> bool {
        self.inner.status.read().open
    }

    pub fn is_disconnected(&self) -> bool {
        self.inner.status.read().disconnected
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.status.read().destroyed
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, PeerError> {
        let (reply, done) = oneshot::channel();
        self.inner
            .commands
            .send(build(reply))
            .map_err(|_| session_gone())?;
        done.await.map_err(|_| session_gone())
    }

    /// Calls `peer` with `stream`. Fails with `missing-media` when no
    /// stream is given and with `disconnected` after [`Peer::disconnect`].
    pub async fn call(
        &self,
        peer: &str,
        stream: Option<MediaStream>,
        options: CallOptions,
    ) -> Result<MediaConnection, PeerError> {
        self.request(|reply| Command::Call {
            peer: peer.to_string(),
            stream,
            options,
            reply,
        })
        .await?
    }

    /// Opens a data connection to `peer`.
    pub async fn connect(
        &self,
        peer: &str,
        options: ConnectOptions,
    ) -> Result<DataConnection, PeerError> {
        self.request(|reply| Command::Connect {
            peer: peer.to_string(),
            options,
            reply,
        })
        .await?
    }

    pub async fn get_connection(&self, peer: &str, connection_id: &str) -> Option<Connection> {
        self.request(|reply| Command::GetConnection {
            peer: peer.to_string(),
            connection_id: connection_id.to_string(),
            reply,
        })
        .await
        .ok()
        .flatten()
    }

    /// Live connections to `peer`.
    pub async fn connections(&self, peer: &str) -> Vec<Connection> {
        self.request(|reply| Command::Connections {
            peer: peer.to_string(),
            reply,
        })
        .await
        .unwrap_or_default()
    }

    /// Leaves the server but keeps existing connections. Idempotent and
    /// final: a disconnected session cannot reconnect.
    pub async fn disconnect(&self) {
        let _ = self.request(|reply| Command::Disconnect { reply }).await;
    }

    /// Closes every connection and disconnects. Idempotent.
    pub async fn destroy(&self) {
        let _ = self.request(|reply| Command::Destroy { reply }).await;
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self.inner.status.read();
        f.debug_struct("Peer")
            .field("id", &status.id)
            .field("open", &status.open)
            .field("disconnected", &status.disconnected)
            .field("destroyed", &status.destroyed)
            .finish()
    }
}

fn check_id(id: Option<&str>) -> Result<(), PeerError> {
    match id {
        Some(id) if !util::validate_id(id) => Err(PeerError::new(
            ErrorKind::InvalidId,
            format!("ID \"{id}\" is invalid"),
        )),
        _ => Ok(()),
    }
}
