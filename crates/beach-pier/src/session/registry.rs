use std::collections::HashMap;

use crate::connection::media::MediaSession;
use crate::connection::data::DataSession;
use crate::connection::{Connection, ConnectionState};
use crate::error::PeerError;
use crate::native::MediaStream;
use crate::protocol::{ConnectionType, ControlMessage};

use super::driver::SessionContext;

pub(crate) enum ConnectionEntry {
    Media(MediaSession),
    Data(DataSession),
}

impl ConnectionEntry {
    pub(crate) fn id(&self) -> &str {
        match self {
            ConnectionEntry::Media(session) => session.id(),
            ConnectionEntry::Data(session) => session.id(),
        }
    }

    pub(crate) fn peer(&self) -> &str {
        match self {
            ConnectionEntry::Media(session) => session.peer(),
            ConnectionEntry::Data(session) => session.peer(),
        }
    }

    pub(crate) fn kind(&self) -> ConnectionType {
        match self {
            ConnectionEntry::Media(_) => ConnectionType::Media,
            ConnectionEntry::Data(_) => ConnectionType::Data,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        match self {
            ConnectionEntry::Media(session) => session.state(),
            ConnectionEntry::Data(session) => session.state(),
        }
    }

    pub(crate) fn handle(&self) -> Connection {
        match self {
            ConnectionEntry::Media(session) => Connection::Media(session.handle()),
            ConnectionEntry::Data(session) => Connection::Data(session.handle()),
        }
    }

    pub(crate) async fn handle_message(
        &mut self,
        message: ControlMessage,
        ctx: &mut SessionContext<'_>,
    ) {
        match self {
            ConnectionEntry::Media(session) => session.handle_message(message, ctx).await,
            ConnectionEntry::Data(session) => session.handle_message(message, ctx).await,
        }
    }

    pub(crate) fn add_remote_stream(&mut self, stream: MediaStream) {
        match self {
            ConnectionEntry::Media(session) => session.add_remote_stream(stream),
            ConnectionEntry::Data(session) => {
                tracing::debug!(target = "pier", connection = %session.id(), "track on data connection ignored");
            }
        }
    }

    pub(crate) fn mark_open(&mut self) {
        if let ConnectionEntry::Data(session) = self {
            session.mark_open();
        }
    }

    pub(crate) async fn fail(&mut self, error: PeerError, ctx: &mut SessionContext<'_>) {
        match self {
            ConnectionEntry::Media(session) => session.fail(error, ctx).await,
            ConnectionEntry::Data(session) => session.fail(error, ctx).await,
        }
    }

    pub(crate) async fn close(&mut self, ctx: &mut SessionContext<'_>) {
        match self {
            ConnectionEntry::Media(session) => session.close(ctx).await,
            ConnectionEntry::Data(session) => session.close(ctx).await,
        }
    }
}

/// Live connections per remote peer plus messages that arrived before
/// their connection existed.
#[derive(Default)]
pub(crate) struct ConnectionRegistry {
    connections: HashMap<String, Vec<ConnectionEntry>>,
    lost: HashMap<String, Vec<ControlMessage>>,
}

impl ConnectionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&mut self, entry: ConnectionEntry) {
        self.connections
            .entry(entry.peer().to_string())
            .or_default()
            .push(entry);
    }

    pub(crate) fn get(&self, peer: &str, connection_id: &str) -> Option<&ConnectionEntry> {
        self.connections
            .get(peer)?
            .iter()
            .find(|entry| entry.id() == connection_id)
    }

    pub(crate) fn get_mut(
        &mut self,
        peer: &str,
        connection_id: &str,
    ) -> Option<&mut ConnectionEntry> {
        self.connections
            .get_mut(peer)?
            .iter_mut()
            .find(|entry| entry.id() == connection_id)
    }

    pub(crate) fn remove(&mut self, peer: &str, connection_id: &str) -> Option<ConnectionEntry> {
        let entries = self.connections.get_mut(peer)?;
        let position = entries.iter().position(|entry| entry.id() == connection_id)?;
        let entry = entries.remove(position);
        if entries.is_empty() {
            self.connections.remove(peer);
        }
        Some(entry)
    }

    pub(crate) fn handles(&self, peer: &str) -> Vec<Connection> {
        self.connections
            .get(peer)
            .map(|entries| entries.iter().map(ConnectionEntry::handle).collect())
            .unwrap_or_default()
    }

    pub(crate) fn take_peer(&mut self, peer: &str) -> Vec<ConnectionEntry> {
        self.connections.remove(peer).unwrap_or_default()
    }

    pub(crate) fn drain_all(&mut self) -> Vec<ConnectionEntry> {
        self.lost.clear();
        self.connections
            .drain()
            .flat_map(|(_, entries)| entries)
            .collect()
    }

    pub(crate) fn store_message(&mut self, connection_id: &str, message: ControlMessage) {
        self.lost
            .entry(connection_id.to_string())
            .or_default()
            .push(message);
    }

    pub(crate) fn take_messages(&mut self, connection_id: &str) -> Vec<ControlMessage> {
        self.lost.remove(connection_id).unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn buffered(&self, connection_id: &str) -> usize {
        self.lost.get(connection_id).map(Vec::len).unwrap_or(0)
    }
}
