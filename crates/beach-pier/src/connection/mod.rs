//! Logical peer-to-peer sessions and their public handles.

use serde_json::Value;

use crate::error::{ErrorKind, PeerError};
use crate::native::OfferConstraints;
use crate::protocol::{ConnectionType, Serialization};

pub mod data;
pub mod media;

pub use data::{DataConnection, DataConnectionEvent};
pub use media::{MediaConnection, MediaConnectionEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Created,
    Negotiating,
    Open,
    Closed,
}

#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub metadata: Option<Value>,
    pub constraints: OfferConstraints,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Defaults to the connection id.
    pub label: Option<String>,
    pub reliable: bool,
    pub serialization: Serialization,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone)]
pub enum Connection {
    Media(MediaConnection),
    Data(DataConnection),
}

impl Connection {
    pub fn id(&self) -> &str {
        match self {
            Connection::Media(connection) => connection.id(),
            Connection::Data(connection) => connection.id(),
        }
    }

    pub fn peer(&self) -> &str {
        match self {
            Connection::Media(connection) => connection.peer(),
            Connection::Data(connection) => connection.peer(),
        }
    }

    pub fn kind(&self) -> ConnectionType {
        match self {
            Connection::Media(_) => ConnectionType::Media,
            Connection::Data(_) => ConnectionType::Data,
        }
    }

    pub fn state(&self) -> ConnectionState {
        match self {
            Connection::Media(connection) => connection.state(),
            Connection::Data(connection) => connection.state(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub async fn close(&self) {
        match self {
            Connection::Media(connection) => connection.close().await,
            Connection::Data(connection) => connection.close().await,
        }
    }

    pub fn as_media(&self) -> Option<&MediaConnection> {
        match self {
            Connection::Media(connection) => Some(connection),
            Connection::Data(_) => None,
        }
    }

    pub fn as_data(&self) -> Option<&DataConnection> {
        match self {
            Connection::Data(connection) => Some(connection),
            Connection::Media(_) => None,
        }
    }
}

pub(crate) fn session_gone() -> PeerError {
    PeerError::new(ErrorKind::Disconnected, "peer session has ended")
}
