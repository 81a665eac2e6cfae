use std::fmt;
use thiserror::Error;

/// Failure categories surfaced on the session and connection event channels.
///
/// The wire names match the names rendezvous clients have always used, so
/// applications can keep matching on `kind.as_str()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Disconnected,
    InvalidId,
    InvalidKey,
    MissingMedia,
    Network,
    PeerUnavailable,
    ServerError,
    SocketError,
    SocketClosed,
    UnavailableId,
    Negotiation,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Disconnected => "disconnected",
            ErrorKind::InvalidId => "invalid-id",
            ErrorKind::InvalidKey => "invalid-key",
            ErrorKind::MissingMedia => "missing-media",
            ErrorKind::Network => "network",
            ErrorKind::PeerUnavailable => "peer-unavailable",
            ErrorKind::ServerError => "server-error",
            ErrorKind::SocketError => "socket-error",
            ErrorKind::SocketClosed => "socket-closed",
            ErrorKind::UnavailableId => "unavailable-id",
            ErrorKind::Negotiation => "webrtc",
        }
    }

    /// Kinds that tear down the whole session when they occur.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            ErrorKind::ServerError
                | ErrorKind::UnavailableId
                | ErrorKind::InvalidKey
                | ErrorKind::SocketError
                | ErrorKind::SocketClosed
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `(kind, detail)` pair reported to the application.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {detail}")]
pub struct PeerError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl PeerError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("rendezvous server answered with status {0}")]
    Status(u16),
}
