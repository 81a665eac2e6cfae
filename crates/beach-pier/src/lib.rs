//! Rendezvous signaling client for peer-to-peer media sessions.
//!
//! A [`Peer`] registers an identity with a rendezvous server, keeps a
//! websocket (with chunked HTTP fallback) open to it, and turns the
//! OFFER/ANSWER/CANDIDATE traffic it relays into [`MediaConnection`]s and
//! [`DataConnection`]s driven through a [`native::PeerConnectionFactory`].

pub mod config;
pub mod connection;
pub mod error;
pub mod logging;
pub mod native;
pub mod negotiation;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod util;

#[cfg(test)]
mod tests;

pub use config::{IceServer, PeerOptions, RtcConfiguration};
pub use connection::{
    CallOptions, ConnectOptions, Connection, ConnectionState, DataConnection,
    DataConnectionEvent, MediaConnection, MediaConnectionEvent,
};
pub use error::{ErrorKind, PeerError, TransportError};
pub use logging::LogLevel;
pub use native::{MediaStream, NativePeerConnection, PeerConnectionFactory};
pub use session::{Peer, PeerEvent};
