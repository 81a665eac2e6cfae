//! Duplex channel to the rendezvous server.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::TransportError;
use crate::protocol::ControlMessage;

#[cfg(test)]
pub mod mock;
pub mod socket;
pub mod stream;

pub use socket::Socket;

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(ControlMessage),
    Error(String),
    /// The server side went away. Emitted at most once.
    Disconnected,
}

#[async_trait]
pub trait ServerTransport: Send + Sync {
    /// Asks the server to assign an identity.
    async fn retrieve_id(&self) -> Result<String, TransportError>;

    /// Binds the identity and opens the channels. Messages queued before
    /// this call are flushed once the websocket is up.
    fn start(&self, id: &str, token: &str);

    /// Sends an already-encoded message. Values without a string `type`
    /// are rejected with a [`TransportEvent::Error`].
    fn send_raw(&self, message: Value);

    fn send(&self, message: &ControlMessage) {
        match serde_json::to_value(message) {
            Ok(value) => self.send_raw(value),
            Err(err) => {
                tracing::warn!(target = "pier", kind = %message.kind.as_str(), error = %err, "failed to encode control message");
            }
        }
    }

    fn close(&self);

    fn is_disconnected(&self) -> bool;
}
