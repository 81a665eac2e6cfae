//! Offer/answer/candidate handshake over pooled native peer connections.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::RtcConfiguration;
use crate::native::{
    IceConnectionState, MediaStream, NativeError, NativeEvent, NativeEventSink,
    NativePeerConnection, OfferConstraints, PeerConnectionFactory, SessionDescription,
};
use crate::protocol::{
    AnswerPayload, CandidatePayload, ConnectionType, ControlMessage, MessageType, OfferPayload,
    Serialization,
};
use crate::transport::ServerTransport;
use crate::util;

pub mod pool;

pub use pool::ConnectionRef;
use pool::PeerConnectionPool;

/// Client name advertised in OFFER and ANSWER payloads.
pub const BROWSER: &str = "beach-pier";

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("failed to create peer connection: {0}")]
    Create(#[source] NativeError),
    #[error("{step} failed: {source}")]
    Step {
        step: &'static str,
        #[source]
        source: NativeError,
    },
    #[error("unknown peer connection {0}")]
    UnknownEntry(String),
    #[error("failed to encode {kind} message: {source}")]
    Encode {
        kind: MessageType,
        #[source]
        source: serde_json::Error,
    },
}

fn step(step: &'static str) -> impl FnOnce(NativeError) -> NegotiationError {
    move |source| NegotiationError::Step { step, source }
}

/// Which side of the handshake a connection plays.
#[derive(Debug, Clone)]
pub(crate) enum Role {
    Originator {
        label: Option<String>,
        reliable: Option<bool>,
        serialization: Option<Serialization>,
        metadata: Option<Value>,
        constraints: OfferConstraints,
    },
    Answerer {
        offer: SessionDescription,
    },
}

/// What the session driver has to do after a native event.
#[derive(Debug)]
pub(crate) enum NativeOutcome {
    Failed(ConnectionRef),
    Track(ConnectionRef, MediaStream),
    DataChannelOpened(ConnectionRef),
}

/// Result of applying a routed ANSWER or CANDIDATE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Applied {
    Answer,
    Candidate,
    Ignored,
}

pub(crate) struct Negotiator {
    factory: Arc<dyn PeerConnectionFactory>,
    transport: Arc<dyn ServerTransport>,
    config: RtcConfiguration,
    pool: PeerConnectionPool,
    native_tx: mpsc::UnboundedSender<(String, NativeEvent)>,
}

impl Negotiator {
    pub(crate) fn new(
        factory: Arc<dyn PeerConnectionFactory>,
        transport: Arc<dyn ServerTransport>,
        config: RtcConfiguration,
        native_tx: mpsc::UnboundedSender<(String, NativeEvent)>,
    ) -> Self {
        Self {
            factory,
            transport,
            config,
            pool: PeerConnectionPool::new(),
            native_tx,
        }
    }

    /// Picks the native instance for `connection`: the current pooled one
    /// when it is idle, otherwise a new one. Returns its entry id.
    pub(crate) async fn acquire(
        &mut self,
        connection: &ConnectionRef,
    ) -> Result<String, NegotiationError> {
        let entry_id = match self.pool.reusable(connection.kind, &connection.peer) {
            Some((entry_id, _)) => {
                tracing::debug!(
                    target = "pier",
                    peer = %connection.peer,
                    entry = %entry_id,
                    "reusing peer connection"
                );
                entry_id
            }
            None => {
                let entry_id = util::prefixed_id("pc_");
                let sink = NativeEventSink::new(entry_id.clone(), self.native_tx.clone());
                let native = self
                    .factory
                    .create(&self.config, sink)
                    .await
                    .map_err(NegotiationError::Create)?;
                tracing::debug!(
                    target = "pier",
                    peer = %connection.peer,
                    entry = %entry_id,
                    "created peer connection"
                );
                self.pool
                    .insert(connection.kind, &connection.peer, entry_id.clone(), native);
                entry_id
            }
        };
        self.pool.set_owner(&entry_id, connection.clone());
        Ok(entry_id)
    }

    fn native(&self, entry_id: &str) -> Result<Arc<dyn NativePeerConnection>, NegotiationError> {
        self.pool
            .get(entry_id)
            .map(|entry| Arc::clone(&entry.native))
            .ok_or_else(|| NegotiationError::UnknownEntry(entry_id.to_string()))
    }

    /// Runs the local half of the handshake on an acquired instance.
    pub(crate) async fn handshake(
        &mut self,
        entry_id: &str,
        connection: &ConnectionRef,
        stream: Option<&MediaStream>,
        role: Role,
    ) -> Result<(), NegotiationError> {
        let native = self.native(entry_id)?;
        if connection.kind == ConnectionType::Media {
            if let Some(stream) = stream {
                native.add_stream(stream).await.map_err(step("add_stream"))?;
            }
        }
        match role {
            Role::Originator {
                label,
                reliable,
                serialization,
                metadata,
                constraints,
            } => {
                if connection.kind == ConnectionType::Data {
                    let channel_label = label.as_deref().unwrap_or(&connection.connection_id);
                    native
                        .create_data_channel(channel_label, reliable.unwrap_or(false))
                        .await
                        .map_err(step("create_data_channel"))?;
                }
                let offer = native
                    .create_offer(&constraints)
                    .await
                    .map_err(step("create_offer"))?;
                match native.set_local_description(offer.clone()).await {
                    Ok(()) => {}
                    Err(err) if err.is_wrong_state() => {
                        tracing::debug!(
                            target = "pier",
                            peer = %connection.peer,
                            connection = %connection.connection_id,
                            "remote offer arrived while offering; local offer dropped"
                        );
                        return Ok(());
                    }
                    Err(err) => return Err(step("set_local_description")(err)),
                }
                let payload = OfferPayload {
                    sdp: offer,
                    connection_type: connection.kind,
                    label,
                    connection_id: connection.connection_id.clone(),
                    reliable,
                    serialization,
                    metadata,
                    browser: Some(BROWSER.to_string()),
                };
                self.send(MessageType::Offer, &connection.peer, &payload)?;
                tracing::debug!(
                    target = "pier",
                    peer = %connection.peer,
                    connection = %connection.connection_id,
                    "sent offer"
                );
            }
            Role::Answerer { offer } => {
                native
                    .set_remote_description(offer)
                    .await
                    .map_err(step("set_remote_description"))?;
                let answer = native.create_answer().await.map_err(step("create_answer"))?;
                native
                    .set_local_description(answer.clone())
                    .await
                    .map_err(step("set_local_description"))?;
                let payload = AnswerPayload {
                    sdp: answer,
                    connection_type: connection.kind,
                    connection_id: connection.connection_id.clone(),
                    browser: Some(BROWSER.to_string()),
                };
                self.send(MessageType::Answer, &connection.peer, &payload)?;
                tracing::debug!(
                    target = "pier",
                    peer = %connection.peer,
                    connection = %connection.connection_id,
                    "sent answer"
                );
            }
        }
        Ok(())
    }

    /// Applies a routed ANSWER or CANDIDATE. Malformed payloads and
    /// candidate failures are logged; a rejected answer is an error.
    pub(crate) async fn apply(
        &mut self,
        entry_id: &str,
        message: &ControlMessage,
    ) -> Result<Applied, NegotiationError> {
        let native = self.native(entry_id)?;
        match message.kind {
            MessageType::Answer => {
                let payload: AnswerPayload = match message.decode_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        tracing::warn!(target = "pier", error = %err, "dropping answer");
                        return Ok(Applied::Ignored);
                    }
                };
                native
                    .set_remote_description(payload.sdp)
                    .await
                    .map_err(step("set_remote_description"))?;
                Ok(Applied::Answer)
            }
            MessageType::Candidate => {
                let payload: CandidatePayload = match message.decode_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        tracing::warn!(target = "pier", error = %err, "dropping candidate");
                        return Ok(Applied::Ignored);
                    }
                };
                if let Err(err) = native.add_ice_candidate(payload.candidate).await {
                    tracing::warn!(
                        target = "pier",
                        connection = %payload.connection_id,
                        error = %err,
                        "failed to add ice candidate"
                    );
                }
                Ok(Applied::Candidate)
            }
            other => {
                tracing::warn!(
                    target = "pier",
                    kind = other.as_str(),
                    src = ?message.src,
                    "unrecognized message type for connection"
                );
                Ok(Applied::Ignored)
            }
        }
    }

    /// Releases `entry_id` on behalf of `connection`. An instance that was
    /// handed to a newer connection is only detached.
    pub(crate) async fn cleanup(&mut self, entry_id: &str, connection: &ConnectionRef) {
        let owned = self
            .pool
            .get(entry_id)
            .map(|entry| entry.owner.as_ref() == Some(connection))
            .unwrap_or(false);
        if !owned {
            return;
        }
        let Some(entry) = self.pool.remove(entry_id) else {
            return;
        };
        tracing::debug!(
            target = "pier",
            entry = %entry_id,
            connection = %connection.connection_id,
            "releasing peer connection"
        );
        if !entry.native.is_closed() {
            entry.native.close().await;
        }
    }

    pub(crate) fn on_native_event(
        &mut self,
        entry_id: &str,
        event: NativeEvent,
    ) -> Option<NativeOutcome> {
        let Some(owner) = self
            .pool
            .get(entry_id)
            .and_then(|entry| entry.owner.clone())
        else {
            tracing::debug!(target = "pier", entry = %entry_id, "event for released peer connection");
            return None;
        };
        match event {
            NativeEvent::IceCandidate(Some(candidate)) => {
                let payload = CandidatePayload {
                    candidate,
                    connection_type: owner.kind,
                    connection_id: owner.connection_id.clone(),
                };
                if let Err(err) = self.send(MessageType::Candidate, &owner.peer, &payload) {
                    tracing::warn!(target = "pier", error = %err, "candidate not sent");
                }
                None
            }
            NativeEvent::IceCandidate(None) => {
                tracing::debug!(target = "pier", connection = %owner.connection_id, "candidate gathering complete");
                None
            }
            NativeEvent::IceConnectionStateChanged(IceConnectionState::Failed) => {
                tracing::warn!(
                    target = "pier",
                    peer = %owner.peer,
                    connection = %owner.connection_id,
                    "ice connection failed"
                );
                Some(NativeOutcome::Failed(owner))
            }
            NativeEvent::IceConnectionStateChanged(IceConnectionState::Disconnected) => {
                tracing::debug!(
                    target = "pier",
                    peer = %owner.peer,
                    connection = %owner.connection_id,
                    "ice connection disconnected"
                );
                None
            }
            NativeEvent::IceConnectionStateChanged(state) => {
                tracing::trace!(target = "pier", connection = %owner.connection_id, ?state, "ice state");
                None
            }
            NativeEvent::DataChannelOpened { label } => {
                tracing::debug!(target = "pier", connection = %owner.connection_id, label = %label, "data channel open");
                Some(NativeOutcome::DataChannelOpened(owner))
            }
            NativeEvent::TrackReceived(stream) => Some(NativeOutcome::Track(owner, stream)),
        }
    }

    fn send<P: serde::Serialize>(
        &self,
        kind: MessageType,
        peer: &str,
        payload: &P,
    ) -> Result<(), NegotiationError> {
        let message = ControlMessage::to_peer(kind, peer, payload)
            .map_err(|source| NegotiationError::Encode { kind, source })?;
        self.transport.send(&message);
        Ok(())
    }
}
