//! Seam to the native peer-connection capability.
//!
//! The signaling client never performs SDP, ICE or media work itself. It
//! drives an implementation of [`NativePeerConnection`] created by a
//! [`PeerConnectionFactory`] and reacts to the [`NativeEvent`]s that
//! implementation reports through its [`NativeEventSink`].

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::RtcConfiguration;

#[cfg(feature = "native-webrtc")]
pub mod webrtc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// Session description as it travels inside OFFER/ANSWER payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Offer options forwarded untouched to the native capability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OfferConstraints {
    pub offer_to_receive_audio: bool,
    pub offer_to_receive_video: bool,
    pub ice_restart: bool,
}

/// Opaque media handle. The id identifies the stream on the wire; the
/// handle is whatever the native capability needs to attach or render it.
#[derive(Clone)]
pub struct MediaStream {
    id: String,
    handle: Option<Arc<dyn Any + Send + Sync>>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            handle: None,
        }
    }

    pub fn with_handle<T: Any + Send + Sync>(id: impl Into<String>, handle: T) -> Self {
        Self {
            id: id.into(),
            handle: Some(Arc::new(handle)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn handle<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.handle.as_deref().and_then(|handle| handle.downcast_ref::<T>())
    }
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.id)
            .field("has_handle", &self.handle.is_some())
            .finish()
    }
}

impl PartialEq for MediaStream {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

#[derive(Debug, Clone)]
pub enum NativeEvent {
    /// `None` marks the end of candidate gathering.
    IceCandidate(Option<IceCandidate>),
    IceConnectionStateChanged(IceConnectionState),
    DataChannelOpened { label: String },
    TrackReceived(MediaStream),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NativeError {
    /// The operation is not valid in the current signaling state. Raised by
    /// `set_local_description` when a remote offer was applied concurrently.
    #[error("{operation} is invalid in signaling state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SignalingState,
    },
    #[error("peer connection is closed")]
    Closed,
    #[error("{0}")]
    Failed(String),
}

impl NativeError {
    pub fn is_wrong_state(&self) -> bool {
        matches!(self, NativeError::InvalidState { .. })
    }
}

/// Where a native instance reports its events; tagged with its pool entry.
#[derive(Debug, Clone)]
pub struct NativeEventSink {
    entry_id: String,
    tx: mpsc::UnboundedSender<(String, NativeEvent)>,
}

impl NativeEventSink {
    pub(crate) fn new(entry_id: String, tx: mpsc::UnboundedSender<(String, NativeEvent)>) -> Self {
        Self { entry_id, tx }
    }

    pub fn entry_id(&self) -> &str {
        &self.entry_id
    }

    /// Returns `false` once the owning session is gone.
    pub fn emit(&self, event: NativeEvent) -> bool {
        self.tx.send((self.entry_id.clone(), event)).is_ok()
    }
}

#[async_trait]
pub trait NativePeerConnection: Send + Sync {
    async fn create_offer(
        &self,
        constraints: &OfferConstraints,
    ) -> Result<SessionDescription, NativeError>;
    async fn create_answer(&self) -> Result<SessionDescription, NativeError>;
    async fn set_local_description(&self, description: SessionDescription)
        -> Result<(), NativeError>;
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NativeError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NativeError>;
    async fn add_stream(&self, stream: &MediaStream) -> Result<(), NativeError>;
    async fn create_data_channel(&self, label: &str, reliable: bool) -> Result<(), NativeError>;
    fn signaling_state(&self) -> SignalingState;
    fn is_closed(&self) -> bool;
    async fn close(&self);
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        config: &RtcConfiguration,
        events: NativeEventSink,
    ) -> Result<Arc<dyn NativePeerConnection>, NativeError>;
}
