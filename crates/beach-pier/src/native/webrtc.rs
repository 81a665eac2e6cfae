//! [`PeerConnectionFactory`] backed by the `webrtc` crate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::{
    IceCandidate, IceConnectionState, MediaStream, NativeError, NativeEvent, NativeEventSink,
    NativePeerConnection, OfferConstraints, PeerConnectionFactory, SdpType, SessionDescription,
    SignalingState,
};
use crate::config::RtcConfiguration;

/// Handle carried by local [`MediaStream`]s handed to this adapter.
#[derive(Clone, Default)]
pub struct LocalTracks(pub Vec<Arc<dyn TrackLocal + Send + Sync>>);

/// Handle carried by remote [`MediaStream`]s reported by this adapter.
#[derive(Clone)]
pub struct RemoteTrack(pub Arc<TrackRemote>);

pub struct WebRtcFactory {
    api: API,
}

impl WebRtcFactory {
    pub fn new() -> Result<Self, NativeError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|err| NativeError::Failed(err.to_string()))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|err| NativeError::Failed(err.to_string()))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcFactory {
    async fn create(
        &self,
        config: &RtcConfiguration,
        events: NativeEventSink,
    ) -> Result<Arc<dyn NativePeerConnection>, NativeError> {
        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let peer_connection = Arc::new(
            self.api
                .new_peer_connection(rtc_config)
                .await
                .map_err(|err| NativeError::Failed(err.to_string()))?,
        );
        install_callbacks(&peer_connection, events.clone());
        Ok(Arc::new(WebRtcPeerConnection {
            peer_connection,
            events,
            closed: AtomicBool::new(false),
        }))
    }
}

fn install_callbacks(peer_connection: &Arc<RTCPeerConnection>, events: NativeEventSink) {
    let sink = events.clone();
    peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let sink = sink.clone();
        Box::pin(async move {
            let candidate = match candidate.map(|candidate| candidate.to_json()).transpose() {
                Ok(candidate) => candidate.map(|init| IceCandidate {
                    candidate: init.candidate,
                    sdp_mline_index: init.sdp_mline_index,
                    sdp_mid: init.sdp_mid,
                }),
                Err(err) => {
                    tracing::warn!(target = "pier", error = %err, "failed to encode local candidate");
                    return;
                }
            };
            sink.emit(NativeEvent::IceCandidate(candidate));
        })
    }));

    let sink = events.clone();
    peer_connection.on_ice_connection_state_change(Box::new(
        move |state: RTCIceConnectionState| {
            let sink = sink.clone();
            Box::pin(async move {
                if let Some(state) = map_ice_state(state) {
                    sink.emit(NativeEvent::IceConnectionStateChanged(state));
                }
            })
        },
    ));

    let sink = events.clone();
    peer_connection.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
        let sink = sink.clone();
        Box::pin(async move {
            watch_data_channel(&channel, sink);
        })
    }));

    let sink = events;
    peer_connection.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
        let sink = sink.clone();
        Box::pin(async move {
            let stream_id = track.stream_id();
            sink.emit(NativeEvent::TrackReceived(MediaStream::with_handle(
                stream_id,
                RemoteTrack(track),
            )));
        })
    }));
}

fn watch_data_channel(channel: &Arc<RTCDataChannel>, sink: NativeEventSink) {
    let label = channel.label().to_string();
    channel.on_open(Box::new(move || {
        let sink = sink.clone();
        let label = label.clone();
        Box::pin(async move {
            sink.emit(NativeEvent::DataChannelOpened { label });
        })
    }));
}

fn map_ice_state(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    Some(match state {
        RTCIceConnectionState::New => IceConnectionState::New,
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        _ => return None,
    })
}

fn map_signaling_state(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
        RTCSignalingState::Closed => SignalingState::Closed,
        _ => SignalingState::Stable,
    }
}

fn to_native(description: &SessionDescription) -> Result<RTCSessionDescription, NativeError> {
    let sdp = description.sdp.clone();
    let converted = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(sdp),
        SdpType::Answer => RTCSessionDescription::answer(sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(sdp),
        SdpType::Rollback => {
            return Err(NativeError::Failed("rollback is not supported".into()));
        }
    };
    converted.map_err(|err| NativeError::Failed(err.to_string()))
}

fn from_native(description: RTCSessionDescription) -> SessionDescription {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        _ => SdpType::Offer,
    };
    SessionDescription {
        sdp_type,
        sdp: description.sdp,
    }
}

struct WebRtcPeerConnection {
    peer_connection: Arc<RTCPeerConnection>,
    events: NativeEventSink,
    closed: AtomicBool,
}

impl WebRtcPeerConnection {
    async fn receive_only(&self, kind: RTPCodecType) -> Result<(), NativeError> {
        self.peer_connection
            .add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: Vec::new(),
                }),
            )
            .await
            .map(|_| ())
            .map_err(|err| NativeError::Failed(err.to_string()))
    }
}

#[async_trait]
impl NativePeerConnection for WebRtcPeerConnection {
    async fn create_offer(
        &self,
        constraints: &OfferConstraints,
    ) -> Result<SessionDescription, NativeError> {
        if constraints.offer_to_receive_audio {
            self.receive_only(RTPCodecType::Audio).await?;
        }
        if constraints.offer_to_receive_video {
            self.receive_only(RTPCodecType::Video).await?;
        }
        let options = RTCOfferOptions {
            ice_restart: constraints.ice_restart,
            ..Default::default()
        };
        self.peer_connection
            .create_offer(Some(options))
            .await
            .map(from_native)
            .map_err(|err| NativeError::Failed(err.to_string()))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NativeError> {
        self.peer_connection
            .create_answer(None)
            .await
            .map(from_native)
            .map_err(|err| NativeError::Failed(err.to_string()))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NativeError> {
        let is_offer = description.sdp_type == SdpType::Offer;
        let native = to_native(&description)?;
        match self.peer_connection.set_local_description(native).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let state = map_signaling_state(self.peer_connection.signaling_state());
                if is_offer && state == SignalingState::HaveRemoteOffer {
                    Err(NativeError::InvalidState {
                        operation: "set_local_description",
                        state,
                    })
                } else {
                    Err(NativeError::Failed(err.to_string()))
                }
            }
        }
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NativeError> {
        let native = to_native(&description)?;
        self.peer_connection
            .set_remote_description(native)
            .await
            .map_err(|err| NativeError::Failed(err.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NativeError> {
        self.peer_connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(|err| NativeError::Failed(err.to_string()))
    }

    async fn add_stream(&self, stream: &MediaStream) -> Result<(), NativeError> {
        let Some(tracks) = stream.handle::<LocalTracks>() else {
            return Err(NativeError::Failed(format!(
                "stream {} carries no local tracks",
                stream.id()
            )));
        };
        for track in &tracks.0 {
            self.peer_connection
                .add_track(Arc::clone(track))
                .await
                .map_err(|err| NativeError::Failed(err.to_string()))?;
        }
        Ok(())
    }

    async fn create_data_channel(&self, label: &str, reliable: bool) -> Result<(), NativeError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            max_retransmits: if reliable { None } else { Some(0) },
            ..Default::default()
        };
        let channel = self
            .peer_connection
            .create_data_channel(label, Some(init))
            .await
            .map_err(|err| NativeError::Failed(err.to_string()))?;
        // Outbound channels do not pass through on_data_channel.
        watch_data_channel(&channel, self.events.clone());
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        map_signaling_state(self.peer_connection.signaling_state())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.peer_connection.close().await {
            tracing::debug!(target = "pier", error = %err, "peer connection close failed");
        }
    }
}
