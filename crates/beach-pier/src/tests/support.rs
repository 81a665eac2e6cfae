use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::config::{PeerOptions, RtcConfiguration};
use crate::logging::{self, LogLevel};
use crate::native::{
    IceCandidate, MediaStream, NativeError, NativeEvent, NativeEventSink, NativePeerConnection,
    OfferConstraints, PeerConnectionFactory, SdpType, SessionDescription, SignalingState,
};
use crate::protocol::{ControlMessage, MessageType};
use crate::session::{Peer, PeerEvent};
use crate::transport::mock::MockTransport;

/// Failure injection shared by every instance a [`FakeFactory`] creates.
#[derive(Default)]
pub struct Script {
    /// `set_local_description(offer)` loses the race against a remote offer.
    pub wrong_state_on_local_offer: AtomicBool,
    pub fail_local_offer: AtomicBool,
    pub fail_remote_description: AtomicBool,
    pub fail_create: AtomicBool,
}

pub struct FakeNative {
    pub entry_id: String,
    sink: NativeEventSink,
    script: Arc<Script>,
    state: Mutex<SignalingState>,
    closed: AtomicBool,
    pub close_calls: AtomicUsize,
    pub candidates: Mutex<Vec<String>>,
    pub streams: Mutex<Vec<String>>,
    pub data_channels: Mutex<Vec<(String, bool)>>,
    pub remote_descriptions: Mutex<Vec<SessionDescription>>,
}

impl FakeNative {
    pub fn emit(&self, event: NativeEvent) {
        self.sink.emit(event);
    }

    pub fn state(&self) -> SignalingState {
        *self.state.lock()
    }

    pub fn candidates(&self) -> Vec<String> {
        self.candidates.lock().clone()
    }
}

#[async_trait]
impl NativePeerConnection for FakeNative {
    async fn create_offer(
        &self,
        _constraints: &OfferConstraints,
    ) -> Result<SessionDescription, NativeError> {
        Ok(SessionDescription::offer(format!("offer-{}", self.entry_id)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NativeError> {
        Ok(SessionDescription::answer(format!("answer-{}", self.entry_id)))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NativeError> {
        let mut state = self.state.lock();
        match description.sdp_type {
            SdpType::Offer => {
                if self.script.wrong_state_on_local_offer.load(Ordering::SeqCst) {
                    *state = SignalingState::HaveRemoteOffer;
                    return Err(NativeError::InvalidState {
                        operation: "set_local_description",
                        state: *state,
                    });
                }
                if self.script.fail_local_offer.load(Ordering::SeqCst) {
                    return Err(NativeError::Failed("local offer rejected".into()));
                }
                *state = SignalingState::HaveLocalOffer;
            }
            _ => *state = SignalingState::Stable,
        }
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NativeError> {
        if self.script.fail_remote_description.load(Ordering::SeqCst) {
            return Err(NativeError::Failed("remote description rejected".into()));
        }
        *self.state.lock() = match description.sdp_type {
            SdpType::Offer => SignalingState::HaveRemoteOffer,
            _ => SignalingState::Stable,
        };
        self.remote_descriptions.lock().push(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NativeError> {
        if candidate.candidate == "bad" {
            return Err(NativeError::Failed("unparseable candidate".into()));
        }
        self.candidates.lock().push(candidate.candidate);
        Ok(())
    }

    async fn add_stream(&self, stream: &MediaStream) -> Result<(), NativeError> {
        self.streams.lock().push(stream.id().to_string());
        Ok(())
    }

    async fn create_data_channel(&self, label: &str, reliable: bool) -> Result<(), NativeError> {
        self.data_channels.lock().push((label.to_string(), reliable));
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.state()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        *self.state.lock() = SignalingState::Closed;
    }
}

#[derive(Default)]
pub struct FakeFactory {
    pub script: Arc<Script>,
    created: Mutex<Vec<Arc<FakeNative>>>,
}

impl FakeFactory {
    pub fn natives(&self) -> Vec<Arc<FakeNative>> {
        self.created.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.created.lock().len()
    }

    pub fn latest(&self) -> Arc<FakeNative> {
        self.created
            .lock()
            .last()
            .cloned()
            .expect("no native peer connection was created")
    }
}

#[async_trait]
impl PeerConnectionFactory for FakeFactory {
    async fn create(
        &self,
        _config: &RtcConfiguration,
        events: NativeEventSink,
    ) -> Result<Arc<dyn NativePeerConnection>, NativeError> {
        if self.script.fail_create.load(Ordering::SeqCst) {
            return Err(NativeError::Failed("factory unavailable".into()));
        }
        let native = Arc::new(FakeNative {
            entry_id: events.entry_id().to_string(),
            sink: events,
            script: Arc::clone(&self.script),
            state: Mutex::new(SignalingState::Stable),
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
            candidates: Mutex::new(Vec::new()),
            streams: Mutex::new(Vec::new()),
            data_channels: Mutex::new(Vec::new()),
            remote_descriptions: Mutex::new(Vec::new()),
        });
        self.created.lock().push(Arc::clone(&native));
        Ok(native)
    }
}

pub struct Harness {
    pub peer: Peer,
    pub events: mpsc::UnboundedReceiver<PeerEvent>,
    pub transport: Arc<MockTransport>,
    pub factory: Arc<FakeFactory>,
}

pub fn options() -> PeerOptions {
    PeerOptions::default()
        .with_host("localhost")
        .with_secure(false)
        .with_token("tok3n")
}

/// Session over the mock transport. The mock must be configured before the
/// session starts when the identity is server-assigned.
pub fn harness_with(id: Option<&str>, configure: impl FnOnce(&MockTransport)) -> Harness {
    logging::init(LogLevel::All);
    let (transport, transport_events) = MockTransport::new();
    configure(&transport);
    let factory = Arc::new(FakeFactory::default());
    let (peer, events) = Peer::with_transport(
        id,
        options(),
        transport.clone(),
        transport_events,
        factory.clone(),
    )
    .expect("valid peer id");
    Harness {
        peer,
        events,
        transport,
        factory,
    }
}

pub fn harness(id: &str) -> Harness {
    harness_with(Some(id), |_| {})
}

/// Session that already received OPEN.
pub async fn open_harness(id: &str) -> Harness {
    let mut harness = harness(id);
    harness.transport.inject(ControlMessage::new(MessageType::Open));
    match harness.next_event().await {
        PeerEvent::Open(opened) => assert_eq!(opened, id),
        other => panic!("expected open, got {other:?}"),
    }
    harness
}

impl Harness {
    pub async fn next_event(&mut self) -> PeerEvent {
        tokio::time::timeout(Duration::from_secs(2), self.events.recv())
            .await
            .expect("timed out waiting for peer event")
            .expect("peer event channel closed")
    }

    /// Waits until the driver has handled everything queued so far.
    pub async fn settle(&self) {
        let _ = self.peer.connections("").await;
    }

    pub async fn drain_events(&mut self) -> Vec<PeerEvent> {
        self.settle().await;
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }
}

pub fn offer_from(peer: &str, connection_id: &str, kind: &str, metadata: Option<Value>) -> ControlMessage {
    let mut payload = json!({
        "sdp": {"type": "offer", "sdp": format!("remote-offer-{connection_id}")},
        "type": kind,
        "connectionId": connection_id,
        "browser": "firefox",
    });
    if let Some(metadata) = metadata {
        payload["metadata"] = metadata;
    }
    ControlMessage::new(MessageType::Offer)
        .with_src(peer)
        .with_payload(payload)
}

pub fn answer_from(peer: &str, connection_id: &str, kind: &str) -> ControlMessage {
    ControlMessage::new(MessageType::Answer)
        .with_src(peer)
        .with_payload(json!({
            "sdp": {"type": "answer", "sdp": format!("remote-answer-{connection_id}")},
            "type": kind,
            "connectionId": connection_id,
        }))
}

pub fn candidate_from(peer: &str, connection_id: &str, candidate: &str) -> ControlMessage {
    ControlMessage::new(MessageType::Candidate)
        .with_src(peer)
        .with_payload(json!({
            "candidate": {"candidate": candidate, "sdpMLineIndex": 0, "sdpMid": "0"},
            "type": "media",
            "connectionId": connection_id,
        }))
}
