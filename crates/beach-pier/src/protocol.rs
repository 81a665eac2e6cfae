//! Control messages exchanged with the rendezvous server.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::native::{IceCandidate, SessionDescription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING-KEBAB-CASE")]
pub enum MessageType {
    Open,
    Error,
    IdTaken,
    InvalidKey,
    Leave,
    Expire,
    Offer,
    Answer,
    Candidate,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Open => "OPEN",
            MessageType::Error => "ERROR",
            MessageType::IdTaken => "ID-TAKEN",
            MessageType::InvalidKey => "INVALID-KEY",
            MessageType::Leave => "LEAVE",
            MessageType::Expire => "EXPIRE",
            MessageType::Offer => "OFFER",
            MessageType::Answer => "ANSWER",
            MessageType::Candidate => "CANDIDATE",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Media,
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Serialization {
    #[default]
    Binary,
    BinaryUtf8,
    Json,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferPayload {
    pub sdp: SessionDescription,
    #[serde(rename = "type")]
    pub connection_type: ConnectionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub connection_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reliable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serialization: Option<Serialization>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerPayload {
    pub sdp: SessionDescription,
    #[serde(rename = "type")]
    pub connection_type: ConnectionType,
    pub connection_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePayload {
    pub candidate: IceCandidate,
    #[serde(rename = "type")]
    pub connection_type: ConnectionType,
    pub connection_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(default)]
    pub msg: Option<String>,
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("{0} message carries no payload")]
    Missing(MessageType),
    #[error("malformed {kind} payload: {source}")]
    Malformed {
        kind: MessageType,
        #[source]
        source: serde_json::Error,
    },
}

/// `{type, payload?, dst?, src?}`; `src` is filled in by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
}

impl ControlMessage {
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            payload: None,
            dst: None,
            src: None,
        }
    }

    /// Outbound message addressed to `dst`.
    pub fn to_peer<P: Serialize>(
        kind: MessageType,
        dst: &str,
        payload: &P,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind,
            payload: Some(serde_json::to_value(payload)?),
            dst: Some(dst.to_string()),
            src: None,
        })
    }

    pub fn with_src(mut self, src: impl Into<String>) -> Self {
        self.src = Some(src.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.payload
            .as_ref()
            .and_then(|payload| payload.get("connectionId"))
            .and_then(Value::as_str)
    }

    pub fn error_message(&self) -> Option<&str> {
        self.payload
            .as_ref()
            .and_then(|payload| payload.get("msg"))
            .and_then(Value::as_str)
    }

    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, PayloadError> {
        let payload = self
            .payload
            .as_ref()
            .ok_or(PayloadError::Missing(self.kind))?;
        T::deserialize(payload).map_err(|source| PayloadError::Malformed {
            kind: self.kind,
            source,
        })
    }
}
