//! Rendezvous protocol envelopes
//!
//! Every datagram carries one JSON envelope; JSON is the only wire codec.
//! `protocol` selects the handling path, `type` the operation, and `seq` is
//! an opaque correlation value that replies echo back verbatim. Fields the
//! server does not know about are kept in `extra` so relayed envelopes reach
//! their destination intact.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use rendezvous_core::{PeerAddress, ProtocolError, RoomId, MAX_DATAGRAM_SIZE};

/// Request types understood on the api protocol
pub const TYPE_CREATE: &str = "create";
pub const TYPE_CONNECT: &str = "connect";
pub const TYPE_INFO: &str = "info";

/// Reply types
pub const TYPE_CREATE_RESPONSE: &str = "create-response";
pub const TYPE_ERROR: &str = "error";

/// Handling path selected by an envelope
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Room registration and queries. Envelopes without a protocol tag
    /// are treated as api requests.
    #[default]
    Api,

    /// Server-mediated delivery to another room member
    Relay,

    /// Anything else; ignored by the dispatcher
    #[serde(other)]
    Unknown,
}

/// A single protocol message
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub protocol: Protocol,

    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub kind: String,

    /// Correlation token, echoed in replies
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub seq: Value,

    /// Room id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RoomId>,

    /// Port the client declares it will send from (api requests)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Relay destination
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<PeerAddress>,

    /// Relay origin, always set by the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<PeerAddress>,

    /// Error reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Room members (info replies)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub members: Option<Vec<PeerAddress>>,

    /// Caller payload
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Envelope {
    fn api(kind: &str) -> Self {
        Self {
            protocol: Protocol::Api,
            kind: kind.into(),
            ..Self::default()
        }
    }

    /// Reply to a `create` without an id
    pub fn create_response(id: RoomId) -> Self {
        Self {
            id: Some(id),
            ..Self::api(TYPE_CREATE_RESPONSE)
        }
    }

    /// Member list of a room
    pub fn info(id: RoomId, members: Vec<PeerAddress>) -> Self {
        Self {
            id: Some(id),
            members: Some(members),
            ..Self::api(TYPE_INFO)
        }
    }

    /// Error reply
    pub fn error(id: RoomId, reason: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            reason: Some(reason.into()),
            ..Self::api(TYPE_ERROR)
        }
    }

    /// Attach the correlation token of the request being answered
    pub fn with_seq(mut self, seq: &Value) -> Self {
        self.seq = seq.clone();
        self
    }

    /// Parse a datagram. An empty `id` is read as no id at all.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut envelope: Self =
            serde_json::from_slice(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))?;
        envelope.id = envelope.id.filter(|id| !id.is_empty());
        Ok(envelope)
    }

    /// Serialize for sending; fails if the result cannot fit in one datagram
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let bytes = serde_json::to_vec(self).map_err(|e| ProtocolError::Encode(e.to_string()))?;
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: bytes.len(),
                max: MAX_DATAGRAM_SIZE,
            });
        }
        Ok(bytes)
    }
}
