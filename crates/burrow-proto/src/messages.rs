//! Protocol message types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::ProtoError;

/// Identifier correlating a forwarded public request with its response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RequestId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for RequestId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Frames carried by the socket transport.
///
/// Serialized as JSON text messages tagged by `type`. `ping` and `pong` carry
/// no request id; data frames are matched purely by `request_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    ForwardRequest(ForwardRequest),
    ForwardResponse(ForwardResponse),
    Ping,
    Pong,
}

impl Frame {
    pub fn to_json(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtoError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Frame::ForwardRequest(req) => Some(req.request_id),
            Frame::ForwardResponse(resp) => Some(resp.request_id),
            Frame::Ping | Frame::Pong => None,
        }
    }
}

/// A public HTTP request pushed to the tunnel client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ForwardRequest {
    #[cfg_attr(feature = "openapi", schema(value_type = String))]
    pub request_id: RequestId,
    pub method: String,
    /// Path and query, e.g. `/api/users?page=2`
    pub path: String,
    #[cfg_attr(feature = "openapi", schema(value_type = Vec<Vec<String>>))]
    pub headers: Vec<(String, String)>,
    /// Base64 encoded on the wire
    #[serde(default, with = "body_base64")]
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>))]
    pub body: Option<Vec<u8>>,
}

/// The tunnel client's answer to a [`ForwardRequest`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ForwardResponse {
    #[cfg_attr(feature = "openapi", schema(value_type = String))]
    pub request_id: RequestId,
    pub status: u16,
    #[serde(default)]
    #[cfg_attr(feature = "openapi", schema(value_type = Vec<Vec<String>>))]
    pub headers: Vec<(String, String)>,
    /// Base64 encoded on the wire
    #[serde(default, with = "body_base64")]
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>))]
    pub body: Option<Vec<u8>>,
}

impl ForwardResponse {
    pub fn new(request_id: RequestId, status: u16) -> Self {
        Self {
            request_id,
            status,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }
}

mod body_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match data {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(text) => STANDARD
                .decode(text.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// Transport variant a client asks for during registration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Persistent WebSocket channel
    #[default]
    Socket,
    /// Blocking pull plus discrete response delivery
    Polling,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Socket => write!(f, "socket"),
            TransportKind::Polling => write!(f, "polling"),
        }
    }
}

/// Body of `POST /tunnel/connect`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ConnectRequest {
    pub subdomain: String,
    /// Base64 Ed25519 public key
    pub public_key: String,
    pub nonce: String,
    /// Unix timestamp in seconds
    pub timestamp: i64,
    /// Base64 Ed25519 signature over `nonce || timestamp`
    pub signature: String,
    #[serde(default)]
    pub transport: TransportKind,
    /// Optional account bearer token; binds the claim to its owner
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

impl ConnectRequest {
    /// Bytes covered by the handshake signature
    pub fn signing_payload(&self) -> Vec<u8> {
        signing_payload(&self.nonce, self.timestamp)
    }
}

/// `nonce || timestamp`, the timestamp rendered as decimal seconds
pub fn signing_payload(nonce: &str, timestamp: i64) -> Vec<u8> {
    let mut payload = nonce.as_bytes().to_vec();
    payload.extend_from_slice(timestamp.to_string().as_bytes());
    payload
}

/// Successful registration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ConnectResponse {
    pub session_token: String,
    pub subdomain: String,
    pub public_url: String,
    pub transport: TransportKind,
}
