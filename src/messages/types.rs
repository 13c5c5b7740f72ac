use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Correlation id reserved for the authentication handshake
pub const HANDSHAKE_CORRELATION_ID: u64 = 1;

/// Correlation id that never identifies a live request
pub const INVALID_CORRELATION_ID: u64 = 0;

/// Protocol revision announced during the handshake
pub const PROTOCOL_VERSION: u16 = 1;

/// Wire tag identifying which payload variant a frame carries
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadTag {
    Handshake = 0x0001,
    HealthCheck = 0x0002,
    GetConfig = 0x0003,
    Request = 0x0004,
    HandshakeAccepted = 0x0101,
    Health = 0x0102,
    Config = 0x0103,
    Response = 0x0104,
    Error = 0x01FF,
}

impl PayloadTag {
    /// Map a raw wire tag back to a known variant
    pub fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            0x0001 => Some(PayloadTag::Handshake),
            0x0002 => Some(PayloadTag::HealthCheck),
            0x0003 => Some(PayloadTag::GetConfig),
            0x0004 => Some(PayloadTag::Request),
            0x0101 => Some(PayloadTag::HandshakeAccepted),
            0x0102 => Some(PayloadTag::Health),
            0x0103 => Some(PayloadTag::Config),
            0x0104 => Some(PayloadTag::Response),
            0x01FF => Some(PayloadTag::Error),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// Handshake request proving possession of the backend's one-time token
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HandshakeRequest {
    pub token: String,
    pub client_id: Uuid,
    pub client_version: String,
    pub protocol_version: u16,
}

impl HandshakeRequest {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            client_id: Uuid::new_v4(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HandshakeAccepted {
    pub session_id: String,
    pub server_version: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HealthStatus {
    pub healthy: bool,
    pub server_version: String,
    pub uptime_ms: u64,
}

/// Application traffic the engine carries without interpreting
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OpaqueMessage {
    pub kind: String,
    pub body: Vec<u8>,
}

impl OpaqueMessage {
    pub fn new(kind: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: kind.into(),
            body: body.into(),
        }
    }
}

/// Error reported by the backend in place of a response
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

/// Schema-flexible configuration value carried inside a typed envelope
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    List(Vec<ConfigValue>),
    Map(BTreeMap<String, ConfigValue>),
}

impl ConfigValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ConfigValue::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// Convert into a JSON value for display purposes
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ConfigValue::Null => serde_json::Value::Null,
            ConfigValue::Bool(value) => serde_json::Value::Bool(*value),
            ConfigValue::Integer(value) => serde_json::Value::from(*value),
            ConfigValue::Float(value) => serde_json::Value::from(*value),
            ConfigValue::Text(value) => serde_json::Value::String(value.clone()),
            ConfigValue::List(items) => {
                serde_json::Value::Array(items.iter().map(ConfigValue::to_json).collect())
            }
            ConfigValue::Map(entries) => serde_json::Value::Object(
                entries
                    .iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            ),
        }
    }
}

/// Configuration object served by the backend
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ConfigSnapshot {
    pub revision: u64,
    pub entries: BTreeMap<String, ConfigValue>,
}

impl ConfigSnapshot {
    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.entries.get(key)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "revision": self.revision,
            "entries": ConfigValue::Map(self.entries.clone()).to_json(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Handshake(HandshakeRequest),
    HealthCheck,
    GetConfig,
    Request(OpaqueMessage),
    HandshakeAccepted(HandshakeAccepted),
    Health(HealthStatus),
    Config(ConfigSnapshot),
    Response(OpaqueMessage),
    Error(ErrorPayload),
}

impl Payload {
    /// Create an error payload
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Payload::Error(ErrorPayload {
            code: code.into(),
            message: message.into(),
        })
    }

    pub fn tag(&self) -> PayloadTag {
        match self {
            Payload::Handshake(_) => PayloadTag::Handshake,
            Payload::HealthCheck => PayloadTag::HealthCheck,
            Payload::GetConfig => PayloadTag::GetConfig,
            Payload::Request(_) => PayloadTag::Request,
            Payload::HandshakeAccepted(_) => PayloadTag::HandshakeAccepted,
            Payload::Health(_) => PayloadTag::Health,
            Payload::Config(_) => PayloadTag::Config,
            Payload::Response(_) => PayloadTag::Response,
            Payload::Error(_) => PayloadTag::Error,
        }
    }

    /// Get the payload type as a string
    pub fn kind_name(&self) -> &'static str {
        match self {
            Payload::Handshake(_) => "Handshake",
            Payload::HealthCheck => "HealthCheck",
            Payload::GetConfig => "GetConfig",
            Payload::Request(_) => "Request",
            Payload::HandshakeAccepted(_) => "HandshakeAccepted",
            Payload::Health(_) => "Health",
            Payload::Config(_) => "Config",
            Payload::Response(_) => "Response",
            Payload::Error(_) => "Error",
        }
    }

    /// Outbound variants are the ones a client may send
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Payload::Handshake(_) | Payload::HealthCheck | Payload::GetConfig | Payload::Request(_)
        )
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Payload::Error(_))
    }
}

/// A correlation id paired with one payload variant
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    correlation_id: u64,
    payload: Payload,
}

impl Envelope {
    pub fn new(correlation_id: u64, payload: Payload) -> Self {
        Self {
            correlation_id,
            payload,
        }
    }

    pub fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }
}
