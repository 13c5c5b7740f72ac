pub mod types;
pub mod wire;

pub use types::{
    ConfigSnapshot, ConfigValue, Envelope, ErrorPayload, HandshakeAccepted, HandshakeRequest,
    HealthStatus, OpaqueMessage, Payload, PayloadTag, HANDSHAKE_CORRELATION_ID,
    INVALID_CORRELATION_ID, PROTOCOL_VERSION,
};
pub use wire::{
    DecodedFrame, FramedMessage, WireConfig, WireProtocolError, FRAME_HEADER_SIZE,
    LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE,
};
