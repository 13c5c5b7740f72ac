use crate::messages::types::{
    ConfigSnapshot, Envelope, ErrorPayload, HandshakeAccepted, HandshakeRequest, HealthStatus,
    OpaqueMessage, Payload, PayloadTag,
};
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, instrument, trace, warn};

// Wire protocol constants
pub const LENGTH_PREFIX_SIZE: usize = 4; // u32 length prefix
pub const CORRELATION_ID_SIZE: usize = 8;
pub const PAYLOAD_TAG_SIZE: usize = 2;
pub const FRAME_HEADER_SIZE: usize = CORRELATION_ID_SIZE + PAYLOAD_TAG_SIZE;
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024; // 4MB
pub const SUSPICIOUS_FRAME_THRESHOLD: usize = 1024 * 1024; // 1MB threshold for logging
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for frame encoding and the outgoing write path
#[derive(Debug, Clone)]
pub struct WireConfig {
    pub max_frame_size: usize,
    pub suspicious_threshold: usize,
    pub write_timeout: Duration,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
            suspicious_threshold: SUSPICIOUS_FRAME_THRESHOLD,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

impl WireConfig {
    pub fn new(max_frame_size: usize, write_timeout: Duration) -> Self {
        Self {
            max_frame_size,
            suspicious_threshold: SUSPICIOUS_FRAME_THRESHOLD.min(max_frame_size),
            write_timeout,
        }
    }

    /// Create a WireConfig with custom frame size and default timeouts
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self::new(max_frame_size, DEFAULT_WRITE_TIMEOUT)
    }
}

/// Custom error types for wire protocol operations
#[derive(Error, Debug)]
pub enum WireProtocolError {
    #[error("Frame too large: {size} bytes exceeds maximum of {max_size} bytes")]
    FrameTooLarge { size: usize, max_size: usize },

    #[error("Frame too small: {size} bytes is below minimum of {min_size} bytes")]
    FrameTooSmall { size: usize, min_size: usize },

    #[error("Invalid length prefix: {length}")]
    InvalidLength { length: u32 },

    #[error("Write operation timed out after {timeout:?}")]
    WriteTimeout { timeout: Duration },

    #[error("Writer closed after {written} of {expected} bytes")]
    WriterClosed { written: usize, expected: usize },

    #[error("Corrupted data: {reason}")]
    CorruptedData { reason: String },

    #[error("Unexpected end of file while reading {operation} ({read} bytes read)")]
    UnexpectedEof { operation: String, read: usize },

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WireProtocolError {
    /// Whether the byte stream can no longer be trusted after this error.
    ///
    /// A body that fails to decode still had a valid length prefix, so the
    /// next frame starts at a known offset. Everything else leaves the
    /// reader at an unknown position.
    pub fn breaks_stream(&self) -> bool {
        !matches!(
            self,
            WireProtocolError::CorruptedData { .. } | WireProtocolError::Serialization(_)
        )
    }
}

/// Result of decoding one complete frame
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedFrame {
    Envelope(Envelope),
    /// Structurally valid frame whose payload tag this client does not know
    UnknownTag { correlation_id: u64, tag: u16 },
}

/// Length-delimited envelope codec
#[derive(Debug, Clone, Default)]
pub struct FramedMessage {
    wire_config: WireConfig,
}

impl FramedMessage {
    pub fn new(wire_config: WireConfig) -> Self {
        Self { wire_config }
    }

    /// Validate frame size against the configured bounds
    #[instrument(level = "trace", skip(self), fields(max_size = self.wire_config.max_frame_size))]
    fn validate_frame_size(&self, size: usize) -> Result<(), WireProtocolError> {
        if size < FRAME_HEADER_SIZE {
            warn!(size = size, min_size = FRAME_HEADER_SIZE, "Frame is smaller than its header");
            return Err(WireProtocolError::FrameTooSmall {
                size,
                min_size: FRAME_HEADER_SIZE,
            });
        }

        if size > self.wire_config.max_frame_size {
            error!(
                size = size,
                max_size = self.wire_config.max_frame_size,
                "Frame size exceeds maximum allowed size"
            );
            return Err(WireProtocolError::FrameTooLarge {
                size,
                max_size: self.wire_config.max_frame_size,
            });
        }

        if size > self.wire_config.suspicious_threshold {
            warn!(
                size = size,
                threshold = self.wire_config.suspicious_threshold,
                "Frame size exceeds suspicious threshold but is still allowed"
            );
        }

        Ok(())
    }

    /// Length prefix validation, run before any allocation
    fn validate_length(&self, length: u32) -> Result<usize, WireProtocolError> {
        if length == 0 {
            warn!("Received zero-length frame prefix");
            return Err(WireProtocolError::InvalidLength { length });
        }

        let length = length as usize;
        self.validate_frame_size(length)?;
        Ok(length)
    }

    /// Serialize an envelope into a frame body (without the length prefix)
    #[instrument(level = "trace", skip(self, envelope), fields(correlation_id = envelope.correlation_id(), kind = envelope.payload().kind_name()))]
    pub fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, WireProtocolError> {
        let payload = envelope.payload();
        let body = match payload {
            Payload::Handshake(request) => bincode::serialize(request)?,
            Payload::HealthCheck | Payload::GetConfig => Vec::new(),
            Payload::Request(message) | Payload::Response(message) => bincode::serialize(message)?,
            Payload::HandshakeAccepted(accepted) => bincode::serialize(accepted)?,
            Payload::Health(status) => bincode::serialize(status)?,
            Payload::Config(snapshot) => bincode::serialize(snapshot)?,
            Payload::Error(error) => bincode::serialize(error)?,
        };

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
        frame.extend_from_slice(&envelope.correlation_id().to_be_bytes());
        frame.extend_from_slice(&payload.tag().as_u16().to_be_bytes());
        frame.extend_from_slice(&body);

        self.validate_frame_size(frame.len())?;
        trace!("Encoded {} frame of {} bytes", payload.kind_name(), frame.len());
        Ok(frame)
    }

    /// Decode one complete frame body
    #[instrument(level = "trace", skip(self, frame), fields(frame_size = frame.len()))]
    pub fn decode(&self, frame: &[u8]) -> Result<DecodedFrame, WireProtocolError> {
        if frame.len() < FRAME_HEADER_SIZE {
            return Err(WireProtocolError::CorruptedData {
                reason: format!(
                    "frame of {} bytes is shorter than the {} byte header",
                    frame.len(),
                    FRAME_HEADER_SIZE
                ),
            });
        }

        let (id_bytes, rest) = frame.split_at(CORRELATION_ID_SIZE);
        let (tag_bytes, body) = rest.split_at(PAYLOAD_TAG_SIZE);
        let correlation_id = u64::from_be_bytes(id_bytes.try_into().map_err(|_| {
            WireProtocolError::CorruptedData {
                reason: "truncated correlation id".to_string(),
            }
        })?);
        let raw_tag = u16::from_be_bytes([tag_bytes[0], tag_bytes[1]]);

        let tag = match PayloadTag::from_u16(raw_tag) {
            Some(tag) => tag,
            None => {
                return Ok(DecodedFrame::UnknownTag {
                    correlation_id,
                    tag: raw_tag,
                })
            }
        };

        let payload = match tag {
            PayloadTag::Handshake => Payload::Handshake(decode_body::<HandshakeRequest>(tag, body)?),
            PayloadTag::HealthCheck => Payload::HealthCheck,
            PayloadTag::GetConfig => Payload::GetConfig,
            PayloadTag::Request => Payload::Request(decode_body::<OpaqueMessage>(tag, body)?),
            PayloadTag::HandshakeAccepted => {
                Payload::HandshakeAccepted(decode_body::<HandshakeAccepted>(tag, body)?)
            }
            PayloadTag::Health => Payload::Health(decode_body::<HealthStatus>(tag, body)?),
            PayloadTag::Config => Payload::Config(decode_body::<ConfigSnapshot>(tag, body)?),
            PayloadTag::Response => Payload::Response(decode_body::<OpaqueMessage>(tag, body)?),
            PayloadTag::Error => Payload::Error(decode_body::<ErrorPayload>(tag, body)?),
        };

        Ok(DecodedFrame::Envelope(Envelope::new(correlation_id, payload)))
    }

    /// Robust write operation with recovery logic for partial writes
    async fn write_all_with_recovery(
        writer: &mut (impl AsyncWrite + Unpin),
        data: &[u8],
    ) -> Result<(), WireProtocolError> {
        let mut total_written = 0;
        let data_len = data.len();

        while total_written < data_len {
            let remaining = &data[total_written..];

            match writer.write(remaining).await {
                Ok(0) => {
                    error!(
                        total_written = total_written,
                        remaining = remaining.len(),
                        "Write returned 0 bytes, writer is closed"
                    );
                    return Err(WireProtocolError::WriterClosed {
                        written: total_written,
                        expected: data_len,
                    });
                }
                Ok(written) => {
                    total_written += written;
                    trace!(
                        written = written,
                        total_written = total_written,
                        remaining = data_len - total_written,
                        "Partial write completed"
                    );
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, total_written = total_written, "Write operation failed");
                    return Err(WireProtocolError::Io(e));
                }
            }
        }

        Ok(())
    }

    /// Read exactly `buffer.len()` bytes, reassembling partial reads
    async fn read_exact_with_recovery(
        reader: &mut (impl AsyncRead + Unpin),
        buffer: &mut [u8],
        operation: &str,
    ) -> Result<(), WireProtocolError> {
        let mut total_read = 0;
        let buffer_len = buffer.len();

        while total_read < buffer_len {
            let remaining = &mut buffer[total_read..];

            match reader.read(remaining).await {
                Ok(0) => {
                    return Err(WireProtocolError::UnexpectedEof {
                        operation: operation.to_string(),
                        read: total_read,
                    });
                }
                Ok(read) => {
                    total_read += read;
                    if total_read < buffer_len {
                        trace!(
                            read = read,
                            total_read = total_read,
                            expected = buffer_len,
                            "Partial read, waiting for the rest of the frame"
                        );
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, total_read = total_read, expected = buffer_len, "Read operation failed");
                    return Err(WireProtocolError::Io(e));
                }
            }
        }

        Ok(())
    }

    /// Write one envelope as a length-prefixed frame under the write timeout
    #[instrument(level = "debug", skip(self, writer, envelope), fields(correlation_id = envelope.correlation_id()))]
    pub async fn write_envelope(
        &self,
        writer: &mut (impl AsyncWrite + Unpin),
        envelope: &Envelope,
    ) -> Result<(), WireProtocolError> {
        let frame = self.encode(envelope)?;
        self.write_frame(writer, &frame).await
    }

    /// Write an already encoded frame body, prefixed with its length
    pub async fn write_frame(
        &self,
        writer: &mut (impl AsyncWrite + Unpin),
        frame: &[u8],
    ) -> Result<(), WireProtocolError> {
        let mut buffer = Vec::with_capacity(LENGTH_PREFIX_SIZE + frame.len());
        buffer.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        buffer.extend_from_slice(frame);

        let timeout = self.wire_config.write_timeout;
        let write = async {
            Self::write_all_with_recovery(writer, &buffer).await?;
            writer.flush().await?;
            Ok::<(), WireProtocolError>(())
        };

        match tokio::time::timeout(timeout, write).await {
            Ok(result) => {
                result?;
                debug!("Wrote {} byte frame", buffer.len());
                Ok(())
            }
            Err(_elapsed) => {
                error!(timeout = ?timeout, "Write operation timed out");
                Err(WireProtocolError::WriteTimeout { timeout })
            }
        }
    }

    /// Read one complete frame body.
    ///
    /// Returns `Ok(None)` when the peer closed the stream cleanly between
    /// frames. EOF anywhere inside a frame is an error.
    #[instrument(level = "trace", skip(self, reader))]
    pub async fn read_frame(
        &self,
        reader: &mut (impl AsyncRead + Unpin),
    ) -> Result<Option<Vec<u8>>, WireProtocolError> {
        let mut length_buffer = [0u8; LENGTH_PREFIX_SIZE];
        match Self::read_exact_with_recovery(reader, &mut length_buffer, "length prefix").await {
            Ok(()) => {}
            Err(WireProtocolError::UnexpectedEof { read: 0, .. }) => return Ok(None),
            Err(e) => return Err(e),
        }

        let length = self.validate_length(u32::from_be_bytes(length_buffer))?;

        let mut frame = vec![0u8; length];
        Self::read_exact_with_recovery(reader, &mut frame, "frame body").await?;
        trace!("Read {} byte frame", length);
        Ok(Some(frame))
    }
}

fn decode_body<T: DeserializeOwned>(
    tag: PayloadTag,
    body: &[u8],
) -> Result<T, WireProtocolError> {
    bincode::deserialize(body).map_err(|e| WireProtocolError::CorruptedData {
        reason: format!("Failed to decode {:?} body: {}", tag, e),
    })
}
