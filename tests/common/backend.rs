//! Scripted in-memory backend speaking the real wire protocol.
//!
//! Application requests are driven by their `kind`:
//!
//! - `echo`: reply immediately with the same kind and body
//! - `delay:<ms>`: reply after the given delay
//! - `silent`: never reply
//! - `fail`: reply with an error payload
//! - `stray`: send a response for an unknown id and a frame with an unknown
//!   tag before the real reply
//! - `hangup`: close the connection cleanly
//! - `garbage`: write an impossible length prefix

use async_trait::async_trait;
use loopwire::messages::types::{
    ConfigSnapshot, ConfigValue, Envelope, HandshakeAccepted, HealthStatus, OpaqueMessage, Payload,
};
use loopwire::messages::wire::{DecodedFrame, FramedMessage};
use loopwire::network::transport::{BoxedStream, Connector};
use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf, WriteHalf};
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;

pub const TOKEN: &str = "test-token";
pub const ENDPOINT: &str = "127.0.0.1:4100";
pub const STRAY_CORRELATION_ID: u64 = 9_999;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeMode {
    Accept,
    /// Reply with an error payload
    Reject,
    /// Close the connection without replying
    HangUp,
    /// Never reply
    Ignore,
}

pub struct BackendState {
    handshake_mode: Mutex<HandshakeMode>,
    handshakes: AtomicUsize,
    config_requests: AtomicUsize,
    config_revision: AtomicU64,
    fail_config: AtomicBool,
    kill: Mutex<CancellationToken>,
}

impl BackendState {
    fn new() -> Self {
        Self {
            handshake_mode: Mutex::new(HandshakeMode::Accept),
            handshakes: AtomicUsize::new(0),
            config_requests: AtomicUsize::new(0),
            config_revision: AtomicU64::new(1),
            fail_config: AtomicBool::new(false),
            kill: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn set_handshake_mode(&self, mode: HandshakeMode) {
        *self.handshake_mode.lock().unwrap() = mode;
    }

    pub fn handshakes(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }

    pub fn config_requests(&self) -> usize {
        self.config_requests.load(Ordering::SeqCst)
    }

    pub fn set_config_revision(&self, revision: u64) {
        self.config_revision.store(revision, Ordering::SeqCst);
    }

    /// Answer GetConfig with an error payload
    pub fn set_fail_config(&self, fail: bool) {
        self.fail_config.store(fail, Ordering::SeqCst);
    }

    fn config(&self) -> ConfigSnapshot {
        let mut entries = BTreeMap::new();
        entries.insert("model".to_string(), ConfigValue::Text("local-large".to_string()));
        entries.insert("max_tokens".to_string(), ConfigValue::Integer(4096));
        entries.insert("streaming".to_string(), ConfigValue::Bool(true));
        ConfigSnapshot {
            revision: self.config_revision.load(Ordering::SeqCst),
            entries,
        }
    }
}

/// Connector that opens in-memory channels to a scripted backend
pub struct MemoryConnector {
    pub backend: Arc<BackendState>,
    opens: AtomicUsize,
    open_delay: Duration,
    close_delay: Duration,
}

impl MemoryConnector {
    pub fn new() -> Arc<Self> {
        Self::with_open_delay(Duration::ZERO)
    }

    pub fn with_open_delay(open_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            backend: Arc::new(BackendState::new()),
            opens: AtomicUsize::new(0),
            open_delay,
            close_delay: Duration::ZERO,
        })
    }

    /// Client streams whose graceful close takes `close_delay`
    pub fn with_close_delay(close_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            backend: Arc::new(BackendState::new()),
            opens: AtomicUsize::new(0),
            open_delay: Duration::ZERO,
            close_delay,
        })
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Drop every open connection on the backend side
    pub fn kill_connections(&self) {
        let mut kill = self.backend.kill.lock().unwrap();
        kill.cancel();
        *kill = CancellationToken::new();
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, _endpoint: &str) -> std::io::Result<BoxedStream> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }

        let (client, server) = tokio::io::duplex(256 * 1024);
        let kill = self.backend.kill.lock().unwrap().clone();
        tokio::spawn(serve(server, Arc::clone(&self.backend), kill));
        if self.close_delay.is_zero() {
            return Ok(Box::new(client));
        }
        Ok(Box::new(SlowClose {
            inner: client,
            delay: self.close_delay,
            closing: None,
        }))
    }
}

/// Delays `poll_shutdown`, like a peer that is slow to drain
struct SlowClose {
    inner: DuplexStream,
    delay: Duration,
    closing: Option<Pin<Box<Sleep>>>,
}

impl AsyncRead for SlowClose {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for SlowClose {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let delay = this.delay;
        let closing = this
            .closing
            .get_or_insert_with(|| Box::pin(tokio::time::sleep(delay)));
        ready!(closing.as_mut().poll(cx));
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

type SharedWriter = Arc<tokio::sync::Mutex<WriteHalf<DuplexStream>>>;

async fn reply(writer: &SharedWriter, envelope: Envelope) {
    let mut writer = writer.lock().await;
    let _ = FramedMessage::default()
        .write_envelope(&mut *writer, &envelope)
        .await;
}

async fn serve(stream: DuplexStream, state: Arc<BackendState>, kill: CancellationToken) {
    let codec = FramedMessage::default();
    let (mut reader, writer) = tokio::io::split(stream);
    let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(writer));

    loop {
        let frame = tokio::select! {
            _ = kill.cancelled() => return,
            frame = codec.read_frame(&mut reader) => frame,
        };
        let Ok(Some(frame)) = frame else {
            return;
        };
        let Ok(DecodedFrame::Envelope(envelope)) = codec.decode(&frame) else {
            continue;
        };
        let id = envelope.correlation_id();

        match envelope.into_payload() {
            Payload::Handshake(request) => {
                state.handshakes.fetch_add(1, Ordering::SeqCst);
                let mode = *state.handshake_mode.lock().unwrap();
                match mode {
                    HandshakeMode::Accept if request.token == TOKEN => {
                        let accepted = HandshakeAccepted {
                            session_id: format!("session-{}", request.client_id),
                            server_version: "test-backend/1.0".to_string(),
                        };
                        reply(&writer, Envelope::new(id, Payload::HandshakeAccepted(accepted))).await;
                    }
                    HandshakeMode::Accept | HandshakeMode::Reject => {
                        reply(&writer, Envelope::new(id, Payload::error("invalid_token", "token rejected"))).await;
                    }
                    HandshakeMode::HangUp => return,
                    HandshakeMode::Ignore => {}
                }
            }
            Payload::HealthCheck => {
                let status = HealthStatus {
                    healthy: true,
                    server_version: "test-backend/1.0".to_string(),
                    uptime_ms: 1234,
                };
                reply(&writer, Envelope::new(id, Payload::Health(status))).await;
            }
            Payload::GetConfig => {
                state.config_requests.fetch_add(1, Ordering::SeqCst);
                let payload = if state.fail_config.load(Ordering::SeqCst) {
                    Payload::error("config_unavailable", "configuration store is locked")
                } else {
                    Payload::Config(state.config())
                };
                reply(&writer, Envelope::new(id, payload)).await;
            }
            Payload::Request(message) => {
                if !handle_request(&writer, id, message).await {
                    return;
                }
            }
            _ => {}
        }
    }
}

/// Returns false when the connection should close
async fn handle_request(writer: &SharedWriter, id: u64, message: OpaqueMessage) -> bool {
    let kind = message.kind.clone();
    match kind.as_str() {
        "echo" => reply(writer, Envelope::new(id, Payload::Response(message))).await,
        "silent" => {}
        "fail" => {
            reply(writer, Envelope::new(id, Payload::error("request_failed", "backend refused the request"))).await
        }
        "stray" => {
            let status = HealthStatus {
                healthy: false,
                server_version: "stray".to_string(),
                uptime_ms: 0,
            };
            reply(writer, Envelope::new(STRAY_CORRELATION_ID, Payload::Health(status))).await;

            let mut unknown = Vec::new();
            unknown.extend_from_slice(&id.to_be_bytes());
            unknown.extend_from_slice(&0x7777u16.to_be_bytes());
            {
                let mut w = writer.lock().await;
                let _ = FramedMessage::default().write_frame(&mut *w, &unknown).await;
            }

            reply(writer, Envelope::new(id, Payload::Response(message))).await;
        }
        "hangup" => return false,
        "garbage" => {
            let mut w = writer.lock().await;
            let _ = w.write_all(&u32::MAX.to_be_bytes()).await;
            let _ = w.flush().await;
        }
        other => {
            if let Some(ms) = other.strip_prefix("delay:").and_then(|ms| ms.parse::<u64>().ok()) {
                let writer = Arc::clone(writer);
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    reply(&writer, Envelope::new(id, Payload::Response(message))).await;
                });
            } else {
                reply(writer, Envelope::new(id, Payload::error("unknown_kind", other))).await;
            }
        }
    }
    true
}
