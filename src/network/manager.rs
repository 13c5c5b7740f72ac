//! Connection lifecycle, authentication and the public engine surface.

use crate::messages::types::{
    ConfigSnapshot, HandshakeRequest, HealthStatus, OpaqueMessage, Payload,
    HANDSHAKE_CORRELATION_ID,
};
use crate::messages::wire::FramedMessage;
use crate::network::error::EngineError;
use crate::network::multiplexer::RequestMultiplexer;
use crate::network::provider::{ConnectionConfigProvider, EndpointConfig};
use crate::network::receiver::{self, LoopExit};
use crate::network::settings::{EngineSettings, ReconnectPolicy};
use crate::network::stats::{EngineStats, StatsSnapshot};
use crate::network::transport::{split_stream, BoxedStream, Connector, TcpConnector};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const STATE_EVENT_CAPACITY: usize = 64;
const DISPOSED: &str = "engine has been disposed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    Disconnecting,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Published on every state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub old: ConnectionState,
    pub new: ConnectionState,
}

/// Everything that lives exactly as long as one channel
struct ActiveSession {
    generation: u64,
    mux: Arc<RequestMultiplexer>,
    receive_cancel: CancellationToken,
    receive_task: JoinHandle<()>,
}

struct ManagerInner {
    provider: Arc<dyn ConnectionConfigProvider>,
    connector: Arc<dyn Connector>,
    settings: EngineSettings,
    codec: FramedMessage,
    state: Mutex<ConnectionState>,
    events: broadcast::Sender<StateChange>,
    session: Mutex<Option<ActiveSession>>,
    /// Held for the whole of a connection attempt
    connect_gate: tokio::sync::Mutex<()>,
    /// Cancels the attempt in flight when the engine is disposed
    attempt_cancel: Mutex<Option<CancellationToken>>,
    attempts: AtomicU64,
    last_connect_error: Mutex<Option<EngineError>>,
    generation: AtomicU64,
    disposed: AtomicBool,
    stats: Arc<EngineStats>,
}

/// Client side of the local backend connection.
///
/// Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ConnectionManager {
    /// Engine connecting over TCP loopback
    pub fn new(provider: Arc<dyn ConnectionConfigProvider>, settings: EngineSettings) -> Self {
        Self::with_connector(provider, Arc::new(TcpConnector), settings)
    }

    pub fn with_connector(
        provider: Arc<dyn ConnectionConfigProvider>,
        connector: Arc<dyn Connector>,
        settings: EngineSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(STATE_EVENT_CAPACITY);
        let codec = FramedMessage::new(settings.wire.clone());

        Self {
            inner: Arc::new(ManagerInner {
                provider,
                connector,
                settings,
                codec,
                state: Mutex::new(ConnectionState::Disconnected),
                events,
                session: Mutex::new(None),
                connect_gate: tokio::sync::Mutex::new(()),
                attempt_cancel: Mutex::new(None),
                attempts: AtomicU64::new(0),
                last_connect_error: Mutex::new(None),
                generation: AtomicU64::new(0),
                disposed: AtomicBool::new(false),
                stats: Arc::new(EngineStats::default()),
            }),
        }
    }

    /// Open and authenticate the connection.
    ///
    /// Returns immediately when already connected. A second caller racing
    /// an attempt in progress gets `InvalidState` instead of a second channel.
    #[instrument(skip(self, cancel))]
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<(), EngineError> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(EngineError::invalid_state(DISPOSED));
        }
        if self.inner.live_mux().is_some() {
            return Ok(());
        }

        let _gate = self
            .inner
            .connect_gate
            .try_lock()
            .map_err(|_| EngineError::invalid_state("a connection attempt is already in progress"))?;

        if self.inner.live_mux().is_some() {
            return Ok(());
        }
        self.inner.connect_locked(cancel).await
    }

    /// Tear the connection down for good. Safe to call repeatedly and from
    /// any state, including while `connect` is running.
    #[instrument(skip(self))]
    pub async fn dispose(&self) {
        let inner = &self.inner;
        if inner.disposed.swap(true, Ordering::SeqCst) {
            debug!("Engine already disposed");
            return;
        }

        info!("Disposing connection engine");
        inner.set_state(ConnectionState::Disconnecting);

        if let Some(attempt) = lock(&inner.attempt_cancel).take() {
            attempt.cancel();
        }

        let session = lock(&inner.session).take();
        if let Some(session) = session {
            inner
                .teardown(session, EngineError::connection_lost("engine disposed"))
                .await;
        }

        inner.set_state(ConnectionState::Disconnected);
        info!(stats = %inner.stats.snapshot(), "Connection engine disposed");
    }

    /// Send one request payload and return the response payload.
    ///
    /// Connects first when the reconnect policy allows it.
    #[instrument(skip(self, payload, cancel), fields(operation = payload.kind_name()))]
    pub async fn send_request(
        &self,
        payload: Payload,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Payload, EngineError> {
        if !payload.is_request() || matches!(payload, Payload::Handshake(_)) {
            return Err(EngineError::protocol(format!(
                "{} cannot be sent as a request",
                payload.kind_name()
            )));
        }

        let mux = self.inner.ensure_connected(cancel).await?;
        let timeout = timeout.unwrap_or(self.inner.settings.request_timeout);
        let response = mux.send(payload, None, timeout, cancel).await?;
        Ok(response.into_payload())
    }

    pub async fn health_check(&self, cancel: &CancellationToken) -> Result<HealthStatus, EngineError> {
        match self.send_request(Payload::HealthCheck, None, cancel).await? {
            Payload::Health(status) => Ok(status),
            other => Err(unexpected_reply("HealthCheck", &other)),
        }
    }

    pub async fn fetch_config(&self, cancel: &CancellationToken) -> Result<ConfigSnapshot, EngineError> {
        match self.send_request(Payload::GetConfig, None, cancel).await? {
            Payload::Config(snapshot) => Ok(snapshot),
            other => Err(unexpected_reply("GetConfig", &other)),
        }
    }

    /// Opaque application request; the body is passed through untouched
    pub async fn request(
        &self,
        kind: impl Into<String>,
        body: impl Into<Vec<u8>>,
        cancel: &CancellationToken,
    ) -> Result<OpaqueMessage, EngineError> {
        let message = OpaqueMessage::new(kind, body);
        match self.send_request(Payload::Request(message), None, cancel).await? {
            Payload::Response(response) => Ok(response),
            other => Err(unexpected_reply("Request", &other)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Connected with the receive loop still reading
    pub fn is_connected(&self) -> bool {
        self.inner.live_mux().is_some()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }
}

impl ManagerInner {
    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    /// Move to `new` only from one of `allowed`
    fn transition_from(&self, allowed: &[ConnectionState], new: ConnectionState) -> bool {
        let mut state = lock(&self.state);
        if !allowed.contains(&*state) {
            return false;
        }
        let old = std::mem::replace(&mut *state, new);
        self.publish(old, new);
        true
    }

    fn set_state(&self, new: ConnectionState) {
        let mut state = lock(&self.state);
        let old = std::mem::replace(&mut *state, new);
        self.publish(old, new);
    }

    // Called with the state lock held so subscribers see transitions in order
    fn publish(&self, old: ConnectionState, new: ConnectionState) {
        if old == new {
            return;
        }
        info!(from = %old, to = %new, "Connection state changed");
        // No subscribers is fine
        let _ = self.events.send(StateChange { old, new });
    }

    fn live_mux(&self) -> Option<Arc<RequestMultiplexer>> {
        if self.state() != ConnectionState::Connected {
            return None;
        }
        lock(&self.session)
            .as_ref()
            .filter(|session| session.mux.is_open())
            .map(|session| Arc::clone(&session.mux))
    }

    async fn ensure_connected(
        self: &Arc<Self>,
        cancel: &CancellationToken,
    ) -> Result<Arc<RequestMultiplexer>, EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if let Some(mux) = self.live_mux() {
            return Ok(mux);
        }
        if self.disposed.load(Ordering::SeqCst) {
            return Err(EngineError::invalid_state(DISPOSED));
        }
        if self.settings.reconnect == ReconnectPolicy::Manual {
            return Err(EngineError::connection_failed(format!(
                "not connected (state: {})",
                self.state()
            )));
        }

        let seen = self.attempts.load(Ordering::SeqCst);
        let _gate = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            gate = self.connect_gate.lock() => gate,
        };

        if let Some(mux) = self.live_mux() {
            return Ok(mux);
        }

        // Someone else attempted while we waited; share their failure
        if self.attempts.load(Ordering::SeqCst) != seen {
            let previous = lock(&self.last_connect_error).clone();
            if let Some(err) = previous.filter(|err| !err.is_cancelled()) {
                return Err(err);
            }
        }

        debug!("Connecting on demand");
        self.connect_locked(cancel).await?;
        self.live_mux()
            .ok_or_else(|| EngineError::connection_lost("connection closed right after connecting"))
    }

    /// Full connection attempt. The caller holds `connect_gate`.
    async fn connect_locked(self: &Arc<Self>, cancel: &CancellationToken) -> Result<(), EngineError> {
        let attempt = cancel.child_token();
        *lock(&self.attempt_cancel) = Some(attempt.clone());

        let result = self.attempt_connect(&attempt).await;

        *lock(&self.attempt_cancel) = None;
        *lock(&self.last_connect_error) = result.as_ref().err().cloned();
        self.attempts.fetch_add(1, Ordering::SeqCst);

        match &result {
            Ok(()) => {
                self.stats.connected();
                info!("Connected to backend");
            }
            Err(err) => warn!(error = %err, kind = %err.kind(), "Connection attempt failed"),
        }
        result
    }

    async fn attempt_connect(self: &Arc<Self>, cancel: &CancellationToken) -> Result<(), EngineError> {
        // Checked after the attempt token is published so dispose either
        // sees the token or we see the flag.
        if self.disposed.load(Ordering::SeqCst) {
            return Err(EngineError::invalid_state(DISPOSED));
        }

        // A Connected state whose channel already closed is left over from a
        // loop exit the supervisor has not processed yet.
        if self.state() == ConnectionState::Connected {
            let stale = lock(&self.session).take();
            if let Some(session) = stale {
                self.teardown(session, EngineError::connection_lost("connection closed"))
                    .await;
            }
            self.transition_from(&[ConnectionState::Connected], ConnectionState::Failed);
        }

        if !self.transition_from(
            &[ConnectionState::Disconnected, ConnectionState::Failed],
            ConnectionState::Connecting,
        ) {
            return Err(EngineError::invalid_state(format!(
                "cannot connect while {}",
                self.state()
            )));
        }

        match self.establish(cancel).await {
            Ok(()) => {
                if self.transition_from(&[ConnectionState::Authenticating], ConnectionState::Connected) {
                    Ok(())
                } else {
                    // Disposed between the handshake reply and here
                    Err(EngineError::Cancelled)
                }
            }
            Err(err) => {
                let session = lock(&self.session).take();
                if let Some(session) = session {
                    self.teardown(session, EngineError::connection_lost(&err)).await;
                }
                self.transition_from(
                    &[ConnectionState::Connecting, ConnectionState::Authenticating],
                    ConnectionState::Failed,
                );
                Err(err)
            }
        }
    }

    async fn establish(self: &Arc<Self>, cancel: &CancellationToken) -> Result<(), EngineError> {
        let config = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            config = self.provider.get_config() => config?,
        };
        config.validate()?;

        info!(
            endpoint = %config.endpoint,
            token = %config.token_fingerprint(),
            "Opening connection to backend"
        );

        let timeout = self.settings.connect_timeout;
        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            opened = tokio::time::timeout(timeout, self.connector.open(&config.endpoint)) => match opened {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    return Err(EngineError::connection_failed(format!(
                        "failed to connect to {}: {}",
                        config.endpoint, e
                    )))
                }
                Err(_) => {
                    return Err(EngineError::connection_failed(format!(
                        "timed out after {:?} connecting to {}",
                        timeout, config.endpoint
                    )))
                }
            },
        };

        let mux = self.start_session(stream).await?;

        if !self.transition_from(&[ConnectionState::Connecting], ConnectionState::Authenticating) {
            return Err(EngineError::Cancelled);
        }

        self.authenticate(&mux, &config, cancel).await
    }

    /// Install the channel and spawn its receive loop
    async fn start_session(
        self: &Arc<Self>,
        stream: BoxedStream,
    ) -> Result<Arc<RequestMultiplexer>, EngineError> {
        let (reader, writer) = split_stream(stream);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mux = Arc::new(RequestMultiplexer::new(
            self.codec.clone(),
            writer,
            Arc::clone(&self.stats),
        ));
        let receive_cancel = CancellationToken::new();

        let receive_task = {
            let weak: Weak<ManagerInner> = Arc::downgrade(self);
            let codec = self.codec.clone();
            let mux = Arc::clone(&mux);
            let cancel = receive_cancel.clone();
            tokio::spawn(async move {
                let exit = receiver::run(reader, codec, mux, cancel).await;
                if let Some(inner) = weak.upgrade() {
                    inner.on_receive_exit(generation, exit).await;
                }
            })
        };

        let displaced = {
            let mut slot = lock(&self.session);
            if self.disposed.load(Ordering::SeqCst) {
                receive_cancel.cancel();
                receive_task.abort();
                return Err(EngineError::Cancelled);
            }
            slot.replace(ActiveSession {
                generation,
                mux: Arc::clone(&mux),
                receive_cancel,
                receive_task,
            })
        };
        debug!(generation, "Session started");

        // At most one live channel: whatever still occupied the slot goes now
        if let Some(old) = displaced {
            warn!(old = old.generation, new = generation, "Tearing down displaced session");
            self.teardown(old, EngineError::connection_lost("replaced by a new connection"))
                .await;
        }
        Ok(mux)
    }

    async fn authenticate(
        &self,
        mux: &Arc<RequestMultiplexer>,
        config: &EndpointConfig,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let request = HandshakeRequest::new(config.token.clone());
        debug!(client_id = %request.client_id, "Sending handshake");

        let reply = mux
            .send(
                Payload::Handshake(request),
                Some(HANDSHAKE_CORRELATION_ID),
                self.settings.auth_timeout,
                cancel,
            )
            .await
            .map_err(|err| match err {
                EngineError::ServerError { code, message } => EngineError::AuthenticationFailed {
                    reason: format!("{}: {}", code, message),
                },
                EngineError::RequestTimeout { elapsed, .. } => EngineError::AuthenticationFailed {
                    reason: format!("no handshake reply within {:?}", elapsed),
                },
                EngineError::ConnectionLost { reason } => EngineError::ConnectionFailed {
                    reason: format!("connection lost during handshake: {}", reason),
                },
                other => other,
            })?;

        match reply.into_payload() {
            Payload::HandshakeAccepted(accepted) => {
                info!(
                    session_id = %accepted.session_id,
                    server_version = %accepted.server_version,
                    "Handshake accepted"
                );
                Ok(())
            }
            other => Err(unexpected_reply("Handshake", &other)),
        }
    }

    /// Stop the loop, close the write half and fail what is still pending
    async fn teardown(&self, session: ActiveSession, reason: EngineError) {
        let close_timeout = self.settings.close_timeout;
        session.receive_cancel.cancel();
        session.mux.shutdown(close_timeout).await;
        session.mux.fail_all(reason);

        let mut task = session.receive_task;
        if tokio::time::timeout(close_timeout, &mut task).await.is_err() {
            warn!(generation = session.generation, "Receive loop did not stop in time, aborting");
            task.abort();
        }
        debug!(generation = session.generation, "Session torn down");
    }

    /// Runs on the receive task after the loop returns
    async fn on_receive_exit(&self, generation: u64, exit: LoopExit) {
        if exit == LoopExit::Cancelled {
            return;
        }

        let session = {
            let mut slot = lock(&self.session);
            let current = matches!(slot.as_ref(), Some(session) if session.generation == generation);
            if !current {
                return;
            }

            match self.state() {
                ConnectionState::Connected => {
                    // Failed before the slot lock is released, so a reconnect
                    // can only start once this session is out of the picture
                    let session = slot.take();
                    self.transition_from(&[ConnectionState::Connected], ConnectionState::Failed);
                    session
                }
                ConnectionState::Authenticating if exit == LoopExit::PeerClosed => {
                    // Backends reject a bad token by hanging up
                    if let Some(session) = slot.as_ref() {
                        session.mux.fail_all(EngineError::AuthenticationFailed {
                            reason: "backend closed the connection during the handshake".to_string(),
                        });
                    }
                    None
                }
                _ => None,
            }
        };

        let Some(session) = session else {
            return;
        };

        match &exit {
            LoopExit::ChannelFailed(err) => warn!(error = %err, generation, "Connection failed"),
            _ => warn!(generation, "Backend closed the connection"),
        }

        // The loop already returned, so no join here: this is its own task.
        session.mux.shutdown(self.settings.close_timeout).await;
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        let session = match self.session.get_mut() {
            Ok(slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(session) = session {
            session.receive_cancel.cancel();
            session.receive_task.abort();
        }
    }
}

fn unexpected_reply(operation: &str, reply: &Payload) -> EngineError {
    EngineError::protocol(format!(
        "unexpected {} reply to {}",
        reply.kind_name(),
        operation
    ))
}
