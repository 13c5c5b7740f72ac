//! Correlation of outgoing requests with incoming responses.
//!
//! Every request registers a one-shot completion keyed by its correlation
//! id. Removing the entry from the pending table is what resolves it, so
//! whichever of response, timeout, cancellation or connection failure
//! removes it first is the only outcome the caller ever observes.

use crate::messages::types::{Envelope, Payload, HANDSHAKE_CORRELATION_ID};
use crate::messages::wire::FramedMessage;
use crate::network::error::EngineError;
use crate::network::stats::EngineStats;
use crate::network::transport::FrameWriter;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

type Completion = oneshot::Sender<Result<Envelope, EngineError>>;

/// First id handed to application traffic; ids below are reserved
const FIRST_APPLICATION_ID: u64 = HANDSHAKE_CORRELATION_ID + 1;

/// Identity and deadline of one request in flight
struct Exchange {
    correlation_id: u64,
    operation: &'static str,
    started: Instant,
    deadline: tokio::time::Instant,
}

pub struct RequestMultiplexer {
    codec: FramedMessage,
    /// Serializes frame writes; `None` once the write half is shut down
    writer: Arc<Mutex<Option<FrameWriter>>>,
    pending: DashMap<u64, Completion>,
    next_id: AtomicU64,
    open: AtomicBool,
    stats: Arc<EngineStats>,
}

impl RequestMultiplexer {
    pub fn new(codec: FramedMessage, writer: FrameWriter, stats: Arc<EngineStats>) -> Self {
        Self {
            codec,
            writer: Arc::new(Mutex::new(Some(writer))),
            pending: DashMap::new(),
            next_id: AtomicU64::new(FIRST_APPLICATION_ID),
            open: AtomicBool::new(true),
            stats,
        }
    }

    /// Whether the underlying channel is still usable for new requests
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Send a request and wait for its response.
    ///
    /// `reserved_id` is only used for the handshake. Cancellation wins over
    /// every other outcome, including while the frame is still queued
    /// behind other writers or being written. The timeout covers the whole
    /// exchange.
    #[instrument(level = "debug", skip(self, payload, cancel), fields(operation = payload.kind_name()))]
    pub async fn send(
        self: &Arc<Self>,
        payload: Payload,
        reserved_id: Option<u64>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Envelope, EngineError> {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + timeout;

        if cancel.is_cancelled() {
            self.stats.cancelled();
            return Err(EngineError::Cancelled);
        }
        if !self.is_open() {
            return Err(EngineError::connection_lost("connection is closed"));
        }

        let correlation_id = reserved_id.unwrap_or_else(|| self.allocate_id());
        let operation = payload.kind_name();
        let envelope = Envelope::new(correlation_id, payload);

        // An outgoing frame that cannot be encoded never reached the wire,
        // so it fails only this caller.
        let frame = self.codec.encode(&envelope).map_err(EngineError::protocol)?;

        let (tx, rx) = oneshot::channel();
        match self.pending.entry(correlation_id) {
            Entry::Occupied(_) => {
                return Err(EngineError::invalid_state(format!(
                    "correlation id {} is already in flight",
                    correlation_id
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }

        // fail_all may have drained the table between the open check and the insert
        if !self.is_open() {
            self.pending.remove(&correlation_id);
            return Err(EngineError::connection_lost("connection is closed"));
        }

        self.stats.request_sent();
        trace!(correlation_id, "Request registered");

        let exchange = Exchange {
            correlation_id,
            operation,
            started,
            deadline,
        };
        let outcome = self.exchange(&exchange, frame, rx, cancel).await;

        match &outcome {
            Ok(_) => self.stats.response_matched(),
            Err(EngineError::Cancelled) => self.stats.cancelled(),
            Err(EngineError::RequestTimeout { elapsed, .. }) => {
                warn!(correlation_id, operation, elapsed = ?elapsed, "Request timed out");
                self.stats.timeout();
            }
            Err(EngineError::ServerError { .. }) => self.stats.server_error(),
            Err(_) => {}
        }

        outcome
    }

    async fn exchange(
        self: &Arc<Self>,
        exchange: &Exchange,
        frame: Vec<u8>,
        mut rx: oneshot::Receiver<Result<Envelope, EngineError>>,
        cancel: &CancellationToken,
    ) -> Result<Envelope, EngineError> {
        let correlation_id = exchange.correlation_id;

        // Nothing has reached the wire while waiting for the send path
        let guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(self.abandon(correlation_id)),
            guard = Arc::clone(&self.writer).lock_owned() => guard,
            _ = tokio::time::sleep_until(exchange.deadline) => {
                return self.expire(exchange, &mut rx).await;
            }
        };

        // A half-written frame cannot be taken back, so the write finishes
        // on its own task even if this caller stops waiting.
        let mut write = {
            let mux = Arc::clone(self);
            tokio::spawn(async move {
                let mut guard = guard;
                let result = match guard.as_mut() {
                    Some(writer) => mux.codec.write_frame(writer, &frame).await.map_err(|e| {
                        EngineError::connection_lost(format!("failed to send frame: {}", e))
                    }),
                    None => Err(EngineError::connection_lost("connection is closed")),
                };
                drop(guard);

                if let Err(e) = &result {
                    mux.pending.remove(&correlation_id);
                    mux.fail_all(e.clone());
                }
                result
            })
        };

        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(self.abandon(correlation_id)),
            joined = &mut write => joined.unwrap_or_else(|e| {
                Err(EngineError::connection_lost(format!("send task failed: {}", e)))
            }),
            _ = tokio::time::sleep_until(exchange.deadline) => {
                return self.expire(exchange, &mut rx).await;
            }
        };
        written?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(self.abandon(correlation_id)),
            resolved = &mut rx => flatten(resolved),
            _ = tokio::time::sleep_until(exchange.deadline) => self.expire(exchange, &mut rx).await,
        }
    }

    fn abandon(&self, correlation_id: u64) -> EngineError {
        self.pending.remove(&correlation_id);
        debug!(correlation_id, "Request cancelled by caller");
        EngineError::Cancelled
    }

    async fn expire(
        &self,
        exchange: &Exchange,
        rx: &mut oneshot::Receiver<Result<Envelope, EngineError>>,
    ) -> Result<Envelope, EngineError> {
        if self.pending.remove(&exchange.correlation_id).is_some() {
            Err(EngineError::RequestTimeout {
                correlation_id: exchange.correlation_id,
                elapsed: exchange.started.elapsed(),
                operation: exchange.operation.to_string(),
            })
        } else {
            // A resolver took the completion first; its outcome stands.
            flatten(rx.await)
        }
    }

    /// Complete the request matching this envelope.
    ///
    /// Returns `false` when no request is waiting for the id; the envelope is
    /// dropped in that case.
    pub fn resolve(&self, envelope: Envelope) -> bool {
        let correlation_id = envelope.correlation_id();
        let Some((_, completion)) = self.pending.remove(&correlation_id) else {
            debug!(
                correlation_id,
                kind = envelope.payload().kind_name(),
                "Discarding response for unknown or already resolved request"
            );
            self.stats.frame_discarded();
            return false;
        };

        let server_error = match envelope.payload() {
            Payload::Error(error) => Some(EngineError::ServerError {
                code: error.code.clone(),
                message: error.message.clone(),
            }),
            _ => None,
        };
        let result = match server_error {
            Some(err) => Err(err),
            None => Ok(envelope),
        };

        if completion.send(result).is_err() {
            debug!(correlation_id, "Caller stopped waiting before the response arrived");
        }
        true
    }

    /// Record a frame the receive loop dropped before it reached `resolve`
    pub fn discard(&self) {
        self.stats.frame_discarded();
    }

    /// Close the multiplexer and fail every outstanding request with `error`
    pub fn fail_all(&self, error: EngineError) {
        self.open.store(false, Ordering::SeqCst);

        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        if ids.is_empty() {
            return;
        }

        warn!(outstanding = ids.len(), error = %error, "Failing all outstanding requests");
        for id in ids {
            if let Some((_, completion)) = self.pending.remove(&id) {
                self.stats.connection_failure();
                let _ = completion.send(Err(error.clone()));
            }
        }
    }

    /// Stop accepting new requests without touching outstanding ones
    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    /// Gracefully shut the write half down, bounded by `timeout`
    pub async fn shutdown(&self, timeout: Duration) {
        self.mark_closed();

        let writer = match tokio::time::timeout(timeout, self.writer.lock()).await {
            Ok(mut guard) => guard.take(),
            Err(_) => {
                warn!(timeout = ?timeout, "Send path still busy, abandoning graceful close");
                return;
            }
        };

        if let Some(mut writer) = writer {
            match tokio::time::timeout(timeout, writer.shutdown()).await {
                Ok(Ok(())) => debug!("Write half closed"),
                Ok(Err(e)) => warn!(error = %e, "Error while closing connection"),
                Err(_) => warn!(timeout = ?timeout, "Graceful close timed out"),
            }
        }
    }
}

fn flatten(
    resolved: Result<Result<Envelope, EngineError>, oneshot::error::RecvError>,
) -> Result<Envelope, EngineError> {
    match resolved {
        Ok(result) => result,
        Err(_) => Err(EngineError::connection_lost("request was dropped with its connection")),
    }
}
