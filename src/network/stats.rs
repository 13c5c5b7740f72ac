use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by the multiplexer, receive loop and connection manager
#[derive(Debug, Default)]
pub struct EngineStats {
    requests_sent: AtomicU64,
    responses_matched: AtomicU64,
    server_errors: AtomicU64,
    timeouts: AtomicU64,
    connection_failures: AtomicU64,
    cancelled: AtomicU64,
    frames_discarded: AtomicU64,
    connects: AtomicU64,
}

impl EngineStats {
    pub fn request_sent(&self) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn response_matched(&self) {
        self.responses_matched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn server_error(&self) {
        self.server_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_failure(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_discarded(&self) {
        self.frames_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connected(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            responses_matched: self.responses_matched.load(Ordering::Relaxed),
            server_errors: self.server_errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            connection_failures: self.connection_failures.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            frames_discarded: self.frames_discarded.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the engine counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub requests_sent: u64,
    pub responses_matched: u64,
    pub server_errors: u64,
    pub timeouts: u64,
    pub connection_failures: u64,
    pub cancelled: u64,
    pub frames_discarded: u64,
    pub connects: u64,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Requests: {}, Matched: {}, Server errors: {}, Timeouts: {}, Connection failures: {}, Cancelled: {}, Discarded frames: {}, Connects: {}",
            self.requests_sent,
            self.responses_matched,
            self.server_errors,
            self.timeouts,
            self.connection_failures,
            self.cancelled,
            self.frames_discarded,
            self.connects
        )
    }
}
