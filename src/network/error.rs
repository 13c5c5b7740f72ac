use crate::messages::wire::WireProtocolError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Coarse classification callers branch on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ConnectionFailed,
    AuthenticationFailed,
    ProtocolError,
    RequestTimeout,
    ServerError,
    Cancelled,
    InvalidState,
    InvalidConfig,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::ConnectionFailed => "connection failed",
            ErrorKind::AuthenticationFailed => "authentication failed",
            ErrorKind::ProtocolError => "protocol error",
            ErrorKind::RequestTimeout => "request timeout",
            ErrorKind::ServerError => "server error",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::InvalidState => "invalid state",
            ErrorKind::InvalidConfig => "invalid config",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by the engine to its callers.
///
/// Cloneable so one connection failure can be delivered to every
/// outstanding request.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Connection failed: {reason}")]
    ConnectionFailed { reason: String },

    #[error("Connection lost: {reason}")]
    ConnectionLost { reason: String },

    #[error("Authentication failed: {reason}")]
    AuthenticationFailed { reason: String },

    #[error("Protocol error: {reason}")]
    Protocol { reason: String },

    #[error("Request {correlation_id} ({operation}) timed out after {elapsed:?}")]
    RequestTimeout {
        correlation_id: u64,
        elapsed: Duration,
        operation: String,
    },

    #[error("Server returned error {code}: {message}")]
    ServerError { code: String, message: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid state: {reason}")]
    InvalidState { reason: String },

    #[error("Invalid connection configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl EngineError {
    pub fn connection_failed(reason: impl fmt::Display) -> Self {
        EngineError::ConnectionFailed {
            reason: reason.to_string(),
        }
    }

    pub fn connection_lost(reason: impl fmt::Display) -> Self {
        EngineError::ConnectionLost {
            reason: reason.to_string(),
        }
    }

    pub fn protocol(reason: impl fmt::Display) -> Self {
        EngineError::Protocol {
            reason: reason.to_string(),
        }
    }

    pub fn invalid_state(reason: impl fmt::Display) -> Self {
        EngineError::InvalidState {
            reason: reason.to_string(),
        }
    }

    pub fn invalid_config(reason: impl fmt::Display) -> Self {
        EngineError::InvalidConfig {
            reason: reason.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::ConnectionFailed { .. } | EngineError::ConnectionLost { .. } => {
                ErrorKind::ConnectionFailed
            }
            EngineError::AuthenticationFailed { .. } => ErrorKind::AuthenticationFailed,
            EngineError::Protocol { .. } => ErrorKind::ProtocolError,
            EngineError::RequestTimeout { .. } => ErrorKind::RequestTimeout,
            EngineError::ServerError { .. } => ErrorKind::ServerError,
            EngineError::Cancelled => ErrorKind::Cancelled,
            EngineError::InvalidState { .. } => ErrorKind::InvalidState,
            EngineError::InvalidConfig { .. } => ErrorKind::InvalidConfig,
        }
    }

    pub fn is_connection_error(&self) -> bool {
        self.kind() == ErrorKind::ConnectionFailed
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }

    /// Retry predicate for transient failures only. Connection loss waits
    /// for an explicit reconnect instead.
    pub fn is_retryable_timeout(&self) -> bool {
        matches!(self, EngineError::RequestTimeout { .. })
    }
}

impl From<WireProtocolError> for EngineError {
    fn from(err: WireProtocolError) -> Self {
        if err.breaks_stream() {
            EngineError::connection_lost(err)
        } else {
            EngineError::protocol(err)
        }
    }
}
