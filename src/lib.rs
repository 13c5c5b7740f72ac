pub mod cache;
pub mod cli;
pub mod messages;
pub mod network;
pub mod retry;

// Re-export key types for easy testing
pub use cache::{CacheEvent, CacheState, ConfigCache, ConfigSource};
pub use messages::{ConfigSnapshot, ConfigValue, Envelope, FramedMessage, Payload};
pub use network::{
    ConnectionManager, ConnectionState, EngineError, EngineSettings, ErrorKind, ReconnectPolicy,
    StateChange,
};
pub use retry::{RetryPolicy, Retryable};
