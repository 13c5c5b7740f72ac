pub mod error;
pub mod manager;
pub mod multiplexer;
pub mod provider;
pub mod receiver;
pub mod settings;
pub mod stats;
pub mod transport;

pub use error::{EngineError, ErrorKind};
pub use manager::{ConnectionManager, ConnectionState, StateChange};
pub use multiplexer::RequestMultiplexer;
pub use provider::{
    ConnectionConfigProvider, EndpointConfig, FileConfigProvider, ProviderError,
    StaticConfigProvider,
};
pub use receiver::LoopExit;
pub use settings::{EngineSettings, ReconnectPolicy};
pub use stats::{EngineStats, StatsSnapshot};
pub use transport::{BoxedStream, Connector, DuplexStream, TcpConnector};
