//! Connection configuration providers.
//!
//! The backend publishes where it listens and a one-time token. The engine
//! asks a provider for both right before every connection attempt.

use crate::network::error::EngineError;
use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Connection details unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to read connection file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse connection file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl From<ProviderError> for EngineError {
    fn from(err: ProviderError) -> Self {
        EngineError::connection_failed(err)
    }
}

/// Where to connect and which secret to present
#[derive(Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    pub endpoint: String,
    pub token: String,
}

impl EndpointConfig {
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            token: token.into(),
        }
    }

    /// Reject malformed endpoints and empty tokens before any I/O happens
    pub fn validate(&self) -> Result<(), EngineError> {
        let (host, port) = self.endpoint.rsplit_once(':').ok_or_else(|| {
            EngineError::invalid_config(format!(
                "endpoint '{}' is missing a port",
                self.endpoint
            ))
        })?;

        if host.trim().is_empty() {
            return Err(EngineError::invalid_config(format!(
                "endpoint '{}' is missing a host",
                self.endpoint
            )));
        }

        match port.parse::<u16>() {
            Ok(0) | Err(_) => {
                return Err(EngineError::invalid_config(format!(
                    "endpoint '{}' has an invalid port '{}'",
                    self.endpoint, port
                )))
            }
            Ok(_) => {}
        }

        if self.token.trim().is_empty() {
            return Err(EngineError::invalid_config("authentication token is empty"));
        }

        let bare_host = host.trim_start_matches('[').trim_end_matches(']');
        let is_loopback = bare_host.eq_ignore_ascii_case("localhost")
            || bare_host
                .parse::<IpAddr>()
                .map(|ip| ip.is_loopback())
                .unwrap_or(false);
        if !is_loopback {
            warn!(endpoint = %self.endpoint, "Backend endpoint is not a loopback address");
        }

        Ok(())
    }

    /// Short digest of the token, safe to log
    pub fn token_fingerprint(&self) -> String {
        let digest = Sha256::digest(self.token.as_bytes());
        hex::encode(&digest[..6])
    }
}

impl fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("endpoint", &self.endpoint)
            .field("token", &format_args!("sha256:{}", self.token_fingerprint()))
            .finish()
    }
}

#[async_trait]
pub trait ConnectionConfigProvider: Send + Sync {
    async fn get_config(&self) -> Result<EndpointConfig, ProviderError>;
}

/// Fixed endpoint and token
#[derive(Debug, Clone)]
pub struct StaticConfigProvider {
    config: EndpointConfig,
}

impl StaticConfigProvider {
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            config: EndpointConfig::new(endpoint, token),
        }
    }
}

#[async_trait]
impl ConnectionConfigProvider for StaticConfigProvider {
    async fn get_config(&self) -> Result<EndpointConfig, ProviderError> {
        Ok(self.config.clone())
    }
}

/// Layout of the connection file the backend writes on startup
#[derive(Debug, Deserialize)]
struct ConnectionFile {
    #[serde(default = "default_host")]
    host: String,
    port: i64,
    token: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

/// `host:port`, bracketing IPv6 literals
fn join_host_port(host: &str, port: i64) -> String {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(ip)) => format!("[{}]:{}", ip, port),
        _ => format!("{}:{}", host, port),
    }
}

/// Reads the backend's connection file on every call, so a restarted
/// backend with a new port and token is picked up on reconnect.
#[derive(Debug, Clone)]
pub struct FileConfigProvider {
    path: PathBuf,
}

impl FileConfigProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ConnectionConfigProvider for FileConfigProvider {
    async fn get_config(&self) -> Result<EndpointConfig, ProviderError> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| {
                if source.kind() == std::io::ErrorKind::NotFound {
                    ProviderError::Unavailable(format!(
                        "{} does not exist, is the backend running?",
                        self.path.display()
                    ))
                } else {
                    ProviderError::Io {
                        path: self.path.clone(),
                        source,
                    }
                }
            })?;

        let file: ConnectionFile = toml::from_str(&content).map_err(|source| ProviderError::Parse {
            path: self.path.clone(),
            source,
        })?;

        debug!(path = %self.path.display(), port = file.port, "Loaded connection file");
        Ok(EndpointConfig::new(join_host_port(&file.host, file.port), file.token))
    }
}
