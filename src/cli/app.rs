use crate::cache::ConfigCache;
use crate::messages::types::{ConfigValue, OpaqueMessage, Payload};
use crate::messages::wire::{WireConfig, FRAME_HEADER_SIZE};
use crate::network::manager::ConnectionManager;
use crate::network::provider::{ConnectionConfigProvider, FileConfigProvider, StaticConfigProvider};
use crate::network::settings::{EngineSettings, ReconnectPolicy};
use crate::retry::RetryPolicy;
use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Overrides the connection file with a fixed endpoint when set with `TOKEN_ENV`
pub const ENDPOINT_ENV: &str = "LOOPWIRE_ENDPOINT";
pub const TOKEN_ENV: &str = "LOOPWIRE_TOKEN";

/// Backoff settings as stored on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_retries: policy.max_retries,
            initial_delay_ms: policy.initial_delay.as_millis() as u64,
            multiplier: policy.multiplier,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            jitter: policy.jitter,
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Connection file the backend writes on startup
    pub connection_file: PathBuf,
    pub connect_timeout_ms: u64,
    pub auth_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub close_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub max_frame_size: usize,
    pub reconnect: ReconnectPolicy,
    /// How long a fetched configuration is served without reloading
    pub config_max_age_secs: u64,
    pub retry: RetrySettings,
}

impl Default for Config {
    fn default() -> Self {
        let engine = EngineSettings::default();
        let connection_file = Self::default_data_dir()
            .map(|dir| dir.join("backend.toml"))
            .unwrap_or_else(|_| PathBuf::from("backend.toml"));

        Self {
            connection_file,
            connect_timeout_ms: engine.connect_timeout.as_millis() as u64,
            auth_timeout_ms: engine.auth_timeout.as_millis() as u64,
            request_timeout_ms: engine.request_timeout.as_millis() as u64,
            close_timeout_ms: engine.close_timeout.as_millis() as u64,
            write_timeout_ms: engine.wire.write_timeout.as_millis() as u64,
            max_frame_size: engine.wire.max_frame_size,
            reconnect: engine.reconnect,
            config_max_age_secs: 30,
            retry: RetrySettings::default(),
        }
    }
}

impl Config {
    fn project_dirs() -> Result<ProjectDirs> {
        ProjectDirs::from("dev", "loopwire", "loopwire")
            .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))
    }

    pub fn default_data_dir() -> Result<PathBuf> {
        Ok(Self::project_dirs()?.data_dir().to_path_buf())
    }

    pub fn default_config_dir() -> Result<PathBuf> {
        Ok(Self::project_dirs()?.config_dir().to_path_buf())
    }

    pub fn default_config_file() -> Result<PathBuf> {
        Ok(Self::default_config_dir()?.join("config.toml"))
    }

    /// Load configuration from file, creating default if it doesn't exist
    pub fn load_or_create_default() -> Result<Self> {
        Self::load_or_create(&Self::default_config_file()?)
    }

    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load_from(path)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            info!(path = %path.display(), "Created default settings file");
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse configuration file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;
        std::fs::write(path, content).context("Failed to write configuration file")?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_frame_size < FRAME_HEADER_SIZE {
            bail!(
                "max_frame_size must be at least {} bytes, got {}",
                FRAME_HEADER_SIZE,
                self.max_frame_size
            );
        }
        if self.max_frame_size > u32::MAX as usize {
            bail!("max_frame_size cannot exceed {} bytes", u32::MAX);
        }

        for (name, value) in [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("auth_timeout_ms", self.auth_timeout_ms),
            ("request_timeout_ms", self.request_timeout_ms),
            ("close_timeout_ms", self.close_timeout_ms),
            ("write_timeout_ms", self.write_timeout_ms),
        ] {
            if value == 0 {
                bail!("{} must be greater than zero", name);
            }
        }

        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            bail!("retry.multiplier must be at least 1.0, got {}", self.retry.multiplier);
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            bail!("retry.initial_delay_ms cannot exceed retry.max_delay_ms");
        }
        Ok(())
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            auth_timeout: Duration::from_millis(self.auth_timeout_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            close_timeout: Duration::from_millis(self.close_timeout_ms),
            wire: WireConfig::new(
                self.max_frame_size,
                Duration::from_millis(self.write_timeout_ms),
            ),
            reconnect: self.reconnect,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
            multiplier: self.retry.multiplier,
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            jitter: self.retry.jitter,
        }
    }

    pub fn config_max_age(&self) -> Duration {
        Duration::from_secs(self.config_max_age_secs)
    }

    /// Fixed endpoint when both overrides are given, the connection file otherwise
    pub fn provider(
        &self,
        endpoint: Option<String>,
        token: Option<String>,
    ) -> Arc<dyn ConnectionConfigProvider> {
        match (endpoint, token) {
            (Some(endpoint), Some(token)) => {
                debug!(endpoint = %endpoint, "Using endpoint from environment");
                Arc::new(StaticConfigProvider::new(endpoint, token))
            }
            _ => {
                debug!(path = %self.connection_file.display(), "Using backend connection file");
                Arc::new(FileConfigProvider::new(self.connection_file.clone()))
            }
        }
    }
}

/// Engine and cache wired from one settings file
pub struct App {
    pub config: Config,
    pub engine: ConnectionManager,
    pub cache: ConfigCache,
}

impl App {
    /// Create a new App instance from the default settings file and environment
    pub fn new() -> Result<Self> {
        let config =
            Config::load_or_create_default().context("Failed to initialize configuration")?;
        let provider = config.provider(
            std::env::var(ENDPOINT_ENV).ok(),
            std::env::var(TOKEN_ENV).ok(),
        );
        Self::with_provider(config, provider)
    }

    pub fn with_provider(config: Config, provider: Arc<dyn ConnectionConfigProvider>) -> Result<Self> {
        config.validate()?;
        let engine = ConnectionManager::new(provider, config.engine_settings());
        let cache = ConfigCache::new(Arc::new(engine.clone()), config.retry_policy());
        Ok(Self {
            config,
            engine,
            cache,
        })
    }

    /// Handle the 'health' command
    pub async fn handle_health(&self, cancel: &CancellationToken) -> Result<()> {
        let status = self
            .engine
            .health_check(cancel)
            .await
            .context("Health check failed")?;

        println!("Healthy:        {}", if status.healthy { "yes" } else { "no" });
        println!("Server version: {}", status.server_version);
        println!("Uptime:         {:?}", Duration::from_millis(status.uptime_ms));
        println!("Engine:         {}", self.engine.stats());
        Ok(())
    }

    /// Handle the 'config' command
    pub async fn handle_config(
        &self,
        max_age_secs: Option<u64>,
        json: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let max_age = max_age_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.config.config_max_age());

        let Some(snapshot) = self.cache.get(max_age, cancel).await else {
            if cancel.is_cancelled() {
                bail!("Configuration request cancelled");
            }
            let cached = self.cache.snapshot();
            bail!(
                "Configuration unavailable ({}): {}",
                cached.state,
                cached.error_message.unwrap_or_else(|| "no details".to_string())
            );
        };

        if json {
            let rendered = serde_json::to_string_pretty(&snapshot.to_json())
                .context("Failed to render configuration as JSON")?;
            println!("{}", rendered);
            return Ok(());
        }

        println!("Revision: {}", snapshot.revision);
        if snapshot.entries.is_empty() {
            println!("(no entries)");
        }
        for (key, value) in &snapshot.entries {
            println!("{:<24} {}", key, render_value(value));
        }
        Ok(())
    }

    /// Handle the 'request' command
    pub async fn handle_request(
        &self,
        kind: String,
        body: Option<String>,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let payload = Payload::Request(OpaqueMessage::new(
            kind.clone(),
            body.unwrap_or_default().into_bytes(),
        ));

        let reply = self
            .engine
            .send_request(payload, timeout, cancel)
            .await
            .with_context(|| format!("Request '{}' failed", kind))?;

        match reply {
            Payload::Response(message) => {
                println!("{}: {}", message.kind, String::from_utf8_lossy(&message.body));
                Ok(())
            }
            other => bail!("Backend answered '{}' with {}", kind, other.kind_name()),
        }
    }

    /// Stop background work and close the connection
    pub async fn shutdown(&self) {
        self.cache.shutdown();
        self.engine.dispose().await;
    }
}

fn render_value(value: &ConfigValue) -> String {
    match value {
        ConfigValue::Text(text) => text.clone(),
        other => other.to_json().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_or_create_writes_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let created = Config::load_or_create(&path).unwrap();
        assert!(path.exists());

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(created, loaded);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "request_timeout_ms = 1500\nreconnect = \"manual\"\n\n[retry]\nmax_retries = 1\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.request_timeout_ms, 1500);
        assert_eq!(config.reconnect, ReconnectPolicy::Manual);
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.retry.multiplier, RetrySettings::default().multiplier);

        let settings = config.engine_settings();
        assert_eq!(settings.request_timeout, Duration::from_millis(1500));
        assert_eq!(settings.reconnect, ReconnectPolicy::Manual);
        assert_eq!(config.retry_policy().max_retries, 1);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = Config {
            max_frame_size: 4,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        config.max_frame_size = 1024;
        config.auth_timeout_ms = 0;
        assert!(config.validate().is_err());

        config.auth_timeout_ms = 100;
        config.retry.multiplier = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_garbage_file_reports_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "request_timeout_ms = [").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("config.toml"));
    }

    #[tokio::test]
    async fn test_provider_selection() {
        let dir = tempdir().unwrap();
        let config = Config {
            connection_file: dir.path().join("backend.toml"),
            ..Config::default()
        };

        let fixed = config.provider(Some("127.0.0.1:4100".to_string()), Some("tok".to_string()));
        assert_eq!(fixed.get_config().await.unwrap().endpoint, "127.0.0.1:4100");

        // a token alone is not enough to skip the connection file
        let from_file = config.provider(None, Some("tok".to_string()));
        assert!(from_file.get_config().await.is_err());
    }
}
