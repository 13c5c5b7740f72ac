use crate::messages::wire::WireConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// What the engine does when an operation finds it without a live connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectPolicy {
    /// The next operation performs a fresh connect. Nothing reconnects in
    /// the background.
    #[default]
    OnDemand,
    /// Operations fail until the caller calls `connect()` again.
    Manual,
}

/// Runtime settings for one engine instance
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub connect_timeout: Duration,
    pub auth_timeout: Duration,
    pub request_timeout: Duration,
    pub close_timeout: Duration,
    pub wire: WireConfig,
    pub reconnect: ReconnectPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            wire: WireConfig::default(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl EngineSettings {
    /// Short timeouts everywhere, for tests and local tooling
    pub fn with_timeouts(connect: Duration, auth: Duration, request: Duration) -> Self {
        Self {
            connect_timeout: connect,
            auth_timeout: auth,
            request_timeout: request,
            ..Self::default()
        }
    }

    pub fn reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }
}
