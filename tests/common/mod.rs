//! Shared helpers for the integration tests

#![allow(dead_code)]

pub mod backend;
pub mod mock_streams;

use backend::{MemoryConnector, ENDPOINT, TOKEN};
use loopwire::network::provider::StaticConfigProvider;
use loopwire::{ConnectionManager, ConnectionState, EngineSettings, ReconnectPolicy};
use std::sync::Arc;
use std::time::Duration;

/// Short timeouts so failure paths finish quickly
pub fn fast_settings() -> EngineSettings {
    EngineSettings::with_timeouts(
        Duration::from_secs(1),
        Duration::from_millis(500),
        Duration::from_secs(2),
    )
}

pub fn engine(connector: &Arc<MemoryConnector>, settings: EngineSettings) -> ConnectionManager {
    ConnectionManager::with_connector(
        Arc::new(StaticConfigProvider::new(ENDPOINT, TOKEN)),
        connector.clone(),
        settings,
    )
}

pub fn manual_engine(connector: &Arc<MemoryConnector>) -> ConnectionManager {
    engine(connector, fast_settings().reconnect_policy(ReconnectPolicy::Manual))
}

/// Poll until `check` holds, panicking after two seconds
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn wait_for_state(engine: &ConnectionManager, state: ConnectionState) {
    eventually(&format!("state {}", state), || engine.state() == state).await;
}
