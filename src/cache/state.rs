use crate::messages::types::ConfigSnapshot;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheState {
    NotLoaded,
    Loading,
    Loaded,
    /// A refresh failed; the previous value is still served
    Stale,
    /// Loading failed and there is no value to fall back on
    Error,
}

impl fmt::Display for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CacheState::NotLoaded => "not loaded",
            CacheState::Loading => "loading",
            CacheState::Loaded => "loaded",
            CacheState::Stale => "stale",
            CacheState::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct CachedConfig {
    pub value: Option<Arc<ConfigSnapshot>>,
    /// When `value` was last loaded successfully
    pub loaded_at: Option<Instant>,
    pub state: CacheState,
    pub error_message: Option<String>,
}

impl Default for CachedConfig {
    fn default() -> Self {
        Self {
            value: None,
            loaded_at: None,
            state: CacheState::NotLoaded,
            error_message: None,
        }
    }
}

impl CachedConfig {
    pub fn age(&self) -> Option<Duration> {
        self.loaded_at.map(|loaded_at| loaded_at.elapsed())
    }

    /// Value loaded no longer than `max_age` ago
    pub fn fresh_value(&self, max_age: Duration) -> Option<Arc<ConfigSnapshot>> {
        match self.age() {
            Some(age) if age <= max_age => self.value.clone(),
            _ => None,
        }
    }
}

/// Published on every cache state transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEvent {
    pub state: CacheState,
    pub error: Option<String>,
}
