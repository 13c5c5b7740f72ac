//! Cached copy of the backend configuration.
//!
//! Reads inside the freshness window never touch the connection. Older
//! values are served immediately while a background refresh runs, and all
//! concurrent refreshes share one in-flight load.

pub mod state;

pub use state::{CacheEvent, CacheState, CachedConfig};

use crate::messages::types::ConfigSnapshot;
use crate::network::error::EngineError;
use crate::network::manager::{ConnectionManager, ConnectionState, StateChange};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CACHE_EVENT_CAPACITY: usize = 32;

type LoadResult = Result<Arc<ConfigSnapshot>, EngineError>;
type SharedLoad = Shared<BoxFuture<'static, LoadResult>>;

/// Where the cache loads configuration from
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn load_config(&self, cancel: &CancellationToken) -> Result<ConfigSnapshot, EngineError>;
}

#[async_trait]
impl ConfigSource for ConnectionManager {
    async fn load_config(&self, cancel: &CancellationToken) -> Result<ConfigSnapshot, EngineError> {
        self.fetch_config(cancel).await
    }
}

struct CacheInner {
    source: Arc<dyn ConfigSource>,
    retry: RetryPolicy,
    cached: RwLock<CachedConfig>,
    in_flight: Mutex<Option<(u64, SharedLoad)>>,
    load_seq: AtomicU64,
    events: broadcast::Sender<CacheEvent>,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct ConfigCache {
    inner: Arc<CacheInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ConfigCache {
    pub fn new(source: Arc<dyn ConfigSource>, retry: RetryPolicy) -> Self {
        let (events, _) = broadcast::channel(CACHE_EVENT_CAPACITY);
        Self {
            inner: Arc::new(CacheInner {
                source,
                retry,
                cached: RwLock::new(CachedConfig::default()),
                in_flight: Mutex::new(None),
                load_seq: AtomicU64::new(0),
                events,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Cached configuration, loading or refreshing as its age requires.
    ///
    /// Returns `None` when nothing has ever loaded successfully, or when
    /// `cancel` fires before the first load finishes.
    pub async fn get(&self, max_age: Duration, cancel: &CancellationToken) -> Option<Arc<ConfigSnapshot>> {
        let (fresh, any) = {
            let cached = self.inner.read();
            (cached.fresh_value(max_age), cached.value.clone())
        };

        if let Some(value) = fresh {
            return Some(value);
        }
        if let Some(value) = any {
            debug!("Serving stale configuration while refreshing");
            drop(self.begin_load());
            return Some(value);
        }

        match self.refresh(cancel).await {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(error = %e, "No configuration available");
                None
            }
        }
    }

    /// Load now, or join the load already running.
    ///
    /// Cancelling only stops this caller from waiting. The shared load runs
    /// until it finishes or the cache shuts down.
    pub async fn refresh(&self, cancel: &CancellationToken) -> Result<Arc<ConfigSnapshot>, EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let load = self.begin_load();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Stopped waiting for configuration load");
                Err(EngineError::Cancelled)
            }
            result = load => result,
        }
    }

    fn begin_load(&self) -> SharedLoad {
        let mut in_flight = lock(&self.inner.in_flight);
        if let Some((seq, load)) = in_flight.as_ref() {
            debug!(load = seq, "Joining configuration load in flight");
            return load.clone();
        }

        let seq = self.inner.load_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.set_state(CacheState::Loading, None);

        // Spawned so the load finishes even if every waiter goes away
        let task = tokio::spawn(CacheInner::load(Arc::clone(&self.inner), seq));
        let load = async move {
            task.await.unwrap_or_else(|e| {
                Err(EngineError::invalid_state(format!(
                    "configuration load task failed: {}",
                    e
                )))
            })
        }
        .boxed()
        .shared();

        *in_flight = Some((seq, load.clone()));
        load
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> CacheState {
        self.inner.read().state
    }

    /// Copy of everything the cache currently holds
    pub fn snapshot(&self) -> CachedConfig {
        self.inner.read().clone()
    }

    /// Refresh after every reconnect that follows a lost connection.
    ///
    /// Nothing happens before the first load; the first `get` loads anyway.
    pub fn watch_reconnects(&self, mut events: broadcast::Receiver<StateChange>) -> JoinHandle<()> {
        let cache = self.clone();
        let shutdown = self.inner.shutdown.clone();

        tokio::spawn(async move {
            let mut was_down = false;
            loop {
                let change = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    change = events.recv() => change,
                };

                let change = match change {
                    Ok(change) => change,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Missed connection state changes");
                        was_down = true;
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                match change.new {
                    ConnectionState::Failed | ConnectionState::Disconnected => was_down = true,
                    ConnectionState::Connected if was_down => {
                        was_down = false;
                        if cache.state() != CacheState::NotLoaded {
                            info!("Connection restored, refreshing configuration");
                            drop(cache.begin_load());
                        }
                    }
                    _ => {}
                }
            }
            debug!("Stopped watching connection state");
        })
    }

    /// Cancel background loads and the reconnect watcher
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

impl CacheInner {
    fn read(&self) -> std::sync::RwLockReadGuard<'_, CachedConfig> {
        self.cached.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, CachedConfig> {
        self.cached.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: CacheState, error: Option<String>) {
        let mut cached = self.write();
        cached.state = state;
        cached.error_message = error.clone();
        // Sent under the write lock so events arrive in transition order
        let _ = self.events.send(CacheEvent { state, error });
    }

    async fn load(inner: Arc<CacheInner>, seq: u64) -> LoadResult {
        let started = Instant::now();
        let source = Arc::clone(&inner.source);
        let shutdown = inner.shutdown.clone();

        let result = inner
            .retry
            .execute_with(
                || {
                    let source = Arc::clone(&source);
                    let cancel = shutdown.clone();
                    async move { source.load_config(&cancel).await }
                },
                EngineError::is_retryable_timeout,
                &shutdown,
            )
            .await
            .map(Arc::new);

        match &result {
            Ok(snapshot) => {
                let mut cached = inner.write();
                cached.value = Some(Arc::clone(snapshot));
                cached.loaded_at = Some(Instant::now());
                cached.state = CacheState::Loaded;
                cached.error_message = None;
                let _ = inner.events.send(CacheEvent {
                    state: CacheState::Loaded,
                    error: None,
                });
                info!(
                    revision = snapshot.revision,
                    entries = snapshot.entries.len(),
                    elapsed = ?started.elapsed(),
                    "Configuration loaded"
                );
            }
            Err(e) => {
                let has_value = inner.read().value.is_some();
                let state = if has_value {
                    CacheState::Stale
                } else {
                    CacheState::Error
                };
                warn!(error = %e, state = %state, "Configuration load failed");
                inner.set_state(state, Some(e.to_string()));
            }
        }

        let mut in_flight = lock(&inner.in_flight);
        if matches!(in_flight.as_ref(), Some((current, _)) if *current == seq) {
            *in_flight = None;
        }

        result
    }
}
