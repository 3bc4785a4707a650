//! Include cache sessions.
//!
//! A session carries the policy of one unit of work (typically one response)
//! plus two request-scoped maps: fragments in flight, and resolved source
//! handles. Handles must go back to the resolver through
//! [`IncludeCacheManager::terminate_session`].
//!
//! [`IncludeCacheManager::terminate_session`]: crate::IncludeCacheManager::terminate_session

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use incache_core::{FetchError, IncludeResult, Source, SourceResolver};
use incache_storage::StorageProxy;
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

type LoadSlot = Option<IncludeResult<Arc<[u8]>>>;

/// Receiving side of a background fragment load.
///
/// Cloning yields another waiter on the same load.
#[derive(Clone)]
pub struct PendingLoad {
    uri: String,
    rx: watch::Receiver<LoadSlot>,
}

/// Sending side of a background fragment load.
pub struct LoadCompleter {
    tx: watch::Sender<LoadSlot>,
}

impl PendingLoad {
    /// Create a linked completer and pending handle for `uri`.
    pub fn channel(uri: impl Into<String>) -> (LoadCompleter, PendingLoad) {
        let (tx, rx) = watch::channel(None);
        (LoadCompleter { tx }, PendingLoad { uri: uri.into(), rx })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Whether the load has finished, successfully or not.
    pub fn is_finished(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Wait for the load to finish and return its captured result.
    ///
    /// A completer dropped without a result yields [`FetchError::LoadAborted`].
    pub async fn wait(mut self) -> IncludeResult<Arc<[u8]>> {
        let outcome = match self.rx.wait_for(Option::is_some).await {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| {
            Err(FetchError::LoadAborted {
                uri: self.uri.clone(),
            }
            .into())
        })
    }
}

impl fmt::Debug for PendingLoad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingLoad")
            .field("uri", &self.uri)
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl LoadCompleter {
    /// Publish the load's result to every waiter.
    pub fn complete(self, result: IncludeResult<Arc<[u8]>>) {
        self.tx.send_replace(Some(result));
    }
}

/// Value of the in-flight map.
#[derive(Debug, Clone)]
pub enum InFlight {
    /// Compiled fragment bytes ready to replay.
    Cached(Arc<[u8]>),
    /// A background load not yet observed by `stream`.
    Loading(PendingLoad),
}

/// Per-request include cache state.
pub struct IncludeCacheSession {
    id: Uuid,
    expires: Duration,
    purge: bool,
    preemptive: bool,
    parallel: bool,
    storage: Arc<dyn StorageProxy>,
    in_flight: Mutex<HashMap<String, InFlight>>,
    sources: Mutex<HashMap<String, Arc<dyn Source>>>,
}

impl IncludeCacheSession {
    pub fn new(
        storage: Arc<dyn StorageProxy>,
        expires: Duration,
        purge: bool,
        preemptive: bool,
        parallel: bool,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            expires,
            purge,
            preemptive,
            parallel,
            storage,
            in_flight: Mutex::new(HashMap::new()),
            sources: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Entry lifetime. Zero disables caching.
    pub fn expires(&self) -> Duration {
        self.expires
    }

    pub fn is_cacheable(&self) -> bool {
        !self.expires.is_zero()
    }

    pub fn is_purging(&self) -> bool {
        self.purge
    }

    pub fn is_preemptive(&self) -> bool {
        self.preemptive
    }

    pub fn is_parallel(&self) -> bool {
        self.parallel
    }

    /// Whether `load` starts background fetches. Preemptive mode wins over
    /// parallel mode.
    pub fn is_parallel_fetch(&self) -> bool {
        self.parallel && !self.preemptive
    }

    pub fn storage(&self) -> &Arc<dyn StorageProxy> {
        &self.storage
    }

    /// Register `value` under `uri`, replacing any previous value.
    pub async fn add(&self, uri: impl Into<String>, value: InFlight) {
        self.in_flight.lock().await.insert(uri.into(), value);
    }

    pub async fn get(&self, uri: &str) -> Option<InFlight> {
        self.in_flight.lock().await.get(uri).cloned()
    }

    /// Resolve `uri`, reusing the handle from an earlier call with the same
    /// string.
    pub async fn resolve_uri(
        &self,
        uri: &str,
        resolver: &dyn SourceResolver,
    ) -> IncludeResult<Arc<dyn Source>> {
        let mut sources = self.sources.lock().await;
        if let Some(source) = sources.get(uri) {
            return Ok(Arc::clone(source));
        }
        let source = resolver.resolve(uri).await?;
        sources.insert(uri.to_string(), Arc::clone(&source));
        Ok(source)
    }

    /// Number of memoized source handles.
    pub async fn resolved_count(&self) -> usize {
        self.sources.lock().await.len()
    }

    /// Release every memoized handle and forget in-flight entries.
    pub async fn cleanup(&self, resolver: &dyn SourceResolver) {
        let sources: Vec<Arc<dyn Source>> = {
            let mut map = self.sources.lock().await;
            map.drain().map(|(_, source)| source).collect()
        };
        let released = sources.len();
        for source in sources {
            resolver.release(source).await;
        }
        self.in_flight.lock().await.clear();
        tracing::trace!(session = %self.id, released, "Session cleaned up");
    }
}

impl fmt::Debug for IncludeCacheSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncludeCacheSession")
            .field("id", &self.id)
            .field("expires", &self.expires)
            .field("purge", &self.purge)
            .field("preemptive", &self.preemptive)
            .field("parallel", &self.parallel)
            .field("storage", &self.storage.location())
            .finish()
    }
}
