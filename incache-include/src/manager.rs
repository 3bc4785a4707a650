//! Include cache manager.
//!
//! The manager decides, per include, whether a fragment is replayed from a
//! storage proxy or fetched, and whether fetching happens inline, in a
//! spawned task started by [`IncludeCacheManager::load`], or later in the
//! preemptive worker.
//!
//! # Modes
//!
//! | session flags | `load` | `stream` |
//! |---|---|---|
//! | default | resolve only | replay a valid hit, else fetch through a tee |
//! | `purge` | resolve only | drop the stored entry, fetch |
//! | `preemptive` | resolve only | replay any hit, queue a refresh if it is stale |
//! | `parallel` | stash a valid hit or spawn a fetch | replay the stash or wait for the fetch |
//!
//! `preemptive` takes precedence over `parallel`.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use incache_core::{
    replay, ByteStreamCompiler, CachedEntry, EventConsumer, FragmentLoader, IncludeCacheConfig,
    IncludeError, IncludeResult, ProtocolError, Source, SourceResolver, TeeConsumer, Validity,
};
use incache_storage::{LocalStorageProxy, ResourceStorageProxy, StorageProxy};
use tracing::Instrument;

use crate::options::SessionOptions;
use crate::preemptive::PreemptiveLoader;
use crate::session::{InFlight, IncludeCacheSession, PendingLoad};
use crate::stats::{IncludeCacheStats, IncludeCacheStatsSnapshot};

/// Entry point for cache-aware inclusion.
pub struct IncludeCacheManager {
    config: IncludeCacheConfig,
    resolver: Arc<dyn SourceResolver>,
    loader: Arc<dyn FragmentLoader>,
    local: Arc<LocalStorageProxy>,
    resource_proxies: DashMap<String, Arc<ResourceStorageProxy>>,
    preemptive: Option<Arc<PreemptiveLoader>>,
    stats: IncludeCacheStats,
}

impl IncludeCacheManager {
    /// Create a manager. A preemptive worker is created, but not started,
    /// when `config.preemptive_enabled` is set.
    pub fn new(
        config: IncludeCacheConfig,
        resolver: Arc<dyn SourceResolver>,
        loader: Arc<dyn FragmentLoader>,
    ) -> Self {
        let preemptive = config
            .preemptive_enabled
            .then(|| Arc::new(PreemptiveLoader::new(Arc::clone(&resolver), Arc::clone(&loader))));
        Self {
            config,
            resolver,
            loader,
            local: Arc::new(LocalStorageProxy::new()),
            resource_proxies: DashMap::new(),
            preemptive,
            stats: IncludeCacheStats::new(),
        }
    }

    pub fn config(&self) -> &IncludeCacheConfig {
        &self.config
    }

    /// The process-local store shared by sessions without a `source`.
    pub fn local_storage(&self) -> &Arc<LocalStorageProxy> {
        &self.local
    }

    pub fn preemptive_loader(&self) -> Option<&Arc<PreemptiveLoader>> {
        self.preemptive.as_ref()
    }

    pub fn stats(&self) -> IncludeCacheStatsSnapshot {
        self.stats.snapshot()
    }

    /// Open a session for one unit of work.
    ///
    /// Never fails: an unresolvable `source` falls back to local storage, and
    /// preemptive mode without a configured worker is switched off.
    pub async fn get_session(&self, options: &SessionOptions) -> IncludeCacheSession {
        let storage = match options.source.as_deref() {
            Some(source) => match self.resource_proxy(source).await {
                Ok(proxy) => proxy,
                Err(e) => {
                    IncludeCacheStats::incr(&self.stats.fallbacks);
                    tracing::warn!(
                        source = %source,
                        error = %e,
                        "Cache source unresolvable, falling back to local storage"
                    );
                    self.local_proxy()
                }
            },
            None => self.local_proxy(),
        };

        let mut preemptive = options.preemptive;
        if preemptive {
            match &self.preemptive {
                None => {
                    tracing::error!(
                        "Preemptive mode requested but no preemptive loader is configured"
                    );
                    preemptive = false;
                }
                Some(loader) => {
                    if loader.start() {
                        tracing::info!("Started preemptive loader");
                    }
                }
            }
        }

        let session = IncludeCacheSession::new(
            storage,
            options.expires.unwrap_or(self.config.default_expires),
            options.purge,
            preemptive,
            options.parallel,
        );
        tracing::debug!(
            session = %session.id(),
            storage = %session.storage().location(),
            expires_secs = session.expires().as_secs(),
            purge = session.is_purging(),
            preemptive = session.is_preemptive(),
            parallel = session.is_parallel(),
            "Opened include cache session"
        );
        session
    }

    /// Prepare `uri` for streaming and return its absolute form.
    ///
    /// Resolution failures are wrapped in [`IncludeError::Cascading`], as in
    /// [`Self::stream`]. In parallel mode this either stashes a valid cached
    /// fragment or starts a background fetch whose failure is reported by
    /// [`Self::stream`].
    pub async fn load(&self, uri: &str, session: &IncludeCacheSession) -> IncludeResult<String> {
        let source = session
            .resolve_uri(uri, self.resolver.as_ref())
            .await
            .map_err(|e| IncludeError::cascading(uri, e))?;
        let absolute = source.uri().to_string();
        if !session.is_parallel_fetch() {
            return Ok(absolute);
        }

        if !session.is_purging() {
            if let Some(entry) = session.storage().get(&absolute).await {
                if entry.validity() == Validity::Valid {
                    IncludeCacheStats::incr(&self.stats.hits);
                    tracing::trace!(
                        session = %session.id(),
                        uri = %absolute,
                        "Stashed cached fragment"
                    );
                    session
                        .add(absolute.clone(), InFlight::Cached(entry.shared_payload()))
                        .await;
                    return Ok(absolute);
                }
            }
        }
        IncludeCacheStats::incr(&self.stats.misses);
        session.storage().remove(&absolute).await;

        let pending = self.spawn_load(source, session);
        session.add(absolute.clone(), InFlight::Loading(pending)).await;
        IncludeCacheStats::incr(&self.stats.parallel_loads);
        Ok(absolute)
    }

    /// Deliver the fragment for `uri` to `consumer`.
    pub async fn stream(
        &self,
        uri: &str,
        session: &IncludeCacheSession,
        consumer: &mut dyn EventConsumer,
    ) -> IncludeResult<()> {
        if session.is_parallel_fetch() {
            return self.stream_loaded(uri, session, consumer).await;
        }

        let source = session
            .resolve_uri(uri, self.resolver.as_ref())
            .await
            .map_err(|e| IncludeError::cascading(uri, e))?;
        self.stream_direct(source, session, consumer).await
    }

    /// Release everything the session resolved.
    pub async fn terminate_session(&self, session: IncludeCacheSession) {
        session.cleanup(self.resolver.as_ref()).await;
        tracing::debug!(session = %session.id(), "Terminated include cache session");
    }

    /// Stop the preemptive worker and drop locally cached entries.
    pub async fn shutdown(&self) {
        if let Some(loader) = &self.preemptive {
            loader.shutdown().await;
        }
        self.local.clear();
        self.resource_proxies.clear();
        tracing::info!("Include cache manager shut down");
    }

    fn local_proxy(&self) -> Arc<dyn StorageProxy> {
        self.local.clone()
    }

    /// Resolve `source` to a resource-backed proxy, reusing one per location.
    async fn resource_proxy(&self, source: &str) -> IncludeResult<Arc<dyn StorageProxy>> {
        let probe = self.resolver.resolve(source).await?;
        let parent = probe.uri().to_string();
        self.resolver.release(probe).await;

        let proxy: Arc<dyn StorageProxy> = self
            .resource_proxies
            .entry(parent.clone())
            .or_insert_with(|| {
                Arc::new(ResourceStorageProxy::new(Arc::clone(&self.resolver), parent))
            })
            .clone();
        Ok(proxy)
    }

    fn spawn_load(&self, source: Arc<dyn Source>, session: &IncludeCacheSession) -> PendingLoad {
        let (completer, pending) = PendingLoad::channel(source.uri());
        let loader = Arc::clone(&self.loader);
        let span =
            tracing::debug_span!("include_load", session = %session.id(), uri = %source.uri());

        tokio::spawn(
            async move {
                let mut compiler = ByteStreamCompiler::new();
                let fetched = loader.emit(source.as_ref(), &mut compiler).await;
                let result = fetched.map(|()| Arc::<[u8]>::from(compiler.into_bytes()));
                if let Err(e) = &result {
                    tracing::debug!(error = %e, "Background load failed");
                }
                completer.complete(result);
            }
            .instrument(span),
        );
        pending
    }

    async fn stream_loaded(
        &self,
        uri: &str,
        session: &IncludeCacheSession,
        consumer: &mut dyn EventConsumer,
    ) -> IncludeResult<()> {
        let (absolute, in_flight) = match self.find_in_flight(uri, session).await {
            Some(found) => found,
            None => {
                return Err(ProtocolError::StreamWithoutLoad {
                    uri: uri.to_string(),
                }
                .into())
            }
        };

        let bytes = match in_flight {
            InFlight::Cached(bytes) => bytes,
            InFlight::Loading(pending) => {
                let bytes = pending.wait().await?;
                session
                    .add(absolute.clone(), InFlight::Cached(Arc::clone(&bytes)))
                    .await;
                replay(&bytes, consumer)?;
                if session.is_cacheable() {
                    let entry = CachedEntry::expiring(session.expires(), Arc::clone(&bytes));
                    session.storage().put(&absolute, entry).await?;
                }
                return Ok(());
            }
        };
        replay(&bytes, consumer)
    }

    /// Look up `uri` as given, then by its absolute form. Resolution goes
    /// through the session memo, so no new handle is created for URIs that
    /// were loaded.
    async fn find_in_flight(
        &self,
        uri: &str,
        session: &IncludeCacheSession,
    ) -> Option<(String, InFlight)> {
        if let Some(found) = session.get(uri).await {
            return Some((uri.to_string(), found));
        }
        let source = session.resolve_uri(uri, self.resolver.as_ref()).await.ok()?;
        let absolute = source.uri().to_string();
        let found = session.get(&absolute).await?;
        Some((absolute, found))
    }

    async fn stream_direct(
        &self,
        source: Arc<dyn Source>,
        session: &IncludeCacheSession,
        consumer: &mut dyn EventConsumer,
    ) -> IncludeResult<()> {
        let uri = source.uri();
        let storage = session.storage();

        if let Some(entry) = storage.get(uri).await {
            let validity = entry.validity();
            let usable = session.is_preemptive() || validity == Validity::Valid;
            if !session.is_purging() && usable {
                IncludeCacheStats::incr(&self.stats.hits);
                tracing::trace!(
                    session = %session.id(),
                    uri = %uri,
                    validity = ?validity,
                    "Serving cached fragment"
                );
                replay(entry.payload(), consumer)?;
                let stale = validity != Validity::Valid;
                if session.is_preemptive() && session.is_cacheable() && stale {
                    self.enqueue_refresh(session, uri);
                }
                return Ok(());
            }
            tracing::trace!(
                session = %session.id(),
                uri = %uri,
                purge = session.is_purging(),
                "Removing unusable entry"
            );
            storage.remove(uri).await;
        }
        IncludeCacheStats::incr(&self.stats.misses);
        IncludeCacheStats::incr(&self.stats.fetches);

        let mut compiler = ByteStreamCompiler::new();
        {
            let mut tee = TeeConsumer::new(consumer, &mut compiler);
            self.loader
                .emit(source.as_ref(), &mut tee)
                .await
                .map_err(|e| IncludeError::cascading(uri, e))?;
        }

        if session.is_cacheable() {
            let entry = CachedEntry::expiring(session.expires(), compiler.into_bytes());
            storage.put(uri, entry).await?;
            tracing::trace!(session = %session.id(), uri = %uri, "Stored fetched fragment");
        }
        Ok(())
    }

    fn enqueue_refresh(&self, session: &IncludeCacheSession, uri: &str) {
        let Some(loader) = &self.preemptive else {
            return;
        };
        if !loader.is_running() {
            tracing::warn!(uri = %uri, "Preemptive loader is not running, refresh will wait");
        }
        if loader.add(Arc::clone(session.storage()), uri, session.expires()) {
            IncludeCacheStats::incr(&self.stats.refreshes_enqueued);
            tracing::debug!(session = %session.id(), uri = %uri, "Queued stale entry for refresh");
        }
    }
}

impl Drop for IncludeCacheManager {
    fn drop(&mut self) {
        // The worker holds its own Arc and would otherwise outlive the manager
        if let Some(loader) = &self.preemptive {
            loader.stop();
        }
    }
}

impl fmt::Debug for IncludeCacheManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncludeCacheManager")
            .field("config", &self.config)
            .field("local_entries", &self.local.len())
            .field("resource_proxies", &self.resource_proxies.len())
            .field("preemptive", &self.preemptive)
            .finish()
    }
}
