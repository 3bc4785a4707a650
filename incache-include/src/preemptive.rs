//! Preemptive refresh worker.
//!
//! Sessions in preemptive mode serve expired entries immediately and hand
//! the URI to this worker, which refetches it out of band and stores a fresh
//! entry. One worker runs per manager.
//!
//! # Deduplication
//!
//! A URI is pending for a storage location from `add` until the worker
//! dequeues it. Further `add` calls for the same pair in that window are
//! dropped. Suppression happens only at enqueue time; an item dequeued while
//! a second request re-adds the URI is refreshed twice.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashSet;
use incache_core::{
    ByteStreamCompiler, CachedEntry, FragmentLoader, IncludeResult, SourceResolver,
};
use incache_storage::StorageProxy;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// One queued refresh.
pub struct RefreshItem {
    pub storage: Arc<dyn StorageProxy>,
    pub uri: String,
    pub expires: Duration,
}

impl RefreshItem {
    fn pending_key(&self) -> (String, String) {
        (self.storage.location().to_string(), self.uri.clone())
    }
}

impl fmt::Debug for RefreshItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshItem")
            .field("location", &self.storage.location())
            .field("uri", &self.uri)
            .field("expires", &self.expires)
            .finish()
    }
}

/// Background worker refreshing entries served stale.
pub struct PreemptiveLoader {
    resolver: Arc<dyn SourceResolver>,
    loader: Arc<dyn FragmentLoader>,
    running: AtomicBool,
    /// Bumped by every start and stop; a loop exits once its value is stale
    generation: AtomicU64,
    wake: Notify,
    queue: Mutex<VecDeque<RefreshItem>>,
    /// (storage location, uri) pairs queued and not yet dequeued
    pending: DashSet<(String, String)>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    refreshed: AtomicU64,
    failed: AtomicU64,
    collapsed: AtomicU64,
}

impl PreemptiveLoader {
    pub fn new(resolver: Arc<dyn SourceResolver>, loader: Arc<dyn FragmentLoader>) -> Self {
        Self {
            resolver,
            loader,
            running: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            wake: Notify::new(),
            queue: Mutex::new(VecDeque::new()),
            pending: DashSet::new(),
            tasks: Mutex::new(Vec::new()),
            refreshed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            collapsed: AtomicU64::new(0),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Items waiting to be refreshed.
    pub fn queued(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    /// Entries successfully refreshed and stored.
    pub fn refreshed(&self) -> u64 {
        self.refreshed.load(Ordering::Relaxed)
    }

    /// Refreshes that failed and were discarded.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// `add` calls dropped as duplicates.
    pub fn collapsed(&self) -> u64 {
        self.collapsed.load(Ordering::Relaxed)
    }

    fn try_transition_to_running(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Claim the next generation. Only the loop holding the current one runs.
    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_current(&self, generation: u64) -> bool {
        self.is_running() && self.generation.load(Ordering::SeqCst) == generation
    }

    /// Spawn the event loop. Returns false if the worker was already running.
    pub fn start(self: &Arc<Self>) -> bool {
        if !self.try_transition_to_running() {
            return false;
        }
        let generation = self.next_generation();
        let worker = Arc::clone(self);
        let handle = tokio::spawn(
            worker
                .event_loop(generation)
                .instrument(tracing::info_span!("preemptive_loader", generation)),
        );
        if let Ok(mut tasks) = self.tasks.lock() {
            // A stopped loop that has not woken yet stays tracked for shutdown
            tasks.retain(|task| !task.is_finished());
            tasks.push(handle);
        }
        true
    }

    /// Run the event loop on the current task until stopped.
    ///
    /// Returns at once if the worker is already running elsewhere.
    pub async fn process(self: Arc<Self>) {
        if self.try_transition_to_running() {
            let generation = self.next_generation();
            self.event_loop(generation).await;
        }
    }

    /// Queue a refresh of `uri` into `storage`.
    ///
    /// Returns false, queueing nothing, when the URI is already pending for
    /// that storage location.
    pub fn add(
        &self,
        storage: Arc<dyn StorageProxy>,
        uri: impl Into<String>,
        expires: Duration,
    ) -> bool {
        let item = RefreshItem {
            storage,
            uri: uri.into(),
            expires,
        };
        let key = item.pending_key();
        if !self.pending.insert(key.clone()) {
            self.collapsed.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(uri = %item.uri, "Refresh already pending");
            return false;
        }

        match self.queue.lock() {
            Ok(mut queue) => queue.push_back(item),
            Err(_) => {
                self.pending.remove(&key);
                tracing::warn!(uri = %key.1, "Refresh queue poisoned, dropping item");
                return false;
            }
        }
        self.wake.notify_waiters();
        true
    }

    /// Ask the worker to exit after its current item.
    ///
    /// Retires the current generation, so a loop that has not yet observed
    /// the stop exits even if the worker is started again in the meantime.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            tracing::info!("Stopping preemptive loader");
        }
        self.next_generation();
        self.wake.notify_waiters();
    }

    /// Stop the worker and wait for every spawned event loop to exit.
    pub async fn shutdown(&self) {
        self.stop();
        let tasks = self
            .tasks
            .lock()
            .map(|mut tasks| std::mem::take(&mut *tasks))
            .unwrap_or_default();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Preemptive loader task ended abnormally");
            }
        }
    }

    fn next_item(&self) -> Option<RefreshItem> {
        let item = self.queue.lock().ok()?.pop_front()?;
        self.pending.remove(&item.pending_key());
        Some(item)
    }

    async fn event_loop(self: Arc<Self>, generation: u64) {
        tracing::info!("Preemptive loader started");
        loop {
            // Registered before draining so an add or stop during the drain is not lost
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            while self.is_current(generation) {
                let Some(item) = self.next_item() else {
                    break;
                };
                self.refresh(item).await;
            }
            if !self.is_current(generation) {
                break;
            }
            notified.await;
        }
        tracing::info!(
            refreshed = self.refreshed(),
            failed = self.failed(),
            "Preemptive loader stopped"
        );
    }

    async fn refresh(&self, item: RefreshItem) {
        match self.fetch_and_store(&item).await {
            Ok(()) => {
                self.refreshed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    uri = %item.uri,
                    location = %item.storage.location(),
                    "Refreshed entry"
                );
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(uri = %item.uri, error = %e, "Discarding failed refresh");
            }
        }
    }

    async fn fetch_and_store(&self, item: &RefreshItem) -> IncludeResult<()> {
        let source = self.resolver.resolve(&item.uri).await?;
        let mut compiler = ByteStreamCompiler::new();
        let fetched = self.loader.emit(source.as_ref(), &mut compiler).await;
        self.resolver.release(source).await;
        fetched?;

        let entry = CachedEntry::expiring(item.expires, compiler.into_bytes());
        item.storage.put(&item.uri, entry).await
    }
}

impl fmt::Debug for PreemptiveLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreemptiveLoader")
            .field("running", &self.is_running())
            .field("queued", &self.queued())
            .field("refreshed", &self.refreshed())
            .finish()
    }
}
