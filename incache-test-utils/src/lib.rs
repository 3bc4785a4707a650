//! incache Test Utilities
//!
//! Shared test infrastructure for the incache workspace:
//! - In-memory source resolver with handle accounting
//! - Counting fragment loader with injectable failures and latency
//! - Fixtures for common fragments
//! - Proptest generators for events and tokens

pub use incache_core::{
    compile, decode, CachedEntry, CompiledFragmentLoader, EventConsumer, FetchError,
    FragmentLoader, IncludeError, IncludeResult, Source, SourceError, SourceResolver,
    StorageError, Validity, ValidityToken, XmlEvent,
};

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use incache_core::source::resolve_against;

// ============================================================================
// IN-MEMORY SOURCES
// ============================================================================

type Store = Arc<RwLock<HashMap<String, Vec<u8>>>>;

/// Resource held in a [`MemorySourceResolver`] store.
pub struct MemorySource {
    uri: String,
    store: Store,
    writable: bool,
}

impl fmt::Debug for MemorySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySource")
            .field("uri", &self.uri)
            .field("writable", &self.writable)
            .finish()
    }
}

#[async_trait]
impl Source for MemorySource {
    fn uri(&self) -> &str {
        &self.uri
    }

    async fn exists(&self) -> bool {
        self.store
            .read()
            .map(|store| store.contains_key(&self.uri))
            .unwrap_or(false)
    }

    async fn read(&self) -> IncludeResult<Vec<u8>> {
        let store = self.store.read().map_err(|_| StorageError::LockPoisoned)?;
        store.get(&self.uri).cloned().ok_or_else(|| {
            SourceError::NotFound {
                uri: self.uri.clone(),
            }
            .into()
        })
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    async fn write(&self, bytes: &[u8]) -> IncludeResult<()> {
        if !self.writable {
            return Err(SourceError::WriteFailed {
                uri: self.uri.clone(),
                reason: "read-only".to_string(),
            }
            .into());
        }
        let mut store = self.store.write().map_err(|_| StorageError::LockPoisoned)?;
        store.insert(self.uri.clone(), bytes.to_vec());
        Ok(())
    }

    async fn delete(&self) -> IncludeResult<()> {
        let mut store = self.store.write().map_err(|_| StorageError::LockPoisoned)?;
        store.remove(&self.uri);
        Ok(())
    }
}

/// Resolver over a shared in-memory map of URI to bytes.
///
/// Counts every `resolve` and `release` so tests can assert that handles are
/// returned. Relative URIs are resolved against the base (`mem://site/` by
/// default).
pub struct MemorySourceResolver {
    base: String,
    store: Store,
    read_only: Vec<String>,
    unresolvable: RwLock<HashSet<String>>,
    resolves: AtomicUsize,
    releases: AtomicUsize,
}

impl Default for MemorySourceResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySourceResolver {
    pub fn new() -> Self {
        Self {
            base: "mem://site/".to_string(),
            store: Arc::new(RwLock::new(HashMap::new())),
            read_only: Vec::new(),
            unresolvable: RwLock::new(HashSet::new()),
            resolves: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        }
    }

    pub fn with_base(mut self, base: impl Into<String>) -> Self {
        self.base = base.into();
        self
    }

    /// Mark every URI under `prefix` as not writable.
    pub fn read_only(mut self, prefix: impl Into<String>) -> Self {
        self.read_only.push(prefix.into());
        self
    }

    /// Make resolution of `uri` fail.
    pub fn fail_resolve(&self, uri: impl Into<String>) {
        if let Ok(mut set) = self.unresolvable.write() {
            set.insert(uri.into());
        }
    }

    pub fn insert(&self, uri: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        if let Ok(mut store) = self.store.write() {
            store.insert(uri.into(), bytes.into());
        }
    }

    /// Store `events` as a compiled fragment under `uri`.
    pub fn insert_fragment(&self, uri: impl Into<String>, events: &[XmlEvent]) {
        self.insert(uri, compile(events));
    }

    pub fn contents(&self, uri: &str) -> Option<Vec<u8>> {
        self.store.read().ok()?.get(uri).cloned()
    }

    /// URIs currently stored under `prefix`.
    pub fn keys_under(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .store
            .read()
            .map(|store| {
                store
                    .keys()
                    .filter(|k| k.starts_with(prefix))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        keys.sort();
        keys
    }

    pub fn resolve_count(&self) -> usize {
        self.resolves.load(Ordering::SeqCst)
    }

    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    /// Handles resolved but not yet released.
    pub fn outstanding(&self) -> usize {
        self.resolve_count().saturating_sub(self.release_count())
    }
}

#[async_trait]
impl SourceResolver for MemorySourceResolver {
    async fn resolve(&self, uri: &str) -> IncludeResult<Arc<dyn Source>> {
        let absolute = resolve_against(&self.base, uri);
        let refused = self
            .unresolvable
            .read()
            .map(|set| set.contains(uri) || set.contains(&absolute))
            .unwrap_or(false);
        if refused {
            return Err(SourceError::ResolutionFailed {
                uri: uri.to_string(),
                reason: "refused by test resolver".to_string(),
            }
            .into());
        }

        self.resolves.fetch_add(1, Ordering::SeqCst);
        let writable = !self.read_only.iter().any(|p| absolute.starts_with(p.as_str()));
        Ok(Arc::new(MemorySource {
            uri: absolute,
            store: Arc::clone(&self.store),
            writable,
        }))
    }

    async fn release(&self, _source: Arc<dyn Source>) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// COUNTING LOADER
// ============================================================================

/// Fragment loader that counts fetches per URI.
///
/// Delegates to [`CompiledFragmentLoader`], so sources must hold compiled
/// streams (see [`MemorySourceResolver::insert_fragment`]).
#[derive(Default)]
pub struct CountingLoader {
    inner: CompiledFragmentLoader,
    fetches: Mutex<HashMap<String, usize>>,
    failing: Mutex<HashSet<String>>,
    delay: Option<Duration>,
    total: AtomicUsize,
}

impl CountingLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep before every fetch.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail every fetch of `uri` until [`CountingLoader::recover`] is called.
    pub fn fail_on(&self, uri: impl Into<String>) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(uri.into());
        }
    }

    pub fn recover(&self, uri: &str) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.remove(uri);
        }
    }

    pub fn fetch_count(&self, uri: &str) -> usize {
        self.fetches
            .lock()
            .map(|f| f.get(uri).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn total_fetches(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    fn should_fail(&self, uri: &str) -> bool {
        self.failing
            .lock()
            .map(|f| f.contains(uri))
            .unwrap_or(false)
    }
}

#[async_trait]
impl FragmentLoader for CountingLoader {
    async fn emit(
        &self,
        source: &dyn Source,
        consumer: &mut dyn EventConsumer,
    ) -> IncludeResult<()> {
        let uri = source.uri().to_string();
        if let Ok(mut fetches) = self.fetches.lock() {
            *fetches.entry(uri.clone()).or_insert(0) += 1;
        }
        self.total.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.should_fail(&uri) {
            return Err(FetchError::Failed {
                uri,
                reason: "injected failure".to_string(),
            }
            .into());
        }
        self.inner.emit(source, consumer).await
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fragments.

    use super::*;

    /// `<p>text</p>`
    pub fn paragraph(text: &str) -> Vec<XmlEvent> {
        vec![XmlEvent::start("p"), XmlEvent::text(text), XmlEvent::end("p")]
    }

    /// A small complete document wrapping `body` in `<page>`.
    pub fn page(title: &str, body: &str) -> Vec<XmlEvent> {
        vec![
            XmlEvent::StartDocument,
            XmlEvent::StartElement {
                name: "page".to_string(),
                attributes: vec![incache_core::Attribute::new("title", title)],
            },
            XmlEvent::start("body"),
            XmlEvent::text(body),
            XmlEvent::end("body"),
            XmlEvent::end("page"),
            XmlEvent::EndDocument,
        ]
    }

    /// Resolver and loader preloaded with `page(uri, body)` for each pair.
    pub fn populated(pages: &[(&str, &str)]) -> (Arc<MemorySourceResolver>, Arc<CountingLoader>) {
        let resolver = MemorySourceResolver::new();
        for (uri, body) in pages {
            resolver.insert_fragment(*uri, &page(uri, body));
        }
        (Arc::new(resolver), Arc::new(CountingLoader::new()))
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for fragment events and validity tokens.

    use super::*;
    use incache_core::Attribute;
    use proptest::prelude::*;

    fn arb_name() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_-]{0,11}"
    }

    pub fn arb_attribute() -> impl Strategy<Value = Attribute> {
        (arb_name(), "\\PC{0,16}").prop_map(|(name, value)| Attribute { name, value })
    }

    pub fn arb_xml_event() -> impl Strategy<Value = XmlEvent> {
        prop_oneof![
            Just(XmlEvent::StartDocument),
            Just(XmlEvent::EndDocument),
            (arb_name(), "\\PC{0,24}")
                .prop_map(|(prefix, uri)| XmlEvent::StartPrefixMapping { prefix, uri }),
            arb_name().prop_map(|prefix| XmlEvent::EndPrefixMapping { prefix }),
            (arb_name(), prop::collection::vec(arb_attribute(), 0..4))
                .prop_map(|(name, attributes)| XmlEvent::StartElement { name, attributes }),
            arb_name().prop_map(|name| XmlEvent::EndElement { name }),
            "\\PC{0,64}".prop_map(XmlEvent::Characters),
            "\\PC{0,32}".prop_map(XmlEvent::Comment),
            (arb_name(), "\\PC{0,24}")
                .prop_map(|(target, data)| XmlEvent::ProcessingInstruction { target, data }),
        ]
    }

    pub fn arb_fragment() -> impl Strategy<Value = Vec<XmlEvent>> {
        prop::collection::vec(arb_xml_event(), 0..32)
    }

    pub fn arb_uri() -> impl Strategy<Value = String> {
        ("[a-z]{1,8}", "[a-z0-9/_-]{1,32}")
            .prop_map(|(host, path)| format!("http://{}/{}.xml", host, path))
    }

    pub fn arb_validity_token() -> impl Strategy<Value = ValidityToken> {
        prop_oneof![
            Just(ValidityToken::Always),
            (0u64..86_400_000).prop_map(|ms| ValidityToken::expires(Duration::from_millis(ms))),
        ]
    }
}

// ============================================================================
// TESTS
// ============================================================================
