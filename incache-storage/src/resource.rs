//! Resource-backed storage proxy.
//!
//! Entries live as child resources of a parent location, one per cached URI.
//! The child name is derived from a stable hash of the URI, so the same URI
//! maps to the same resource across processes.
//!
//! # Naming
//!
//! The hash is the first 8 bytes of SHA-256(uri) read as a big-endian `i64`.
//! Non-negative hashes are rendered directly, negative ones as `M<abs>`,
//! followed by [`CACHE_EXTENSION`]:
//!
//! - `4611686018427387904.cxml`
//! - `M1152921504606846976.cxml`
//!
//! Two URIs with the same hash share a resource; the last writer wins.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use incache_core::source::join;
use incache_core::{CachedEntry, IncludeResult, Source, SourceResolver, StorageError};
use sha2::{Digest, Sha256};

use crate::proxy::StorageProxy;

/// Extension of every cache resource.
pub const CACHE_EXTENSION: &str = ".cxml";

/// Stable signed hash of a URI.
pub fn uri_hash(uri: &str) -> i64 {
    let digest = Sha256::digest(uri.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[0..8]);
    i64::from_be_bytes(head)
}

/// Child resource name used for `uri`.
pub fn cache_name(uri: &str) -> String {
    let hash = uri_hash(uri);
    if hash >= 0 {
        format!("{}{}", hash, CACHE_EXTENSION)
    } else {
        format!("M{}{}", hash.unsigned_abs(), CACHE_EXTENSION)
    }
}

/// Storage proxy writing entries as child resources of `parent`.
///
/// Equality and hashing consider only the parent location.
pub struct ResourceStorageProxy {
    resolver: Arc<dyn SourceResolver>,
    parent: String,
}

impl ResourceStorageProxy {
    /// Create a proxy rooted at an absolute parent location.
    pub fn new(resolver: Arc<dyn SourceResolver>, parent: impl Into<String>) -> Self {
        Self {
            resolver,
            parent: parent.into(),
        }
    }

    pub fn parent(&self) -> &str {
        &self.parent
    }

    /// Absolute URI of the resource holding `uri`'s entry.
    pub fn child_uri(&self, uri: &str) -> String {
        join(&self.parent, &cache_name(uri))
    }

    async fn resolve_child(&self, uri: &str) -> IncludeResult<Arc<dyn Source>> {
        self.resolver.resolve(&self.child_uri(uri)).await
    }

    async fn read_entry(&self, child: &dyn Source) -> IncludeResult<Option<CachedEntry>> {
        if !child.exists().await {
            return Ok(None);
        }
        let bytes = child.read().await?;
        CachedEntry::decode(&bytes).map(Some)
    }

    async fn write_entry(
        &self,
        uri: &str,
        child: &dyn Source,
        entry: &CachedEntry,
    ) -> IncludeResult<()> {
        if !child.is_writable() {
            return Err(StorageError::NotWritable {
                uri: uri.to_string(),
            }
            .into());
        }
        let bytes = entry.encode()?;
        child.write(&bytes).await
    }
}

#[async_trait]
impl StorageProxy for ResourceStorageProxy {
    async fn get(&self, uri: &str) -> Option<CachedEntry> {
        let child = match self.resolve_child(uri).await {
            Ok(child) => child,
            Err(e) => {
                tracing::debug!(
                    uri = %uri,
                    error = %e,
                    "Cache resource unresolvable, treating as miss"
                );
                return None;
            }
        };

        let result = self.read_entry(child.as_ref()).await;
        self.resolver.release(child).await;

        match result {
            Ok(entry) => entry,
            Err(e) => {
                tracing::debug!(
                    uri = %uri,
                    error = %e,
                    "Cache resource unreadable, treating as miss"
                );
                None
            }
        }
    }

    async fn put(&self, uri: &str, entry: CachedEntry) -> IncludeResult<()> {
        let child = self.resolve_child(uri).await?;
        let result = self.write_entry(uri, child.as_ref(), &entry).await;
        self.resolver.release(child).await;
        result
    }

    async fn remove(&self, uri: &str) {
        let child = match self.resolve_child(uri).await {
            Ok(child) => child,
            Err(_) => return,
        };
        if child.is_writable() {
            if let Err(e) = child.delete().await {
                tracing::debug!(uri = %uri, error = %e, "Failed to remove cache resource");
            }
        }
        self.resolver.release(child).await;
    }

    fn location(&self) -> &str {
        &self.parent
    }
}

impl PartialEq for ResourceStorageProxy {
    fn eq(&self, other: &Self) -> bool {
        self.parent == other.parent
    }
}

impl Eq for ResourceStorageProxy {}

impl Hash for ResourceStorageProxy {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.parent.hash(state);
    }
}

impl fmt::Debug for ResourceStorageProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceStorageProxy")
            .field("parent", &self.parent)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_source::FileSourceResolver;
    use incache_core::{compile, decode, ValidityToken, XmlEvent};
    use incache_test_utils::generators::{arb_fragment, arb_validity_token};
    use incache_test_utils::MemorySourceResolver;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::time::Duration;
    use tempfile::TempDir;

    fn file_proxy() -> (ResourceStorageProxy, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let resolver = Arc::new(FileSourceResolver::new(temp_dir.path()));
        let parent = format!("file://{}/cache", temp_dir.path().display());
        (ResourceStorageProxy::new(resolver, parent), temp_dir)
    }

    fn fragment_entry(text: &str) -> CachedEntry {
        let payload = compile(&[XmlEvent::start("p"), XmlEvent::text(text), XmlEvent::end("p")]);
        CachedEntry::expiring(Duration::from_secs(60), payload)
    }

    #[test]
    fn test_cache_name_format() {
        for uri in ["http://x/a.xml", "http://x/b.xml", "", "cocoon:/page"] {
            let name = cache_name(uri);
            assert!(name.ends_with(CACHE_EXTENSION));
            let stem = name.trim_end_matches(CACHE_EXTENSION);
            let hash = uri_hash(uri);
            if hash >= 0 {
                assert_eq!(stem, hash.to_string());
            } else {
                assert_eq!(stem, format!("M{}", hash.unsigned_abs()));
            }
        }
    }

    #[test]
    fn test_cache_name_is_stable() {
        assert_eq!(cache_name("http://x/a.xml"), cache_name("http://x/a.xml"));
        assert_ne!(cache_name("http://x/a.xml"), cache_name("http://x/b.xml"));
    }

    #[test]
    fn test_equality_by_parent() {
        let resolver: Arc<dyn SourceResolver> = Arc::new(MemorySourceResolver::new());
        let a = ResourceStorageProxy::new(Arc::clone(&resolver), "mem://cache");
        let b = ResourceStorageProxy::new(Arc::new(MemorySourceResolver::new()), "mem://cache");
        let c = ResourceStorageProxy::new(resolver, "mem://other");

        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: HashSet<ResourceStorageProxy> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[tokio::test]
    async fn test_file_put_get_roundtrip() {
        let (proxy, temp_dir) = file_proxy();
        let entry = fragment_entry("hello");

        proxy
            .put("http://x/a.xml", entry.clone())
            .await
            .expect("put should succeed");

        let stored = temp_dir.path().join("cache").join(cache_name("http://x/a.xml"));
        assert!(stored.exists(), "cache file should be at {}", stored.display());

        let back = proxy.get("http://x/a.xml").await.expect("entry should exist");
        assert_eq!(back.validities(), entry.validities());
        assert_eq!(
            decode(back.payload()).expect("decode should succeed"),
            decode(entry.payload()).expect("decode should succeed")
        );
    }

    #[tokio::test]
    async fn test_missing_and_corrupt_are_misses() {
        let (proxy, temp_dir) = file_proxy();
        assert!(proxy.get("http://x/missing.xml").await.is_none());

        let dir = temp_dir.path().join("cache");
        std::fs::create_dir_all(&dir).expect("mkdir should succeed");
        std::fs::write(dir.join(cache_name("http://x/bad.xml")), b"\xFF\xFF\xFF\xFFgarbage")
            .expect("write should succeed");
        assert!(proxy.get("http://x/bad.xml").await.is_none());
    }

    #[tokio::test]
    async fn test_remove_deletes_and_tolerates_missing() {
        let (proxy, _temp_dir) = file_proxy();
        proxy.remove("http://x/never.xml").await;

        proxy
            .put("http://x/a.xml", fragment_entry("a"))
            .await
            .expect("put should succeed");
        proxy.remove("http://x/a.xml").await;
        assert!(proxy.get("http://x/a.xml").await.is_none());
    }

    #[tokio::test]
    async fn test_put_to_read_only_location_fails() {
        let resolver = Arc::new(MemorySourceResolver::new().read_only("mem://ro"));
        let proxy = ResourceStorageProxy::new(resolver.clone(), "mem://ro");

        let err = proxy
            .put("http://x/a.xml", fragment_entry("a"))
            .await
            .expect_err("put should fail");
        assert!(matches!(
            err,
            incache_core::IncludeError::Storage(StorageError::NotWritable { ref uri })
                if uri == "http://x/a.xml"
        ));
        // Handles are released on the failure path too
        assert_eq!(resolver.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_handles_released() {
        let resolver = Arc::new(MemorySourceResolver::new());
        let proxy = ResourceStorageProxy::new(resolver.clone(), "mem://cache");

        proxy
            .put("http://x/a.xml", fragment_entry("a"))
            .await
            .expect("put should succeed");
        let _ = proxy.get("http://x/a.xml").await;
        proxy.remove("http://x/a.xml").await;

        assert_eq!(resolver.outstanding(), 0);
        assert_eq!(resolver.resolve_count(), 3);
    }

    #[tokio::test]
    async fn test_thousand_uris_roundtrip() {
        let (proxy, _temp_dir) = file_proxy();

        for i in 0..1000 {
            let uri = format!("http://x/docs/{}.xml", i);
            let entry = CachedEntry::new(
                ValidityToken::expires(Duration::from_secs(60)),
                compile(&[XmlEvent::text(uri.clone())]),
            );
            proxy.put(&uri, entry).await.expect("put should succeed");
        }

        for i in 0..1000 {
            let uri = format!("http://x/docs/{}.xml", i);
            let back = proxy.get(&uri).await.expect("entry should exist");
            assert_eq!(back.validities().len(), 1);
            assert_eq!(
                back.payload(),
                compile(&[XmlEvent::text(uri.clone())]).as_slice()
            );
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_access() {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let resolver = Arc::new(FileSourceResolver::new(temp_dir.path()));
        let parent = format!("file://{}/cache", temp_dir.path().display());
        let proxy = Arc::new(ResourceStorageProxy::new(resolver.clone(), parent));

        let mut handles = Vec::new();
        for i in 0..16 {
            let proxy = Arc::clone(&proxy);
            handles.push(tokio::spawn(async move {
                let uri = format!("http://x/{}.xml", i % 4);
                for round in 0..20 {
                    proxy
                        .put(&uri, fragment_entry(&format!("writer-{}-{}", i, round)))
                        .await
                        .expect("put should succeed");
                    // Readers see a whole entry or none, never a partial write
                    if let Some(entry) = proxy.get(&uri).await {
                        let events = decode(entry.payload()).expect("stored payload should decode");
                        assert_eq!(events.len(), 3);
                    }
                    proxy.remove(&uri).await;
                }
            }));
        }
        for handle in handles {
            handle.await.expect("task should not panic");
        }

        assert_eq!(resolver.outstanding(), 0);
        let leftovers = std::fs::read_dir(temp_dir.path().join("cache"))
            .expect("cache dir should exist")
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with("tmp_"))
            .count();
        assert_eq!(leftovers, 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        /// Property: names are deterministic and carry the sign marker only for negative hashes.
        #[test]
        fn prop_cache_name_shape(uri in "\\PC{0,64}") {
            let name = cache_name(&uri);
            prop_assert_eq!(&name, &cache_name(&uri));
            prop_assert!(name.ends_with(CACHE_EXTENSION));
            prop_assert_eq!(name.starts_with('M'), uri_hash(&uri) < 0);
            let digits = name.trim_start_matches('M').trim_end_matches(CACHE_EXTENSION);
            prop_assert!(!digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()));
        }

        /// Property: tokens and payload survive a put/get through child resources.
        #[test]
        fn prop_entries_survive_storage(
            tokens in prop::collection::vec(arb_validity_token(), 1..4),
            events in arb_fragment(),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| TestCaseError::fail(format!("Failed to create runtime: {}", e)))?;

            let resolver = Arc::new(MemorySourceResolver::new());
            let proxy = ResourceStorageProxy::new(resolver, "mem://cache");
            let entry = CachedEntry::with_validities(tokens, compile(&events));
            let back = rt.block_on(async {
                proxy
                    .put("http://x/a.xml", entry.clone())
                    .await
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
                Ok::<_, TestCaseError>(proxy.get("http://x/a.xml").await)
            })?;

            let back = back.ok_or_else(|| TestCaseError::fail("entry missing"))?;
            prop_assert_eq!(back.validities(), entry.validities());
            prop_assert_eq!(back.payload(), entry.payload());
        }
    }
}
