//! Process-local storage proxy.

use async_trait::async_trait;
use dashmap::DashMap;
use incache_core::{CachedEntry, IncludeResult};

use crate::proxy::StorageProxy;

/// Location reported by every [`LocalStorageProxy`].
pub const LOCAL_LOCATION: &str = "local:";

/// In-memory store shared by every session of a manager.
///
/// Unbounded; entries leave only through `remove`, replacement or `clear`.
#[derive(Debug, Default)]
pub struct LocalStorageProxy {
    entries: DashMap<String, CachedEntry>,
}

impl LocalStorageProxy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[async_trait]
impl StorageProxy for LocalStorageProxy {
    async fn get(&self, uri: &str) -> Option<CachedEntry> {
        self.entries.get(uri).map(|entry| entry.value().clone())
    }

    async fn put(&self, uri: &str, entry: CachedEntry) -> IncludeResult<()> {
        self.entries.insert(uri.to_string(), entry);
        Ok(())
    }

    async fn remove(&self, uri: &str) {
        self.entries.remove(uri);
    }

    fn location(&self) -> &str {
        LOCAL_LOCATION
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_put_get_remove() {
        let proxy = LocalStorageProxy::new();
        assert!(proxy.get("http://x/a.xml").await.is_none());

        let entry = CachedEntry::expiring(Duration::from_secs(60), b"payload".to_vec());
        proxy
            .put("http://x/a.xml", entry.clone())
            .await
            .expect("put should succeed");
        assert_eq!(proxy.get("http://x/a.xml").await, Some(entry));
        assert_eq!(proxy.len(), 1);

        proxy.remove("http://x/a.xml").await;
        assert!(proxy.get("http://x/a.xml").await.is_none());
        assert!(proxy.is_empty());
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let proxy = LocalStorageProxy::new();
        proxy
            .put("u", CachedEntry::expiring(Duration::from_secs(1), b"one".to_vec()))
            .await
            .expect("put should succeed");
        proxy
            .put("u", CachedEntry::expiring(Duration::from_secs(1), b"two".to_vec()))
            .await
            .expect("put should succeed");

        let entry = proxy.get("u").await.expect("entry should exist");
        assert_eq!(entry.payload(), b"two");
    }

    #[tokio::test]
    async fn test_clear_and_remove_missing() {
        let proxy = LocalStorageProxy::new();
        proxy.remove("missing").await;
        proxy
            .put("a", CachedEntry::expiring(Duration::from_secs(1), b"a".to_vec()))
            .await
            .expect("put should succeed");
        proxy.clear();
        assert!(proxy.is_empty());
        assert_eq!(proxy.location(), LOCAL_LOCATION);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_access() {
        let proxy = Arc::new(LocalStorageProxy::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let proxy = Arc::clone(&proxy);
            handles.push(tokio::spawn(async move {
                let uri = format!("http://x/{}.xml", i % 4);
                for _ in 0..50 {
                    proxy
                        .put(&uri, CachedEntry::expiring(Duration::from_secs(60), vec![i as u8]))
                        .await
                        .expect("put should succeed");
                    let _ = proxy.get(&uri).await;
                    proxy.remove(&uri).await;
                }
            }));
        }
        for handle in handles {
            handle.await.expect("task should not panic");
        }
        assert!(proxy.len() <= 4);
    }
}
