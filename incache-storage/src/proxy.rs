//! Storage proxy trait for pluggable cache stores.

use async_trait::async_trait;
use incache_core::{CachedEntry, IncludeResult};

/// Key/value store of cached fragments, keyed by absolute URI.
///
/// Implementations must tolerate concurrent `get`/`put`/`remove` from request
/// tasks and the preemptive worker.
///
/// # Failure Contract
///
/// - `get` never fails: anything that prevents a read is a miss.
/// - `put` reports failures, since the caller asked for a write.
/// - `remove` is best effort and swallows failures.
#[async_trait]
pub trait StorageProxy: Send + Sync {
    /// Get the entry stored for `uri`.
    async fn get(&self, uri: &str) -> Option<CachedEntry>;

    /// Store `entry` for `uri`, replacing any previous entry.
    async fn put(&self, uri: &str, entry: CachedEntry) -> IncludeResult<()>;

    /// Remove the entry stored for `uri`, if any.
    async fn remove(&self, uri: &str);

    /// Identity of the backing store. Two proxies with the same location
    /// address the same entries.
    fn location(&self) -> &str;
}
