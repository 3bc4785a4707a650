//! Filesystem source resolution.
//!
//! Resolves `file:` URIs and plain paths to [`FileSource`] handles. Relative
//! paths are taken against the resolver's base directory.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use incache_core::source::has_scheme;
use incache_core::{IncludeResult, Source, SourceError, SourceResolver};

/// A file on the local filesystem.
#[derive(Debug, Clone)]
pub struct FileSource {
    uri: String,
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            uri: format!("file://{}", path.display()),
            path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.path
            .with_file_name(format!("tmp_{}_{}_{}", std::process::id(), n, name))
    }
}

#[async_trait]
impl Source for FileSource {
    fn uri(&self) -> &str {
        &self.uri
    }

    async fn exists(&self) -> bool {
        tokio::fs::try_exists(&self.path).await.unwrap_or(false)
    }

    async fn read(&self) -> IncludeResult<Vec<u8>> {
        tokio::fs::read(&self.path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SourceError::NotFound {
                    uri: self.uri.clone(),
                }
            } else {
                SourceError::ReadFailed {
                    uri: self.uri.clone(),
                    reason: e.to_string(),
                }
            }
            .into()
        })
    }

    fn is_writable(&self) -> bool {
        true
    }

    async fn write(&self, bytes: &[u8]) -> IncludeResult<()> {
        let write_failed = |e: std::io::Error| SourceError::WriteFailed {
            uri: self.uri.clone(),
            reason: e.to_string(),
        };

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(write_failed)?;
        }

        // Write to a sibling temp file and rename so readers never see a partial entry
        let temp = self.temp_path();
        if let Err(e) = tokio::fs::write(&temp, bytes).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(write_failed(e).into());
        }
        if let Err(e) = tokio::fs::rename(&temp, &self.path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(write_failed(e).into());
        }
        Ok(())
    }

    async fn delete(&self) -> IncludeResult<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SourceError::DeleteFailed {
                uri: self.uri.clone(),
                reason: e.to_string(),
            }
            .into()),
        }
    }
}

/// Resolver for the local filesystem.
#[derive(Debug)]
pub struct FileSourceResolver {
    base: PathBuf,
    outstanding: AtomicU64,
}

impl FileSourceResolver {
    /// Create a resolver that takes relative paths against `base`.
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            outstanding: AtomicU64::new(0),
        }
    }

    /// Number of handles resolved but not yet released.
    pub fn outstanding(&self) -> u64 {
        self.outstanding.load(Ordering::Relaxed)
    }

    fn to_path(&self, uri: &str) -> IncludeResult<PathBuf> {
        if let Some(rest) = uri.strip_prefix("file://") {
            // file:///abs/path or file://localhost/abs/path
            let path = rest.strip_prefix("localhost").unwrap_or(rest);
            return Ok(PathBuf::from(path));
        }
        if let Some(rest) = uri.strip_prefix("file:") {
            return Ok(self.base.join(rest));
        }
        if has_scheme(uri) {
            return Err(SourceError::ResolutionFailed {
                uri: uri.to_string(),
                reason: "unsupported scheme".to_string(),
            }
            .into());
        }
        Ok(self.base.join(uri))
    }
}

#[async_trait]
impl SourceResolver for FileSourceResolver {
    async fn resolve(&self, uri: &str) -> IncludeResult<Arc<dyn Source>> {
        let path = self.to_path(uri)?;
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(FileSource::new(path)))
    }

    async fn release(&self, _source: Arc<dyn Source>) {
        // Saturating: releasing a foreign handle must not wrap the counter
        let _ = self
            .outstanding
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_resolve_forms() {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let resolver = FileSourceResolver::new(temp_dir.path());

        let rel = resolver.resolve("a/b.xml").await.expect("resolve should succeed");
        assert_eq!(
            rel.uri(),
            format!("file://{}", temp_dir.path().join("a/b.xml").display())
        );

        let abs = resolver
            .resolve("file:///tmp/x.xml")
            .await
            .expect("resolve should succeed");
        assert_eq!(abs.uri(), "file:///tmp/x.xml");

        assert!(resolver.resolve("http://x/a.xml").await.is_err());
        assert_eq!(resolver.outstanding(), 2);

        resolver.release(rel).await;
        resolver.release(abs).await;
        assert_eq!(resolver.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_write_read_delete() {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let source = FileSource::new(temp_dir.path().join("nested/dir/entry.cxml"));

        assert!(!source.exists().await);
        assert!(matches!(
            source.read().await,
            Err(incache_core::IncludeError::Source(SourceError::NotFound { .. }))
        ));

        source.write(b"first").await.expect("write should succeed");
        source.write(b"second").await.expect("write should succeed");
        assert!(source.exists().await);
        assert_eq!(source.read().await.expect("read should succeed"), b"second");

        // No temp files left behind
        let leftovers: Vec<_> = std::fs::read_dir(temp_dir.path().join("nested/dir"))
            .expect("read_dir should succeed")
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with("tmp_"))
            .collect();
        assert!(leftovers.is_empty());

        source.delete().await.expect("delete should succeed");
        source.delete().await.expect("deleting twice should succeed");
        assert!(!source.exists().await);
    }
}
