//! Source resolution contracts.
//!
//! A [`SourceResolver`] turns a URI string into a [`Source`] handle. Handles
//! are request-scoped: whoever resolves one must hand it back through
//! [`SourceResolver::release`] when done.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::IncludeResult;

/// A resolved, fetchable resource.
#[async_trait]
pub trait Source: Send + Sync + fmt::Debug {
    /// Absolute URI of this resource.
    fn uri(&self) -> &str;

    /// Whether the resource currently exists.
    async fn exists(&self) -> bool;

    /// Read the full content.
    async fn read(&self) -> IncludeResult<Vec<u8>>;

    /// Whether [`Source::write`] and [`Source::delete`] are supported.
    fn is_writable(&self) -> bool;

    /// Replace the content, creating the resource if needed.
    async fn write(&self, bytes: &[u8]) -> IncludeResult<()>;

    /// Delete the resource. Deleting a missing resource is not an error.
    async fn delete(&self) -> IncludeResult<()>;
}

/// Resolves URIs to [`Source`] handles.
#[async_trait]
pub trait SourceResolver: Send + Sync {
    /// Resolve `uri`, which may be relative to the resolver's base.
    async fn resolve(&self, uri: &str) -> IncludeResult<Arc<dyn Source>>;

    /// Return a handle obtained from [`SourceResolver::resolve`].
    async fn release(&self, source: Arc<dyn Source>);
}

/// Returns true when `uri` carries a scheme (`scheme:rest`).
pub fn has_scheme(uri: &str) -> bool {
    match uri.find(':') {
        Some(0) | None => false,
        Some(idx) => {
            let scheme = &uri[..idx];
            scheme
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic())
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        }
    }
}

/// Join a child name under a parent location with exactly one slash.
pub fn join(parent: &str, child: &str) -> String {
    let parent = parent.trim_end_matches('/');
    let child = child.trim_start_matches('/');
    format!("{}/{}", parent, child)
}

/// Resolve `uri` against `base`.
///
/// Absolute URIs are returned unchanged. A leading `/` replaces the base
/// path after its authority; anything else is appended to the base's
/// directory.
pub fn resolve_against(base: &str, uri: &str) -> String {
    if has_scheme(uri) {
        return uri.to_string();
    }
    if let Some(rooted) = uri.strip_prefix('/') {
        let authority_end = base
            .find("://")
            .map(|i| i + 3)
            .and_then(|start| base[start..].find('/').map(|i| start + i))
            .unwrap_or(base.len());
        return format!("{}/{}", &base[..authority_end], rooted);
    }
    let dir = match base.rfind('/') {
        Some(idx) if !base[..idx].ends_with('/') || base[idx + 1..].is_empty() => &base[..=idx],
        _ => base,
    };
    if dir.ends_with('/') {
        format!("{}{}", dir, uri)
    } else {
        format!("{}/{}", dir, uri)
    }
}
