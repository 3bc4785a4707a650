//! incache Storage - Storage Proxies for Cached Fragments
//!
//! Defines the [`StorageProxy`] abstraction over cached entries and its two
//! backends: a process-local map and a resource-backed store that writes one
//! child resource per URI. Also ships a filesystem [`SourceResolver`] so the
//! resource-backed store has something real to write to.
//!
//! [`SourceResolver`]: incache_core::SourceResolver

pub mod file_source;
pub mod local;
pub mod proxy;
pub mod resource;

pub use file_source::{FileSource, FileSourceResolver};
pub use local::{LocalStorageProxy, LOCAL_LOCATION};
pub use proxy::StorageProxy;
pub use resource::{cache_name, uri_hash, ResourceStorageProxy, CACHE_EXTENSION};
