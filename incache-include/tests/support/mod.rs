//! Shared harness for include cache integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use incache_core::IncludeCacheConfig;
use incache_include::{IncludeCacheManager, SessionOptions};
use incache_test_utils::{fixtures, CountingLoader, MemorySourceResolver};

pub const A: &str = "http://x/a.xml";
pub const B: &str = "http://x/b.xml";
pub const C: &str = "http://x/c.xml";

pub struct Harness {
    pub manager: IncludeCacheManager,
    pub resolver: Arc<MemorySourceResolver>,
    pub loader: Arc<CountingLoader>,
}

impl Harness {
    pub fn new(config: IncludeCacheConfig) -> Self {
        Self::with_loader(config, CountingLoader::new())
    }

    pub fn with_loader(config: IncludeCacheConfig, loader: CountingLoader) -> Self {
        let resolver = Arc::new(MemorySourceResolver::new().read_only("mem://readonly"));
        for (uri, body) in [(A, "alpha"), (B, "beta"), (C, "gamma")] {
            resolver.insert_fragment(uri, &fixtures::page(uri, body));
        }
        let loader = Arc::new(loader);
        let manager = IncludeCacheManager::new(config, resolver.clone(), loader.clone());
        Self {
            manager,
            resolver,
            loader,
        }
    }
}

pub fn expiring(secs: u64) -> SessionOptions {
    SessionOptions::new().with_expires(Duration::from_secs(secs))
}

pub fn page(uri: &str) -> Vec<incache_core::XmlEvent> {
    let body = match uri {
        A => "alpha",
        B => "beta",
        C => "gamma",
        _ => "",
    };
    fixtures::page(uri, body)
}

/// Poll `done` for up to a second.
pub async fn eventually(mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    done()
}
