//! incache Include - Cache-Aware Fragment Inclusion
//!
//! Ties storage proxies, fragment loading and the preemptive refresh worker
//! together behind [`IncludeCacheManager`].
//!
//! # Usage
//!
//! ```ignore
//! let manager = IncludeCacheManager::new(config, resolver, loader);
//! let options = SessionOptions::new().with_expires(Duration::from_secs(60));
//! let session = manager.get_session(&options).await;
//!
//! let uri = manager.load("header.xml", &session).await?;
//! manager.stream(&uri, &session, &mut consumer).await?;
//!
//! manager.terminate_session(session).await;
//! ```

pub mod manager;
pub mod options;
pub mod preemptive;
pub mod session;
pub mod stats;
pub mod telemetry;

pub use manager::IncludeCacheManager;
pub use options::SessionOptions;
pub use preemptive::{PreemptiveLoader, RefreshItem};
pub use session::{InFlight, IncludeCacheSession, LoadCompleter, PendingLoad};
pub use stats::{IncludeCacheStats, IncludeCacheStatsSnapshot};
pub use telemetry::{init_tracing, TelemetryConfig, TelemetryError};
