//! cachewheel - Timing Wheel and Read-Through Cache
//!
//! A single-coordinator timing wheel and a sharded, stampede-safe cache built
//! on top of it.
//!
//! # Architecture
//!
//! ```text
//! CacheCluster ──► CacheNode ──► KvStore
//!                     │
//!                     └── failed deletes ──► CacheCleaner ──► TimingWheel
//! ```
//!
//! The cache protects its backing source three ways: concurrent misses on a
//! key share one query, missing rows are remembered with a short-lived
//! placeholder, and every TTL is jittered so batches do not expire together.
//!
//! # Modules
//!
//! - [`cache`] - Cache node, cluster, cleaner and stat counters
//! - [`collection`] - Timing wheel
//! - [`config`] - Serde configuration and duration parsing
//! - [`error`] - Error types
//! - [`hash`] - Consistent hash ring
//! - [`report`] - Alert sink for unrecoverable conditions
//! - [`store`] - Key-value backend trait and in-memory backend
//! - [`sync`] - Shared-call barrier

pub mod cache;
pub mod collection;
pub mod config;
pub mod error;
pub mod hash;
pub mod report;
pub mod store;
pub mod sync;

// Re-export commonly used types
pub use cache::{Cache, CacheCleaner, CacheCluster, CacheNode, CacheStat};
pub use collection::TimingWheel;
pub use config::{CacheOptions, CleanerConfig, Config, NodeConf};
pub use error::{BatchError, Error, Result};
pub use hash::ConsistentHash;
pub use report::{LogReporter, Reporter};
pub use store::{InMemoryStore, KvStore};
pub use sync::SharedCalls;
