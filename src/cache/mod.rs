//! Read-Through Cache
//!
//! Stampede-safe cache over an external key-value store, sharded by a
//! consistent hash ring.
//!
//! ```text
//!                 ┌──────────────────────────────┐
//!   take(key) ──► │ CacheCluster (hash ring)     │
//!                 └──────┬───────────────┬───────┘
//!                        ▼               ▼
//!                 ┌────────────┐   ┌────────────┐
//!                 │ CacheNode  │   │ CacheNode  │ ── SharedCalls, CacheStat
//!                 └─────┬──────┘   └─────┬──────┘
//!                       ▼                ▼
//!                    KvStore          KvStore
//!                       │ failed deletes │
//!                       └──────►  CacheCleaner (timing wheel + backoff)
//! ```

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

pub mod cleaner;
pub mod cluster;
pub mod node;
pub mod stat;
pub mod unstable;

pub use cleaner::{CacheCleaner, DelayTask, RetryAction, BACKOFF};
pub use cluster::CacheCluster;
pub use node::{CacheNode, NOT_FOUND_PLACEHOLDER};
pub use stat::{CacheStat, StatSnapshot, STAT_INTERVAL};
pub use unstable::{Unstable, DEFAULT_DEVIATION};

/// Cache operations shared by a single node and a cluster of nodes
///
/// Values are stored as JSON. Absence is reported as
/// [`Error::NotFound`](crate::error::Error::NotFound).
#[async_trait]
pub trait Cache: Send + Sync {
    /// Delete `keys`. Backend failures are retried in the background.
    async fn del<K>(&self, keys: &[K]) -> Result<()>
    where
        K: AsRef<str> + Sync;

    /// Read a cached value
    async fn get<T>(&self, key: &str) -> Result<T>
    where
        T: DeserializeOwned + Send;

    /// Write a value with the default expiry
    async fn set<T>(&self, key: &str, value: &T) -> Result<()>
    where
        T: Serialize + Sync;

    /// Write a value expiring after about `ttl`
    async fn set_ex<T>(&self, key: &str, value: &T, ttl: Duration) -> Result<()>
    where
        T: Serialize + Sync;

    /// Read a value, computing and caching it with `query` on a miss
    ///
    /// Concurrent misses on the same key run `query` once. A query returning
    /// `NotFound` is remembered for a short while.
    async fn take<T, F, Fut>(&self, key: &str, query: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send;

    /// Like [`take`](Cache::take), with `query` also choosing the expiry
    async fn take_ex<T, F, Fut>(&self, key: &str, query: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<(T, Duration)>> + Send;
}

/// Comma-separated key list for logs and reports
pub fn format_keys<S: AsRef<str>>(keys: &[S]) -> String {
    keys.iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(",")
}
