//! Cache Node
//!
//! One shard of the cache: a read-through layer over a single [`KvStore`].
//!
//! - concurrent misses on a key share one source query ([`SharedCalls`])
//! - a query reporting [`Error::NotFound`] leaves a short-lived placeholder
//! - every TTL written is jittered so entries written together expire apart
//! - values that fail to decode are reported, evicted and treated as misses
//! - failed deletes are handed to the [`CacheCleaner`] for retry

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{error, instrument, warn};

use crate::config::CacheOptions;
use crate::error::{Error, Result};
use crate::store::KvStore;
use crate::sync::SharedCalls;

use super::cleaner::CacheCleaner;
use super::stat::CacheStat;
use super::unstable::Unstable;
use super::{format_keys, Cache};

/// Stored in place of a value the source reported as missing
pub const NOT_FOUND_PLACEHOLDER: &[u8] = b"*";

enum Lookup<T> {
    Hit(T),
    Placeholder,
    Miss,
}

/// Single-store cache shard
pub struct CacheNode {
    name: String,
    store: Arc<dyn KvStore>,
    barrier: Arc<SharedCalls>,
    stat: Arc<CacheStat>,
    cleaner: Arc<CacheCleaner>,
    expiry: Duration,
    not_found_expiry: Duration,
    unstable: Unstable,
}

impl CacheNode {
    /// Create a node over `store`
    ///
    /// `barrier`, `stat` and `cleaner` are usually shared by all nodes of a cluster.
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn KvStore>,
        barrier: Arc<SharedCalls>,
        stat: Arc<CacheStat>,
        cleaner: Arc<CacheCleaner>,
        options: CacheOptions,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            barrier,
            stat,
            cleaner,
            expiry: options.expiry,
            not_found_expiry: options.not_found_expiry,
            unstable: Unstable::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stat(&self) -> &Arc<CacheStat> {
        &self.stat
    }

    /// Base TTL of cached values
    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    /// Base TTL of not-found placeholders
    pub fn not_found_expiry(&self) -> Duration {
        self.not_found_expiry
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Result<Lookup<T>> {
        self.stat.incr_total();

        let data = match self.store.get(key).await {
            Ok(Some(data)) if !data.is_empty() => data,
            Ok(_) => {
                self.stat.incr_miss();
                return Ok(Lookup::Miss);
            }
            Err(e) => {
                self.stat.incr_miss();
                return Err(e);
            }
        };

        self.stat.incr_hit();
        if data.as_ref() == NOT_FOUND_PLACEHOLDER {
            return Ok(Lookup::Placeholder);
        }

        match serde_json::from_slice(&data) {
            Ok(value) => Ok(Lookup::Hit(value)),
            Err(e) => {
                self.evict_corrupted(key, &data, e).await;
                Ok(Lookup::Miss)
            }
        }
    }

    async fn evict_corrupted(&self, key: &str, data: &[u8], e: serde_json::Error) {
        let message = format!(
            "unmarshal cache, node: {}, key: {}, value: {}, error: {}",
            self.name,
            key,
            String::from_utf8_lossy(data),
            e
        );
        error!(node = %self.name, key, error = %e, "Corrupted cache value");
        self.cleaner.reporter().report(&message);

        if let Err(e) = self.store.del(&[key.to_string()]).await {
            error!(node = %self.name, key, error = %e, "Failed to evict corrupted cache value");
        }
    }

    async fn write(&self, key: &str, data: Bytes, ttl: Duration) -> Result<()> {
        self.store
            .set_ex(key, data, self.unstable.around_duration(ttl))
            .await
    }

    async fn write_placeholder(&self, key: &str) -> Result<()> {
        self.write(key, Bytes::from_static(NOT_FOUND_PLACEHOLDER), self.not_found_expiry)
            .await
    }

    #[instrument(level = "debug", skip(self, query), fields(node = %self.name))]
    async fn do_take<T, F, Fut>(&self, key: &str, query: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<(T, Duration)>> + Send,
    {
        let mut fetched: Option<T> = None;
        let slot = &mut fetched;

        let (result, shared) = self
            .barrier
            .call(key, move || async move {
                match self.lookup::<T>(key).await {
                    Ok(Lookup::Hit(value)) => {
                        let data = encode(&value)?;
                        *slot = Some(value);
                        return Ok(data);
                    }
                    Ok(Lookup::Placeholder) => return Err(Error::NotFound),
                    Ok(Lookup::Miss) => {}
                    Err(e) => {
                        warn!(node = %self.name, key, error = %e, "Cache read failed, querying source");
                    }
                }

                match query().await {
                    Ok((value, ttl)) => {
                        let data = encode(&value)?;
                        if let Err(e) = self.write(key, data.clone(), ttl).await {
                            error!(node = %self.name, key, error = %e, "Failed to cache value");
                        }
                        *slot = Some(value);
                        Ok(data)
                    }
                    Err(Error::NotFound) => {
                        if let Err(e) = self.write_placeholder(key).await {
                            error!(node = %self.name, key, error = %e, "Failed to cache placeholder");
                        }
                        Err(Error::NotFound)
                    }
                    Err(e) => {
                        self.stat.incr_db_fails();
                        Err(e)
                    }
                }
            })
            .await;

        let data = result?;
        if shared {
            self.stat.incr_total();
            self.stat.incr_hit();
        } else if let Some(value) = fetched {
            return Ok(value);
        }

        Ok(serde_json::from_slice(&data)?)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

impl fmt::Display for CacheNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl fmt::Debug for CacheNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheNode")
            .field("name", &self.name)
            .field("expiry", &self.expiry)
            .field("not_found_expiry", &self.not_found_expiry)
            .finish()
    }
}

#[async_trait]
impl Cache for CacheNode {
    async fn del<K>(&self, keys: &[K]) -> Result<()>
    where
        K: AsRef<str> + Sync,
    {
        if keys.is_empty() {
            return Ok(());
        }

        let keys: Vec<String> = keys.iter().map(|k| k.as_ref().to_string()).collect();
        let Err(e) = self.store.del(&keys).await else {
            return Ok(());
        };

        warn!(
            node = %self.name,
            keys = %format_keys(&keys),
            error = %e,
            "Cache delete failed, scheduling retry"
        );

        let store = Arc::clone(&self.store);
        let retry_keys = keys.clone();
        let retry = move || {
            let store = Arc::clone(&store);
            let keys = retry_keys.clone();
            async move { store.del(&keys).await.map(|_| ()) }
        };

        if let Err(e) = self.cleaner.add_clean_task(retry, keys.clone()).await {
            self.cleaner.reporter().report(&format!(
                "cache delete could not be retried, node: {}, keys: {}, error: {}",
                self.name,
                format_keys(&keys),
                e
            ));
        }
        Ok(())
    }

    async fn get<T>(&self, key: &str) -> Result<T>
    where
        T: DeserializeOwned + Send,
    {
        match self.lookup(key).await? {
            Lookup::Hit(value) => Ok(value),
            Lookup::Placeholder | Lookup::Miss => Err(Error::NotFound),
        }
    }

    async fn set<T>(&self, key: &str, value: &T) -> Result<()>
    where
        T: Serialize + Sync,
    {
        self.set_ex(key, value, self.expiry).await
    }

    async fn set_ex<T>(&self, key: &str, value: &T, ttl: Duration) -> Result<()>
    where
        T: Serialize + Sync,
    {
        let data = encode(value)?;
        self.write(key, data, ttl).await
    }

    async fn take<T, F, Fut>(&self, key: &str, query: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
    {
        let expiry = self.expiry;
        self.do_take(key, move || async move { query().await.map(|value| (value, expiry)) })
            .await
    }

    async fn take_ex<T, F, Fut>(&self, key: &str, query: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<(T, Duration)>> + Send,
    {
        self.do_take(key, query).await
    }
}

// =============================================================================
// Tests
// =============================================================================
