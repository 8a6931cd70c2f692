//! Cache Cluster
//!
//! Routes every key to the [`CacheNode`] owning it on a consistent hash ring.
//! A cluster of one node skips hashing entirely.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{total_weights, CacheOptions, NodeConf};
use crate::error::{BatchError, Error, Result};
use crate::hash::ConsistentHash;
use crate::store::KvStore;
use crate::sync::SharedCalls;

use super::cleaner::CacheCleaner;
use super::node::CacheNode;
use super::stat::CacheStat;
use super::{format_keys, Cache};

/// Cache sharded over several nodes
#[derive(Debug, Default)]
pub struct CacheCluster {
    dispatcher: ConsistentHash<Arc<CacheNode>>,
}

impl CacheCluster {
    /// Create an empty cluster; every operation fails until a node is added
    pub fn new() -> Self {
        Self::default()
    }

    /// Build one node per entry of `confs`, opening stores with `connect`
    pub fn from_conf<C>(
        confs: &[NodeConf],
        mut connect: C,
        barrier: Arc<SharedCalls>,
        stat: Arc<CacheStat>,
        cleaner: Arc<CacheCleaner>,
        options: CacheOptions,
    ) -> Result<Self>
    where
        C: FnMut(&NodeConf) -> Result<Arc<dyn KvStore>>,
    {
        if confs.is_empty() || total_weights(confs) == 0 {
            return Err(Error::Config("no cache nodes".to_string()));
        }

        let mut cluster = Self::new();
        for conf in confs {
            let store = connect(conf)?;
            let node = CacheNode::new(
                conf.name.clone(),
                store,
                Arc::clone(&barrier),
                Arc::clone(&stat),
                Arc::clone(&cleaner),
                options.clone(),
            );
            cluster.add_node(Arc::new(node), conf.weight);
        }

        info!(nodes = cluster.len(), cache = stat.name(), "Cache cluster ready");
        Ok(cluster)
    }

    /// Add a node owning a share of the key space proportional to `weight`
    pub fn add_node(&mut self, node: Arc<CacheNode>, weight: u32) {
        self.dispatcher.add_with_weight(node, weight);
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.dispatcher.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dispatcher.is_empty()
    }

    pub fn nodes(&self) -> &[Arc<CacheNode>] {
        self.dispatcher.nodes()
    }

    /// Node owning `key`
    pub fn node_for(&self, key: &str) -> Result<&Arc<CacheNode>> {
        match self.dispatcher.nodes() {
            [only] => Ok(only),
            _ => self.dispatcher.lookup(key).ok_or(Error::NoCacheNode),
        }
    }

    fn group_by_node<K: AsRef<str>>(
        &self,
        keys: &[K],
    ) -> Result<Vec<(Arc<CacheNode>, Vec<String>)>> {
        let mut groups: Vec<(Arc<CacheNode>, Vec<String>)> = Vec::new();
        for key in keys {
            let key = key.as_ref();
            let node = self.node_for(key)?;
            match groups.iter_mut().find(|(n, _)| Arc::ptr_eq(n, node)) {
                Some((_, group)) => group.push(key.to_string()),
                None => groups.push((Arc::clone(node), vec![key.to_string()])),
            }
        }
        Ok(groups)
    }
}

/// Fold per-node results into one, keeping every failure
fn merge_results(groups: &[(Arc<CacheNode>, Vec<String>)], results: Vec<Result<()>>) -> Result<()> {
    let mut batch = BatchError::new();
    for ((node, keys), result) in groups.iter().zip(results) {
        if let Err(e) = result {
            warn!(node = %node, keys = %format_keys(keys), error = %e, "Cache delete failed");
            batch.add(e);
        }
    }
    batch.err()
}

#[async_trait]
impl Cache for CacheCluster {
    async fn del<K>(&self, keys: &[K]) -> Result<()>
    where
        K: AsRef<str> + Sync,
    {
        match keys {
            [] => Ok(()),
            [key] => self.node_for(key.as_ref())?.del(keys).await,
            _ => {
                let groups = self.group_by_node(keys)?;
                let results = join_all(groups.iter().map(|(node, keys)| node.del(keys))).await;
                merge_results(&groups, results)
            }
        }
    }

    async fn get<T>(&self, key: &str) -> Result<T>
    where
        T: DeserializeOwned + Send,
    {
        self.node_for(key)?.get(key).await
    }

    async fn set<T>(&self, key: &str, value: &T) -> Result<()>
    where
        T: Serialize + Sync,
    {
        self.node_for(key)?.set(key, value).await
    }

    async fn set_ex<T>(&self, key: &str, value: &T, ttl: Duration) -> Result<()>
    where
        T: Serialize + Sync,
    {
        self.node_for(key)?.set_ex(key, value, ttl).await
    }

    async fn take<T, F, Fut>(&self, key: &str, query: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
    {
        self.node_for(key)?.take(key, query).await
    }

    async fn take_ex<T, F, Fut>(&self, key: &str, query: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<(T, Duration)>> + Send,
    {
        self.node_for(key)?.take_ex(key, query).await
    }
}

// =============================================================================
// Tests
// =============================================================================
