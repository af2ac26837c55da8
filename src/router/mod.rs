//! Query routing
//!
//! The [`Router`] is the facade the query engine uses to reach shards: it
//! resolves targets through a [`RoutingCache`] and, when a shard answers
//! `StaleShardVersion`, refreshes and retries a bounded number of times.

pub mod cache;

pub use cache::{CachedEntry, Lookup, RouteTarget, RoutingCache};

use crate::common::{retry_with_backoff, ClusterConfig, Error, Result, ShardKey};
use crate::shard::{Document, ShardNode, ShardNodes};
use std::sync::Arc;

pub struct Router {
    cache: Arc<RoutingCache>,
    nodes: Arc<ShardNodes>,
    config: ClusterConfig,
}

impl Router {
    pub fn new(cache: Arc<RoutingCache>, nodes: Arc<ShardNodes>, config: ClusterConfig) -> Self {
        Self {
            cache,
            nodes,
            config,
        }
    }

    pub fn cache(&self) -> &Arc<RoutingCache> {
        &self.cache
    }

    /// Insert or replace the document with shard key `key`.
    pub async fn upsert(&self, namespace: &str, key: ShardKey, doc: Document) -> Result<()> {
        let (key, doc) = (&key, &doc);
        retry_with_backoff(
            "routed upsert",
            || {
                self.with_target(namespace, key, move |node, version| {
                    node.write(namespace, key.clone(), doc.clone(), version)
                })
            },
            self.config.refresh_max_retries,
            self.config.refresh_initial_backoff,
        )
        .await
    }

    pub async fn delete(&self, namespace: &str, key: &ShardKey) -> Result<bool> {
        retry_with_backoff(
            "routed delete",
            || {
                self.with_target(namespace, key, move |node, version| {
                    node.delete(namespace, key, version)
                })
            },
            self.config.refresh_max_retries,
            self.config.refresh_initial_backoff,
        )
        .await
    }

    pub async fn find(&self, namespace: &str, key: &ShardKey) -> Result<Option<Document>> {
        self.with_target(namespace, key, |node, version| {
            node.read(namespace, key, version)
        })
        .await
    }

    /// Route to the owner of `key` and run `op`, refreshing the cache after
    /// each stale-version rejection.
    async fn with_target<T>(
        &self,
        namespace: &str,
        key: &ShardKey,
        op: impl Fn(&ShardNode, crate::common::Version) -> Result<T>,
    ) -> Result<T> {
        let mut attempt = 0;
        loop {
            let target = self.cache.route(namespace, key).await?;
            let node = self
                .nodes
                .get(&target.shard)
                .ok_or_else(|| Error::ShardNotFound(target.shard.to_string()))?;

            match op(&node, target.version) {
                Err(Error::StaleShardVersion { wanted, .. })
                    if attempt < self.config.stale_version_max_retries =>
                {
                    attempt += 1;
                    tracing::debug!(
                        namespace,
                        shard = %target.shard,
                        sent = %target.version,
                        wanted = ?wanted,
                        attempt,
                        "retrying after stale shard version"
                    );
                    self.cache.invalidate(namespace);
                    self.cache.refresh_with_backoff(namespace).await?;
                }
                result => return result,
            }
        }
    }
}
