//! Cluster context
//!
//! Owns one instance of every component and wires them together. Everything
//! that needs the metadata store, the data plane or the routers gets it from
//! here; there is no global state.

use crate::common::{ClusterConfig, Error, Metrics, Result, ShardId, VersionClock};
use crate::coordinator::consistency::ConsistencyChecker;
use crate::coordinator::drain::DrainCoordinator;
use crate::coordinator::metadata::{MetadataStore, ShardRegistryEntry, ShardState};
use crate::coordinator::migration::ChunkMigrationCoordinator;
use crate::coordinator::range_deleter::RangeDeleter;
use crate::router::{Router, RoutingCache};
use crate::shard::{InMemoryShards, ShardDataPlane, ShardLocalReplica, ShardNode, ShardNodes};
use futures_util::future::join_all;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::task::JoinHandle;

pub struct Cluster {
    config: ClusterConfig,
    store: Arc<MetadataStore>,
    data: Arc<dyn ShardDataPlane>,
    nodes: Arc<ShardNodes>,
    deleter: Arc<RangeDeleter>,
    migrations: Arc<ChunkMigrationCoordinator>,
    drain: Arc<DrainCoordinator>,
    checker: Arc<ConsistencyChecker>,
    caches: RwLock<BTreeMap<String, Arc<RoutingCache>>>,
    metrics: Arc<Metrics>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Cluster {
    /// Wire every component around `store` and `data`.
    ///
    /// Shards already registered in the store (after a reload) get a node
    /// and a replica rebuilt from the change log.
    pub fn new(
        config: ClusterConfig,
        store: Arc<MetadataStore>,
        data: Arc<dyn ShardDataPlane>,
    ) -> Result<Arc<Self>> {
        let metrics = Arc::new(Metrics::new());
        let deleter = Arc::new(
            RangeDeleter::new(store.clone(), data.clone()).with_metrics(metrics.clone()),
        );
        let migrations = Arc::new(
            ChunkMigrationCoordinator::new(
                store.clone(),
                data.clone(),
                deleter.clone(),
                config.clone(),
            )
            .with_metrics(metrics.clone()),
        );
        let drain = Arc::new(DrainCoordinator::new(
            store.clone(),
            migrations.clone(),
            deleter.clone(),
            config.clone(),
        ));
        let checker = Arc::new(
            ConsistencyChecker::new(store.clone(), config.clone()).with_metrics(metrics.clone()),
        );

        let cluster = Arc::new(Self {
            config,
            store,
            data,
            nodes: Arc::new(ShardNodes::new()),
            deleter,
            migrations,
            drain,
            checker,
            caches: RwLock::new(BTreeMap::new()),
            metrics,
            background: Mutex::new(Vec::new()),
        });

        for entry in cluster.store.list_shards()? {
            if entry.state != ShardState::Removed {
                cluster.attach_node(&entry.shard_id);
            }
        }
        Ok(cluster)
    }

    /// Volatile store and in-memory shards
    pub fn in_memory(config: ClusterConfig, clock: Arc<VersionClock>) -> Result<Arc<Self>> {
        let store = Arc::new(MetadataStore::in_memory(clock));
        let data = Arc::new(InMemoryShards::new(config.max_upsert_retries));
        Self::new(config, store, data)
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    pub fn data(&self) -> &Arc<dyn ShardDataPlane> {
        &self.data
    }

    pub fn nodes(&self) -> &Arc<ShardNodes> {
        &self.nodes
    }

    pub fn deleter(&self) -> &Arc<RangeDeleter> {
        &self.deleter
    }

    pub fn migrations(&self) -> &Arc<ChunkMigrationCoordinator> {
        &self.migrations
    }

    pub fn drain(&self) -> &Arc<DrainCoordinator> {
        &self.drain
    }

    pub fn checker(&self) -> &Arc<ConsistencyChecker> {
        &self.checker
    }

    /// Counters shared by every component of this cluster
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Register a shard and bring up its node.
    pub fn add_shard(&self, id: ShardId, connection_info: &str) -> Result<ShardRegistryEntry> {
        let entry = self.store.add_shard(id.clone(), connection_info)?;
        self.attach_node(&id);
        Ok(entry)
    }

    pub fn node(&self, id: &ShardId) -> Option<Arc<ShardNode>> {
        self.nodes.get(id)
    }

    /// Routing cache registered under `name`, created on first use.
    pub fn router_cache(&self, name: &str) -> Arc<RoutingCache> {
        let mut caches = self.caches.write().unwrap_or_else(|p| p.into_inner());
        if let Some(cache) = caches.get(name) {
            return cache.clone();
        }
        let cache = Arc::new(
            RoutingCache::new(name, self.store.clone(), self.config.clone())
                .with_metrics(self.metrics.clone()),
        );
        self.checker.register_cache(cache.clone());
        caches.insert(name.to_string(), cache.clone());
        tracing::debug!(cache = name, "routing cache registered");
        cache
    }

    pub fn router(&self, name: &str) -> Router {
        Router::new(
            self.router_cache(name),
            self.nodes.clone(),
            self.config.clone(),
        )
    }

    pub fn caches(&self) -> Vec<Arc<RoutingCache>> {
        self.caches
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Drop cached routing for `namespace` (or everything) in every router.
    pub fn flush_router_config(&self, namespace: Option<&str>) -> usize {
        let caches = self.caches();
        for cache in &caches {
            match namespace {
                Some(ns) => cache.invalidate(ns),
                None => cache.invalidate_all(),
            }
        }
        caches.len()
    }

    /// Apply every pending change-log entry on every shard.
    pub fn catch_up_replicas(&self) -> usize {
        let applied = self
            .nodes
            .all()
            .iter()
            .map(|node| node.replica().catch_up(self.store.changelog()))
            .sum();
        compact_changelog(&self.store, &self.nodes);
        applied
    }

    /// Bring every replica and every router up to the authoritative record
    /// for `namespace`. Used after a forced overwrite.
    pub async fn force_refresh_everywhere(&self, namespace: &str) -> Result<()> {
        self.catch_up_replicas();
        let caches = self.caches();
        let refreshes = caches.iter().map(|cache| {
            cache.invalidate(namespace);
            cache.refresh_with_backoff(namespace)
        });
        for result in join_all(refreshes).await {
            match result {
                Ok(_) | Err(Error::NamespaceNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        tracing::info!(namespace, "routing refreshed on every router and shard");
        Ok(())
    }

    /// Start the range deleter and one change-log follower per shard.
    pub fn spawn_background(&self) {
        let mut handles = self.background.lock().unwrap_or_else(|p| p.into_inner());
        handles.push(self.deleter.spawn(self.config.range_deleter_interval));
        for node in self.nodes.all() {
            handles.push(node.replica().spawn_follower(self.store.clone()));
        }
        let (store, nodes) = (self.store.clone(), self.nodes.clone());
        let interval = self.config.range_deleter_interval;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                compact_changelog(&store, &nodes);
            }
        }));
        tracing::info!(tasks = handles.len(), "background tasks started");
    }

    pub fn shutdown(&self) {
        let mut handles = self.background.lock().unwrap_or_else(|p| p.into_inner());
        for handle in handles.drain(..) {
            handle.abort();
        }
    }

    fn attach_node(&self, id: &ShardId) {
        if self.nodes.get(id).is_some() {
            return;
        }
        let replica = Arc::new(ShardLocalReplica::new(id.clone()));
        replica.catch_up(self.store.changelog());
        self.checker.register_replica(replica.clone());
        self.nodes.insert(Arc::new(ShardNode::new(
            id.clone(),
            replica,
            self.data.clone(),
            self.store.clone(),
        )));
    }
}

/// Trim change-log events every attached replica has applied.
fn compact_changelog(store: &MetadataStore, nodes: &ShardNodes) -> usize {
    let Some(through) = nodes
        .all()
        .iter()
        .map(|node| node.replica().applied_seq())
        .min()
    else {
        return 0;
    };
    store.changelog().trim(through)
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{KeyRange, ManualClock, ShardKey};
    use serde_json::json;

    fn cluster() -> Arc<Cluster> {
        let clock = Arc::new(VersionClock::new(Arc::new(ManualClock::new(1_000))));
        let cluster = Cluster::in_memory(ClusterConfig::default(), clock).unwrap();
        cluster.add_shard("shard0".into(), "h0").unwrap();
        cluster.add_shard("shard1".into(), "h1").unwrap();
        cluster
    }

    #[tokio::test]
    async fn test_router_writes_through_nodes() {
        let cluster = cluster();
        cluster
            .store()
            .create_collection(
                "db.c",
                vec!["x".into()],
                vec![(KeyRange::full(), "shard1".into())],
            )
            .unwrap();

        let router = cluster.router("mongos-1");
        router
            .upsert("db.c", ShardKey::int(7), json!({"x": 7}))
            .await
            .unwrap();
        let found = router.find("db.c", &ShardKey::int(7)).await.unwrap();
        assert_eq!(found, Some(json!({"x": 7})));
        assert_eq!(cluster.caches().len(), 1);
    }

    #[tokio::test]
    async fn test_flush_router_config() {
        let cluster = cluster();
        cluster.store().create_database("db", None).unwrap();
        let cache = cluster.router_cache("r");
        cache.get("db").await.unwrap();
        assert_eq!(cache.snapshot().len(), 1);

        assert_eq!(cluster.flush_router_config(None), 1);
        assert!(cache.snapshot().is_empty());
    }

    #[test]
    fn test_reload_attaches_registered_shards() {
        let cluster = cluster();
        let store = cluster.store().clone();
        let data = cluster.data().clone();
        let reloaded = Cluster::new(ClusterConfig::default(), store, data).unwrap();
        assert_eq!(reloaded.nodes().all().len(), 2);
    }
}
