//! Routing cache
//!
//! Read-through, per-process cache of namespace records. Lookups never touch
//! the metadata store. Refreshes of the same namespace are coalesced. An
//! entry is only replaced by a record of the same kind with an equal or newer
//! version, or by a record of the other kind (a collection sharded or dropped
//! under a cached database entry). A namespace that no longer exists is
//! evicted.

use crate::common::{
    retry_with_backoff, ClusterConfig, Error, Metrics, Result, ShardId, ShardKey, Version,
};
use crate::coordinator::metadata::{MetadataStore, NamespaceEntry};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq)]
pub struct CachedEntry {
    pub entry: NamespaceEntry,
    pub fetched_at_ms: u64,
}

impl CachedEntry {
    pub fn version(&self) -> Version {
        self.entry.version()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Hit(CachedEntry),
    Miss,
}

/// Where a single-key request should go
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    pub namespace: String,
    pub shard: ShardId,
    pub version: Version,
}

pub struct RoutingCache {
    name: String,
    store: Arc<MetadataStore>,
    config: ClusterConfig,
    entries: RwLock<HashMap<String, CachedEntry>>,
    gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    store_reads: AtomicU64,
    metrics: Arc<Metrics>,
}

impl RoutingCache {
    pub fn new(name: impl Into<String>, store: Arc<MetadataStore>, config: ClusterConfig) -> Self {
        Self {
            name: name.into(),
            store,
            config,
            entries: RwLock::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            store_reads: AtomicU64::new(0),
            metrics: Arc::new(Metrics::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cached entry for `namespace`, or `Miss` if absent or expired.
    pub fn lookup(&self, namespace: &str) -> Lookup {
        let now = self.store.clock().now_millis();
        let ttl = crate::common::duration_millis(self.config.routing_cache_ttl);
        match self.entries().get(namespace) {
            Some(cached) if now.saturating_sub(cached.fetched_at_ms) < ttl => {
                Lookup::Hit(cached.clone())
            }
            _ => Lookup::Miss,
        }
    }

    pub fn invalidate(&self, namespace: &str) {
        if self.entries_mut().remove(namespace).is_some() {
            tracing::debug!(cache = %self.name, namespace, "routing entry invalidated");
        }
    }

    pub fn invalidate_all(&self) {
        self.entries_mut().clear();
        tracing::debug!(cache = %self.name, "routing cache flushed");
    }

    /// Re-read `namespace` from the metadata store (single attempt).
    ///
    /// Concurrent calls for one namespace wait on the same gate; a caller that
    /// finds a newer entry installed while it waited returns that entry
    /// without reading the store again.
    pub async fn refresh(&self, namespace: &str) -> Result<CachedEntry> {
        let seen = self.cached_version(namespace);
        let gate = self.gate(namespace);
        let refreshed = {
            let _guard = gate.lock().await;
            self.refresh_gated(namespace, seen)
        };
        self.release_gate(namespace, gate);
        refreshed
    }

    fn refresh_gated(&self, namespace: &str, seen: Option<Version>) -> Result<CachedEntry> {
        if let Some(current) = self.entries().get(namespace) {
            if seen.map_or(true, |v| current.version() > v) {
                return Ok(current.clone());
            }
        }

        self.store_reads.fetch_add(1, Ordering::Relaxed);
        self.metrics.routing_refreshes.inc();
        let Some(fresh) = self.store.read(namespace)? else {
            self.invalidate(namespace);
            return Err(Error::NamespaceNotFound(namespace.to_string()));
        };
        let fresh = CachedEntry {
            entry: fresh,
            fetched_at_ms: self.store.clock().now_millis(),
        };

        let mut entries = self.entries_mut();
        match entries.get(namespace) {
            Some(current)
                if current.entry.same_kind(&fresh.entry) && current.version() > fresh.version() =>
            {
                tracing::debug!(
                    cache = %self.name,
                    namespace,
                    cached = %current.version(),
                    read = %fresh.version(),
                    "kept newer cached entry"
                );
                Ok(current.clone())
            }
            _ => {
                tracing::debug!(cache = %self.name, namespace, version = %fresh.version(), "routing entry refreshed");
                entries.insert(namespace.to_string(), fresh.clone());
                Ok(fresh)
            }
        }
    }

    /// `refresh` retried with exponential backoff while the store is unreachable.
    pub async fn refresh_with_backoff(&self, namespace: &str) -> Result<CachedEntry> {
        retry_with_backoff(
            "routing refresh",
            || self.refresh(namespace),
            self.config.refresh_max_retries,
            self.config.refresh_initial_backoff,
        )
        .await
    }

    /// Cached entry, refreshing on a miss.
    pub async fn get(&self, namespace: &str) -> Result<CachedEntry> {
        match self.lookup(namespace) {
            Lookup::Hit(cached) => Ok(cached),
            Lookup::Miss => self.refresh_with_backoff(namespace).await,
        }
    }

    /// React to a shard reporting `StaleShardVersion`: drop the entry and
    /// refresh in the background.
    pub fn on_stale_shard_version(
        self: &Arc<Self>,
        namespace: &str,
        wanted: Option<Version>,
    ) -> JoinHandle<()> {
        tracing::debug!(cache = %self.name, namespace, wanted = ?wanted, "stale shard version reported");
        self.metrics.stale_version_signals.inc();
        let stale = match (self.cached_version(namespace), wanted) {
            (Some(cached), Some(wanted)) => cached < wanted,
            _ => true,
        };
        if stale {
            self.invalidate(namespace);
        }

        let cache = self.clone();
        let namespace = namespace.to_string();
        tokio::spawn(async move {
            if let Err(e) = cache.refresh_with_backoff(&namespace).await {
                tracing::warn!(cache = %cache.name, namespace = %namespace, error = %e, "background refresh failed");
            }
        })
    }

    /// Shard owning `key`, or the database primary for unsharded namespaces.
    pub async fn route(&self, namespace: &str, key: &ShardKey) -> Result<RouteTarget> {
        self.store.ensure_not_quarantined(namespace)?;
        let cached = self.get(namespace).await?;
        let shard = match &cached.entry {
            NamespaceEntry::Collection(coll) => coll
                .chunk_for_key(key)
                .map(|c| c.owning_shard.clone())
                .ok_or_else(|| Error::ChunkNotFound {
                    namespace: namespace.to_string(),
                    range: key.to_string(),
                })?,
            NamespaceEntry::Database(db) => db.primary_shard.clone(),
        };
        Ok(RouteTarget {
            namespace: namespace.to_string(),
            shard,
            version: cached.version(),
        })
    }

    /// Every shard a broadcast over `namespace` must reach.
    pub async fn targets(&self, namespace: &str) -> Result<(BTreeSet<ShardId>, Version)> {
        self.store.ensure_not_quarantined(namespace)?;
        let cached = self.get(namespace).await?;
        let shards = match &cached.entry {
            NamespaceEntry::Collection(coll) => coll.shards(),
            NamespaceEntry::Database(db) => BTreeSet::from([db.primary_shard.clone()]),
        };
        Ok((shards, cached.version()))
    }

    /// Every cached entry by namespace, for consistency checks.
    pub fn snapshot(&self) -> BTreeMap<String, CachedEntry> {
        self.entries()
            .iter()
            .map(|(ns, cached)| (ns.clone(), cached.clone()))
            .collect()
    }

    /// Number of metadata store reads issued by refreshes
    pub fn store_reads(&self) -> u64 {
        self.store_reads.load(Ordering::Relaxed)
    }

    fn cached_version(&self, namespace: &str) -> Option<Version> {
        self.entries().get(namespace).map(CachedEntry::version)
    }

    fn gate(&self, namespace: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.gates
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(namespace.to_string())
            .or_default()
            .clone()
    }

    /// Drop the gate once nobody else holds or waits on it.
    fn release_gate(&self, namespace: &str, gate: Arc<tokio::sync::Mutex<()>>) {
        let mut gates = self.gates.lock().unwrap_or_else(|p| p.into_inner());
        // One reference in the map, one here.
        if Arc::strong_count(&gate) == 2 {
            gates.remove(namespace);
        }
    }

    fn entries(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, CachedEntry>> {
        self.entries.read().unwrap_or_else(|p| p.into_inner())
    }

    fn entries_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, CachedEntry>> {
        self.entries.write().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{KeyBound, KeyRange, ManualClock, VersionClock};
    use crate::coordinator::metadata::Mutation;
    use std::time::Duration;

    fn setup() -> (Arc<ManualClock>, Arc<MetadataStore>, Arc<RoutingCache>) {
        let wall = Arc::new(ManualClock::new(1_000));
        let store = Arc::new(MetadataStore::in_memory(Arc::new(VersionClock::new(
            wall.clone(),
        ))));
        store.add_shard("shard0".into(), "h0").unwrap();
        store.add_shard("shard1".into(), "h1").unwrap();
        store
            .create_collection(
                "db.c",
                vec!["x".into()],
                vec![
                    (KeyRange::new(KeyBound::MinKey, 0), "shard0".into()),
                    (KeyRange::new(0, KeyBound::MaxKey), "shard1".into()),
                ],
            )
            .unwrap();
        let config = ClusterConfig {
            refresh_max_retries: 2,
            refresh_initial_backoff: Duration::from_millis(1),
            routing_cache_ttl: Duration::from_secs(60),
            ..Default::default()
        };
        let cache = Arc::new(RoutingCache::new("router-1", store.clone(), config));
        (wall, store, cache)
    }

    #[tokio::test]
    async fn test_miss_refresh_hit() {
        let (_wall, _store, cache) = setup();
        assert_eq!(cache.lookup("db.c"), Lookup::Miss);

        let target = cache.route("db.c", &ShardKey::int(7)).await.unwrap();
        assert_eq!(target.shard, ShardId::from("shard1"));
        assert!(matches!(cache.lookup("db.c"), Lookup::Hit(_)));
        assert_eq!(cache.store_reads(), 1);

        let target = cache.route("db.c", &ShardKey::int(-7)).await.unwrap();
        assert_eq!(target.shard, ShardId::from("shard0"));
        assert_eq!(cache.store_reads(), 1);
    }

    #[tokio::test]
    async fn test_targets_cover_every_owner() {
        let (_wall, store, cache) = setup();
        let (shards, version) = cache.targets("db.c").await.unwrap();
        assert_eq!(shards.len(), 2);
        assert_eq!(Some(version), store.get_collection("db.c").unwrap().map(|c| c.version));

        let (shards, _) = cache.targets("db.unsharded").await.unwrap();
        assert_eq!(shards, BTreeSet::from([ShardId::from("shard0")]));
    }

    #[tokio::test]
    async fn test_sharding_replaces_cached_database_entry() {
        let (_wall, store, cache) = setup();
        let db = store.get_database("db").unwrap().unwrap();
        store
            .compare_and_swap("db", db.version, Mutation::MovePrimary { to: "shard1".into() })
            .unwrap();
        let cached = cache.refresh("db.other").await.unwrap();
        assert!(matches!(cached.entry, NamespaceEntry::Database(_)));
        assert_eq!(cached.version().last_mod, 2);

        let coll = store
            .shard_collection("db.other", vec!["x".into()], vec![])
            .unwrap();
        assert_eq!(coll.version.last_mod, 1);

        cache
            .on_stale_shard_version("db.other", Some(coll.version))
            .await
            .unwrap();
        match cache.lookup("db.other") {
            Lookup::Hit(hit) => assert_eq!(hit.entry, NamespaceEntry::Collection(coll.clone())),
            Lookup::Miss => panic!("expected the collection to be cached"),
        }
    }

    #[tokio::test]
    async fn test_recreated_collection_replaces_cached_entry() {
        let (_wall, store, cache) = setup();
        for at in [10, 20] {
            let coll = store.get_collection("db.c").unwrap().unwrap();
            store
                .compare_and_swap("db.c", coll.version, Mutation::SplitChunk { at: ShardKey::int(at) })
                .unwrap();
        }
        let old = cache.refresh("db.c").await.unwrap();
        assert_eq!(old.version().last_mod, 3);

        let coll = store.get_collection("db.c").unwrap().unwrap();
        store
            .compare_and_swap("db.c", coll.version, Mutation::DropCollection)
            .unwrap();
        let after_drop = cache.refresh("db.c").await.unwrap();
        assert!(matches!(after_drop.entry, NamespaceEntry::Database(_)));

        let recreated = store
            .create_collection("db.c", vec!["x".into()], vec![(KeyRange::full(), "shard1".into())])
            .unwrap();
        assert_eq!(recreated.version.last_mod, 1);
        assert!(recreated.version > old.version());

        let fresh = cache.refresh("db.c").await.unwrap();
        assert_eq!(fresh.entry, NamespaceEntry::Collection(recreated));
        let target = cache.route("db.c", &ShardKey::int(-5)).await.unwrap();
        assert_eq!(target.shard, ShardId::from("shard1"));
    }

    #[tokio::test]
    async fn test_dropped_database_is_evicted() {
        let (_wall, store, cache) = setup();
        cache.refresh("db.c").await.unwrap();
        let coll = store.get_collection("db.c").unwrap().unwrap();
        store
            .compare_and_swap("db.c", coll.version, Mutation::DropCollection)
            .unwrap();
        let db = store.get_database("db").unwrap().unwrap();
        store
            .compare_and_swap("db", db.version, Mutation::DropDatabase)
            .unwrap();

        let err = cache.refresh("db.c").await.unwrap_err();
        assert_eq!(err.kind(), crate::common::ErrorKind::NamespaceNotFound);
        assert_eq!(cache.lookup("db.c"), Lookup::Miss);
    }

    #[tokio::test]
    async fn test_refresh_gates_are_released() {
        let (_wall, store, cache) = setup();
        for i in 0..20 {
            let ns = format!("db.unsharded{}", i);
            cache.refresh(&ns).await.unwrap();
        }
        let coll = store.get_collection("db.c").unwrap().unwrap();
        let refreshes = (0..8).map(|_| cache.refresh("db.c"));
        for cached in futures_util::future::join_all(refreshes).await {
            assert_eq!(cached.unwrap().version(), coll.version);
        }
        assert!(cache.gates.lock().unwrap().is_empty());
        assert_eq!(cache.snapshot().len(), 21);
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let (wall, _store, cache) = setup();
        cache.refresh("db.c").await.unwrap();
        wall.advance(Duration::from_secs(61));
        assert_eq!(cache.lookup("db.c"), Lookup::Miss);
    }

    #[tokio::test]
    async fn test_unreachable_store_times_out() {
        let (_wall, store, cache) = setup();
        store.set_reachable(false);

        let err = cache.refresh("db.c").await.unwrap_err();
        assert!(matches!(err, Error::MetadataUnavailable(_)));
        let err = cache.refresh_with_backoff("db.c").await.unwrap_err();
        assert!(matches!(err, Error::OperationTimedOut(_)));

        store.set_reachable(true);
        assert!(cache.refresh_with_backoff("db.c").await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_coalesce() {
        let (_wall, _store, cache) = setup();
        // Hold the gate so every refresh queues behind the first one.
        let gate = cache.gate("db.c");
        let guard = gate.lock().await;
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.refresh("db.c").await.map(|e| e.version()) })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);

        let mut versions = Vec::new();
        for task in tasks {
            versions.push(task.await.unwrap().unwrap());
        }
        assert!(versions.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(cache.store_reads(), 1);
    }

    #[tokio::test]
    async fn test_stale_signal_refreshes() {
        let (_wall, store, cache) = setup();
        let old = cache.refresh("db.c").await.unwrap().version();
        let new = store
            .compare_and_swap(
                "db.c",
                old,
                Mutation::SplitChunk {
                    at: ShardKey::int(10),
                },
            )
            .unwrap();

        cache
            .on_stale_shard_version("db.c", Some(new))
            .await
            .unwrap();
        match cache.lookup("db.c") {
            Lookup::Hit(cached) => assert_eq!(cached.version(), new),
            Lookup::Miss => panic!("expected refreshed entry"),
        }
    }
}
