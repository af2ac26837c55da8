//! Shard-local replica of the routing catalog
//!
//! Each shard keeps its own copy of the metadata it needs to validate
//! incoming requests. The copy is derived: it is only ever updated by
//! replaying the config server's change log, never written directly.

use crate::common::{split_namespace, ShardId, ShardKey, Version};
use crate::coordinator::changelog::{Change, ChangeEvent, ChangeLog};
use crate::coordinator::metadata::{
    CollectionRecord, DatabaseRecord, MetadataStore, ShardRegistryEntry,
};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tokio::task::JoinHandle;

#[derive(Default)]
struct Catalog {
    applied_seq: u64,
    databases: BTreeMap<String, DatabaseRecord>,
    collections: BTreeMap<String, CollectionRecord>,
    shards: BTreeMap<ShardId, ShardRegistryEntry>,
}

impl Catalog {
    fn apply_change(&mut self, change: &Change) {
        match change {
            Change::DatabaseUpserted(db) => {
                self.databases.insert(db.name.clone(), db.clone());
            }
            Change::DatabaseDropped { name } => {
                self.databases.remove(name);
            }
            Change::CollectionUpserted(coll) => {
                self.collections.insert(coll.namespace.clone(), coll.clone());
            }
            Change::CollectionDropped { namespace } => {
                self.collections.remove(namespace);
            }
            Change::ShardUpserted(entry) => {
                self.shards.insert(entry.shard_id.clone(), entry.clone());
            }
        }
    }
}

pub struct ShardLocalReplica {
    shard_id: ShardId,
    catalog: RwLock<Catalog>,
}

impl ShardLocalReplica {
    pub fn new(shard_id: ShardId) -> Self {
        Self {
            shard_id,
            catalog: RwLock::new(Catalog::default()),
        }
    }

    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    /// Sequence number of the last change-log event applied
    pub fn applied_seq(&self) -> u64 {
        self.read().applied_seq
    }

    /// Apply one event. Events at or below `applied_seq` are ignored, so
    /// redelivery is harmless. Returns whether the event was applied.
    pub fn apply(&self, event: &ChangeEvent) -> bool {
        let mut catalog = self.catalog.write().unwrap_or_else(|p| p.into_inner());
        if event.seq <= catalog.applied_seq {
            return false;
        }
        if event.seq != catalog.applied_seq + 1 {
            tracing::warn!(
                shard = %self.shard_id,
                expected = catalog.applied_seq + 1,
                got = event.seq,
                "change log gap, skipping event"
            );
            return false;
        }

        catalog.apply_change(&event.change);
        catalog.applied_seq = event.seq;
        true
    }

    /// Pull and apply every event this replica has not seen yet.
    ///
    /// A replica behind the log's trimmed point first reloads the compacted
    /// base.
    pub fn catch_up(&self, log: &ChangeLog) -> usize {
        if self.applied_seq() < log.trimmed_through() {
            let (through, base) = log.compacted();
            self.reload(through, &base);
        }
        let events = log.since(self.applied_seq());
        let applied = events.iter().filter(|e| self.apply(e)).count();
        if applied > 0 {
            tracing::debug!(shard = %self.shard_id, applied, seq = self.applied_seq(), "replica caught up");
        }
        applied
    }

    /// Replace the whole catalog with `base`, current as of `through`.
    fn reload(&self, through: u64, base: &[Change]) {
        let mut catalog = Catalog {
            applied_seq: through,
            ..Catalog::default()
        };
        for change in base {
            catalog.apply_change(change);
        }
        let mut current = self.catalog.write().unwrap_or_else(|p| p.into_inner());
        if current.applied_seq >= through {
            return;
        }
        *current = catalog;
        tracing::info!(shard = %self.shard_id, seq = through, records = base.len(), "replica reloaded from compacted change log");
    }

    /// Follow the store's change log until the task is aborted.
    pub fn spawn_follower(self: &Arc<Self>, store: Arc<MetadataStore>) -> JoinHandle<()> {
        let replica = self.clone();
        tokio::spawn(async move {
            let mut rx = store.changelog().subscribe();
            loop {
                replica.catch_up(store.changelog());
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    pub fn database(&self, name: &str) -> Option<DatabaseRecord> {
        self.read().databases.get(name).cloned()
    }

    pub fn collection(&self, namespace: &str) -> Option<CollectionRecord> {
        self.read().collections.get(namespace).cloned()
    }

    pub fn databases(&self) -> Vec<DatabaseRecord> {
        self.read().databases.values().cloned().collect()
    }

    pub fn collections(&self) -> Vec<CollectionRecord> {
        self.read().collections.values().cloned().collect()
    }

    pub fn shard_entry(&self, shard: &ShardId) -> Option<ShardRegistryEntry> {
        self.read().shards.get(shard).cloned()
    }

    /// Routing version this shard holds for `namespace`: the collection
    /// version when sharded, otherwise the database version.
    pub fn version_of(&self, namespace: &str) -> Option<Version> {
        let catalog = self.read();
        if let Some(coll) = catalog.collections.get(namespace) {
            return Some(coll.version);
        }
        let (db, _) = split_namespace(namespace);
        catalog.databases.get(db).map(|d| d.version)
    }

    /// Does this shard believe it owns `key` in `namespace`?
    pub fn owns(&self, namespace: &str, key: Option<&ShardKey>) -> bool {
        let catalog = self.read();
        if let Some(coll) = catalog.collections.get(namespace) {
            return match key {
                Some(key) => coll
                    .chunk_for_key(key)
                    .is_some_and(|c| c.owning_shard == self.shard_id),
                None => coll.chunks.iter().any(|c| c.owning_shard == self.shard_id),
            };
        }
        let (db, _) = split_namespace(namespace);
        catalog
            .databases
            .get(db)
            .is_some_and(|d| d.primary_shard == self.shard_id)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Catalog> {
        self.catalog.read().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{HlcTimestamp, ManualClock, VersionClock};

    fn db_event(seq: u64, primary: &str, last_mod: u64) -> ChangeEvent {
        let stamp = HlcTimestamp::new(seq, 0);
        ChangeEvent {
            seq,
            stamp,
            change: Change::DatabaseUpserted(DatabaseRecord {
                name: "test".into(),
                primary_shard: primary.into(),
                version: Version::new(HlcTimestamp::new(1, 0), last_mod, stamp),
            }),
        }
    }

    #[test]
    fn test_apply_in_order_and_ignore_redelivery() {
        let replica = ShardLocalReplica::new("shard0".into());
        assert!(replica.apply(&db_event(1, "shard0", 1)));
        assert!(!replica.apply(&db_event(1, "shard0", 1)));
        assert!(!replica.apply(&db_event(3, "shard1", 3)));
        assert!(replica.apply(&db_event(2, "shard1", 2)));

        assert_eq!(replica.applied_seq(), 2);
        assert_eq!(
            replica.database("test").unwrap().primary_shard,
            ShardId::from("shard1")
        );
        assert!(!replica.owns("test.unsharded", None));
    }

    #[tokio::test]
    async fn test_follower_tracks_store() {
        let clock = Arc::new(VersionClock::new(Arc::new(ManualClock::new(1))));
        let store = Arc::new(MetadataStore::in_memory(clock));
        store.add_shard("shard0".into(), "h0").unwrap();

        let replica = Arc::new(ShardLocalReplica::new("shard0".into()));
        let follower = replica.spawn_follower(store.clone());

        let db = store.create_database("test", None).unwrap();
        for _ in 0..50 {
            if replica.version_of("test.c") == Some(db.version) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(replica.version_of("test.c"), Some(db.version));
        assert!(replica.owns("test.c", None));
        assert_eq!(
            replica.shard_entry(&"shard0".into()).map(|e| e.connection_info),
            Some("h0".to_string())
        );
        follower.abort();
    }

    #[test]
    fn test_replica_behind_trimmed_log_reloads() {
        let clock = Arc::new(VersionClock::new(Arc::new(ManualClock::new(1))));
        let store = MetadataStore::in_memory(clock);
        store.add_shard("shard0".into(), "h0").unwrap();
        store.create_database("gone", Some("shard0".into())).unwrap();
        let gone = store.get_database("gone").unwrap().unwrap();
        store
            .compare_and_swap("gone", gone.version, crate::coordinator::metadata::Mutation::DropDatabase)
            .unwrap();
        let kept = store.create_database("kept", Some("shard0".into())).unwrap();

        let early = ShardLocalReplica::new("shard0".into());
        early.catch_up(store.changelog());
        let log = store.changelog();
        log.trim(log.last_seq() - 1);
        let late = store.create_database("late", Some("shard0".into())).unwrap();

        let fresh = ShardLocalReplica::new("shard0".into());
        assert!(fresh.catch_up(store.changelog()) >= 1);
        assert_eq!(fresh.applied_seq(), store.changelog().last_seq());
        assert_eq!(fresh.database("kept"), Some(kept));
        assert_eq!(fresh.database("late"), Some(late));
        assert!(fresh.database("gone").is_none());
        assert!(fresh.shard_entry(&"shard0".into()).is_some());

        // A replica that was already past the trimmed point just continues.
        assert_eq!(early.catch_up(store.changelog()), 1);
        assert_eq!(early.databases(), fresh.databases());
    }
}
