//! Shard side of the cluster
//!
//! A shard:
//! - Keeps a derived replica of the routing catalog (fed by the change log)
//! - Rejects requests stamped with a routing version it does not hold
//! - Rejects writes to ranges frozen by a migration commit
//! - Stores documents through a [`ShardDataPlane`]

pub mod data;
pub mod replica;

pub use data::{Document, InMemoryShards, ShardDataPlane, UniqueIndex, WriteKind, WriteOp};
pub use replica::ShardLocalReplica;

use crate::common::{Error, Result, ShardId, ShardKey, Version};
use crate::coordinator::metadata::MetadataStore;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// One shard as seen by routers
pub struct ShardNode {
    id: ShardId,
    replica: Arc<ShardLocalReplica>,
    data: Arc<dyn ShardDataPlane>,
    store: Arc<MetadataStore>,
}

impl ShardNode {
    pub fn new(
        id: ShardId,
        replica: Arc<ShardLocalReplica>,
        data: Arc<dyn ShardDataPlane>,
        store: Arc<MetadataStore>,
    ) -> Self {
        Self {
            id,
            replica,
            data,
            store,
        }
    }

    pub fn id(&self) -> &ShardId {
        &self.id
    }

    pub fn replica(&self) -> &Arc<ShardLocalReplica> {
        &self.replica
    }

    /// Validate the router's version against this shard's catalog.
    ///
    /// A router ahead of the shard makes the shard catch up from the change
    /// log first; any remaining mismatch, or a key this shard does not own,
    /// is reported as `StaleShardVersion` with the version the shard holds.
    fn check_version(&self, namespace: &str, key: Option<&ShardKey>, received: Version) -> Result<()> {
        let mut local = self.replica.version_of(namespace);
        if local.map_or(true, |v| v < received) {
            self.replica.catch_up(self.store.changelog());
            local = self.replica.version_of(namespace);
        }

        if local != Some(received) || !self.replica.owns(namespace, key) {
            tracing::debug!(
                shard = %self.id,
                namespace,
                received = %received,
                wanted = ?local,
                "rejecting request with stale routing version"
            );
            return Err(Error::StaleShardVersion {
                namespace: namespace.to_string(),
                shard: self.id.to_string(),
                wanted: local,
                received: Some(received),
            });
        }
        Ok(())
    }

    pub fn write(
        &self,
        namespace: &str,
        key: ShardKey,
        doc: Document,
        version: Version,
    ) -> Result<()> {
        self.check_version(namespace, Some(&key), version)?;
        self.data.upsert(&self.id, namespace, key, doc)
    }

    pub fn delete(&self, namespace: &str, key: &ShardKey, version: Version) -> Result<bool> {
        self.check_version(namespace, Some(key), version)?;
        self.data.remove(&self.id, namespace, key)
    }

    pub fn read(&self, namespace: &str, key: &ShardKey, version: Version) -> Result<Option<Document>> {
        self.check_version(namespace, Some(key), version)?;
        self.data.get(&self.id, namespace, key)
    }
}

/// Shard id → node directory shared by the cluster and its routers
#[derive(Default)]
pub struct ShardNodes {
    nodes: RwLock<BTreeMap<ShardId, Arc<ShardNode>>>,
}

impl ShardNodes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, node: Arc<ShardNode>) {
        self.nodes
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(node.id().clone(), node);
    }

    pub fn get(&self, id: &ShardId) -> Option<Arc<ShardNode>> {
        self.nodes
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .cloned()
    }

    pub fn all(&self) -> Vec<Arc<ShardNode>> {
        self.nodes
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{KeyBound, KeyRange, ManualClock, VersionClock};
    use crate::coordinator::metadata::Mutation;
    use serde_json::json;

    fn setup() -> (Arc<MetadataStore>, ShardNode, ShardNode) {
        let clock = Arc::new(VersionClock::new(Arc::new(ManualClock::new(1))));
        let store = Arc::new(MetadataStore::in_memory(clock));
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

        let data: Arc<dyn ShardDataPlane> = Arc::new(InMemoryShards::new(3));
        let node = |id: &str| {
            ShardNode::new(
                id.into(),
                Arc::new(ShardLocalReplica::new(id.into())),
                data.clone(),
                store.clone(),
            )
        };
        (store.clone(), node("shard0"), node("shard1"))
    }

    #[test]
    fn test_write_with_current_version() {
        let (store, shard0, shard1) = setup();
        let version = store.get_collection("db.c").unwrap().unwrap().version;

        shard1
            .write("db.c", ShardKey::int(5), json!({ "x": 5 }), version)
            .unwrap();
        assert_eq!(
            shard1.read("db.c", &ShardKey::int(5), version).unwrap(),
            Some(json!({ "x": 5 }))
        );

        // Right version, wrong owner.
        let err = shard0
            .write("db.c", ShardKey::int(5), json!({}), version)
            .unwrap_err();
        assert!(matches!(err, Error::StaleShardVersion { .. }));
    }

    #[test]
    fn test_stale_router_version_rejected() {
        let (store, _shard0, shard1) = setup();
        let old = store.get_collection("db.c").unwrap().unwrap().version;
        let new = store
            .compare_and_swap(
                "db.c",
                old,
                Mutation::SplitChunk {
                    at: ShardKey::int(100),
                },
            )
            .unwrap();

        match shard1.write("db.c", ShardKey::int(5), json!({}), old) {
            Err(Error::StaleShardVersion {
                wanted, received, ..
            }) => {
                assert_eq!(wanted, Some(new));
                assert_eq!(received, Some(old));
            }
            other => panic!("expected stale version, got {other:?}"),
        }
    }
}
