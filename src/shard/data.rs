//! Shard data plane
//!
//! Migrations only talk to shard storage through [`ShardDataPlane`]: copy a
//! range, tail the donor's write log, pause a range for the commit, delete
//! orphans. [`InMemoryShards`] is the in-process implementation used by the
//! config server and the tests.

use crate::common::{Error, KeyRange, Result, ShardId, ShardKey};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::time::Duration;

/// Stored document body
pub type Document = serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteKind {
    Upsert(Document),
    Delete,
}

/// One entry of a shard's write log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteOp {
    pub op_id: u64,
    pub namespace: String,
    pub key: ShardKey,
    pub kind: WriteKind,
}

/// Storage operations a chunk migration needs from shards.
pub trait ShardDataPlane: Send + Sync + 'static {
    /// Id of the newest write on `shard` (0 when it has none).
    fn last_op(&self, shard: &ShardId) -> Result<u64>;

    /// Up to `limit` documents of `range`, ordered by key, strictly after `after`.
    fn read_range(
        &self,
        shard: &ShardId,
        namespace: &str,
        range: &KeyRange,
        after: Option<&ShardKey>,
        limit: usize,
    ) -> Result<Vec<(ShardKey, Document)>>;

    /// Install cloned documents without index or pause checks.
    fn insert_batch(
        &self,
        shard: &ShardId,
        namespace: &str,
        docs: Vec<(ShardKey, Document)>,
    ) -> Result<()>;

    /// Writes to `range` logged on `shard` after `after_op`, in order.
    fn writes_since(
        &self,
        shard: &ShardId,
        namespace: &str,
        range: &KeyRange,
        after_op: u64,
    ) -> Result<Vec<WriteOp>>;

    /// Replay donor writes on the recipient.
    fn apply_writes(&self, shard: &ShardId, namespace: &str, writes: Vec<WriteOp>) -> Result<()>;

    /// Block (or unblock) client writes to `range` on `shard`.
    fn set_range_paused(
        &self,
        shard: &ShardId,
        namespace: &str,
        range: &KeyRange,
        paused: bool,
    ) -> Result<()>;

    /// Physically delete every document of `range`. Returns the count removed.
    fn delete_range(&self, shard: &ShardId, namespace: &str, range: &KeyRange) -> Result<usize>;

    fn count_in_range(&self, shard: &ShardId, namespace: &str, range: &KeyRange) -> Result<usize>;

    /// Client upsert by shard key.
    fn upsert(&self, shard: &ShardId, namespace: &str, key: ShardKey, doc: Document) -> Result<()>;

    /// Client delete by shard key. Returns whether a document was removed.
    fn remove(&self, shard: &ShardId, namespace: &str, key: &ShardKey) -> Result<bool>;

    fn get(&self, shard: &ShardId, namespace: &str, key: &ShardKey) -> Result<Option<Document>>;
}

/// Unique secondary index over one top-level document field.
///
/// With a partial filter, only documents whose `filter_field` equals
/// `filter_value` take part in the uniqueness check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniqueIndex {
    pub field: String,
    pub partial_filter: Option<(String, serde_json::Value)>,
}

impl UniqueIndex {
    fn covers(&self, doc: &Document) -> bool {
        match &self.partial_filter {
            Some((field, value)) => doc.get(field) == Some(value),
            None => true,
        }
    }

    fn indexed_value<'a>(&self, doc: &'a Document) -> Option<&'a serde_json::Value> {
        if !self.covers(doc) {
            return None;
        }
        doc.get(&self.field)
    }
}

#[derive(Default)]
struct ShardData {
    collections: HashMap<String, BTreeMap<ShardKey, Document>>,
    oplog: Vec<WriteOp>,
    paused: Vec<(String, KeyRange)>,
    unreachable: bool,
}

impl ShardData {
    fn check_reachable(&self, shard: &ShardId) -> Result<()> {
        if self.unreachable {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("shard {} is unreachable", shard),
            )));
        }
        Ok(())
    }

    fn log(&mut self, namespace: &str, key: ShardKey, kind: WriteKind) {
        let op_id = self.oplog.len() as u64 + 1;
        self.oplog.push(WriteOp {
            op_id,
            namespace: namespace.to_string(),
            key,
            kind,
        });
    }

    fn apply(&mut self, namespace: &str, key: ShardKey, kind: WriteKind) {
        let docs = self.collections.entry(namespace.to_string()).or_default();
        match &kind {
            WriteKind::Upsert(doc) => {
                docs.insert(key.clone(), doc.clone());
            }
            WriteKind::Delete => {
                docs.remove(&key);
            }
        }
        self.log(namespace, key, kind);
    }
}

/// In-process shard storage keyed by shard id
pub struct InMemoryShards {
    shards: RwLock<HashMap<ShardId, ShardData>>,
    indexes: RwLock<HashMap<String, UniqueIndex>>,
    max_upsert_retries: u32,
    upsert_retry_delay: Duration,
}

impl InMemoryShards {
    pub fn new(max_upsert_retries: u32) -> Self {
        Self {
            shards: RwLock::new(HashMap::new()),
            indexes: RwLock::new(HashMap::new()),
            max_upsert_retries: max_upsert_retries.max(1),
            upsert_retry_delay: Duration::ZERO,
        }
    }

    /// Wait `delay` between duplicate-key retries instead of just yielding.
    pub fn with_upsert_retry_delay(mut self, delay: Duration) -> Self {
        self.upsert_retry_delay = delay;
        self
    }

    fn pause_before_retry(&self) {
        if self.upsert_retry_delay.is_zero() {
            std::thread::yield_now();
        } else {
            std::thread::sleep(self.upsert_retry_delay);
        }
    }

    /// Declare a unique index on every shard's copy of `namespace`.
    pub fn create_unique_index(&self, namespace: &str, index: UniqueIndex) {
        tracing::info!(namespace, field = %index.field, partial = index.partial_filter.is_some(), "unique index created");
        self.indexes
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(namespace.to_string(), index);
    }

    /// Simulate a network partition between the config server and `shard`.
    pub fn set_unreachable(&self, shard: &ShardId, unreachable: bool) {
        let mut shards = self.shards.write().unwrap_or_else(|p| p.into_inner());
        shards.entry(shard.clone()).or_default().unreachable = unreachable;
    }

    /// Every document of `namespace` on `shard`.
    pub fn documents(&self, shard: &ShardId, namespace: &str) -> Vec<(ShardKey, Document)> {
        let shards = self.shards.read().unwrap_or_else(|p| p.into_inner());
        shards
            .get(shard)
            .and_then(|s| s.collections.get(namespace))
            .map(|docs| docs.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    fn with_shard<T>(&self, shard: &ShardId, f: impl FnOnce(&ShardData) -> T) -> Result<T> {
        let shards = self.shards.read().unwrap_or_else(|p| p.into_inner());
        match shards.get(shard) {
            Some(data) => {
                data.check_reachable(shard)?;
                Ok(f(data))
            }
            None => Ok(f(&ShardData::default())),
        }
    }

    fn with_shard_mut<T>(
        &self,
        shard: &ShardId,
        f: impl FnOnce(&mut ShardData) -> Result<T>,
    ) -> Result<T> {
        let mut shards = self.shards.write().unwrap_or_else(|p| p.into_inner());
        let data = shards.entry(shard.clone()).or_default();
        data.check_reachable(shard)?;
        f(data)
    }

    /// Key of another document that would collide with `doc` on the index.
    fn collision(
        index: &UniqueIndex,
        docs: Option<&BTreeMap<ShardKey, Document>>,
        key: &ShardKey,
        doc: &Document,
    ) -> Option<ShardKey> {
        let value = index.indexed_value(doc)?;
        docs?
            .iter()
            .find(|(k, other)| *k != key && index.indexed_value(other) == Some(value))
            .map(|(k, _)| k.clone())
    }
}

impl ShardDataPlane for InMemoryShards {
    fn last_op(&self, shard: &ShardId) -> Result<u64> {
        self.with_shard(shard, |data| data.oplog.len() as u64)
    }

    fn read_range(
        &self,
        shard: &ShardId,
        namespace: &str,
        range: &KeyRange,
        after: Option<&ShardKey>,
        limit: usize,
    ) -> Result<Vec<(ShardKey, Document)>> {
        self.with_shard(shard, |data| {
            data.collections
                .get(namespace)
                .map(|docs| {
                    docs.iter()
                        .filter(|(k, _)| range.contains_key(k))
                        .filter(|(k, _)| after.map_or(true, |a| *k > a))
                        .take(limit)
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect()
                })
                .unwrap_or_default()
        })
    }

    fn insert_batch(
        &self,
        shard: &ShardId,
        namespace: &str,
        docs: Vec<(ShardKey, Document)>,
    ) -> Result<()> {
        self.with_shard_mut(shard, |data| {
            for (key, doc) in docs {
                data.apply(namespace, key, WriteKind::Upsert(doc));
            }
            Ok(())
        })
    }

    fn writes_since(
        &self,
        shard: &ShardId,
        namespace: &str,
        range: &KeyRange,
        after_op: u64,
    ) -> Result<Vec<WriteOp>> {
        self.with_shard(shard, |data| {
            let start = (after_op as usize).min(data.oplog.len());
            data.oplog[start..]
                .iter()
                .filter(|op| op.namespace == namespace && range.contains_key(&op.key))
                .cloned()
                .collect()
        })
    }

    fn apply_writes(&self, shard: &ShardId, namespace: &str, writes: Vec<WriteOp>) -> Result<()> {
        self.with_shard_mut(shard, |data| {
            for op in writes {
                data.apply(namespace, op.key, op.kind);
            }
            Ok(())
        })
    }

    fn set_range_paused(
        &self,
        shard: &ShardId,
        namespace: &str,
        range: &KeyRange,
        paused: bool,
    ) -> Result<()> {
        let mut shards = self.shards.write().unwrap_or_else(|p| p.into_inner());
        let data = shards.entry(shard.clone()).or_default();
        // Unpausing must work on an unreachable shard so aborts always clean up.
        if paused {
            data.check_reachable(shard)?;
            data.paused.push((namespace.to_string(), range.clone()));
        } else {
            data.paused
                .retain(|(ns, r)| !(ns == namespace && r == range));
        }
        Ok(())
    }

    fn delete_range(&self, shard: &ShardId, namespace: &str, range: &KeyRange) -> Result<usize> {
        self.with_shard_mut(shard, |data| {
            let keys: Vec<ShardKey> = data
                .collections
                .get(namespace)
                .map(|docs| {
                    docs.keys()
                        .filter(|k| range.contains_key(k))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            if let Some(docs) = data.collections.get_mut(namespace) {
                for key in &keys {
                    docs.remove(key);
                }
            }
            Ok(keys.len())
        })
    }

    fn count_in_range(&self, shard: &ShardId, namespace: &str, range: &KeyRange) -> Result<usize> {
        self.with_shard(shard, |data| {
            data.collections
                .get(namespace)
                .map(|docs| docs.keys().filter(|k| range.contains_key(k)).count())
                .unwrap_or(0)
        })
    }

    fn upsert(&self, shard: &ShardId, namespace: &str, key: ShardKey, doc: Document) -> Result<()> {
        let index = self
            .indexes
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(namespace)
            .cloned();
        let max_attempts = self.max_upsert_retries;

        // A collision on a partial index can clear up once the conflicting
        // document leaves the filter, so the upsert releases the shard and
        // tries again. The attempts are capped: when nothing changes, every
        // retry collides again.
        for attempt in 1..=max_attempts {
            let conflicting = self.with_shard_mut(shard, |data| {
                if data
                    .paused
                    .iter()
                    .any(|(ns, r)| ns == namespace && r.contains_key(&key))
                {
                    return Err(Error::CriticalSection {
                        namespace: namespace.to_string(),
                        range: key.to_string(),
                    });
                }
                let conflicting = index.as_ref().and_then(|index| {
                    Self::collision(index, data.collections.get(namespace), &key, &doc)
                });
                if conflicting.is_none() {
                    data.apply(namespace, key.clone(), WriteKind::Upsert(doc.clone()));
                }
                Ok(conflicting)
            })?;

            let Some(other) = conflicting else {
                return Ok(());
            };
            let partial = index.as_ref().is_some_and(|i| i.partial_filter.is_some());
            if !partial {
                return Err(Error::DuplicateKey {
                    namespace: namespace.to_string(),
                    key: other.to_string(),
                });
            }
            tracing::debug!(
                namespace,
                key = %key,
                conflicting = %other,
                attempt,
                "upsert hit duplicate key"
            );
            if attempt < max_attempts {
                self.pause_before_retry();
            }
        }
        tracing::warn!(namespace, key = %key, attempts = max_attempts, "upsert gave up on duplicate key");
        Err(Error::DuplicateKeyBoundedRetry {
            namespace: namespace.to_string(),
            attempts: max_attempts,
        })
    }

    fn remove(&self, shard: &ShardId, namespace: &str, key: &ShardKey) -> Result<bool> {
        self.with_shard_mut(shard, |data| {
            if data
                .paused
                .iter()
                .any(|(ns, r)| ns == namespace && r.contains_key(key))
            {
                return Err(Error::CriticalSection {
                    namespace: namespace.to_string(),
                    range: key.to_string(),
                });
            }
            let existed = data
                .collections
                .get(namespace)
                .is_some_and(|docs| docs.contains_key(key));
            if existed {
                data.apply(namespace, key.clone(), WriteKind::Delete);
            }
            Ok(existed)
        })
    }

    fn get(&self, shard: &ShardId, namespace: &str, key: &ShardKey) -> Result<Option<Document>> {
        self.with_shard(shard, |data| {
            data.collections
                .get(namespace)
                .and_then(|docs| docs.get(key))
                .cloned()
        })
    }
}
