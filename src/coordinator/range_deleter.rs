//! Orphan range deletion
//!
//! After a migration commits, the donor still holds the moved documents.
//! They are removed by a [`RangeDeletionTask`] once its `not_before` time has
//! passed. Executing a task twice is harmless.

use crate::common::{Metrics, Result, ShardId};
use crate::coordinator::metadata::{MetadataStore, RangeDeletionTask};
use crate::shard::ShardDataPlane;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// A resolved deletion task
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeletionRecord {
    pub task_id: uuid::Uuid,
    pub namespace: String,
    pub donor_shard: ShardId,
    pub not_before_ms: u64,
    pub deleted_at_ms: u64,
    pub documents_deleted: usize,
}

pub struct RangeDeleter {
    store: Arc<MetadataStore>,
    data: Arc<dyn ShardDataPlane>,
    history: Mutex<VecDeque<DeletionRecord>>,
    history_limit: usize,
    metrics: Arc<Metrics>,
}

/// Resolved deletions remembered by [`RangeDeleter::history`]
const HISTORY_LIMIT: usize = 256;

impl RangeDeleter {
    pub fn new(store: Arc<MetadataStore>, data: Arc<dyn ShardDataPlane>) -> Self {
        Self {
            store,
            data,
            history: Mutex::new(VecDeque::new()),
            history_limit: HISTORY_LIMIT,
            metrics: Arc::new(Metrics::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Run `task` if it is due. `None` when it is not yet due or another
    /// caller already resolved it.
    pub fn execute(&self, task: &RangeDeletionTask) -> Result<Option<DeletionRecord>> {
        let now = self.store.clock().now_millis();
        if !task.is_due(now) {
            return Ok(None);
        }

        // The range may have migrated back to the donor since; its documents
        // are live again and must stay.
        let returned = self
            .store
            .get_collection(&task.namespace)?
            .is_some_and(|coll| {
                coll.chunks
                    .iter()
                    .any(|c| c.owning_shard == task.donor_shard && c.range.overlaps(&task.range))
            });

        let documents_deleted = if returned {
            tracing::warn!(
                namespace = %task.namespace,
                range = %task.range,
                donor = %task.donor_shard,
                "range is owned by the donor again, skipping physical deletion"
            );
            0
        } else {
            self.data
                .delete_range(&task.donor_shard, &task.namespace, &task.range)?
        };

        if self.store.complete_range_deletion(task.id)?.is_none() {
            return Ok(None);
        }

        let record = DeletionRecord {
            task_id: task.id,
            namespace: task.namespace.clone(),
            donor_shard: task.donor_shard.clone(),
            not_before_ms: task.not_before_ms,
            deleted_at_ms: now,
            documents_deleted,
        };
        tracing::info!(
            namespace = %task.namespace,
            range = %task.range,
            donor = %task.donor_shard,
            migration_id = %task.migration_id,
            documents = documents_deleted,
            "orphaned range deleted"
        );
        self.metrics.range_deletions.inc();
        self.metrics.orphans_deleted.add(documents_deleted as u64);
        let mut history = self.history.lock().unwrap_or_else(|p| p.into_inner());
        history.push_back(record.clone());
        while history.len() > self.history_limit {
            history.pop_front();
        }
        Ok(Some(record))
    }

    /// Execute every task that is due now.
    pub fn process_due(&self) -> Result<Vec<DeletionRecord>> {
        let now = self.store.clock().now_millis();
        let mut done = Vec::new();
        for task in self.store.range_deletions()? {
            if !task.is_due(now) {
                continue;
            }
            if let Some(record) = self.execute(&task)? {
                done.push(record);
            }
        }
        Ok(done)
    }

    /// Most recent deletions performed by this deleter, oldest first
    pub fn history(&self) -> Vec<DeletionRecord> {
        self.history
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Background loop calling [`process_due`](Self::process_due) every `interval`.
    pub fn spawn(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let deleter = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = deleter.process_due() {
                    tracing::warn!(error = %e, "range deleter pass failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{KeyBound, KeyRange, ManualClock, ShardKey, VersionClock};
    use crate::shard::InMemoryShards;
    use serde_json::json;

    #[test]
    fn test_task_waits_for_not_before() {
        let wall = Arc::new(ManualClock::new(1_000));
        let store = Arc::new(MetadataStore::in_memory(Arc::new(VersionClock::new(
            wall.clone(),
        ))));
        let data = Arc::new(InMemoryShards::new(3));
        let donor = ShardId::from("shard1");
        for i in 0..4 {
            data.upsert(&donor, "db.c", ShardKey::int(i), json!({})).unwrap();
        }

        let task = RangeDeletionTask {
            id: uuid::Uuid::new_v4(),
            namespace: "db.c".into(),
            range: KeyRange::new(0, KeyBound::MaxKey),
            donor_shard: donor.clone(),
            migration_id: "mig-1".into(),
            created_at_ms: 1_000,
            not_before_ms: 6_000,
        };
        store.schedule_range_deletion(task.clone()).unwrap();
        let deleter = RangeDeleter::new(store.clone(), data.clone());

        assert!(deleter.process_due().unwrap().is_empty());
        assert_eq!(data.documents(&donor, "db.c").len(), 4);

        wall.advance(Duration::from_secs(5));
        let done = deleter.process_due().unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].documents_deleted, 4);
        assert!(done[0].deleted_at_ms >= done[0].not_before_ms);
        assert!(store.range_deletions().unwrap().is_empty());

        // Second execution is a no-op.
        assert!(deleter.execute(&task).unwrap().is_none());
        assert_eq!(deleter.history().len(), 1);
    }

    #[test]
    fn test_history_keeps_most_recent() {
        let wall = Arc::new(ManualClock::new(1_000));
        let store = Arc::new(MetadataStore::in_memory(Arc::new(VersionClock::new(
            wall.clone(),
        ))));
        let data = Arc::new(InMemoryShards::new(3));
        for i in 0..5i64 {
            store
                .schedule_range_deletion(RangeDeletionTask {
                    id: uuid::Uuid::new_v4(),
                    namespace: "db.c".into(),
                    range: KeyRange::new(i * 10, i * 10 + 10),
                    donor_shard: "shard1".into(),
                    migration_id: format!("mig-{}", i),
                    created_at_ms: 1_000,
                    not_before_ms: 1_000,
                })
                .unwrap();
        }
        let deleter = RangeDeleter::new(store.clone(), data).with_history_limit(2);

        let done = deleter.process_due().unwrap();
        assert_eq!(done.len(), 5);
        assert_eq!(deleter.history(), done[3..].to_vec());
    }
}
