//! Ordered change log of metadata mutations
//!
//! Every successful metadata mutation appends one event. Shard-local replicas
//! pull events by sequence number and are woken through a watch channel when
//! new ones arrive; delivery is in order and at-least-once per reader.
//!
//! Events every reader has applied can be trimmed. They are folded into a
//! compacted base holding the latest change per record, which a reader that
//! fell behind the trimmed point reloads before resuming.

use crate::common::HlcTimestamp;
use crate::coordinator::metadata::{CollectionRecord, DatabaseRecord, ShardRegistryEntry};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::RwLock;
use tokio::sync::watch;

/// Payload of a change-log event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Change {
    DatabaseUpserted(DatabaseRecord),
    DatabaseDropped { name: String },
    CollectionUpserted(CollectionRecord),
    CollectionDropped { namespace: String },
    ShardUpserted(ShardRegistryEntry),
}

impl Change {
    /// Namespace or shard id the event is about.
    pub fn subject(&self) -> &str {
        match self {
            Change::DatabaseUpserted(db) => &db.name,
            Change::DatabaseDropped { name } => name,
            Change::CollectionUpserted(coll) => &coll.namespace,
            Change::CollectionDropped { namespace } => namespace,
            Change::ShardUpserted(shard) => shard.shard_id.as_str(),
        }
    }

    /// Record the change is about, with databases, collections and shards
    /// kept apart.
    fn record_key(&self) -> (u8, String) {
        let kind = match self {
            Change::DatabaseUpserted(_) | Change::DatabaseDropped { .. } => 0,
            Change::CollectionUpserted(_) | Change::CollectionDropped { .. } => 1,
            Change::ShardUpserted(_) => 2,
        };
        (kind, self.subject().to_string())
    }

    fn is_drop(&self) -> bool {
        matches!(
            self,
            Change::DatabaseDropped { .. } | Change::CollectionDropped { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// 1-based, gap-free sequence number
    pub seq: u64,
    pub stamp: HlcTimestamp,
    pub change: Change,
}

#[derive(Default)]
struct Events {
    /// Latest surviving change per record, for every trimmed event
    base: BTreeMap<(u8, String), Change>,
    trimmed_through: u64,
    retained: VecDeque<ChangeEvent>,
}

impl Events {
    fn last_seq(&self) -> u64 {
        self.trimmed_through + self.retained.len() as u64
    }
}

pub struct ChangeLog {
    events: RwLock<Events>,
    notify: watch::Sender<u64>,
}

impl ChangeLog {
    pub fn new() -> Self {
        let (notify, _) = watch::channel(0);
        Self {
            events: RwLock::new(Events::default()),
            notify,
        }
    }

    /// Append an event and wake followers. Returns its sequence number.
    pub fn append(&self, stamp: HlcTimestamp, change: Change) -> u64 {
        let mut events = self.events.write().unwrap_or_else(|p| p.into_inner());
        let seq = events.last_seq() + 1;
        tracing::trace!(seq, subject = change.subject(), "change log append");
        events.retained.push_back(ChangeEvent { seq, stamp, change });
        // Published under the lock so the watched value never goes backwards.
        self.notify.send_replace(seq);
        seq
    }

    /// Retained events with `seq > after`, in order.
    pub fn since(&self, after: u64) -> Vec<ChangeEvent> {
        let events = self.events.read().unwrap_or_else(|p| p.into_inner());
        let skip = after.saturating_sub(events.trimmed_through) as usize;
        events.retained.iter().skip(skip).cloned().collect()
    }

    pub fn last_seq(&self) -> u64 {
        *self.notify.borrow()
    }

    /// Highest sequence number folded into the compacted base
    pub fn trimmed_through(&self) -> u64 {
        self.events
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .trimmed_through
    }

    /// Compacted base and the sequence number it is current as of.
    pub fn compacted(&self) -> (u64, Vec<Change>) {
        let events = self.events.read().unwrap_or_else(|p| p.into_inner());
        (events.trimmed_through, events.base.values().cloned().collect())
    }

    /// Number of events not yet trimmed
    pub fn retained(&self) -> usize {
        self.events
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .retained
            .len()
    }

    /// Fold every event with `seq <= through` into the compacted base.
    /// Returns how many events were trimmed.
    pub fn trim(&self, through: u64) -> usize {
        let mut events = self.events.write().unwrap_or_else(|p| p.into_inner());
        let mut trimmed = 0;
        while events.retained.front().is_some_and(|e| e.seq <= through) {
            let Some(event) = events.retained.pop_front() else {
                break;
            };
            let key = event.change.record_key();
            if event.change.is_drop() {
                events.base.remove(&key);
            } else {
                events.base.insert(key, event.change);
            }
            events.trimmed_through = event.seq;
            trimmed += 1;
        }
        if trimmed > 0 {
            tracing::debug!(trimmed, through = events.trimmed_through, "change log trimmed");
        }
        trimmed
    }

    /// Receiver that changes whenever a new event is appended.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.notify.subscribe()
    }
}

impl Default for ChangeLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_since() {
        let log = ChangeLog::new();
        assert_eq!(log.last_seq(), 0);

        let s1 = log.append(
            HlcTimestamp::new(1, 0),
            Change::DatabaseDropped { name: "a".into() },
        );
        let s2 = log.append(
            HlcTimestamp::new(1, 1),
            Change::DatabaseDropped { name: "b".into() },
        );
        assert_eq!((s1, s2), (1, 2));
        assert_eq!(log.since(0).len(), 2);
        assert_eq!(log.since(1)[0].change.subject(), "b");
        assert!(log.since(2).is_empty());
        assert!(log.since(10).is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_wakes_on_append() {
        let log = std::sync::Arc::new(ChangeLog::new());
        let mut rx = log.subscribe();

        let writer = log.clone();
        tokio::spawn(async move {
            writer.append(
                HlcTimestamp::new(5, 0),
                Change::CollectionDropped {
                    namespace: "db.c".into(),
                },
            );
        });

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 1);
    }

    #[test]
    fn test_trim_folds_into_compacted_base() {
        let log = ChangeLog::new();
        for (i, name) in ["a", "b", "a"].iter().enumerate() {
            log.append(
                HlcTimestamp::new(i as u64, 0),
                Change::CollectionDropped {
                    namespace: format!("{}.c", name),
                },
            );
        }
        log.append(
            HlcTimestamp::new(9, 0),
            Change::DatabaseDropped { name: "b".into() },
        );

        assert_eq!(log.trim(3), 3);
        assert_eq!(log.trimmed_through(), 3);
        assert_eq!(log.retained(), 1);
        assert_eq!(log.last_seq(), 4);
        // Drops leave nothing behind in the base.
        assert!(log.compacted().1.is_empty());

        let rest = log.since(0);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].seq, 4);
        assert!(log.since(4).is_empty());
        assert_eq!(log.trim(2), 0);

        let seq = log.append(
            HlcTimestamp::new(10, 0),
            Change::DatabaseDropped { name: "c".into() },
        );
        assert_eq!(seq, 5);
    }

    #[test]
    fn test_concurrent_appends_publish_tail() {
        let log = std::sync::Arc::new(ChangeLog::new());
        let writers: Vec<_> = (0..8)
            .map(|w| {
                let log = log.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        log.append(
                            HlcTimestamp::new(i, w),
                            Change::DatabaseDropped {
                                name: format!("db{}", w),
                            },
                        );
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        assert_eq!(log.last_seq(), 1600);
        assert_eq!(log.since(0).len(), 1600);
        assert_eq!(*log.subscribe().borrow(), 1600);
    }
}
