//! End-to-end scenarios: migration, conflicting migrations, shard removal
//! and the restore playbook.

use serde_json::json;
use shardmeta::common::{
    ClusterConfig, ErrorKind, KeyBound, KeyRange, ManualClock, ShardId, ShardKey, VersionClock,
};
use shardmeta::coordinator::commands::{AdminCommand, CommandDispatcher};
use shardmeta::coordinator::metadata::{DatabaseRecord, NamespaceEntry, ShardState};
use shardmeta::coordinator::{Cluster, DrainState, MigrationPhase, MoveChunkRequest};
use shardmeta::shard::{InMemoryShards, ShardDataPlane};
use std::sync::Arc;
use std::time::Duration;

fn config() -> ClusterConfig {
    ClusterConfig {
        orphan_cleanup_delay: Duration::from_secs(60),
        range_deleter_interval: Duration::from_millis(5),
        drain_poll_interval: Duration::from_millis(5),
        consistency_grace_period: Duration::from_millis(10),
        clone_batch_size: 4,
        ..Default::default()
    }
}

struct Harness {
    wall: Arc<ManualClock>,
    data: Arc<InMemoryShards>,
    cluster: Arc<Cluster>,
}

fn harness() -> Harness {
    let wall = Arc::new(ManualClock::new(1_700_000_000_000));
    let store = Arc::new(shardmeta::coordinator::MetadataStore::in_memory(Arc::new(
        VersionClock::new(wall.clone()),
    )));
    let data = Arc::new(InMemoryShards::new(3));
    let cluster = Cluster::new(config(), store, data.clone()).unwrap();
    cluster.add_shard("shard0".into(), "h0:27018").unwrap();
    cluster.add_shard("shard1".into(), "h1:27018").unwrap();
    Harness {
        wall,
        data,
        cluster,
    }
}

fn seed(h: &Harness, shard: &str, keys: std::ops::Range<i64>) {
    let shard = ShardId::from(shard);
    for i in keys {
        h.data
            .upsert(&shard, "test.users", ShardKey::int(i), json!({ "x": i }))
            .unwrap();
    }
}

#[tokio::test]
async fn test_migrate_upper_chunk() {
    let h = harness();
    let store = h.cluster.store();
    let before = store
        .create_collection(
            "test.users",
            vec!["x".into()],
            vec![
                (KeyRange::new(KeyBound::MinKey, 0), "shard0".into()),
                (KeyRange::new(0, KeyBound::MaxKey), "shard1".into()),
            ],
        )
        .unwrap();
    seed(&h, "shard1", 0..10);

    let status = h
        .cluster
        .migrations()
        .move_chunk(MoveChunkRequest {
            namespace: "test.users".into(),
            range: KeyRange::new(0, KeyBound::MaxKey),
            to: "shard0".into(),
        })
        .await
        .unwrap();
    assert_eq!(status.phase, MigrationPhase::RangeDeletionScheduled);

    let after = store.get_collection("test.users").unwrap().unwrap();
    assert_eq!(after.version.last_mod, before.version.last_mod + 1);
    assert!(after.version > before.version);
    let owner = &after.chunk_for_key(&ShardKey::int(5)).unwrap().owning_shard;
    assert_eq!(owner, &ShardId::from("shard0"));
    assert!(after
        .chunks
        .iter()
        .all(|c| c.owning_shard == ShardId::from("shard0")));

    let tasks = store.range_deletions().unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].donor_shard, ShardId::from("shard1"));
    assert_eq!(tasks[0].range, KeyRange::new(0, KeyBound::MaxKey));
    assert_eq!(h.data.documents(&"shard0".into(), "test.users").len(), 10);

    let metrics = h.cluster.metrics();
    assert_eq!(metrics.migrations_started.get(), 1);
    assert_eq!(metrics.migrations_committed.get(), 1);
    assert_eq!(metrics.migrations_aborted.get(), 0);
    assert_eq!(metrics.critical_section.count(), 1);
}

#[tokio::test]
async fn test_overlapping_migrations_conflict() {
    let h = harness();
    h.cluster
        .store()
        .create_collection(
            "test.users",
            vec!["x".into()],
            vec![
                (KeyRange::new(KeyBound::MinKey, 0), "shard0".into()),
                (KeyRange::new(0, KeyBound::MaxKey), "shard1".into()),
            ],
        )
        .unwrap();
    seed(&h, "shard1", 0..100);

    let migrations = h.cluster.migrations();
    let mut first = migrations
        .start(MoveChunkRequest {
            namespace: "test.users".into(),
            range: KeyRange::new(0, 50),
            to: "shard0".into(),
        })
        .unwrap();
    let err = migrations
        .start(MoveChunkRequest {
            namespace: "test.users".into(),
            range: KeyRange::new(25, 75),
            to: "shard0".into(),
        })
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MigrationConflict);

    let status = first
        .wait_for(MigrationPhase::RangeDeletionScheduled)
        .await
        .unwrap();
    assert_eq!(status.docs_cloned, 50);

    let coll = h.cluster.store().get_collection("test.users").unwrap().unwrap();
    assert_eq!(
        coll.chunk_for_key(&ShardKey::int(30)).unwrap().owning_shard,
        ShardId::from("shard0")
    );
    assert_eq!(
        coll.chunk_for_key(&ShardKey::int(60)).unwrap().owning_shard,
        ShardId::from("shard1")
    );
    coll.validate().unwrap();
}

#[tokio::test]
async fn test_drain_waits_for_orphan_cleanup() {
    let h = harness();
    let store = h.cluster.store().clone();
    store
        .create_collection(
            "test.users",
            vec!["x".into()],
            vec![
                (KeyRange::new(KeyBound::MinKey, 0), "shard0".into()),
                (KeyRange::new(0, 100), "shard1".into()),
                (KeyRange::new(100, KeyBound::MaxKey), "shard1".into()),
            ],
        )
        .unwrap();
    seed(&h, "shard1", 0..200);
    let shard1 = ShardId::from("shard1");

    let drain = h.cluster.drain().clone();
    let status = drain.start_draining(&shard1).unwrap();
    assert_eq!(status.state, DrainState::DrainingChunks);
    assert_eq!(status.remaining_chunks, 2);

    let status = drain.run_to_completion(&shard1).await.unwrap();
    assert_eq!(status.state, DrainState::DrainComplete);
    assert_eq!(status.pending_range_deletions, 2);

    let committing = {
        let drain = drain.clone();
        let shard = shard1.clone();
        tokio::spawn(async move { drain.commit(&shard).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!committing.is_finished());
    assert_eq!(
        store.get_shard(&shard1).unwrap().unwrap().state,
        ShardState::Draining
    );

    h.wall.advance(Duration::from_secs(61));
    let status = committing.await.unwrap().unwrap();
    assert_eq!(status.state, DrainState::Committed);
    assert_eq!(
        store.get_shard(&shard1).unwrap().unwrap().state,
        ShardState::Removed
    );
    assert!(store.range_deletions_for_donor(&shard1).unwrap().is_empty());
    assert!(h.data.documents(&shard1, "test.users").is_empty());
    assert_eq!(h.data.documents(&"shard0".into(), "test.users").len(), 200);
    for record in h.cluster.deleter().history() {
        assert!(record.deleted_at_ms >= record.not_before_ms);
    }
}

#[tokio::test]
async fn test_progressive_remove_shard() {
    let h = harness();
    let d = CommandDispatcher::new(h.cluster.clone());
    d.run(AdminCommand::EnableSharding {
        database: "test".into(),
        primary_shard: Some("shard1".into()),
    })
    .await
    .unwrap();
    d.run(AdminCommand::ShardCollection {
        namespace: "test.users".into(),
        key: vec!["x".into()],
        split_points: vec![ShardKey::int(0)],
    })
    .await
    .unwrap();
    seed(&h, "shard1", -10..10);

    let remove = AdminCommand::RemoveShard {
        shard: "shard1".into(),
    };
    let reply = d.run(remove.clone()).await.unwrap();
    assert_eq!(reply["msg"], "draining started successfully");

    let finished = d.wait_for_drain(&"shard1".into()).await.unwrap().unwrap();
    assert_eq!(finished.state, DrainState::DrainComplete);

    let reply = d.run(remove.clone()).await.unwrap();
    assert_eq!(reply["msg"], "waiting for orphan cleanup");
    assert_eq!(reply["drain"]["state"], "DrainComplete");

    h.wall.advance(Duration::from_secs(61));
    let reply = d.run(remove.clone()).await.unwrap();
    assert_eq!(reply["msg"], "removeshard completed successfully");
    assert_eq!(reply["drain"]["state"], "Committed");

    let db = h.cluster.store().get_database("test").unwrap().unwrap();
    assert_eq!(db.primary_shard, ShardId::from("shard0"));
}

async fn restore_playbook(bad_primary: &str) {
    let h = harness();
    let d = CommandDispatcher::new(h.cluster.clone());
    d.run(AdminCommand::EnableSharding {
        database: "test".into(),
        primary_shard: Some("shard0".into()),
    })
    .await
    .unwrap();
    h.cluster.catch_up_replicas();
    let cache = h.cluster.router_cache("router-1");
    cache.get("test").await.unwrap();

    // Restore an out-of-date backup: same version, different primary.
    let good = h.cluster.store().get_database("test").unwrap().unwrap();
    h.cluster
        .store()
        .restore_raw(NamespaceEntry::Database(DatabaseRecord {
            primary_shard: bad_primary.into(),
            ..good.clone()
        }))
        .unwrap();

    let check = AdminCommand::CheckMetadataConsistency { namespace: None };
    let reply = d.run(check.clone()).await.unwrap();
    let findings = reply["inconsistencies"].as_array().unwrap();
    assert_eq!(findings.len(), 1, "{:#?}", findings);
    assert_eq!(findings[0]["kind"], "ConflictingPrimary");
    assert_eq!(findings[0]["severity"], "FATAL_INCONSISTENCY");
    assert_eq!(findings[0]["namespace"], "test");

    // The namespace is blocked until repaired.
    let err = cache
        .route("test.users", &ShardKey::int(1))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FatalInconsistency);
    let err = d
        .run(AdminCommand::MovePrimary {
            database: "test".into(),
            to: "shard1".into(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FatalInconsistency);

    d.run(AdminCommand::ForceOverwrite {
        record: NamespaceEntry::Database(good),
    })
    .await
    .unwrap();

    let reply = d.run(check).await.unwrap();
    assert_eq!(reply["inconsistencies"].as_array().unwrap().len(), 0);
    assert_eq!(reply["fatal"], 0);
    let target = cache.route("test.users", &ShardKey::int(1)).await.unwrap();
    assert_eq!(target.shard, ShardId::from("shard0"));
}

#[tokio::test]
async fn test_restore_playbook_incorrect_primary() {
    restore_playbook("shard1").await;
}

#[tokio::test]
async fn test_restore_playbook_unknown_primary() {
    restore_playbook("shard9").await;
}

#[tokio::test]
async fn test_stop_draining_cancels_blocked_commit() {
    let h = harness();
    let store = h.cluster.store().clone();
    store
        .create_collection(
            "test.users",
            vec!["x".into()],
            vec![
                (KeyRange::new(KeyBound::MinKey, 0), "shard0".into()),
                (KeyRange::new(0, KeyBound::MaxKey), "shard1".into()),
            ],
        )
        .unwrap();
    seed(&h, "shard1", 0..20);
    let shard1 = ShardId::from("shard1");

    let drain = h.cluster.drain().clone();
    drain.start_draining(&shard1).unwrap();
    let status = drain.run_to_completion(&shard1).await.unwrap();
    assert_eq!(status.state, DrainState::DrainComplete);
    assert_eq!(status.pending_range_deletions, 1);

    let committing = {
        let drain = drain.clone();
        let shard = shard1.clone();
        tokio::spawn(async move { drain.commit(&shard).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!committing.is_finished());

    let status = drain.stop_draining(&shard1).unwrap();
    assert_eq!(status.state, DrainState::NotDraining);
    let err = committing.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DrainCancelled);

    // The shard stays registered; the committed chunk move and its cleanup stay.
    assert_eq!(
        store.get_shard(&shard1).unwrap().unwrap().state,
        ShardState::Active
    );
    assert_eq!(store.range_deletions_for_donor(&shard1).unwrap().len(), 1);
    let coll = store.get_collection("test.users").unwrap().unwrap();
    assert!(coll
        .chunks
        .iter()
        .all(|c| c.owning_shard == ShardId::from("shard0")));
}
