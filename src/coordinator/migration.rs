//! Chunk migration
//!
//! One migration moves a key range from its donor shard to a recipient:
//!
//! ```text
//! Cloning → SteadyStateCatchup → CommitPending → Committed
//!         → RangeDeletionScheduled → Done
//! ```
//!
//! `Aborted` is reachable from every phase before `Committed`. Ownership only
//! changes hands at the metadata compare-and-swap in `CommitPending`; any
//! failure before that point leaves the range with the donor. After it the
//! migration only moves forward: scheduling the donor's cleanup is retried
//! until it is recorded.

use crate::common::{
    generate_migration_id, retry_with_backoff, validate_namespace, ClusterConfig, Error, KeyRange,
    Metrics, Result, ShardId, ShardKey, Version,
};
use crate::coordinator::metadata::{
    MetadataStore, MigrationLock, Mutation, RangeDeletionTask, ShardState,
};
use crate::coordinator::range_deleter::RangeDeleter;
use crate::shard::ShardDataPlane;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MigrationPhase {
    Cloning,
    SteadyStateCatchup,
    CommitPending,
    Committed,
    RangeDeletionScheduled,
    Done,
    Aborted,
}

impl MigrationPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, MigrationPhase::Done | MigrationPhase::Aborted)
    }

    /// Has ownership been transferred?
    pub fn is_committed(self) -> bool {
        self >= MigrationPhase::Committed && self != MigrationPhase::Aborted
    }
}

/// Request to move `range` of `namespace` to shard `to`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveChunkRequest {
    pub namespace: String,
    pub range: KeyRange,
    pub to: ShardId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStatus {
    pub migration_id: String,
    pub namespace: String,
    pub range: KeyRange,
    pub donor: ShardId,
    pub recipient: ShardId,
    pub phase: MigrationPhase,
    pub docs_cloned: usize,
    pub catchup_rounds: u32,
    pub committed_version: Option<Version>,
    pub deletion_task: Option<uuid::Uuid>,
    pub error: Option<String>,
}

/// Caller's view of a running migration
#[derive(Debug)]
pub struct MigrationHandle {
    migration_id: String,
    status: watch::Receiver<MigrationStatus>,
    cancel: Arc<AtomicBool>,
    task: Option<JoinHandle<Result<MigrationStatus>>>,
}

impl MigrationHandle {
    pub fn id(&self) -> &str {
        &self.migration_id
    }

    pub fn status(&self) -> MigrationStatus {
        self.status.borrow().clone()
    }

    /// Ask the migration to abort. Returns `false` once the commit point has
    /// been reached, after which the migration can only move forward.
    pub fn abort(&self) -> bool {
        if self.status.borrow().phase.is_committed() {
            return false;
        }
        self.cancel.store(true, Ordering::SeqCst);
        true
    }

    /// Wait until the migration reaches `phase` (or beyond). An abort is
    /// returned as the error that caused it.
    pub async fn wait_for(&mut self, phase: MigrationPhase) -> Result<MigrationStatus> {
        loop {
            let current = self.status.borrow_and_update().clone();
            if current.phase == MigrationPhase::Aborted {
                return self.join().await;
            }
            if current.phase >= phase {
                return Ok(current);
            }
            if self.status.changed().await.is_err() {
                return self.join().await;
            }
        }
    }

    /// Wait for the migration task to finish.
    pub async fn wait_done(mut self) -> Result<MigrationStatus> {
        self.join().await
    }

    async fn join(&mut self) -> Result<MigrationStatus> {
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| Error::Internal(format!("migration task failed: {}", e)))?,
            None => Ok(self.status.borrow().clone()),
        }
    }
}

pub struct ChunkMigrationCoordinator {
    store: Arc<MetadataStore>,
    data: Arc<dyn ShardDataPlane>,
    deleter: Arc<RangeDeleter>,
    config: ClusterConfig,
    /// Started migrations, oldest first
    migrations: RwLock<VecDeque<watch::Receiver<MigrationStatus>>>,
    finished_kept: usize,
    metrics: Arc<Metrics>,
}

/// Finished migrations kept for [`ChunkMigrationCoordinator::list`]
const FINISHED_MIGRATIONS_KEPT: usize = 64;

impl ChunkMigrationCoordinator {
    pub fn new(
        store: Arc<MetadataStore>,
        data: Arc<dyn ShardDataPlane>,
        deleter: Arc<RangeDeleter>,
        config: ClusterConfig,
    ) -> Self {
        Self {
            store,
            data,
            deleter,
            config,
            migrations: RwLock::new(VecDeque::new()),
            finished_kept: FINISHED_MIGRATIONS_KEPT,
            metrics: Arc::new(Metrics::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Keep at most `n` finished migrations in [`list`](Self::list).
    pub fn with_finished_limit(mut self, n: usize) -> Self {
        self.finished_kept = n;
        self
    }

    /// Track a new migration and forget the oldest finished ones past the limit.
    fn track(&self, status: watch::Receiver<MigrationStatus>) {
        let mut migrations = self.migrations.write().unwrap_or_else(|p| p.into_inner());
        migrations.push_back(status);
        let mut excess = migrations
            .iter()
            .filter(|rx| rx.borrow().phase.is_terminal())
            .count()
            .saturating_sub(self.finished_kept);
        if excess == 0 {
            return;
        }
        migrations.retain(|rx| {
            if excess > 0 && rx.borrow().phase.is_terminal() {
                excess -= 1;
                return false;
            }
            true
        });
    }

    /// Validate the request, take the range lock and start the migration.
    ///
    /// An overlapping migration fails here with `MigrationConflict`.
    pub fn start(self: &Arc<Self>, req: MoveChunkRequest) -> Result<MigrationHandle> {
        validate_namespace(&req.namespace)?;
        self.store.ensure_not_quarantined(&req.namespace)?;
        if req.range.is_empty() {
            return Err(Error::InvalidCommand(format!("{} is empty", req.range)));
        }

        let coll = self
            .store
            .get_collection(&req.namespace)?
            .ok_or_else(|| Error::NamespaceNotFound(req.namespace.clone()))?;
        let idx = coll
            .chunk_containing(&req.range)
            .ok_or_else(|| Error::ChunkNotFound {
                namespace: req.namespace.clone(),
                range: req.range.to_string(),
            })?;
        let donor = coll.chunks[idx].owning_shard.clone();
        if donor == req.to {
            return Err(Error::IllegalOperation(format!(
                "{} already owns {}",
                req.to, req.range
            )));
        }
        match self.store.get_shard(&req.to)? {
            None => return Err(Error::ShardNotFound(req.to.to_string())),
            Some(entry) if entry.state != ShardState::Active => {
                return Err(Error::ShardNotActive {
                    shard: req.to.to_string(),
                    state: entry.state.to_string(),
                })
            }
            Some(_) => {}
        }

        let migration_id = generate_migration_id();
        self.store.acquire_migration_lock(MigrationLock {
            migration_id: migration_id.clone(),
            namespace: req.namespace.clone(),
            range: req.range.clone(),
            donor: donor.clone(),
            recipient: req.to.clone(),
            acquired_at_ms: self.store.clock().now_millis(),
            critical_section: false,
        })?;

        let (tx, rx) = watch::channel(MigrationStatus {
            migration_id: migration_id.clone(),
            namespace: req.namespace.clone(),
            range: req.range.clone(),
            donor: donor.clone(),
            recipient: req.to.clone(),
            phase: MigrationPhase::Cloning,
            docs_cloned: 0,
            catchup_rounds: 0,
            committed_version: None,
            deletion_task: None,
            error: None,
        });
        self.track(rx.clone());
        self.metrics.migrations_started.inc();

        tracing::info!(
            migration_id = %migration_id,
            namespace = %req.namespace,
            range = %req.range,
            from = %donor,
            to = %req.to,
            "migration started"
        );

        let cancel = Arc::new(AtomicBool::new(false));
        let run = Migration {
            coordinator: self.clone(),
            status: tx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(run.run());

        Ok(MigrationHandle {
            migration_id,
            status: rx,
            cancel,
            task: Some(task),
        })
    }

    /// Start a migration and wait until its ownership transfer is recorded
    /// and its orphan cleanup is scheduled.
    pub async fn move_chunk(self: &Arc<Self>, req: MoveChunkRequest) -> Result<MigrationStatus> {
        let mut handle = self.start(req)?;
        handle
            .wait_for(MigrationPhase::RangeDeletionScheduled)
            .await
    }

    /// Move the chunk containing `key`.
    pub async fn move_chunk_containing(
        self: &Arc<Self>,
        namespace: &str,
        key: &ShardKey,
        to: ShardId,
    ) -> Result<MigrationStatus> {
        let coll = self
            .store
            .get_collection(namespace)?
            .ok_or_else(|| Error::NamespaceNotFound(namespace.to_string()))?;
        let chunk = coll
            .chunk_for_key(key)
            .ok_or_else(|| Error::ChunkNotFound {
                namespace: namespace.to_string(),
                range: key.to_string(),
            })?;
        self.move_chunk(MoveChunkRequest {
            namespace: namespace.to_string(),
            range: chunk.range.clone(),
            to,
        })
        .await
    }

    /// Latest status of every running migration and of the most recently
    /// finished ones, oldest first
    pub fn list(&self) -> Vec<MigrationStatus> {
        self.migrations
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|rx| rx.borrow().clone())
            .collect()
    }
}

/// State owned by one spawned migration task
struct Migration {
    coordinator: Arc<ChunkMigrationCoordinator>,
    status: watch::Sender<MigrationStatus>,
    cancel: Arc<AtomicBool>,
}

impl Migration {
    fn snapshot(&self) -> MigrationStatus {
        self.status.borrow().clone()
    }

    fn set_phase(&self, phase: MigrationPhase) {
        self.status.send_modify(|s| s.phase = phase);
        let s = self.snapshot();
        tracing::info!(
            migration_id = %s.migration_id,
            namespace = %s.namespace,
            range = %s.range,
            phase = ?phase,
            "migration phase"
        );
    }

    fn check_cancel(&self) -> Result<()> {
        if self.cancel.load(Ordering::SeqCst) {
            let s = self.snapshot();
            return Err(Error::MigrationAborted {
                migration_id: s.migration_id,
                reason: "aborted by request".into(),
            });
        }
        Ok(())
    }

    async fn run(self) -> Result<MigrationStatus> {
        let version = match self.transfer().await {
            Ok(version) => version,
            Err(e) => {
                self.abort(&e);
                return Err(e);
            }
        };
        self.status
            .send_modify(|s| s.committed_version = Some(version));
        self.coordinator.metrics.migrations_committed.inc();
        self.set_phase(MigrationPhase::Committed);
        self.cleanup_orphans().await
    }

    /// Clone, catch up and commit. Returns the new collection version.
    async fn transfer(&self) -> Result<Version> {
        let s = self.snapshot();
        let c = &self.coordinator;
        let cfg = &c.config;

        // Cloning: the donor keeps serving the range.
        let start_op = c.data.last_op(&s.donor)?;
        let mut after: Option<ShardKey> = None;
        loop {
            self.check_cancel()?;
            let batch = c.data.read_range(
                &s.donor,
                &s.namespace,
                &s.range,
                after.as_ref(),
                cfg.clone_batch_size,
            )?;
            let Some((last, _)) = batch.last() else {
                break;
            };
            after = Some(last.clone());
            let n = batch.len();
            c.data.insert_batch(&s.recipient, &s.namespace, batch)?;
            self.status.send_modify(|st| st.docs_cloned += n);
            tokio::task::yield_now().await;
        }

        // Catch up on writes made while cloning, until a round is small enough.
        self.set_phase(MigrationPhase::SteadyStateCatchup);
        let mut cursor = start_op;
        let mut rounds = 0u32;
        loop {
            self.check_cancel()?;
            let writes = c.data.writes_since(&s.donor, &s.namespace, &s.range, cursor)?;
            rounds += 1;
            self.status.send_modify(|st| st.catchup_rounds = rounds);
            if let Some(last) = writes.last() {
                cursor = last.op_id;
            }
            let n = writes.len();
            c.data.apply_writes(&s.recipient, &s.namespace, writes)?;
            tracing::debug!(migration_id = %s.migration_id, round = rounds, writes = n, "catch-up round");

            if n <= cfg.catchup_converged_ops {
                break;
            }
            if rounds >= cfg.catchup_max_rounds {
                return Err(Error::CatchupLimitExceeded {
                    namespace: s.namespace.clone(),
                    rounds,
                });
            }
            tokio::task::yield_now().await;
        }

        // Commit: freeze the range on both sides and flip ownership.
        self.check_cancel()?;
        self.set_phase(MigrationPhase::CommitPending);
        let paused_at = Instant::now();
        c.store.set_critical_section(&s.migration_id, true);
        c.data
            .set_range_paused(&s.donor, &s.namespace, &s.range, true)?;
        c.data
            .set_range_paused(&s.recipient, &s.namespace, &s.range, true)?;

        // Last writes are now frozen, since `cursor` was drained before the pause.
        let final_writes = c.data.writes_since(&s.donor, &s.namespace, &s.range, cursor)?;
        c.data
            .apply_writes(&s.recipient, &s.namespace, final_writes)?;

        let current = c
            .store
            .get_collection(&s.namespace)?
            .ok_or_else(|| Error::NamespaceNotFound(s.namespace.clone()))?;
        let still_donor = current
            .chunk_containing(&s.range)
            .is_some_and(|i| current.chunks[i].owning_shard == s.donor);
        if !still_donor {
            return Err(Error::MigrationAborted {
                migration_id: s.migration_id.clone(),
                reason: format!("{} is no longer owned by {}", s.range, s.donor),
            });
        }

        let version = c.store.compare_and_swap(
            &s.namespace,
            current.version,
            Mutation::TransferChunk {
                range: s.range.clone(),
                to: s.recipient.clone(),
            },
        )?;

        // Ownership has moved. Donor writes for the range now fail the
        // version check instead of the pause.
        self.unpause(&s.donor);
        self.unpause(&s.recipient);
        c.store.set_critical_section(&s.migration_id, false);
        c.metrics.critical_section.observe(paused_at.elapsed());
        Ok(version)
    }

    fn unpause(&self, shard: &ShardId) {
        let s = self.snapshot();
        if let Err(e) = self
            .coordinator
            .data
            .set_range_paused(shard, &s.namespace, &s.range, false)
        {
            tracing::warn!(
                migration_id = %s.migration_id,
                shard = %shard,
                range = %s.range,
                error = %e,
                "could not lift write pause"
            );
        }
    }

    /// Schedule and then run deletion of the donor's orphaned copy.
    async fn cleanup_orphans(self) -> Result<MigrationStatus> {
        let s = self.snapshot();
        let c = &self.coordinator;
        let now = c.store.clock().now_millis();
        let delay = crate::common::duration_millis(c.config.orphan_cleanup_delay);
        let task = RangeDeletionTask {
            id: uuid::Uuid::new_v4(),
            namespace: s.namespace.clone(),
            range: s.range.clone(),
            donor_shard: s.donor.clone(),
            migration_id: s.migration_id.clone(),
            created_at_ms: now,
            not_before_ms: now.saturating_add(delay),
        };

        // Ownership already moved, so the task must be recorded eventually.
        // Keep retrying while the lock stays held.
        let (store, pending) = (&c.store, &task);
        let mut failures = 0u32;
        while let Err(e) = retry_with_backoff(
            "schedule range deletion",
            || async move { store.schedule_range_deletion(pending.clone()) },
            c.config.refresh_max_retries,
            c.config.refresh_initial_backoff,
        )
        .await
        {
            failures += 1;
            tracing::error!(
                migration_id = %s.migration_id,
                namespace = %s.namespace,
                failures,
                error = %e,
                "committed migration could not schedule orphan cleanup, retrying"
            );
            self.status.send_modify(|st| st.error = Some(e.to_string()));
            tokio::time::sleep(c.config.range_deleter_interval).await;
        }
        c.store.release_migration_lock(&s.migration_id);
        self.status.send_modify(|st| {
            st.deletion_task = Some(task.id);
            st.error = None;
        });
        self.set_phase(MigrationPhase::RangeDeletionScheduled);

        // Wait out the delay, re-reading the clock so a stepped test clock is seen.
        let poll = c.config.range_deleter_interval;
        loop {
            let now = c.store.clock().now_millis();
            if task.is_due(now) {
                break;
            }
            let remaining = Duration::from_millis(task.not_before_ms - now);
            tokio::time::sleep(remaining.min(poll)).await;
        }

        match c.deleter.execute(&task) {
            Ok(_) => {}
            Err(e) => {
                // The background deleter retries pending tasks.
                tracing::warn!(migration_id = %s.migration_id, error = %e, "orphan cleanup deferred");
            }
        }
        self.set_phase(MigrationPhase::Done);
        Ok(self.snapshot())
    }

    /// Undo everything done before the commit point.
    fn abort(&self, cause: &Error) {
        let s = self.snapshot();
        let c = &self.coordinator;

        self.unpause(&s.donor);
        self.unpause(&s.recipient);
        if let Err(e) = c.data.delete_range(&s.recipient, &s.namespace, &s.range) {
            tracing::warn!(
                migration_id = %s.migration_id,
                recipient = %s.recipient,
                error = %e,
                "could not discard partial clone on recipient"
            );
        }
        c.store.set_critical_section(&s.migration_id, false);
        c.store.release_migration_lock(&s.migration_id);
        c.metrics.migrations_aborted.inc();

        self.status.send_modify(|st| {
            st.phase = MigrationPhase::Aborted;
            st.error = Some(cause.to_string());
        });
        tracing::warn!(
            migration_id = %s.migration_id,
            namespace = %s.namespace,
            range = %s.range,
            from = %s.donor,
            to = %s.recipient,
            phase = ?s.phase,
            error = %cause,
            "migration aborted, donor keeps ownership"
        );
    }
}
