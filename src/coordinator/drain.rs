//! Shard removal
//!
//! ```text
//! NotDraining → DrainingDatabases → DrainingChunks → DrainComplete → Committed
//! ```
//!
//! The state is derived from the metadata store on every call, so a restarted
//! config server resumes where the drain left off. Commit waits until every
//! orphan cleanup task with the shard as donor is due, runs them, and only
//! then marks the shard removed.

use crate::common::{ClusterConfig, Error, Result, ShardId, Version};
use crate::coordinator::metadata::{MetadataStore, Mutation, ShardState};
use crate::coordinator::migration::{ChunkMigrationCoordinator, MoveChunkRequest};
use crate::coordinator::range_deleter::RangeDeleter;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum DrainState {
    NotDraining,
    DrainingDatabases,
    DrainingChunks,
    DrainComplete,
    Committed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainStatus {
    pub shard: ShardId,
    pub state: DrainState,
    pub remaining_databases: Vec<String>,
    pub remaining_chunks: usize,
    pub pending_range_deletions: usize,
    /// Latest `not_before` among the pending deletions
    pub blocked_until_ms: Option<u64>,
}

pub struct DrainCoordinator {
    store: Arc<MetadataStore>,
    migrations: Arc<ChunkMigrationCoordinator>,
    deleter: Arc<RangeDeleter>,
    config: ClusterConfig,
}

impl DrainCoordinator {
    pub fn new(
        store: Arc<MetadataStore>,
        migrations: Arc<ChunkMigrationCoordinator>,
        deleter: Arc<RangeDeleter>,
        config: ClusterConfig,
    ) -> Self {
        Self {
            store,
            migrations,
            deleter,
            config,
        }
    }

    pub fn status(&self, shard: &ShardId) -> Result<DrainStatus> {
        let entry = self
            .store
            .get_shard(shard)?
            .ok_or_else(|| Error::ShardNotFound(shard.to_string()))?;
        let remaining_databases = self.store.databases_owned_by(shard)?;
        let remaining_chunks = self.store.chunks_owned_by(shard)?.len();
        let pending = self.store.range_deletions_for_donor(shard)?;

        let state = match entry.state {
            ShardState::Active => DrainState::NotDraining,
            ShardState::Removed => DrainState::Committed,
            ShardState::Draining if !remaining_databases.is_empty() => {
                DrainState::DrainingDatabases
            }
            ShardState::Draining if remaining_chunks > 0 => DrainState::DrainingChunks,
            ShardState::Draining => DrainState::DrainComplete,
        };

        Ok(DrainStatus {
            shard: shard.clone(),
            state,
            remaining_databases,
            remaining_chunks,
            pending_range_deletions: pending.len(),
            blocked_until_ms: pending.iter().map(|t| t.not_before_ms).max(),
        })
    }

    /// Mark `shard` draining. No database or chunk can be assigned to it
    /// afterwards. Calling it on a draining shard just reports status.
    pub fn start_draining(&self, shard: &ShardId) -> Result<DrainStatus> {
        let entry = self
            .store
            .get_shard(shard)?
            .ok_or_else(|| Error::ShardNotFound(shard.to_string()))?;
        match entry.state {
            ShardState::Removed => {
                return Err(Error::IllegalOperation(format!(
                    "shard {} is already removed",
                    shard
                )))
            }
            ShardState::Draining => return self.status(shard),
            ShardState::Active => {}
        }

        let others = self
            .store
            .active_shards()?
            .into_iter()
            .filter(|s| s != shard)
            .count();
        if others == 0 {
            return Err(Error::IllegalOperation(format!(
                "cannot drain {}: it is the last active shard",
                shard
            )));
        }

        self.store.set_shard_state(shard, ShardState::Draining)?;
        let status = self.status(shard)?;
        tracing::info!(
            shard = %shard,
            databases = status.remaining_databases.len(),
            chunks = status.remaining_chunks,
            state = ?status.state,
            "shard draining started"
        );
        Ok(status)
    }

    /// Revert a draining shard to active. Migrations already committed stay.
    pub fn stop_draining(&self, shard: &ShardId) -> Result<DrainStatus> {
        let entry = self
            .store
            .get_shard(shard)?
            .ok_or_else(|| Error::ShardNotFound(shard.to_string()))?;
        match entry.state {
            ShardState::Removed => Err(Error::IllegalOperation(format!(
                "shard {} is already removed",
                shard
            ))),
            ShardState::Active => self.status(shard),
            ShardState::Draining => {
                self.store.set_shard_state(shard, ShardState::Active)?;
                tracing::info!(shard = %shard, "shard draining stopped");
                self.status(shard)
            }
        }
    }

    /// Active shard with the fewest databases and chunks, excluding `except`.
    fn least_loaded_target(&self, except: &ShardId) -> Result<ShardId> {
        let mut best: Option<(usize, ShardId)> = None;
        for shard in self.store.active_shards()? {
            if &shard == except {
                continue;
            }
            let load = self.store.databases_owned_by(&shard)?.len()
                + self.store.chunks_owned_by(&shard)?.len();
            if best.as_ref().map_or(true, |(l, _)| load < *l) {
                best = Some((load, shard));
            }
        }
        best.map(|(_, s)| s)
            .ok_or_else(|| Error::IllegalOperation("no active shard to drain into".into()))
    }

    /// Point `database` at a new primary, re-reading the version on conflict.
    pub fn move_primary(&self, database: &str, to: &ShardId) -> Result<Version> {
        let mut attempt = 0;
        loop {
            let current = self
                .store
                .get_database(database)?
                .ok_or_else(|| Error::NamespaceNotFound(database.to_string()))?;
            match self.store.compare_and_swap(
                database,
                current.version,
                Mutation::MovePrimary { to: to.clone() },
            ) {
                Err(Error::MetadataConflict { .. }) if attempt < self.config.refresh_max_retries => {
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    fn ensure_still_draining(&self, shard: &ShardId) -> Result<()> {
        match self.store.get_shard(shard)? {
            Some(entry) if entry.state == ShardState::Draining => Ok(()),
            _ => Err(Error::DrainCancelled(shard.to_string())),
        }
    }

    /// Move every database primary and chunk off a draining shard, one at a
    /// time. Stops with `DrainCancelled` if draining is stopped meanwhile.
    pub async fn run_to_completion(&self, shard: &ShardId) -> Result<DrainStatus> {
        loop {
            self.ensure_still_draining(shard)?;

            if let Some(database) = self.store.databases_owned_by(shard)?.into_iter().next() {
                let target = self.least_loaded_target(shard)?;
                let version = self.move_primary(&database, &target)?;
                tracing::info!(shard = %shard, database = %database, to = %target, version = %version, "primary moved off draining shard");
                continue;
            }

            if let Some((namespace, chunk)) = self.store.chunks_owned_by(shard)?.into_iter().next() {
                let target = self.least_loaded_target(shard)?;
                let status = self
                    .migrations
                    .move_chunk(MoveChunkRequest {
                        namespace,
                        range: chunk.range,
                        to: target,
                    })
                    .await?;
                tracing::info!(
                    shard = %shard,
                    namespace = %status.namespace,
                    range = %status.range,
                    to = %status.recipient,
                    "chunk moved off draining shard"
                );
                continue;
            }

            return self.status(shard);
        }
    }

    /// Finish removing a drained shard.
    ///
    /// Blocks, re-checking every `drain_poll_interval`, until every range
    /// deletion with this shard as donor is due and no migration touches it,
    /// for at most `drain_commit_timeout`.
    pub async fn commit(&self, shard: &ShardId) -> Result<DrainStatus> {
        let status = self.status(shard)?;
        match status.state {
            DrainState::Committed => return Ok(status),
            DrainState::DrainComplete => {}
            DrainState::NotDraining => {
                return Err(Error::IllegalOperation(format!(
                    "shard {} is not draining",
                    shard
                )))
            }
            DrainState::DrainingDatabases | DrainState::DrainingChunks => {
                return Err(Error::ShardNotDrained {
                    shard: shard.to_string(),
                    databases: status.remaining_databases.len(),
                    chunks: status.remaining_chunks,
                })
            }
        }

        let timeout = self.config.drain_commit_timeout;
        match tokio::time::timeout(timeout, self.wait_for_orphan_cleanup(shard)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::OperationTimedOut(format!(
                    "removal of shard {} still waiting on range deletions after {:?}",
                    shard, timeout
                )))
            }
        }

        self.store.set_shard_state(shard, ShardState::Removed)?;
        tracing::info!(shard = %shard, "shard removal committed");
        self.status(shard)
    }

    async fn wait_for_orphan_cleanup(&self, shard: &ShardId) -> Result<()> {
        let poll: Duration = self.config.drain_poll_interval;
        loop {
            self.ensure_still_draining(shard)?;

            let busy = self
                .store
                .active_migrations(None)
                .iter()
                .any(|m| &m.donor == shard || &m.recipient == shard);
            let pending = self.store.range_deletions_for_donor(shard)?;
            let now = self.store.clock().now_millis();

            if !busy && pending.iter().all(|t| t.is_due(now)) {
                for task in &pending {
                    self.deleter.execute(task)?;
                }
                if self.store.range_deletions_for_donor(shard)?.is_empty() {
                    return Ok(());
                }
            } else {
                tracing::debug!(
                    shard = %shard,
                    pending = pending.len(),
                    migrations_in_flight = busy,
                    "shard removal waiting on orphan cleanup"
                );
            }
            tokio::time::sleep(poll).await;
        }
    }
}
