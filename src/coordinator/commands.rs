//! Administrative commands
//!
//! Each command is a tagged variant with typed fields:
//!
//! ```json
//! { "command": "moveChunk", "namespace": "db.c", "find": [{"int": 5}], "to": "shard0" }
//! ```
//!
//! Replies are `{ "ok": 1, ... }` on success and
//! `{ "ok": 0, "codeName": ..., "errmsg": ... }` on failure.

use crate::common::{
    validate_namespace, Error, ErrorKind, KeyRange, Result, RetryPolicy, ShardId, ShardKey,
};
use crate::coordinator::cluster::Cluster;
use crate::coordinator::consistency::CheckScope;
use crate::coordinator::drain::{DrainState, DrainStatus};
use crate::coordinator::metadata::{Mutation, NamespaceEntry, ShardState};
use crate::coordinator::migration::MoveChunkRequest;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum AdminCommand {
    EnableSharding {
        database: String,
        #[serde(default)]
        primary_shard: Option<ShardId>,
    },
    ShardCollection {
        namespace: String,
        key: Vec<String>,
        #[serde(default)]
        split_points: Vec<ShardKey>,
    },
    SplitChunk {
        namespace: String,
        middle: ShardKey,
    },
    MergeChunks {
        namespace: String,
        bounds: KeyRange,
    },
    /// Either `range` or `find` selects what moves.
    MoveChunk {
        namespace: String,
        #[serde(default)]
        range: Option<KeyRange>,
        #[serde(default)]
        find: Option<ShardKey>,
        to: ShardId,
    },
    AddShard {
        shard: ShardId,
        host: String,
    },
    RemoveShard {
        shard: ShardId,
    },
    StopDraining {
        shard: ShardId,
    },
    CommitShardRemoval {
        shard: ShardId,
    },
    DrainStatus {
        shard: ShardId,
    },
    MovePrimary {
        database: String,
        to: ShardId,
    },
    DropDatabase {
        database: String,
    },
    DropCollection {
        namespace: String,
    },
    ListShards,
    FlushRouterConfig {
        #[serde(default)]
        namespace: Option<String>,
    },
    CheckMetadataConsistency {
        #[serde(default)]
        namespace: Option<String>,
    },
    ForceOverwrite {
        record: NamespaceEntry,
    },
}

impl AdminCommand {
    pub fn name(&self) -> &'static str {
        match self {
            AdminCommand::EnableSharding { .. } => "enableSharding",
            AdminCommand::ShardCollection { .. } => "shardCollection",
            AdminCommand::SplitChunk { .. } => "splitChunk",
            AdminCommand::MergeChunks { .. } => "mergeChunks",
            AdminCommand::MoveChunk { .. } => "moveChunk",
            AdminCommand::AddShard { .. } => "addShard",
            AdminCommand::RemoveShard { .. } => "removeShard",
            AdminCommand::StopDraining { .. } => "stopDraining",
            AdminCommand::CommitShardRemoval { .. } => "commitShardRemoval",
            AdminCommand::DrainStatus { .. } => "drainStatus",
            AdminCommand::MovePrimary { .. } => "movePrimary",
            AdminCommand::DropDatabase { .. } => "dropDatabase",
            AdminCommand::DropCollection { .. } => "dropCollection",
            AdminCommand::ListShards => "listShards",
            AdminCommand::FlushRouterConfig { .. } => "flushRouterConfig",
            AdminCommand::CheckMetadataConsistency { .. } => "checkMetadataConsistency",
            AdminCommand::ForceOverwrite { .. } => "forceOverwrite",
        }
    }

    /// Field-level checks that need no metadata.
    pub fn validate(&self) -> Result<()> {
        match self {
            AdminCommand::EnableSharding { database, .. }
            | AdminCommand::MovePrimary { database, .. }
            | AdminCommand::DropDatabase { database } => {
                validate_namespace(database)?;
                if database.contains('.') {
                    return Err(Error::InvalidCommand(format!(
                        "{:?} is not a database name",
                        database
                    )));
                }
                Ok(())
            }
            AdminCommand::ShardCollection { namespace, key, .. } => {
                require_collection(namespace)?;
                if key.is_empty() || key.iter().any(String::is_empty) {
                    return Err(Error::InvalidCommand(
                        "shard key needs at least one named field".into(),
                    ));
                }
                Ok(())
            }
            AdminCommand::SplitChunk { namespace, .. }
            | AdminCommand::DropCollection { namespace } => require_collection(namespace),
            AdminCommand::MergeChunks { namespace, bounds } => {
                require_collection(namespace)?;
                if bounds.is_empty() {
                    return Err(Error::InvalidCommand(format!("{} is empty", bounds)));
                }
                Ok(())
            }
            AdminCommand::MoveChunk {
                namespace,
                range,
                find,
                ..
            } => {
                require_collection(namespace)?;
                match (range, find) {
                    (Some(_), None) | (None, Some(_)) => Ok(()),
                    _ => Err(Error::InvalidCommand(
                        "moveChunk needs exactly one of range or find".into(),
                    )),
                }
            }
            AdminCommand::AddShard { shard, host } => {
                if shard.as_str().is_empty() || host.is_empty() {
                    return Err(Error::InvalidCommand(
                        "addShard needs a shard id and a host".into(),
                    ));
                }
                Ok(())
            }
            AdminCommand::FlushRouterConfig { namespace }
            | AdminCommand::CheckMetadataConsistency { namespace } => match namespace {
                Some(ns) => validate_namespace(ns),
                None => Ok(()),
            },
            AdminCommand::ForceOverwrite { record } => validate_namespace(record.namespace()),
            AdminCommand::RemoveShard { .. }
            | AdminCommand::StopDraining { .. }
            | AdminCommand::CommitShardRemoval { .. }
            | AdminCommand::DrainStatus { .. }
            | AdminCommand::ListShards => Ok(()),
        }
    }
}

fn require_collection(namespace: &str) -> Result<()> {
    validate_namespace(namespace)?;
    if !namespace.contains('.') {
        return Err(Error::InvalidCommand(format!(
            "{:?} is not a collection namespace",
            namespace
        )));
    }
    Ok(())
}

/// Error reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandFailure {
    pub ok: u8,
    pub code_name: String,
    pub errmsg: String,
}

impl From<&Error> for CommandFailure {
    fn from(e: &Error) -> Self {
        Self {
            ok: 0,
            code_name: e.kind().as_str().to_string(),
            errmsg: e.to_string(),
        }
    }
}

/// Executes admin commands against a [`Cluster`].
pub struct CommandDispatcher {
    cluster: Arc<Cluster>,
    drains: Mutex<BTreeMap<ShardId, JoinHandle<Result<DrainStatus>>>>,
}

impl CommandDispatcher {
    pub fn new(cluster: Arc<Cluster>) -> Self {
        Self {
            cluster,
            drains: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    /// Run a command, folding errors into a `CommandFailure` reply.
    pub async fn handle(&self, cmd: AdminCommand) -> Value {
        match self.run(cmd).await {
            Ok(reply) => reply,
            Err(e) => json!(CommandFailure::from(&e)),
        }
    }

    pub async fn run(&self, cmd: AdminCommand) -> Result<Value> {
        cmd.validate()?;
        let name = cmd.name();
        tracing::debug!(command = name, "running admin command");

        let result = self.execute(cmd).await;
        match &result {
            Ok(_) => tracing::info!(command = name, "admin command succeeded"),
            Err(e) => tracing::warn!(command = name, code = %e.kind(), error = %e, "admin command failed"),
        }
        result
    }

    async fn execute(&self, cmd: AdminCommand) -> Result<Value> {
        let store = self.cluster.store();
        match cmd {
            AdminCommand::EnableSharding {
                database,
                primary_shard,
            } => {
                let record = store.create_database(&database, primary_shard)?;
                Ok(json!({ "ok": 1, "database": record }))
            }
            AdminCommand::ShardCollection {
                namespace,
                key,
                split_points,
            } => {
                let record = store.shard_collection(&namespace, key, split_points)?;
                Ok(json!({ "ok": 1, "collection": record }))
            }
            AdminCommand::SplitChunk { namespace, middle } => {
                let version = self.collection_cas(&namespace, Mutation::SplitChunk { at: middle })?;
                Ok(json!({ "ok": 1, "version": version }))
            }
            AdminCommand::MergeChunks { namespace, bounds } => {
                let version =
                    self.collection_cas(&namespace, Mutation::MergeChunks { range: bounds })?;
                Ok(json!({ "ok": 1, "version": version }))
            }
            AdminCommand::MoveChunk {
                namespace,
                range,
                find,
                to,
            } => {
                let migrations = self.cluster.migrations();
                let status = match (range, find) {
                    (Some(range), _) => {
                        migrations
                            .move_chunk(MoveChunkRequest {
                                namespace,
                                range,
                                to,
                            })
                            .await?
                    }
                    (None, Some(key)) => {
                        migrations
                            .move_chunk_containing(&namespace, &key, to)
                            .await?
                    }
                    (None, None) => {
                        return Err(Error::InvalidCommand(
                            "moveChunk needs exactly one of range or find".into(),
                        ))
                    }
                };
                Ok(json!({ "ok": 1, "migration": status }))
            }
            AdminCommand::AddShard { shard, host } => {
                let entry = self.cluster.add_shard(shard, &host)?;
                Ok(json!({ "ok": 1, "shardAdded": entry.shard_id, "shard": entry }))
            }
            AdminCommand::RemoveShard { shard } => self.remove_shard(shard).await,
            AdminCommand::StopDraining { shard } => {
                if let Some(handle) = self.drain_tasks().remove(&shard) {
                    handle.abort();
                }
                let status = self.cluster.drain().stop_draining(&shard)?;
                Ok(json!({ "ok": 1, "drain": status }))
            }
            AdminCommand::CommitShardRemoval { shard } => {
                let status = self.cluster.drain().commit(&shard).await?;
                self.drain_tasks().remove(&shard);
                Ok(json!({ "ok": 1, "drain": status }))
            }
            AdminCommand::DrainStatus { shard } => {
                let status = self.cluster.drain().status(&shard)?;
                Ok(json!({ "ok": 1, "drain": status }))
            }
            AdminCommand::MovePrimary { database, to } => {
                match store.get_shard(&to)? {
                    Some(entry) if entry.state == ShardState::Active => {}
                    Some(entry) => {
                        return Err(Error::ShardNotActive {
                            shard: to.to_string(),
                            state: entry.state.to_string(),
                        })
                    }
                    None => return Err(Error::ShardNotFound(to.to_string())),
                }
                let version = self.cluster.drain().move_primary(&database, &to)?;
                Ok(json!({ "ok": 1, "primary": to, "version": version }))
            }
            AdminCommand::DropDatabase { database } => {
                let current = store
                    .get_database(&database)?
                    .ok_or_else(|| Error::NamespaceNotFound(database.clone()))?;
                store.compare_and_swap(&database, current.version, Mutation::DropDatabase)?;
                self.cluster.flush_router_config(Some(&database));
                Ok(json!({ "ok": 1, "dropped": database }))
            }
            AdminCommand::DropCollection { namespace } => {
                self.collection_cas(&namespace, Mutation::DropCollection)?;
                self.cluster.flush_router_config(Some(&namespace));
                Ok(json!({ "ok": 1, "dropped": namespace }))
            }
            AdminCommand::ListShards => Ok(json!({ "ok": 1, "shards": store.list_shards()? })),
            AdminCommand::FlushRouterConfig { namespace } => {
                let flushed = self.cluster.flush_router_config(namespace.as_deref());
                Ok(json!({ "ok": 1, "flushed": flushed }))
            }
            AdminCommand::CheckMetadataConsistency { namespace } => {
                let scope = match namespace {
                    Some(ns) => CheckScope::Namespace(ns),
                    None => CheckScope::Cluster,
                };
                let findings = self.cluster.checker().check(&scope).await?;
                let mut fatal = 0;
                for f in findings.iter().filter(|f| f.is_fatal()) {
                    fatal += 1;
                    store.quarantine(&f.namespace, format!("{:?}: {}", f.kind, f.details));
                }
                Ok(json!({ "ok": 1, "fatal": fatal, "inconsistencies": findings }))
            }
            AdminCommand::ForceOverwrite { record } => {
                let namespace = record.namespace().to_string();
                let version = store.force_overwrite(record)?;
                self.cluster.force_refresh_everywhere(&namespace).await?;
                Ok(json!({ "ok": 1, "namespace": namespace, "version": version }))
            }
        }
    }

    /// CAS against the current collection version, re-reading on conflict.
    fn collection_cas(&self, namespace: &str, mutation: Mutation) -> Result<crate::common::Version> {
        let store = self.cluster.store();
        let mut attempt = 0;
        loop {
            let current = store
                .get_collection(namespace)?
                .ok_or_else(|| Error::NamespaceNotFound(namespace.to_string()))?;
            match store.compare_and_swap(namespace, current.version, mutation.clone()) {
                Err(e)
                    if e.kind().retry_policy() == RetryPolicy::RefetchAndRetry
                        && attempt < self.cluster.config().refresh_max_retries =>
                {
                    attempt += 1;
                    tracing::debug!(namespace, attempt, "metadata changed underneath, retrying");
                }
                result => return result,
            }
        }
    }

    /// First call starts draining in the background, later calls report
    /// progress, and the call after drain completes commits the removal.
    async fn remove_shard(&self, shard: ShardId) -> Result<Value> {
        let drain = self.cluster.drain();
        let entry = self
            .cluster
            .store()
            .get_shard(&shard)?
            .ok_or_else(|| Error::ShardNotFound(shard.to_string()))?;

        match entry.state {
            ShardState::Removed => {
                let status = drain.status(&shard)?;
                return Ok(json!({ "ok": 1, "msg": "removeshard completed successfully", "drain": status }));
            }
            ShardState::Active => {
                let status = drain.start_draining(&shard)?;
                self.spawn_drain(&shard);
                return Ok(json!({ "ok": 1, "msg": "draining started successfully", "drain": status }));
            }
            ShardState::Draining => {}
        }

        let status = drain.status(&shard)?;
        if status.state != DrainState::DrainComplete {
            self.spawn_drain(&shard);
            return Ok(json!({ "ok": 1, "msg": "draining ongoing", "drain": status }));
        }

        let now = self.cluster.store().clock().now_millis();
        if status.blocked_until_ms.is_some_and(|t| t > now) {
            return Ok(json!({ "ok": 1, "msg": "waiting for orphan cleanup", "drain": status }));
        }

        let status = drain.commit(&shard).await?;
        self.drain_tasks().remove(&shard);
        Ok(json!({ "ok": 1, "msg": "removeshard completed successfully", "drain": status }))
    }

    /// Start a drain driver unless one is already running for `shard`.
    fn spawn_drain(&self, shard: &ShardId) {
        let mut tasks = self.drain_tasks();
        if tasks.get(shard).is_some_and(|h| !h.is_finished()) {
            return;
        }
        let drain = self.cluster.drain().clone();
        let id = shard.clone();
        let handle = tokio::spawn(async move {
            let result = drain.run_to_completion(&id).await;
            match &result {
                Ok(status) => tracing::info!(shard = %id, state = ?status.state, "drain driver finished"),
                Err(e) if e.kind() == ErrorKind::DrainCancelled => {
                    tracing::info!(shard = %id, "drain driver stopped")
                }
                Err(e) => tracing::warn!(shard = %id, error = %e, "drain driver failed"),
            }
            result
        });
        tasks.insert(shard.clone(), handle);
    }

    fn drain_tasks(
        &self,
    ) -> std::sync::MutexGuard<'_, BTreeMap<ShardId, JoinHandle<Result<DrainStatus>>>> {
        self.drains.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Wait for the background drain of `shard`, if any.
    pub async fn wait_for_drain(&self, shard: &ShardId) -> Option<Result<DrainStatus>> {
        let handle = self.drain_tasks().remove(shard)?;
        Some(
            handle
                .await
                .map_err(|e| Error::Internal(format!("drain task failed: {}", e)))
                .and_then(|r| r),
        )
    }
}
