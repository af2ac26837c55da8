//! Authoritative metadata store
//!
//! Stores:
//! - Database records (primary shard)
//! - Collection records (shard key pattern + chunk map)
//! - Shard registry (shard id → connection info, state)
//! - Range deletion tasks left behind by committed migrations
//! - Advisory migration locks
//!
//! Every mutation is a compare-and-swap on the record version, stamped by the
//! [`VersionClock`], and appended to the [`ChangeLog`]. When opened on disk the
//! records are written through to RocksDB.

use crate::common::{
    split_namespace, Error, KeyBound, KeyRange, Result, ShardId, ShardKey, Version,
    VersionClock,
};
use crate::coordinator::changelog::{Change, ChangeLog};
use rocksdb::{Options, DB};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

const CF_DATABASES: &str = "databases";
const CF_COLLECTIONS: &str = "collections";
const CF_SHARDS: &str = "shards";
const CF_RANGE_DELETIONS: &str = "range_deletions";

/// Database metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseRecord {
    pub name: String,
    pub primary_shard: ShardId,
    pub version: Version,
}

/// One contiguous range of a sharded collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub range: KeyRange,
    pub owning_shard: ShardId,
    pub last_modified: Version,
}

/// Sharded collection metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionRecord {
    pub namespace: String,
    pub shard_key_pattern: Vec<String>,
    /// Sorted by range, gap-free from MinKey to MaxKey
    pub chunks: Vec<ChunkRecord>,
    pub version: Version,
}

impl CollectionRecord {
    pub fn database(&self) -> &str {
        split_namespace(&self.namespace).0
    }

    pub fn chunk_for_key(&self, key: &ShardKey) -> Option<&ChunkRecord> {
        self.chunks.iter().find(|c| c.range.contains_key(key))
    }

    /// Index of the single chunk that fully contains `range`.
    pub fn chunk_containing(&self, range: &KeyRange) -> Option<usize> {
        self.chunks
            .iter()
            .position(|c| c.range.contains_range(range))
    }

    pub fn shards(&self) -> BTreeSet<ShardId> {
        self.chunks.iter().map(|c| c.owning_shard.clone()).collect()
    }

    pub fn chunks_on(&self, shard: &ShardId) -> usize {
        self.chunks
            .iter()
            .filter(|c| &c.owning_shard == shard)
            .count()
    }

    /// Check that the chunks partition the key space with no gap or overlap.
    pub fn validate(&self) -> Result<()> {
        validate_chunks(&self.namespace, &self.chunks)
    }
}

pub fn validate_chunks(namespace: &str, chunks: &[ChunkRecord]) -> Result<()> {
    let invalid = |reason: String| Error::InvalidChunkMap {
        namespace: namespace.to_string(),
        reason,
    };

    let (first, last) = match (chunks.first(), chunks.last()) {
        (Some(first), Some(last)) => (first, last),
        _ => return Err(invalid("no chunks".into())),
    };
    if first.range.min != KeyBound::MinKey {
        return Err(invalid(format!("first chunk starts at {}", first.range.min)));
    }
    if last.range.max != KeyBound::MaxKey {
        return Err(invalid(format!("last chunk ends at {}", last.range.max)));
    }
    for chunk in chunks {
        if chunk.range.is_empty() {
            return Err(invalid(format!("empty chunk {}", chunk.range)));
        }
    }
    for pair in chunks.windows(2) {
        if pair[0].range.max < pair[1].range.min {
            return Err(invalid(format!(
                "gap between {} and {}",
                pair[0].range, pair[1].range
            )));
        }
        if pair[0].range.max > pair[1].range.min {
            return Err(invalid(format!(
                "overlap between {} and {}",
                pair[0].range, pair[1].range
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardState {
    Active,
    Draining,
    Removed,
}

impl std::fmt::Display for ShardState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShardState::Active => write!(f, "active"),
            ShardState::Draining => write!(f, "draining"),
            ShardState::Removed => write!(f, "removed"),
        }
    }
}

/// Shard registry entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRegistryEntry {
    pub shard_id: ShardId,
    pub connection_info: String,
    pub state: ShardState,
    pub version: Version,
}

/// Deferred deletion of orphaned documents on a migration donor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeDeletionTask {
    pub id: uuid::Uuid,
    pub namespace: String,
    pub range: KeyRange,
    pub donor_shard: ShardId,
    pub migration_id: String,
    pub created_at_ms: u64,
    pub not_before_ms: u64,
}

impl RangeDeletionTask {
    pub fn is_due(&self, now_ms: u64) -> bool {
        now_ms >= self.not_before_ms
    }
}

/// Advisory lock held by an in-flight migration on a chunk range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationLock {
    pub migration_id: String,
    pub namespace: String,
    pub range: KeyRange,
    pub donor: ShardId,
    pub recipient: ShardId,
    pub acquired_at_ms: u64,
    pub critical_section: bool,
}

/// Either kind of namespace record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NamespaceEntry {
    Database(DatabaseRecord),
    Collection(CollectionRecord),
}

impl NamespaceEntry {
    pub fn namespace(&self) -> &str {
        match self {
            NamespaceEntry::Database(db) => &db.name,
            NamespaceEntry::Collection(coll) => &coll.namespace,
        }
    }

    pub fn version(&self) -> Version {
        match self {
            NamespaceEntry::Database(db) => db.version,
            NamespaceEntry::Collection(coll) => coll.version,
        }
    }

    /// Whether both entries describe the same kind of record. Versions of
    /// a database and of a collection are not comparable.
    pub fn same_kind(&self, other: &NamespaceEntry) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

/// CAS mutation applied to a namespace record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Mutation {
    SplitChunk { at: ShardKey },
    MergeChunks { range: KeyRange },
    /// Move `range` (inside a single chunk) to `to`, splitting at its bounds
    TransferChunk { range: KeyRange, to: ShardId },
    DropCollection,
    MovePrimary { to: ShardId },
    DropDatabase,
}

/// Metadata store
pub struct MetadataStore {
    clock: Arc<VersionClock>,
    changelog: ChangeLog,
    db: Option<DB>,
    reachable: AtomicBool,
    shards: RwLock<BTreeMap<ShardId, ShardRegistryEntry>>,
    databases: RwLock<BTreeMap<String, DatabaseRecord>>,
    collections: RwLock<BTreeMap<String, CollectionRecord>>,
    range_deletions: RwLock<BTreeMap<uuid::Uuid, RangeDeletionTask>>,
    migrations: RwLock<BTreeMap<String, MigrationLock>>,
    quarantined: RwLock<BTreeMap<String, String>>,
}

impl MetadataStore {
    /// Volatile store
    pub fn in_memory(clock: Arc<VersionClock>) -> Self {
        Self {
            clock,
            changelog: ChangeLog::new(),
            db: None,
            reachable: AtomicBool::new(true),
            shards: RwLock::new(BTreeMap::new()),
            databases: RwLock::new(BTreeMap::new()),
            collections: RwLock::new(BTreeMap::new()),
            range_deletions: RwLock::new(BTreeMap::new()),
            migrations: RwLock::new(BTreeMap::new()),
            quarantined: RwLock::new(BTreeMap::new()),
        }
    }

    /// Open or create a RocksDB-backed store and reload its records
    pub fn open(path: impl AsRef<Path>, clock: Arc<VersionClock>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(
            &opts,
            path.as_ref(),
            vec![CF_DATABASES, CF_COLLECTIONS, CF_SHARDS, CF_RANGE_DELETIONS],
        )?;

        let shards: Vec<ShardRegistryEntry> = load_cf(&db, CF_SHARDS)?;
        let databases: Vec<DatabaseRecord> = load_cf(&db, CF_DATABASES)?;
        let collections: Vec<CollectionRecord> = load_cf(&db, CF_COLLECTIONS)?;
        let deletions: Vec<RangeDeletionTask> = load_cf(&db, CF_RANGE_DELETIONS)?;

        // Never issue a timestamp at or below one already persisted.
        let newest = shards
            .iter()
            .map(|s| s.version.timestamp)
            .chain(databases.iter().map(|d| d.version.timestamp))
            .chain(collections.iter().map(|c| c.version.timestamp))
            .max();
        if let Some(ts) = newest {
            clock.observe(ts);
        }

        let mut store = Self::in_memory(clock);
        tracing::info!(
            path = %path.as_ref().display(),
            shards = shards.len(),
            databases = databases.len(),
            collections = collections.len(),
            range_deletions = deletions.len(),
            "opened metadata store"
        );

        // Seed the change log so replicas can rebuild from sequence 0.
        {
            let mut map = store.shards.write().unwrap_or_else(|p| p.into_inner());
            for entry in shards {
                store
                    .changelog
                    .append(entry.version.timestamp, Change::ShardUpserted(entry.clone()));
                map.insert(entry.shard_id.clone(), entry);
            }
        }
        {
            let mut map = store.databases.write().unwrap_or_else(|p| p.into_inner());
            for record in databases {
                store
                    .changelog
                    .append(record.version.timestamp, Change::DatabaseUpserted(record.clone()));
                map.insert(record.name.clone(), record);
            }
        }
        {
            let mut map = store.collections.write().unwrap_or_else(|p| p.into_inner());
            for record in collections {
                store.changelog.append(
                    record.version.timestamp,
                    Change::CollectionUpserted(record.clone()),
                );
                map.insert(record.namespace.clone(), record);
            }
        }
        {
            let mut map = store
                .range_deletions
                .write()
                .unwrap_or_else(|p| p.into_inner());
            for task in deletions {
                map.insert(task.id, task);
            }
        }

        store.db = Some(db);
        Ok(store)
    }

    pub fn clock(&self) -> &Arc<VersionClock> {
        &self.clock
    }

    pub fn changelog(&self) -> &ChangeLog {
        &self.changelog
    }

    // === Availability ===

    /// Simulate losing (or regaining) connectivity to the config servers
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
        if reachable {
            tracing::info!("metadata store reachable");
        } else {
            tracing::warn!("metadata store unreachable");
        }
    }

    fn ensure_reachable(&self) -> Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::MetadataUnavailable(
                "config servers are unreachable".into(),
            ))
        }
    }

    // === Quarantine ===

    /// Block metadata operations on `namespace` until it is force-overwritten
    pub fn quarantine(&self, namespace: &str, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::error!(namespace, reason = %reason, "namespace quarantined");
        write(&self.quarantined).insert(namespace.to_string(), reason);
    }

    pub fn quarantined(&self) -> BTreeMap<String, String> {
        read(&self.quarantined).clone()
    }

    /// Fails if the namespace or its database is quarantined.
    pub fn ensure_not_quarantined(&self, namespace: &str) -> Result<()> {
        let quarantined = read(&self.quarantined);
        let (db, _) = split_namespace(namespace);
        for key in [namespace, db] {
            if let Some(reason) = quarantined.get(key) {
                return Err(Error::FatalInconsistency {
                    namespace: key.to_string(),
                    details: reason.clone(),
                });
            }
        }
        Ok(())
    }

    // === Reads ===

    /// Read the record governing `namespace`.
    ///
    /// A `db.coll` namespace with no collection record resolves to its
    /// database record (unsharded collections live on the primary).
    pub fn read(&self, namespace: &str) -> Result<Option<NamespaceEntry>> {
        self.ensure_reachable()?;
        let (db, coll) = split_namespace(namespace);
        if coll.is_some() {
            if let Some(record) = read(&self.collections).get(namespace) {
                return Ok(Some(NamespaceEntry::Collection(record.clone())));
            }
        }
        Ok(read(&self.databases)
            .get(db)
            .cloned()
            .map(NamespaceEntry::Database))
    }

    pub fn get_database(&self, name: &str) -> Result<Option<DatabaseRecord>> {
        self.ensure_reachable()?;
        Ok(read(&self.databases).get(name).cloned())
    }

    pub fn get_collection(&self, namespace: &str) -> Result<Option<CollectionRecord>> {
        self.ensure_reachable()?;
        Ok(read(&self.collections).get(namespace).cloned())
    }

    pub fn list_databases(&self) -> Result<Vec<DatabaseRecord>> {
        self.ensure_reachable()?;
        Ok(read(&self.databases).values().cloned().collect())
    }

    pub fn list_collections(&self) -> Result<Vec<CollectionRecord>> {
        self.ensure_reachable()?;
        Ok(read(&self.collections).values().cloned().collect())
    }

    pub fn list_shards(&self) -> Result<Vec<ShardRegistryEntry>> {
        self.ensure_reachable()?;
        Ok(read(&self.shards).values().cloned().collect())
    }

    pub fn get_shard(&self, shard: &ShardId) -> Result<Option<ShardRegistryEntry>> {
        self.ensure_reachable()?;
        Ok(read(&self.shards).get(shard).cloned())
    }

    pub fn active_shards(&self) -> Result<Vec<ShardId>> {
        Ok(self
            .list_shards()?
            .into_iter()
            .filter(|s| s.state == ShardState::Active)
            .map(|s| s.shard_id)
            .collect())
    }

    /// Databases whose primary is `shard`
    pub fn databases_owned_by(&self, shard: &ShardId) -> Result<Vec<String>> {
        self.ensure_reachable()?;
        Ok(read(&self.databases)
            .values()
            .filter(|d| &d.primary_shard == shard)
            .map(|d| d.name.clone())
            .collect())
    }

    /// `(namespace, chunk)` pairs owned by `shard`
    pub fn chunks_owned_by(&self, shard: &ShardId) -> Result<Vec<(String, ChunkRecord)>> {
        self.ensure_reachable()?;
        let collections = read(&self.collections);
        Ok(collections
            .values()
            .flat_map(|c| {
                c.chunks
                    .iter()
                    .filter(|chunk| &chunk.owning_shard == shard)
                    .map(|chunk| (c.namespace.clone(), chunk.clone()))
            })
            .collect())
    }

    // === Shard registry ===

    /// Register a shard (or bring a removed one back)
    pub fn add_shard(
        &self,
        shard: ShardId,
        connection_info: impl Into<String>,
    ) -> Result<ShardRegistryEntry> {
        self.ensure_reachable()?;
        let mut shards = write(&self.shards);
        let stamp = self.clock.next();
        let version = match shards.get(&shard) {
            Some(existing) if existing.state != ShardState::Removed => {
                return Err(Error::IllegalOperation(format!(
                    "shard {} is already registered",
                    shard
                )))
            }
            Some(existing) => existing.version.bump(stamp),
            None => Version::initial(stamp),
        };
        let entry = ShardRegistryEntry {
            shard_id: shard.clone(),
            connection_info: connection_info.into(),
            state: ShardState::Active,
            version,
        };
        self.persist(CF_SHARDS, shard.as_str(), &entry)?;
        shards.insert(shard.clone(), entry.clone());
        self.changelog
            .append(stamp, Change::ShardUpserted(entry.clone()));
        tracing::info!(shard = %shard, "shard added");
        Ok(entry)
    }

    /// Transition a shard between `active`, `draining` and `removed`.
    ///
    /// Moving to `removed` requires the shard to be draining and to own no
    /// database, no chunk and no pending range deletion.
    pub fn set_shard_state(&self, shard: &ShardId, state: ShardState) -> Result<ShardRegistryEntry> {
        self.ensure_reachable()?;
        let mut shards = write(&self.shards);
        let current = shards
            .get(shard)
            .cloned()
            .ok_or_else(|| Error::ShardNotFound(shard.to_string()))?;

        match (current.state, state) {
            (from, to) if from == to => return Ok(current),
            (ShardState::Active, ShardState::Draining) | (ShardState::Draining, ShardState::Active) => {}
            (ShardState::Draining, ShardState::Removed) => {
                let databases = self.databases_owned_by_locked(shard);
                let chunks = self.chunks_owned_by_locked(shard);
                if databases > 0 || chunks > 0 {
                    return Err(Error::ShardNotDrained {
                        shard: shard.to_string(),
                        databases,
                        chunks,
                    });
                }
                let pending = read(&self.range_deletions)
                    .values()
                    .filter(|t| &t.donor_shard == shard)
                    .count();
                if pending > 0 {
                    return Err(Error::IllegalOperation(format!(
                        "shard {} still has {} pending range deletion(s)",
                        shard, pending
                    )));
                }
            }
            (from, to) => {
                return Err(Error::IllegalOperation(format!(
                    "shard {} cannot move from {} to {}",
                    shard, from, to
                )))
            }
        }

        let stamp = self.clock.next();
        let entry = ShardRegistryEntry {
            state,
            version: current.version.bump(stamp),
            ..current
        };
        self.persist(CF_SHARDS, shard.as_str(), &entry)?;
        shards.insert(shard.clone(), entry.clone());
        self.changelog
            .append(stamp, Change::ShardUpserted(entry.clone()));
        tracing::info!(shard = %shard, state = %state, "shard state changed");
        Ok(entry)
    }

    fn databases_owned_by_locked(&self, shard: &ShardId) -> usize {
        read(&self.databases)
            .values()
            .filter(|d| &d.primary_shard == shard)
            .count()
    }

    fn chunks_owned_by_locked(&self, shard: &ShardId) -> usize {
        read(&self.collections)
            .values()
            .map(|c| c.chunks_on(shard))
            .sum()
    }

    fn require_active(shards: &BTreeMap<ShardId, ShardRegistryEntry>, shard: &ShardId) -> Result<()> {
        match shards.get(shard) {
            None => Err(Error::ShardNotFound(shard.to_string())),
            Some(entry) if entry.state != ShardState::Active => Err(Error::ShardNotActive {
                shard: shard.to_string(),
                state: entry.state.to_string(),
            }),
            Some(_) => Ok(()),
        }
    }

    // === Namespace creation ===

    /// Create a database record (enableSharding).
    ///
    /// Idempotent when the database exists with the requested primary. With
    /// no primary given, the active shard holding the fewest primaries wins.
    pub fn create_database(&self, name: &str, primary: Option<ShardId>) -> Result<DatabaseRecord> {
        self.ensure_reachable()?;
        let shards = read(&self.shards);
        let mut databases = write(&self.databases);

        if let Some(existing) = databases.get(name) {
            return match primary {
                Some(p) if p != existing.primary_shard => {
                    Err(Error::NamespaceExists(name.to_string()))
                }
                _ => Ok(existing.clone()),
            };
        }

        let primary = match primary {
            Some(p) => {
                Self::require_active(&shards, &p)?;
                p
            }
            None => shards
                .values()
                .filter(|s| s.state == ShardState::Active)
                .map(|s| {
                    let load = databases
                        .values()
                        .filter(|d| d.primary_shard == s.shard_id)
                        .count();
                    (load, s.shard_id.clone())
                })
                .min()
                .map(|(_, id)| id)
                .ok_or_else(|| Error::IllegalOperation("no active shards".into()))?,
        };

        let stamp = self.clock.next();
        let record = DatabaseRecord {
            name: name.to_string(),
            primary_shard: primary,
            version: Version::initial(stamp),
        };
        self.persist(CF_DATABASES, name, &record)?;
        databases.insert(name.to_string(), record.clone());
        self.changelog
            .append(stamp, Change::DatabaseUpserted(record.clone()));
        tracing::info!(database = name, primary = %record.primary_shard, "database created");
        Ok(record)
    }

    /// Shard a collection with an explicit initial chunk layout.
    ///
    /// The database is created on the first chunk's shard if missing.
    pub fn create_collection(
        &self,
        namespace: &str,
        shard_key_pattern: Vec<String>,
        layout: Vec<(KeyRange, ShardId)>,
    ) -> Result<CollectionRecord> {
        self.ensure_reachable()?;
        let (db, coll) = split_namespace(namespace);
        if coll.is_none() {
            return Err(Error::InvalidCommand(format!(
                "{} is not a collection namespace",
                namespace
            )));
        }
        if shard_key_pattern.is_empty() {
            return Err(Error::InvalidCommand("shard key pattern is empty".into()));
        }
        if read(&self.databases).get(db).is_none() {
            let primary = layout.first().map(|(_, s)| s.clone());
            self.create_database(db, primary)?;
        }

        let shards = read(&self.shards);
        let mut collections = write(&self.collections);
        if collections.contains_key(namespace) {
            return Err(Error::NamespaceExists(namespace.to_string()));
        }
        for (_, owner) in &layout {
            Self::require_active(&shards, owner)?;
        }

        let stamp = self.clock.next();
        let version = Version::initial(stamp);
        let mut chunks: Vec<ChunkRecord> = layout
            .into_iter()
            .map(|(range, owning_shard)| ChunkRecord {
                range,
                owning_shard,
                last_modified: version,
            })
            .collect();
        chunks.sort_by(|a, b| a.range.cmp(&b.range));

        let record = CollectionRecord {
            namespace: namespace.to_string(),
            shard_key_pattern,
            chunks,
            version,
        };
        record.validate()?;
        self.persist(CF_COLLECTIONS, namespace, &record)?;
        collections.insert(namespace.to_string(), record.clone());
        self.changelog
            .append(stamp, Change::CollectionUpserted(record.clone()));
        tracing::info!(
            namespace,
            chunks = record.chunks.len(),
            version = %record.version,
            "collection sharded"
        );
        Ok(record)
    }

    /// Shard a collection with every initial chunk on the database primary.
    pub fn shard_collection(
        &self,
        namespace: &str,
        shard_key_pattern: Vec<String>,
        split_points: Vec<ShardKey>,
    ) -> Result<CollectionRecord> {
        let (db, _) = split_namespace(namespace);
        let primary = match self.get_database(db)? {
            Some(record) => record.primary_shard,
            None => self.create_database(db, None)?.primary_shard,
        };

        let mut points = split_points;
        points.sort();
        points.dedup();
        let mut bounds = vec![KeyBound::MinKey];
        bounds.extend(points.into_iter().map(KeyBound::Value));
        bounds.push(KeyBound::MaxKey);

        let layout = bounds
            .windows(2)
            .map(|w| {
                (
                    KeyRange {
                        min: w[0].clone(),
                        max: w[1].clone(),
                    },
                    primary.clone(),
                )
            })
            .collect();
        self.create_collection(namespace, shard_key_pattern, layout)
    }

    // === Compare-and-swap ===

    /// Apply `mutation` if the record's version still equals `expected`.
    ///
    /// Returns the new version. A mismatch yields `MetadataConflict` and
    /// leaves the record untouched.
    pub fn compare_and_swap(
        &self,
        namespace: &str,
        expected: Version,
        mutation: Mutation,
    ) -> Result<Version> {
        self.ensure_reachable()?;
        self.ensure_not_quarantined(namespace)?;
        match mutation {
            Mutation::MovePrimary { to } => self.cas_move_primary(namespace, expected, to),
            Mutation::DropDatabase => self.cas_drop_database(namespace, expected),
            other => self.cas_collection(namespace, expected, other),
        }
    }

    fn cas_collection(&self, namespace: &str, expected: Version, mutation: Mutation) -> Result<Version> {
        let shards = read(&self.shards);
        let mut collections = write(&self.collections);
        let current = collections
            .get(namespace)
            .cloned()
            .ok_or_else(|| Error::NamespaceNotFound(namespace.to_string()))?;
        if current.version != expected {
            return Err(Error::MetadataConflict {
                namespace: namespace.to_string(),
                expected,
                actual: Some(current.version),
            });
        }

        let stamp = self.clock.next();
        let version = current.version.bump(stamp);

        if mutation == Mutation::DropCollection {
            self.erase(CF_COLLECTIONS, namespace)?;
            collections.remove(namespace);
            self.changelog.append(
                stamp,
                Change::CollectionDropped {
                    namespace: namespace.to_string(),
                },
            );
            tracing::info!(namespace, "collection dropped");
            return Ok(version);
        }

        let chunks = match &mutation {
            Mutation::SplitChunk { at } => split_chunks(&current, at, version)?,
            Mutation::MergeChunks { range } => merge_chunks(&current, range, version)?,
            Mutation::TransferChunk { range, to } => {
                Self::require_active(&shards, to)?;
                transfer_chunk(&current, range, to, version)?
            }
            _ => {
                return Err(Error::InvalidCommand(format!(
                    "{:?} does not apply to collection {}",
                    mutation, namespace
                )))
            }
        };
        validate_chunks(namespace, &chunks)?;

        let record = CollectionRecord {
            chunks,
            version,
            ..current
        };
        self.persist(CF_COLLECTIONS, namespace, &record)?;
        collections.insert(namespace.to_string(), record.clone());
        self.changelog
            .append(stamp, Change::CollectionUpserted(record));
        tracing::info!(namespace, mutation = ?mutation, version = %version, "collection metadata updated");
        Ok(version)
    }

    fn cas_move_primary(&self, name: &str, expected: Version, to: ShardId) -> Result<Version> {
        let shards = read(&self.shards);
        let mut databases = write(&self.databases);
        let current = databases
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NamespaceNotFound(name.to_string()))?;
        if current.version != expected {
            return Err(Error::MetadataConflict {
                namespace: name.to_string(),
                expected,
                actual: Some(current.version),
            });
        }
        if current.primary_shard == to {
            return Err(Error::IllegalOperation(format!(
                "{} is already the primary of {}",
                to, name
            )));
        }
        Self::require_active(&shards, &to)?;

        let stamp = self.clock.next();
        let record = DatabaseRecord {
            primary_shard: to,
            version: current.version.bump(stamp),
            ..current
        };
        self.persist(CF_DATABASES, name, &record)?;
        databases.insert(name.to_string(), record.clone());
        self.changelog
            .append(stamp, Change::DatabaseUpserted(record.clone()));
        tracing::info!(database = name, primary = %record.primary_shard, version = %record.version, "primary moved");
        Ok(record.version)
    }

    fn cas_drop_database(&self, name: &str, expected: Version) -> Result<Version> {
        let mut databases = write(&self.databases);
        let mut collections = write(&self.collections);
        let current = databases
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NamespaceNotFound(name.to_string()))?;
        if current.version != expected {
            return Err(Error::MetadataConflict {
                namespace: name.to_string(),
                expected,
                actual: Some(current.version),
            });
        }

        let stamp = self.clock.next();
        let dropped: Vec<String> = collections
            .values()
            .filter(|c| c.database() == name)
            .map(|c| c.namespace.clone())
            .collect();
        for ns in dropped {
            self.erase(CF_COLLECTIONS, &ns)?;
            collections.remove(&ns);
            self.changelog
                .append(stamp, Change::CollectionDropped { namespace: ns });
        }
        self.erase(CF_DATABASES, name)?;
        databases.remove(name);
        self.changelog.append(
            stamp,
            Change::DatabaseDropped {
                name: name.to_string(),
            },
        );
        tracing::info!(database = name, "database dropped");
        Ok(current.version.bump(stamp))
    }

    // === Repair primitives ===

    /// Unconditionally replace a record with an operator-supplied one.
    ///
    /// The stored version is bumped above both the current and the supplied
    /// version so every cache and replica picks the new record up. Clears any
    /// quarantine on the namespace.
    pub fn force_overwrite(&self, entry: NamespaceEntry) -> Result<Version> {
        self.ensure_reachable()?;
        let stamp = self.clock.next();
        let version = match entry {
            NamespaceEntry::Database(record) => {
                let shards = read(&self.shards);
                match shards.get(&record.primary_shard) {
                    Some(s) if s.state != ShardState::Removed => {}
                    _ => return Err(Error::ShardNotFound(record.primary_shard.to_string())),
                }
                let mut databases = write(&self.databases);
                let floor = databases
                    .get(&record.name)
                    .map(|r| r.version)
                    .unwrap_or(record.version)
                    .max(record.version);
                let record = DatabaseRecord {
                    version: floor.bump(stamp),
                    ..record
                };
                self.persist(CF_DATABASES, &record.name, &record)?;
                databases.insert(record.name.clone(), record.clone());
                self.changelog
                    .append(stamp, Change::DatabaseUpserted(record.clone()));
                write(&self.quarantined).remove(&record.name);
                tracing::warn!(database = %record.name, primary = %record.primary_shard, version = %record.version, "database record force-overwritten");
                record.version
            }
            NamespaceEntry::Collection(mut record) => {
                record.chunks.sort_by(|a, b| a.range.cmp(&b.range));
                record.validate()?;
                let mut collections = write(&self.collections);
                let floor = collections
                    .get(&record.namespace)
                    .map(|r| r.version)
                    .unwrap_or(record.version)
                    .max(record.version);
                record.version = floor.bump(stamp);
                for chunk in &mut record.chunks {
                    chunk.last_modified = chunk.last_modified.min(record.version);
                }
                self.persist(CF_COLLECTIONS, &record.namespace, &record)?;
                collections.insert(record.namespace.clone(), record.clone());
                self.changelog
                    .append(stamp, Change::CollectionUpserted(record.clone()));
                write(&self.quarantined).remove(&record.namespace);
                tracing::warn!(namespace = %record.namespace, version = %record.version, "collection record force-overwritten");
                record.version
            }
        };
        Ok(version)
    }

    /// Install a record exactly as given, without a version bump and without
    /// a change-log entry, as when restoring config data from a backup.
    pub fn restore_raw(&self, entry: NamespaceEntry) -> Result<()> {
        self.ensure_reachable()?;
        match entry {
            NamespaceEntry::Database(record) => {
                self.persist(CF_DATABASES, &record.name, &record)?;
                tracing::warn!(database = %record.name, version = %record.version, "database record restored from backup");
                write(&self.databases).insert(record.name.clone(), record);
            }
            NamespaceEntry::Collection(record) => {
                self.persist(CF_COLLECTIONS, &record.namespace, &record)?;
                tracing::warn!(namespace = %record.namespace, version = %record.version, "collection record restored from backup");
                write(&self.collections).insert(record.namespace.clone(), record);
            }
        }
        Ok(())
    }

    // === Range deletion tasks ===

    pub fn schedule_range_deletion(&self, task: RangeDeletionTask) -> Result<()> {
        self.ensure_reachable()?;
        self.persist(CF_RANGE_DELETIONS, &task.id.to_string(), &task)?;
        tracing::info!(
            namespace = %task.namespace,
            range = %task.range,
            donor = %task.donor_shard,
            not_before_ms = task.not_before_ms,
            "range deletion scheduled"
        );
        write(&self.range_deletions).insert(task.id, task);
        Ok(())
    }

    pub fn range_deletions(&self) -> Result<Vec<RangeDeletionTask>> {
        self.ensure_reachable()?;
        let mut tasks: Vec<_> = read(&self.range_deletions).values().cloned().collect();
        tasks.sort_by_key(|t| (t.not_before_ms, t.id));
        Ok(tasks)
    }

    pub fn range_deletions_for_donor(&self, donor: &ShardId) -> Result<Vec<RangeDeletionTask>> {
        Ok(self
            .range_deletions()?
            .into_iter()
            .filter(|t| &t.donor_shard == donor)
            .collect())
    }

    /// Remove a finished task. `None` if it was already resolved.
    pub fn complete_range_deletion(&self, id: uuid::Uuid) -> Result<Option<RangeDeletionTask>> {
        self.ensure_reachable()?;
        self.erase(CF_RANGE_DELETIONS, &id.to_string())?;
        Ok(write(&self.range_deletions).remove(&id))
    }

    // === Migration locks ===

    /// Take the advisory lock for a migration range.
    ///
    /// Fails with `MigrationConflict` if any in-flight migration on the same
    /// namespace overlaps the range.
    pub fn acquire_migration_lock(&self, lock: MigrationLock) -> Result<()> {
        self.ensure_reachable()?;
        let mut migrations = write(&self.migrations);
        if let Some(holder) = migrations
            .values()
            .find(|m| m.namespace == lock.namespace && m.range.overlaps(&lock.range))
        {
            return Err(Error::MigrationConflict {
                namespace: lock.namespace.clone(),
                range: lock.range.to_string(),
                holder: holder.migration_id.clone(),
            });
        }
        migrations.insert(lock.migration_id.clone(), lock);
        Ok(())
    }

    pub fn set_critical_section(&self, migration_id: &str, on: bool) {
        if let Some(lock) = write(&self.migrations).get_mut(migration_id) {
            lock.critical_section = on;
        }
    }

    pub fn release_migration_lock(&self, migration_id: &str) -> Option<MigrationLock> {
        write(&self.migrations).remove(migration_id)
    }

    pub fn active_migrations(&self, namespace: Option<&str>) -> Vec<MigrationLock> {
        read(&self.migrations)
            .values()
            .filter(|m| namespace.map_or(true, |ns| m.namespace == ns))
            .cloned()
            .collect()
    }

    /// Flush to disk
    pub fn flush(&self) -> Result<()> {
        if let Some(db) = &self.db {
            db.flush()?;
        }
        Ok(())
    }

    // === Persistence helpers ===

    fn persist<T: Serialize>(&self, cf: &str, key: &str, value: &T) -> Result<()> {
        if let Some(db) = &self.db {
            let handle = db
                .cf_handle(cf)
                .ok_or_else(|| Error::Internal(format!("missing column family {}", cf)))?;
            db.put_cf(handle, key.as_bytes(), bincode::serialize(value)?)?;
        }
        Ok(())
    }

    fn erase(&self, cf: &str, key: &str) -> Result<()> {
        if let Some(db) = &self.db {
            let handle = db
                .cf_handle(cf)
                .ok_or_else(|| Error::Internal(format!("missing column family {}", cf)))?;
            db.delete_cf(handle, key.as_bytes())?;
        }
        Ok(())
    }
}

fn load_cf<T: serde::de::DeserializeOwned>(db: &DB, cf: &str) -> Result<Vec<T>> {
    let handle = db
        .cf_handle(cf)
        .ok_or_else(|| Error::Internal(format!("missing column family {}", cf)))?;
    let mut out = Vec::new();
    for item in db.iterator_cf(handle, rocksdb::IteratorMode::Start) {
        let (_, value) = item?;
        out.push(bincode::deserialize(&value)?);
    }
    Ok(out)
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|p| p.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|p| p.into_inner())
}

fn split_chunks(current: &CollectionRecord, at: &ShardKey, version: Version) -> Result<Vec<ChunkRecord>> {
    if at.arity() != current.shard_key_pattern.len() {
        return Err(Error::InvalidCommand(format!(
            "split point {} does not match shard key {:?}",
            at, current.shard_key_pattern
        )));
    }
    let bound = KeyBound::Value(at.clone());
    let idx = current
        .chunks
        .iter()
        .position(|c| c.range.contains_key(at))
        .ok_or_else(|| Error::ChunkNotFound {
            namespace: current.namespace.clone(),
            range: at.to_string(),
        })?;
    let target = &current.chunks[idx];
    if target.range.min == bound {
        return Err(Error::IllegalOperation(format!(
            "{} is already a chunk boundary",
            at
        )));
    }

    let mut chunks = current.chunks.clone();
    let right = ChunkRecord {
        range: KeyRange {
            min: bound.clone(),
            max: target.range.max.clone(),
        },
        owning_shard: target.owning_shard.clone(),
        last_modified: version,
    };
    chunks[idx].range.max = bound;
    chunks[idx].last_modified = version;
    chunks.insert(idx + 1, right);
    Ok(chunks)
}

fn merge_chunks(current: &CollectionRecord, range: &KeyRange, version: Version) -> Result<Vec<ChunkRecord>> {
    let inside: Vec<usize> = current
        .chunks
        .iter()
        .enumerate()
        .filter(|(_, c)| range.contains_range(&c.range))
        .map(|(i, _)| i)
        .collect();
    let not_found = || Error::ChunkNotFound {
        namespace: current.namespace.clone(),
        range: range.to_string(),
    };
    let (&first, &last) = match (inside.first(), inside.last()) {
        (Some(f), Some(l)) => (f, l),
        _ => return Err(not_found()),
    };
    if current.chunks[first].range.min != range.min || current.chunks[last].range.max != range.max {
        return Err(Error::IllegalOperation(format!(
            "{} does not align with chunk boundaries",
            range
        )));
    }
    if inside.len() < 2 {
        return Err(Error::IllegalOperation(format!(
            "{} covers a single chunk",
            range
        )));
    }
    let owner = current.chunks[first].owning_shard.clone();
    if inside.iter().any(|&i| current.chunks[i].owning_shard != owner) {
        return Err(Error::IllegalOperation(format!(
            "chunks in {} live on different shards",
            range
        )));
    }

    let mut chunks = current.chunks.clone();
    chunks.drain(first..=last);
    chunks.insert(
        first,
        ChunkRecord {
            range: range.clone(),
            owning_shard: owner,
            last_modified: version,
        },
    );
    Ok(chunks)
}

fn transfer_chunk(
    current: &CollectionRecord,
    range: &KeyRange,
    to: &ShardId,
    version: Version,
) -> Result<Vec<ChunkRecord>> {
    if range.is_empty() {
        return Err(Error::InvalidCommand(format!("{} is empty", range)));
    }
    let idx = current
        .chunk_containing(range)
        .ok_or_else(|| Error::ChunkNotFound {
            namespace: current.namespace.clone(),
            range: range.to_string(),
        })?;
    let source = current.chunks[idx].clone();
    if &source.owning_shard == to {
        return Err(Error::IllegalOperation(format!(
            "{} already owns {}",
            to, range
        )));
    }

    let mut pieces = Vec::with_capacity(3);
    if source.range.min < range.min {
        pieces.push(ChunkRecord {
            range: KeyRange {
                min: source.range.min.clone(),
                max: range.min.clone(),
            },
            owning_shard: source.owning_shard.clone(),
            last_modified: version,
        });
    }
    pieces.push(ChunkRecord {
        range: range.clone(),
        owning_shard: to.clone(),
        last_modified: version,
    });
    if range.max < source.range.max {
        pieces.push(ChunkRecord {
            range: KeyRange {
                min: range.max.clone(),
                max: source.range.max.clone(),
            },
            owning_shard: source.owning_shard.clone(),
            last_modified: version,
        });
    }

    let mut chunks = current.chunks.clone();
    chunks.splice(idx..=idx, pieces);
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ManualClock;
    use tempfile::tempdir;

    fn store() -> MetadataStore {
        let clock = Arc::new(VersionClock::new(Arc::new(ManualClock::new(1_000))));
        let store = MetadataStore::in_memory(clock);
        store.add_shard("shard0".into(), "localhost:27018").unwrap();
        store.add_shard("shard1".into(), "localhost:27019").unwrap();
        store
    }

    fn two_chunk_collection(store: &MetadataStore) -> CollectionRecord {
        store
            .create_collection(
                "test.coll",
                vec!["x".into()],
                vec![
                    (KeyRange::new(KeyBound::MinKey, 0), "shard0".into()),
                    (KeyRange::new(0, KeyBound::MaxKey), "shard1".into()),
                ],
            )
            .unwrap()
    }

    #[test]
    fn test_create_collection_validates_layout() {
        let store = store();
        let err = store
            .create_collection(
                "test.gappy",
                vec!["x".into()],
                vec![
                    (KeyRange::new(KeyBound::MinKey, 0), "shard0".into()),
                    (KeyRange::new(10, KeyBound::MaxKey), "shard1".into()),
                ],
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidChunkMap { .. }));

        let coll = two_chunk_collection(&store);
        assert_eq!(coll.chunks.len(), 2);
        assert_eq!(coll.version.last_mod, 1);
        assert!(store.get_database("test").unwrap().is_some());
    }

    #[test]
    fn test_cas_conflict_leaves_record_untouched() {
        let store = store();
        let coll = two_chunk_collection(&store);

        let v2 = store
            .compare_and_swap(
                "test.coll",
                coll.version,
                Mutation::SplitChunk {
                    at: ShardKey::int(100),
                },
            )
            .unwrap();
        assert_eq!(v2.last_mod, coll.version.last_mod + 1);

        let err = store
            .compare_and_swap(
                "test.coll",
                coll.version,
                Mutation::SplitChunk {
                    at: ShardKey::int(200),
                },
            )
            .unwrap_err();
        match err {
            Error::MetadataConflict { actual, .. } => assert_eq!(actual, Some(v2)),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(store.get_collection("test.coll").unwrap().unwrap().chunks.len(), 3);
    }

    #[test]
    fn test_split_merge_and_transfer() {
        let store = store();
        let coll = two_chunk_collection(&store);

        let v = store
            .compare_and_swap(
                "test.coll",
                coll.version,
                Mutation::SplitChunk {
                    at: ShardKey::int(50),
                },
            )
            .unwrap();
        let v = store
            .compare_and_swap(
                "test.coll",
                v,
                Mutation::MergeChunks {
                    range: KeyRange::new(0, KeyBound::MaxKey),
                },
            )
            .unwrap();
        let v = store
            .compare_and_swap(
                "test.coll",
                v,
                Mutation::TransferChunk {
                    range: KeyRange::new(10, 20),
                    to: "shard0".into(),
                },
            )
            .unwrap();

        let coll = store.get_collection("test.coll").unwrap().unwrap();
        assert_eq!(coll.version, v);
        assert_eq!(coll.chunks.len(), 4);
        coll.validate().unwrap();
        let moved = coll.chunk_for_key(&ShardKey::int(15)).unwrap();
        assert_eq!(moved.owning_shard, ShardId::from("shard0"));
        assert_eq!(
            coll.chunk_for_key(&ShardKey::int(25)).unwrap().owning_shard,
            ShardId::from("shard1")
        );
    }

    #[test]
    fn test_transfer_to_draining_shard_rejected() {
        let store = store();
        let coll = two_chunk_collection(&store);
        store
            .set_shard_state(&"shard0".into(), ShardState::Draining)
            .unwrap();

        let err = store
            .compare_and_swap(
                "test.coll",
                coll.version,
                Mutation::TransferChunk {
                    range: KeyRange::new(0, KeyBound::MaxKey),
                    to: "shard0".into(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::ShardNotActive { .. }));
    }

    #[test]
    fn test_remove_requires_empty_shard() {
        let store = store();
        two_chunk_collection(&store);
        let shard1 = ShardId::from("shard1");

        assert!(store.set_shard_state(&shard1, ShardState::Removed).is_err());
        store.set_shard_state(&shard1, ShardState::Draining).unwrap();
        let err = store
            .set_shard_state(&shard1, ShardState::Removed)
            .unwrap_err();
        assert!(matches!(err, Error::ShardNotDrained { chunks: 1, .. }));
    }

    #[test]
    fn test_migration_locks_conflict_on_overlap() {
        let store = store();
        let lock = |id: &str, min: i64, max: i64| MigrationLock {
            migration_id: id.to_string(),
            namespace: "test.coll".into(),
            range: KeyRange::new(min, max),
            donor: "shard1".into(),
            recipient: "shard0".into(),
            acquired_at_ms: 0,
            critical_section: false,
        };

        store.acquire_migration_lock(lock("a", 0, 50)).unwrap();
        let err = store.acquire_migration_lock(lock("b", 25, 75)).unwrap_err();
        assert!(matches!(err, Error::MigrationConflict { ref holder, .. } if holder == "a"));
        store.acquire_migration_lock(lock("c", 50, 100)).unwrap();

        store.release_migration_lock("a");
        store.acquire_migration_lock(lock("b", 25, 45)).unwrap();
    }

    #[test]
    fn test_unreachable_store_fails_reads() {
        let store = store();
        store.set_reachable(false);
        assert!(matches!(
            store.read("test.coll"),
            Err(Error::MetadataUnavailable(_))
        ));
        store.set_reachable(true);
        assert!(store.read("test.coll").unwrap().is_none());
    }

    #[test]
    fn test_every_mutation_is_logged() {
        let store = store();
        let before = store.changelog().last_seq();
        let coll = two_chunk_collection(&store);
        store
            .compare_and_swap("test.coll", coll.version, Mutation::DropCollection)
            .unwrap();
        let events = store.changelog().since(before);
        // database created, collection created, collection dropped
        assert_eq!(events.len(), 3);
        assert!(matches!(
            events.last().unwrap().change,
            Change::CollectionDropped { .. }
        ));
    }

    #[test]
    fn test_persistence_reload() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(VersionClock::new(Arc::new(ManualClock::new(1_000))));
        let version = {
            let store = MetadataStore::open(dir.path().join("meta"), clock.clone()).unwrap();
            store.add_shard("shard0".into(), "h0").unwrap();
            store.add_shard("shard1".into(), "h1").unwrap();
            let coll = two_chunk_collection(&store);
            store.flush().unwrap();
            coll.version
        };

        let fresh_clock = Arc::new(VersionClock::new(Arc::new(ManualClock::new(10))));
        let store = MetadataStore::open(dir.path().join("meta"), fresh_clock.clone()).unwrap();
        let coll = store.get_collection("test.coll").unwrap().unwrap();
        assert_eq!(coll.version, version);
        assert_eq!(store.list_shards().unwrap().len(), 2);
        assert!(fresh_clock.next() > version.timestamp);
        // 2 shards + 1 database + 1 collection
        assert_eq!(store.changelog().last_seq(), 4);
    }
}
