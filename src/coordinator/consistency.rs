//! Metadata consistency checking
//!
//! Compares the authoritative metadata with every registered routing cache
//! and every shard-local replica. A check takes two observations separated
//! by the grace period. A fatal finding is only reported if the same
//! divergence, at the same authoritative version, is present in both;
//! anything else is downgraded to `StaleCache`.
//!
//! Checking never repairs anything. The command layer quarantines
//! namespaces with fatal findings until an operator force-overwrites them.

use crate::common::{split_namespace, ClusterConfig, Metrics, Result, ShardId, Version};
use crate::coordinator::metadata::{
    validate_chunks, CollectionRecord, DatabaseRecord, MetadataStore, NamespaceEntry, ShardState,
};
use crate::router::RoutingCache;
use crate::shard::ShardLocalReplica;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "namespace", rename_all = "camelCase")]
pub enum CheckScope {
    Namespace(String),
    Cluster,
}

impl CheckScope {
    fn includes(&self, namespace: &str) -> bool {
        match self {
            CheckScope::Cluster => true,
            CheckScope::Namespace(ns) => {
                // A database scope covers its collections.
                ns == namespace || split_namespace(namespace).0 == ns
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum InconsistencyKind {
    /// A cache or replica is behind the authoritative version
    StaleCache,
    /// More than one shard believes it is a database's primary
    ConflictingPrimary,
    /// A chunk or database is owned by a removed or unknown shard
    OrphanedOwnership,
    /// The authoritative chunk map has a gap or overlap
    InvalidChunkMap,
    /// An up-to-date replica holds content the config server does not
    DivergentReplica,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Benign,
    FatalInconsistency,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Inconsistency {
    pub namespace: String,
    pub kind: InconsistencyKind,
    pub severity: Severity,
    /// `cache:<name>`, `replica:<shard>` or `config`
    pub source: String,
    pub authoritative: Option<Version>,
    pub observed: Option<Version>,
    pub details: String,
}

impl Inconsistency {
    pub fn is_fatal(&self) -> bool {
        self.severity == Severity::FatalInconsistency
    }

    fn fatal(
        namespace: &str,
        kind: InconsistencyKind,
        source: impl Into<String>,
        authoritative: Option<Version>,
        observed: Option<Version>,
        details: String,
    ) -> Self {
        Self {
            namespace: namespace.to_string(),
            kind,
            severity: Severity::FatalInconsistency,
            source: source.into(),
            authoritative,
            observed,
            details,
        }
    }

    fn stale(
        namespace: &str,
        source: impl Into<String>,
        authoritative: Option<Version>,
        observed: Option<Version>,
        details: String,
    ) -> Self {
        Self {
            namespace: namespace.to_string(),
            kind: InconsistencyKind::StaleCache,
            severity: Severity::Benign,
            source: source.into(),
            authoritative,
            observed,
            details,
        }
    }

    /// Identity used to match a fatal finding across two observations
    fn fingerprint(&self) -> (String, InconsistencyKind, String, Option<Version>) {
        (
            self.namespace.clone(),
            self.kind,
            self.source.clone(),
            self.authoritative,
        )
    }
}

pub struct ConsistencyChecker {
    store: Arc<MetadataStore>,
    config: ClusterConfig,
    caches: RwLock<Vec<Arc<RoutingCache>>>,
    replicas: RwLock<BTreeMap<ShardId, Arc<ShardLocalReplica>>>,
    metrics: Arc<Metrics>,
}

impl ConsistencyChecker {
    pub fn new(store: Arc<MetadataStore>, config: ClusterConfig) -> Self {
        Self {
            store,
            config,
            caches: RwLock::new(Vec::new()),
            replicas: RwLock::new(BTreeMap::new()),
            metrics: Arc::new(Metrics::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn register_cache(&self, cache: Arc<RoutingCache>) {
        self.caches
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(cache);
    }

    pub fn register_replica(&self, replica: Arc<ShardLocalReplica>) {
        self.replicas
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(replica.shard_id().clone(), replica);
    }

    /// Two observations separated by the grace period; see module docs.
    pub async fn check(&self, scope: &CheckScope) -> Result<Vec<Inconsistency>> {
        self.metrics.consistency_checks.inc();
        let first = self.observe(scope)?;
        if !first.iter().any(Inconsistency::is_fatal) {
            return Ok(first);
        }

        tokio::time::sleep(self.config.consistency_grace_period).await;
        let second = self.observe(scope)?;
        let confirmed: BTreeSet<_> = first
            .iter()
            .filter(|f| f.is_fatal())
            .map(Inconsistency::fingerprint)
            .collect();

        let mut findings: Vec<Inconsistency> = second
            .into_iter()
            .map(|f| {
                if f.is_fatal() && !confirmed.contains(&f.fingerprint()) {
                    Inconsistency::stale(
                        &f.namespace,
                        f.source,
                        f.authoritative,
                        f.observed,
                        format!("unconfirmed: {}", f.details),
                    )
                } else {
                    f
                }
            })
            .collect();
        findings.sort();
        findings.dedup();

        for f in &findings {
            if f.is_fatal() {
                self.metrics.fatal_inconsistencies.inc();
                tracing::error!(
                    namespace = %f.namespace,
                    kind = ?f.kind,
                    source = %f.source,
                    details = %f.details,
                    "fatal metadata inconsistency"
                );
            }
        }
        Ok(findings)
    }

    /// One observation of the whole scope. Sorted and side-effect free.
    pub fn observe(&self, scope: &CheckScope) -> Result<Vec<Inconsistency>> {
        let databases: BTreeMap<String, DatabaseRecord> = self
            .store
            .list_databases()?
            .into_iter()
            .filter(|d| scope.includes(&d.name))
            .map(|d| (d.name.clone(), d))
            .collect();
        let collections: BTreeMap<String, CollectionRecord> = self
            .store
            .list_collections()?
            .into_iter()
            .filter(|c| scope.includes(&c.namespace))
            .map(|c| (c.namespace.clone(), c))
            .collect();
        let shard_states: BTreeMap<ShardId, ShardState> = self
            .store
            .list_shards()?
            .into_iter()
            .map(|s| (s.shard_id, s.state))
            .collect();
        let migrating: BTreeSet<String> = self
            .store
            .active_migrations(None)
            .into_iter()
            .map(|m| m.namespace)
            .collect();
        let last_seq = self.store.changelog().last_seq();

        let mut findings = Vec::new();
        let mut conflicting_dbs = BTreeSet::new();

        // Replicas
        let replicas: Vec<Arc<ShardLocalReplica>> = self
            .replicas
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();
        for db in databases.values() {
            let mut claimants = BTreeSet::from([db.primary_shard.clone()]);
            let mut lagging = Vec::new();
            for replica in &replicas {
                let Some(local) = replica.database(&db.name) else {
                    continue;
                };
                let source = format!("replica:{}", replica.shard_id());
                if replica.applied_seq() < last_seq && local.version < db.version {
                    lagging.push(Inconsistency::stale(
                        &db.name,
                        source,
                        Some(db.version),
                        Some(local.version),
                        "replica behind config server".into(),
                    ));
                    continue;
                }
                if &local.primary_shard == replica.shard_id() {
                    claimants.insert(local.primary_shard.clone());
                } else if local.version > db.version {
                    findings.push(Inconsistency::fatal(
                        &db.name,
                        InconsistencyKind::DivergentReplica,
                        source,
                        Some(db.version),
                        Some(local.version),
                        format!(
                            "replica holds version {} ahead of config server",
                            local.version
                        ),
                    ));
                }
            }
            if claimants.len() > 1 {
                conflicting_dbs.insert(db.name.clone());
                let names: Vec<String> = claimants.iter().map(ShardId::to_string).collect();
                findings.push(Inconsistency::fatal(
                    &db.name,
                    InconsistencyKind::ConflictingPrimary,
                    "config",
                    Some(db.version),
                    None,
                    format!(
                        "config server names {} primary, shards claiming primary: {}",
                        db.primary_shard,
                        names.join(", ")
                    ),
                ));
            } else {
                findings.extend(lagging);
            }
        }

        for coll in collections.values() {
            for replica in &replicas {
                let Some(local) = replica.collection(&coll.namespace) else {
                    continue;
                };
                let source = format!("replica:{}", replica.shard_id());
                if local.version < coll.version {
                    findings.push(Inconsistency::stale(
                        &coll.namespace,
                        source,
                        Some(coll.version),
                        Some(local.version),
                        "replica behind config server".into(),
                    ));
                } else if replica.applied_seq() >= last_seq
                    && (local.version > coll.version || local.chunks != coll.chunks)
                {
                    findings.push(Inconsistency::fatal(
                        &coll.namespace,
                        InconsistencyKind::DivergentReplica,
                        source,
                        Some(coll.version),
                        Some(local.version),
                        "replica chunk map differs from config server".into(),
                    ));
                }
            }
        }

        // Caches
        let caches: Vec<Arc<RoutingCache>> = self
            .caches
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        for cache in &caches {
            for (ns, cached) in cache.snapshot() {
                if !scope.includes(&ns) {
                    continue;
                }
                let authoritative = match collections.get(&ns) {
                    Some(coll) => Some(NamespaceEntry::Collection(coll.clone())),
                    None => databases
                        .get(split_namespace(&ns).0)
                        .cloned()
                        .map(NamespaceEntry::Database),
                };
                let details = match &authoritative {
                    None => "namespace dropped on config server",
                    Some(entry) if !entry.same_kind(&cached.entry) => {
                        "routing cache holds the wrong kind of record"
                    }
                    Some(entry) if cached.version() < entry.version() => {
                        "routing cache behind config server"
                    }
                    Some(_) => continue,
                };
                findings.push(Inconsistency::stale(
                    &ns,
                    format!("cache:{}", cache.name()),
                    authoritative.as_ref().map(NamespaceEntry::version),
                    Some(cached.version()),
                    details.into(),
                ));
            }
        }

        // Authoritative records on their own
        for db in databases.values() {
            if conflicting_dbs.contains(&db.name) {
                continue;
            }
            if !is_live(&shard_states, &db.primary_shard) {
                findings.push(Inconsistency::fatal(
                    &db.name,
                    InconsistencyKind::OrphanedOwnership,
                    "config",
                    Some(db.version),
                    None,
                    format!("primary {} is removed or unknown", db.primary_shard),
                ));
            }
        }
        for coll in collections.values() {
            if let Err(e) = validate_chunks(&coll.namespace, &coll.chunks) {
                findings.push(Inconsistency::fatal(
                    &coll.namespace,
                    InconsistencyKind::InvalidChunkMap,
                    "config",
                    Some(coll.version),
                    None,
                    e.to_string(),
                ));
            }
            let orphaned: BTreeSet<&ShardId> = coll
                .chunks
                .iter()
                .map(|c| &c.owning_shard)
                .filter(|s| !is_live(&shard_states, s))
                .collect();
            for shard in orphaned {
                findings.push(Inconsistency::fatal(
                    &coll.namespace,
                    InconsistencyKind::OrphanedOwnership,
                    "config",
                    Some(coll.version),
                    None,
                    format!("chunks owned by removed or unknown shard {}", shard),
                ));
            }
        }

        // A namespace mid-migration is expected to look inconsistent.
        for f in &mut findings {
            if f.is_fatal() && migrating.contains(&f.namespace) {
                f.kind = InconsistencyKind::StaleCache;
                f.severity = Severity::Benign;
                f.details = format!("migration in progress: {}", f.details);
            }
        }

        findings.sort();
        findings.dedup();
        for f in findings.iter().filter(|f| !f.is_fatal()) {
            tracing::debug!(namespace = %f.namespace, source = %f.source, "stale metadata observed");
        }
        Ok(findings)
    }
}

/// Draining shards still legitimately own data while it moves off.
fn is_live(states: &BTreeMap<ShardId, ShardState>, shard: &ShardId) -> bool {
    matches!(
        states.get(shard),
        Some(ShardState::Active) | Some(ShardState::Draining)
    )
}
