//! Configuration for shardmeta components

use crate::common::utils::parse_duration;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment prefix for overrides, e.g. `SHARDMETA__CLUSTER__CATCHUP_MAX_ROUNDS=4`
const ENV_PREFIX: &str = "SHARDMETA";

/// Config file looked up when none is given explicitly
const DEFAULT_CONFIG_FILE: &str = "shardmeta.toml";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node ID (unique identifier)
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Admin server config
    #[serde(default)]
    pub server: ServerConfig,

    /// Metadata engine tuning
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_node_id() -> String {
    "configsvr-1".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            server: ServerConfig::default(),
            cluster: ClusterConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file layered with
    /// `SHARDMETA__*` environment variables.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let file = match path {
            Some(p) => config::File::from(p.to_path_buf()).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };
        let settings = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .map_err(|e| crate::Error::InvalidConfig(e.to_string()))?;
        let config: Config = settings
            .try_deserialize()
            .map_err(|e| crate::Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        self.cluster.validate()
    }
}

/// Admin server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the admin HTTP API
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// RocksDB path for durable metadata (in-memory when unset)
    #[serde(default)]
    pub db_path: Option<PathBuf>,

    /// Shards registered at startup
    #[serde(default)]
    pub shards: Vec<String>,
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 5000))
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            db_path: None,
            shards: Vec::new(),
        }
    }
}

/// Tuning knobs for migrations, draining, caches and checks.
///
/// Durations accept either integer milliseconds or strings such as `"15m"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Delay before orphaned donor documents may be deleted
    #[serde(default = "default_orphan_cleanup_delay", with = "duration_ms")]
    pub orphan_cleanup_delay: Duration,

    /// Maximum steady-state catch-up rounds before a migration aborts
    #[serde(default = "default_catchup_max_rounds")]
    pub catchup_max_rounds: u32,

    /// A catch-up round with at most this many writes counts as converged
    #[serde(default = "default_catchup_converged_ops")]
    pub catchup_converged_ops: usize,

    /// Documents copied per clone batch
    #[serde(default = "default_clone_batch_size")]
    pub clone_batch_size: usize,

    /// Range deleter scan interval
    #[serde(default = "default_range_deleter_interval", with = "duration_ms")]
    pub range_deleter_interval: Duration,

    /// Drain commit re-check interval
    #[serde(default = "default_drain_poll_interval", with = "duration_ms")]
    pub drain_poll_interval: Duration,

    /// Upper bound on the drain commit wait
    #[serde(default = "default_drain_commit_timeout", with = "duration_ms")]
    pub drain_commit_timeout: Duration,

    /// Gap between the two observations of a consistency check
    #[serde(default = "default_consistency_grace_period", with = "duration_ms")]
    pub consistency_grace_period: Duration,

    /// Attempts made by routing refreshes before giving up
    #[serde(default = "default_refresh_max_retries")]
    pub refresh_max_retries: usize,

    /// First refresh backoff delay, doubled per attempt
    #[serde(default = "default_refresh_initial_backoff", with = "duration_ms")]
    pub refresh_initial_backoff: Duration,

    /// Routing cache entry lifetime
    #[serde(default = "default_routing_cache_ttl", with = "duration_ms")]
    pub routing_cache_ttl: Duration,

    /// Router retries after a stale shard version response
    #[serde(default = "default_stale_version_max_retries")]
    pub stale_version_max_retries: usize,

    /// Duplicate-key retries allowed for a single upsert
    #[serde(default = "default_max_upsert_retries")]
    pub max_upsert_retries: u32,
}

fn default_orphan_cleanup_delay() -> Duration {
    Duration::from_secs(900)
}
fn default_catchup_max_rounds() -> u32 {
    10
}
fn default_catchup_converged_ops() -> usize {
    16
}
fn default_clone_batch_size() -> usize {
    1_000
}
fn default_range_deleter_interval() -> Duration {
    Duration::from_secs(10)
}
fn default_drain_poll_interval() -> Duration {
    Duration::from_secs(1)
}
fn default_drain_commit_timeout() -> Duration {
    Duration::from_secs(3_600)
}
fn default_consistency_grace_period() -> Duration {
    Duration::from_secs(1)
}
fn default_refresh_max_retries() -> usize {
    5
}
fn default_refresh_initial_backoff() -> Duration {
    Duration::from_millis(50)
}
fn default_routing_cache_ttl() -> Duration {
    Duration::from_secs(600)
}
fn default_stale_version_max_retries() -> usize {
    3
}
fn default_max_upsert_retries() -> u32 {
    3
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            orphan_cleanup_delay: default_orphan_cleanup_delay(),
            catchup_max_rounds: default_catchup_max_rounds(),
            catchup_converged_ops: default_catchup_converged_ops(),
            clone_batch_size: default_clone_batch_size(),
            range_deleter_interval: default_range_deleter_interval(),
            drain_poll_interval: default_drain_poll_interval(),
            drain_commit_timeout: default_drain_commit_timeout(),
            consistency_grace_period: default_consistency_grace_period(),
            refresh_max_retries: default_refresh_max_retries(),
            refresh_initial_backoff: default_refresh_initial_backoff(),
            routing_cache_ttl: default_routing_cache_ttl(),
            stale_version_max_retries: default_stale_version_max_retries(),
            max_upsert_retries: default_max_upsert_retries(),
        }
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.catchup_max_rounds == 0 {
            return Err(crate::Error::InvalidConfig(
                "catchup_max_rounds must be at least 1".into(),
            ));
        }
        if self.clone_batch_size == 0 {
            return Err(crate::Error::InvalidConfig(
                "clone_batch_size must be at least 1".into(),
            ));
        }
        if self.refresh_max_retries == 0 {
            return Err(crate::Error::InvalidConfig(
                "refresh_max_retries must be at least 1".into(),
            ));
        }
        if self.drain_poll_interval.is_zero() || self.range_deleter_interval.is_zero() {
            return Err(crate::Error::InvalidConfig(
                "poll intervals must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Serde adapter: durations as milliseconds, or as `"30s"`-style strings.
mod duration_ms {
    use super::parse_duration;
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis().min(u128::from(u64::MAX)) as u64)
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(u64),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(d)? {
            Raw::Millis(ms) => Ok(Duration::from_millis(ms)),
            Raw::Text(text) => parse_duration(&text).map_err(de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(
            config.cluster.orphan_cleanup_delay,
            Duration::from_secs(900)
        );
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shardmeta.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
node_id = "cfg-7"

[server]
bind_addr = "127.0.0.1:7000"
shards = ["shard0", "shard1"]

[cluster]
orphan_cleanup_delay = "2s"
catchup_max_rounds = 4
drain_poll_interval = 25
"#
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.node_id, "cfg-7");
        assert_eq!(config.server.shards.len(), 2);
        assert_eq!(config.cluster.orphan_cleanup_delay, Duration::from_secs(2));
        assert_eq!(config.cluster.catchup_max_rounds, 4);
        assert_eq!(
            config.cluster.drain_poll_interval,
            Duration::from_millis(25)
        );
        assert_eq!(config.cluster.max_upsert_retries, 3);
    }

    #[test]
    fn test_validate_rejects_zero_budgets() {
        let cluster = ClusterConfig {
            catchup_max_rounds: 0,
            ..Default::default()
        };
        assert!(cluster.validate().is_err());

        let cluster = ClusterConfig {
            drain_poll_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(cluster.validate().is_err());
    }
}
