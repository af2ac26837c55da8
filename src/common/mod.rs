//! Common utilities and types shared across shardmeta

pub mod clock;
pub mod config;
pub mod error;
pub mod keys;
pub mod metrics;
pub mod utils;

pub use clock::{Clock, HlcTimestamp, ManualClock, SystemClock, Version, VersionClock};
pub use config::{ClusterConfig, Config, ServerConfig};
pub use error::{Error, ErrorKind, Result, RetryPolicy};
pub use keys::{split_namespace, validate_namespace, KeyBound, KeyRange, KeyValue, ShardId, ShardKey};
pub use metrics::Metrics;
pub use utils::{
    duration_millis, generate_migration_id, parse_duration, retry_with_backoff,
    timestamp_now_millis,
};
