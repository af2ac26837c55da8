//! # shardmeta
//!
//! Routing metadata for a sharded document database:
//! - Versioned database and chunk ownership records with compare-and-swap updates
//! - Chunk migrations with bounded catch-up and delayed orphan cleanup
//! - Shard draining and removal
//! - Routing caches that refresh on stale shard versions
//! - Consistency checks between the config server, routers and shards
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │              Config server               │
//! │  MetadataStore ── change log ──┐         │
//! │  migrations / drain / checker  │         │
//! └───────────┬────────────────────┼─────────┘
//!             │ refresh            │ in-order events
//!   ┌─────────▼────────┐   ┌───────▼──────────────────┐
//!   │ Router            │   │ Shard nodes              │
//!   │  RoutingCache     │──▶│  ShardLocalReplica       │
//!   └──────────────────┘   │  data plane              │
//!                           └──────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start a config server
//! ```bash
//! shardmeta-configsvr serve \
//!   --bind 0.0.0.0:5000 \
//!   --db ./configsvr-data \
//!   --shard shard0=10.0.0.1:27018 --shard shard1=10.0.0.2:27018
//! ```
//!
//! ### Use the CLI
//! ```bash
//! shardmeta command '{"command": "enableSharding", "database": "test"}'
//! shardmeta status
//! shardmeta verify --namespace test
//! shardmeta repair --record ./test.json
//! ```

#![allow(clippy::result_large_err)]

pub mod common;
pub mod coordinator;
pub mod ops;
pub mod router;
pub mod shard;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use coordinator::{Cluster, ConfigServer};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
