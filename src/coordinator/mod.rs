//! Config server implementation
//!
//! The config server is responsible for:
//! - The authoritative routing metadata (database primaries, chunk maps, versions)
//! - Chunk migrations and deferred orphan cleanup
//! - Shard draining and removal
//! - Consistency checks against routers and shard replicas
//! - Administrative commands over HTTP

pub mod changelog;
pub mod cluster;
pub mod commands;
pub mod consistency;
pub mod drain;
pub mod http;
pub mod metadata;
pub mod migration;
pub mod range_deleter;
pub mod server;

pub use changelog::{Change, ChangeEvent, ChangeLog};
pub use cluster::Cluster;
pub use commands::{AdminCommand, CommandDispatcher, CommandFailure};
pub use consistency::{CheckScope, ConsistencyChecker, Inconsistency, InconsistencyKind, Severity};
pub use drain::{DrainCoordinator, DrainState, DrainStatus};
pub use metadata::MetadataStore;
pub use migration::{ChunkMigrationCoordinator, MigrationHandle, MigrationPhase, MigrationStatus, MoveChunkRequest};
pub use range_deleter::RangeDeleter;
pub use server::ConfigServer;
