//! Error types for shardmeta

use crate::common::clock::Version;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // === Metadata Errors ===
    #[error("Metadata conflict on {namespace}: expected version {expected}, found {}", fmt_version(.actual))]
    MetadataConflict {
        namespace: String,
        expected: Version,
        actual: Option<Version>,
    },

    #[error("Metadata store unavailable: {0}")]
    MetadataUnavailable(String),

    #[error("Namespace not found: {0}")]
    NamespaceNotFound(String),

    #[error("Namespace already exists: {0}")]
    NamespaceExists(String),

    #[error("Invalid chunk map for {namespace}: {reason}")]
    InvalidChunkMap { namespace: String, reason: String },

    #[error("Chunk not found in {namespace} for range {range}")]
    ChunkNotFound { namespace: String, range: String },

    #[error("Fatal metadata inconsistency on {namespace}: {details}")]
    FatalInconsistency { namespace: String, details: String },

    // === Shard Registry Errors ===
    #[error("Shard not found: {0}")]
    ShardNotFound(String),

    #[error("Shard {shard} is {state}, expected active")]
    ShardNotActive { shard: String, state: String },

    #[error("Shard {shard} still owns {databases} database(s) and {chunks} chunk(s)")]
    ShardNotDrained {
        shard: String,
        databases: usize,
        chunks: usize,
    },

    #[error("Drain of shard {0} was cancelled")]
    DrainCancelled(String),

    // === Migration Errors ===
    #[error("Migration conflict on {namespace} {range}: overlapping migration {holder} in progress")]
    MigrationConflict {
        namespace: String,
        range: String,
        holder: String,
    },

    #[error("Catch-up limit exceeded for {namespace} after {rounds} round(s)")]
    CatchupLimitExceeded { namespace: String, rounds: u32 },

    #[error("Migration {migration_id} aborted: {reason}")]
    MigrationAborted {
        migration_id: String,
        reason: String,
    },

    // === Shard Data Errors ===
    #[error("Stale shard version for {namespace} on {shard}: wanted {}, received {}", fmt_version(.wanted), fmt_version(.received))]
    StaleShardVersion {
        namespace: String,
        shard: String,
        wanted: Option<Version>,
        received: Option<Version>,
    },

    #[error("Writes to {namespace} {range} are paused by a migration critical section")]
    CriticalSection { namespace: String, range: String },

    #[error("Duplicate key on {namespace}: {key}")]
    DuplicateKey { namespace: String, key: String },

    #[error("Duplicate key on {namespace} persisted after {attempts} upsert attempt(s)")]
    DuplicateKeyBoundedRetry { namespace: String, attempts: u32 },

    // === Command Errors ===
    #[error("Illegal operation: {0}")]
    IllegalOperation(String),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Operation timed out: {0}")]
    OperationTimedOut(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn fmt_version(v: &Option<Version>) -> String {
    match v {
        Some(v) => v.to_string(),
        None => "none".to_string(),
    }
}

/// Client-visible error taxonomy tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    MetadataConflict,
    MigrationConflict,
    MetadataUnavailable,
    OperationTimedOut,
    CatchupLimitExceeded,
    FatalInconsistency,
    DuplicateKeyBoundedRetry,
    NamespaceNotFound,
    NamespaceExists,
    ShardNotFound,
    ShardNotActive,
    ChunkNotFound,
    InvalidChunkMap,
    ShardNotDrained,
    DrainCancelled,
    MigrationAborted,
    StaleShardVersion,
    CriticalSection,
    DuplicateKey,
    IllegalOperation,
    InvalidCommand,
    InvalidConfig,
    Storage,
    Internal,
}

/// How a caller is expected to react to an error of a given kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Re-read the current metadata version, then retry the operation.
    RefetchAndRetry,
    /// Retry the same request with exponential backoff.
    Backoff,
    /// Return to the caller as-is.
    Surface,
    /// Blocked until an operator repairs the metadata.
    RequiresRepair,
}

impl ErrorKind {
    pub fn retry_policy(self) -> RetryPolicy {
        match self {
            ErrorKind::MetadataConflict | ErrorKind::StaleShardVersion => {
                RetryPolicy::RefetchAndRetry
            }
            ErrorKind::MetadataUnavailable | ErrorKind::CriticalSection => RetryPolicy::Backoff,
            ErrorKind::FatalInconsistency => RetryPolicy::RequiresRepair,
            _ => RetryPolicy::Surface,
        }
    }

    /// Stable name reported to clients in `codeName`.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::MetadataConflict => "MetadataConflict",
            ErrorKind::MigrationConflict => "MigrationConflict",
            ErrorKind::MetadataUnavailable => "MetadataUnavailable",
            ErrorKind::OperationTimedOut => "OperationTimedOut",
            ErrorKind::CatchupLimitExceeded => "CatchupLimitExceeded",
            ErrorKind::FatalInconsistency => "FatalInconsistency",
            ErrorKind::DuplicateKeyBoundedRetry => "DuplicateKeyBoundedRetry",
            ErrorKind::NamespaceNotFound => "NamespaceNotFound",
            ErrorKind::NamespaceExists => "NamespaceExists",
            ErrorKind::ShardNotFound => "ShardNotFound",
            ErrorKind::ShardNotActive => "ShardNotActive",
            ErrorKind::ChunkNotFound => "ChunkNotFound",
            ErrorKind::InvalidChunkMap => "InvalidChunkMap",
            ErrorKind::ShardNotDrained => "ShardNotDrained",
            ErrorKind::DrainCancelled => "DrainCancelled",
            ErrorKind::MigrationAborted => "MigrationAborted",
            ErrorKind::StaleShardVersion => "StaleShardVersion",
            ErrorKind::CriticalSection => "CriticalSection",
            ErrorKind::DuplicateKey => "DuplicateKey",
            ErrorKind::IllegalOperation => "IllegalOperation",
            ErrorKind::InvalidCommand => "InvalidCommand",
            ErrorKind::InvalidConfig => "InvalidConfig",
            ErrorKind::Storage => "Storage",
            ErrorKind::Internal => "Internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) | Error::RocksDb(_) | Error::Serialization(_) => ErrorKind::Storage,
            Error::MetadataConflict { .. } => ErrorKind::MetadataConflict,
            Error::MetadataUnavailable(_) => ErrorKind::MetadataUnavailable,
            Error::NamespaceNotFound(_) => ErrorKind::NamespaceNotFound,
            Error::NamespaceExists(_) => ErrorKind::NamespaceExists,
            Error::InvalidChunkMap { .. } => ErrorKind::InvalidChunkMap,
            Error::ChunkNotFound { .. } => ErrorKind::ChunkNotFound,
            Error::FatalInconsistency { .. } => ErrorKind::FatalInconsistency,
            Error::ShardNotFound(_) => ErrorKind::ShardNotFound,
            Error::ShardNotActive { .. } => ErrorKind::ShardNotActive,
            Error::ShardNotDrained { .. } => ErrorKind::ShardNotDrained,
            Error::DrainCancelled(_) => ErrorKind::DrainCancelled,
            Error::MigrationConflict { .. } => ErrorKind::MigrationConflict,
            Error::CatchupLimitExceeded { .. } => ErrorKind::CatchupLimitExceeded,
            Error::MigrationAborted { .. } => ErrorKind::MigrationAborted,
            Error::StaleShardVersion { .. } => ErrorKind::StaleShardVersion,
            Error::CriticalSection { .. } => ErrorKind::CriticalSection,
            Error::DuplicateKey { .. } => ErrorKind::DuplicateKey,
            Error::DuplicateKeyBoundedRetry { .. } => ErrorKind::DuplicateKeyBoundedRetry,
            Error::IllegalOperation(_) => ErrorKind::IllegalOperation,
            Error::InvalidCommand(_) => ErrorKind::InvalidCommand,
            Error::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Error::OperationTimedOut(_) => ErrorKind::OperationTimedOut,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind().retry_policy(),
            RetryPolicy::Backoff | RetryPolicy::RefetchAndRetry
        )
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self.kind() {
            ErrorKind::NamespaceNotFound | ErrorKind::ShardNotFound | ErrorKind::ChunkNotFound => {
                StatusCode::NOT_FOUND
            }
            ErrorKind::MetadataConflict
            | ErrorKind::MigrationConflict
            | ErrorKind::NamespaceExists
            | ErrorKind::StaleShardVersion => StatusCode::CONFLICT,
            ErrorKind::InvalidCommand | ErrorKind::InvalidConfig | ErrorKind::IllegalOperation => {
                StatusCode::BAD_REQUEST
            }
            ErrorKind::ShardNotActive | ErrorKind::ShardNotDrained | ErrorKind::DrainCancelled => {
                StatusCode::PRECONDITION_FAILED
            }
            ErrorKind::MetadataUnavailable | ErrorKind::CriticalSection => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ErrorKind::OperationTimedOut => StatusCode::REQUEST_TIMEOUT,
            ErrorKind::FatalInconsistency | ErrorKind::InvalidChunkMap => StatusCode::LOCKED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Internal(e.to_string())
    }
}
