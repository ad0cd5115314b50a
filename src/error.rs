//! MemSync error types

use std::time::Duration;
use thiserror::Error;

/// MemSync error type
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed chunk or query. Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The requested chunk or record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Timeout or connection failure talking to the vector store
    #[error("Transient store error: {0}")]
    Transient(String),

    /// Retries exhausted; the caller should try again later
    #[error("Store unavailable after {attempts} attempts: {last_error}")]
    StoreUnavailable { attempts: u32, last_error: String },

    /// The circuit guarding the target is open
    #[error("Circuit open for target '{target}'")]
    CircuitOpen { target: String },

    /// Optimistic concurrency check failed
    #[error("Version conflict on chunk {id}: expected {expected}, found {actual}")]
    VersionConflict {
        id: String,
        expected: u64,
        actual: u64,
    },

    /// Manual resolution required; the stored chunk was left untouched
    #[error("Conflict {conflict_id} on chunk {chunk_id} requires manual resolution")]
    ConflictUnresolved {
        conflict_id: String,
        chunk_id: String,
    },

    /// No connection became available within the acquire timeout
    #[error("Connection pool exhausted after waiting {waited:?}")]
    PoolExhausted { waited: Duration },

    /// The pool has been closed
    #[error("Connection pool is closed")]
    PoolClosed,

    /// Embedding provider failure
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the failure is a transient dependency failure.
    ///
    /// Only these are retried under backoff and counted by circuit breakers.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    /// Whether the caller should treat this as "try again later" rather than
    /// as a rejection of the request itself.
    pub fn is_retry_later(&self) -> bool {
        matches!(
            self,
            Error::Transient(_)
                | Error::StoreUnavailable { .. }
                | Error::CircuitOpen { .. }
                | Error::PoolExhausted { .. }
                | Error::PoolClosed
        )
    }
}

/// Result type alias for MemSync operations
pub type Result<T> = std::result::Result<T, Error>;
