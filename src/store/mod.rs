//! Storage port and its implementations
//!
//! [`StoragePort`] is the boundary to the external vector database. Raw
//! drivers ([`memory`], [`qdrant`]) implement it per connection; the
//! wrappers in [`resilient`] implement it again by delegation, so pooling,
//! circuit breaking and retry compose as independent layers:
//!
//! ```text
//! ResilientStore
//!   └─ RetryStore         backoff on transient errors, then StoreUnavailable
//!        └─ BreakerStore  fail fast while the target circuit is open
//!             └─ PooledStore  one lease per call, released on every exit path
//!                  └─ driver connection (memory | qdrant)
//! ```

pub mod memory;
pub mod qdrant;
pub mod resilient;

#[cfg(test)]
pub mod testing;

pub use memory::MemoryStore;
pub use qdrant::{QdrantConnection, QdrantConnector};
pub use resilient::{BreakerStore, PooledStore, ResilientStore, RetryStore, StoreProbe};

use crate::error::Result;
use crate::memory::{Chunk, ScoredChunk, SearchQuery, StoreStats};
use async_trait::async_trait;
use std::sync::Arc;

/// Operations the sync engine needs from a vector database.
///
/// `get` must report a missing chunk as [`Error::NotFound`](crate::Error::NotFound),
/// distinguishable from a transient failure.
#[async_trait]
pub trait StoragePort: Send + Sync {
    /// Prepare the backing collection
    async fn initialize(&self) -> Result<()>;

    /// Release backend resources
    async fn close(&self) -> Result<()>;

    /// Insert or replace a chunk
    async fn upsert(&self, chunk: &Chunk) -> Result<()>;

    /// Fetch a chunk by id
    async fn get(&self, id: &str) -> Result<Chunk>;

    /// Physically remove a chunk
    async fn delete(&self, id: &str) -> Result<()>;

    /// Nearest-neighbour search with metadata filtering
    async fn search(&self, query: &SearchQuery) -> Result<Vec<ScoredChunk>>;

    /// Backend statistics
    async fn stats(&self) -> Result<StoreStats>;
}

#[async_trait]
impl<T: StoragePort + ?Sized> StoragePort for Arc<T> {
    async fn initialize(&self) -> Result<()> {
        (**self).initialize().await
    }

    async fn close(&self) -> Result<()> {
        (**self).close().await
    }

    async fn upsert(&self, chunk: &Chunk) -> Result<()> {
        (**self).upsert(chunk).await
    }

    async fn get(&self, id: &str) -> Result<Chunk> {
        (**self).get(id).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        (**self).delete(id).await
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<ScoredChunk>> {
        (**self).search(query).await
    }

    async fn stats(&self) -> Result<StoreStats> {
        (**self).stats().await
    }
}
