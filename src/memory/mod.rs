//! Conversation memory: chunks and the versioned repository over them
//!
//! Chunks are never overwritten directly. Every accepted mutation goes
//! through [`ChunkRepository::put_if_version`], which bumps the logical
//! clock, and deletions are tombstones rather than physical removal.

pub mod chunk;
pub mod repository;

pub use chunk::{
    Chunk, ChunkBuilder, ChunkMetadata, Outcome, ScoredChunk, SearchFilter, SearchQuery,
    StoreStats,
};
pub use repository::ChunkRepository;
