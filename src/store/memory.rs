//! In-process vector store
//!
//! Keeps chunks in a `tokio::sync::RwLock<HashMap>` and answers searches by
//! brute-force cosine similarity. Cloning the store shares its contents, so a
//! clone doubles as a pool connection.

use super::StoragePort;
use crate::embedding::cosine_similarity;
use crate::error::{Error, Result};
use crate::memory::{Chunk, ScoredChunk, SearchQuery, StoreStats};
use crate::resilience::{Connection, ConnectionFactory};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory chunk store
#[derive(Clone, Default)]
pub struct MemoryStore {
    chunks: Arc<RwLock<HashMap<String, Chunk>>>,
    dimension: Option<usize>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store that reports `dimension` in its stats
    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            chunks: Arc::default(),
            dimension: Some(dimension),
        }
    }

    /// Number of stored chunks, tombstones included
    pub async fn len(&self) -> usize {
        self.chunks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.chunks.read().await.is_empty()
    }
}

#[async_trait]
impl StoragePort for MemoryStore {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn upsert(&self, chunk: &Chunk) -> Result<()> {
        self.chunks
            .write()
            .await
            .insert(chunk.id.clone(), chunk.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Chunk> {
        self.chunks
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("chunk {}", id)))
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.chunks.write().await.remove(id);
        Ok(())
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<ScoredChunk>> {
        let chunks = self.chunks.read().await;
        let mut scored: Vec<ScoredChunk> = chunks
            .values()
            .filter(|c| query.filter.matches(c))
            .map(|c| ScoredChunk {
                score: cosine_similarity(&query.vector, &c.embedding),
                chunk: c.clone(),
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk.id.cmp(&b.chunk.id))
        });
        scored.truncate(query.top_k);
        Ok(scored)
    }

    async fn stats(&self) -> Result<StoreStats> {
        let chunks = self.chunks.read().await;
        Ok(StoreStats {
            backend: "memory".to_string(),
            total_chunks: chunks.len() as u64,
            deleted_chunks: Some(chunks.values().filter(|c| c.deleted).count() as u64),
            dimension: self.dimension,
        })
    }
}

#[async_trait]
impl Connection for MemoryStore {
    async fn is_healthy(&self) -> bool {
        true
    }
}

#[async_trait]
impl ConnectionFactory for MemoryStore {
    type Conn = MemoryStore;

    async fn connect(&self) -> Result<MemoryStore> {
        Ok(self.clone())
    }
}
