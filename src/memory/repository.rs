//! Versioned chunk repository
//!
//! Validates chunks, assigns versions and provides the optimistic
//! concurrency primitive the conflict resolver is built on. Writes to one
//! chunk id are serialized by an in-process lock so the read-compare-write in
//! `put_if_version` is atomic within this process; unrelated chunks never
//! contend.

use crate::config::RepositoryConfig;
use crate::error::{Error, Result};
use crate::memory::{Chunk, ScoredChunk, SearchQuery, StoreStats};
use crate::store::StoragePort;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

type ChunkLock = Arc<tokio::sync::Mutex<()>>;

/// CRUD and search over the resilient store, with versioning
pub struct ChunkRepository {
    store: Arc<dyn StoragePort>,
    config: RepositoryConfig,
    locks: Mutex<HashMap<String, ChunkLock>>,
    /// Superseded versions per chunk, oldest first
    history: Mutex<HashMap<String, VecDeque<Chunk>>>,
}

impl ChunkRepository {
    pub fn new(store: Arc<dyn StoragePort>, config: RepositoryConfig) -> Self {
        Self {
            store,
            config,
            locks: Mutex::new(HashMap::new()),
            history: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    /// Prepare the backing store
    pub async fn initialize(&self) -> Result<()> {
        self.store.initialize().await
    }

    pub async fn close(&self) -> Result<()> {
        self.store.close().await
    }

    /// Check the invariants every stored chunk must satisfy
    pub fn validate(&self, chunk: &Chunk) -> Result<()> {
        if chunk.id.trim().is_empty() {
            return Err(Error::Validation("chunk id is required".to_string()));
        }
        if chunk.content.trim().is_empty() {
            return Err(Error::Validation(format!("chunk {} has empty content", chunk.id)));
        }
        if chunk.embedding.len() != self.config.embedding_dim {
            return Err(Error::Validation(format!(
                "chunk {} embedding has {} dimensions, expected {}",
                chunk.id,
                chunk.embedding.len(),
                self.config.embedding_dim
            )));
        }
        Ok(())
    }

    /// Current stored version, tombstones included. `None` if never stored.
    pub async fn get_current(&self, id: &str) -> Result<Option<Chunk>> {
        match self.store.get(id).await {
            Ok(chunk) => Ok(Some(chunk)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Live chunk by id; tombstoned chunks are reported as not found
    pub async fn get(&self, id: &str) -> Result<Chunk> {
        match self.get_current(id).await? {
            Some(chunk) if !chunk.deleted => Ok(chunk),
            _ => Err(Error::NotFound(format!("chunk {}", id))),
        }
    }

    /// Store a new chunk at version 1
    pub async fn create(&self, chunk: Chunk) -> Result<Chunk> {
        self.put_if_version(chunk, 0).await
    }

    /// Write `chunk` only if the stored version still equals `expected`
    /// (0 meaning "not stored yet"). The written chunk carries version
    /// `expected + 1`. A stale `expected` fails with `VersionConflict` and
    /// leaves the store untouched.
    pub async fn put_if_version(&self, chunk: Chunk, expected: u64) -> Result<Chunk> {
        self.validate(&chunk)?;

        let entry = self.chunk_lock(&chunk.id);
        let _guard = entry.lock.lock().await;
        self.write_locked(chunk, expected).await
    }

    async fn write_locked(&self, mut chunk: Chunk, expected: u64) -> Result<Chunk> {
        let current = self.get_current(&chunk.id).await?;
        let actual = current.as_ref().map_or(0, |c| c.version);
        if actual != expected {
            return Err(Error::VersionConflict {
                id: chunk.id,
                expected,
                actual,
            });
        }

        chunk.version = expected + 1;
        self.store.upsert(&chunk).await?;
        if let Some(previous) = current {
            self.remember(previous);
        }
        tracing::debug!(chunk_id = %chunk.id, version = chunk.version, "Chunk written");
        Ok(chunk)
    }

    /// Tombstone a chunk if it is still at `expected`
    pub async fn delete(&self, id: &str, expected: u64, origin: &str) -> Result<Chunk> {
        let current = self
            .get_current(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("chunk {}", id)))?;
        if current.deleted {
            return Err(Error::NotFound(format!("chunk {} already deleted", id)));
        }
        self.put_if_version(current.tombstone(origin, Utc::now()), expected)
            .await
    }

    /// Vector search over live chunks
    pub async fn search(&self, query: &SearchQuery) -> Result<Vec<ScoredChunk>> {
        let mut hits = self.store.search(query).await?;
        if !query.filter.include_deleted {
            hits.retain(|hit| !hit.chunk.deleted);
        }
        Ok(hits)
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        self.store.stats().await
    }

    /// A specific superseded version, if still retained
    pub fn history(&self, id: &str, version: u64) -> Option<Chunk> {
        self.history_map()
            .get(id)?
            .iter()
            .find(|c| c.version == version)
            .cloned()
    }

    fn remember(&self, previous: Chunk) {
        if self.config.history_depth == 0 {
            return;
        }
        let mut history = self.history_map();
        let versions = history.entry(previous.id.clone()).or_default();
        versions.push_back(previous);
        while versions.len() > self.config.history_depth {
            versions.pop_front();
        }
    }

    fn history_map(&self) -> MutexGuard<'_, HashMap<String, VecDeque<Chunk>>> {
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn chunk_lock(&self, id: &str) -> LockEntry<'_> {
        let lock = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(id.to_string())
            .or_default()
            .clone();
        LockEntry {
            locks: &self.locks,
            id: id.to_string(),
            lock,
        }
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

/// A chunk lock checked out of the lock map. Dropping it removes the map
/// entry once no other writer holds or waits on it, including when the
/// write is cancelled.
struct LockEntry<'a> {
    locks: &'a Mutex<HashMap<String, ChunkLock>>,
    id: String,
    lock: ChunkLock,
}

impl Drop for LockEntry<'_> {
    fn drop(&mut self) {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // The map and this entry are the only owners left
        if locks
            .get(&self.id)
            .is_some_and(|l| Arc::ptr_eq(l, &self.lock) && Arc::strong_count(l) == 2)
        {
            locks.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ChunkBuilder, SearchFilter};
    use crate::store::MemoryStore;

    fn repo() -> ChunkRepository {
        ChunkRepository::new(
            Arc::new(MemoryStore::new()),
            RepositoryConfig {
                embedding_dim: 2,
                history_depth: 2,
                max_top_k: 10,
            },
        )
    }

    fn chunk(id: &str, content: &str) -> Chunk {
        ChunkBuilder::new("repo", content)
            .id(id)
            .embedding(vec![1.0, 0.0])
            .origin("peer-a")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_assigns_version_one() {
        let repo = repo();
        let stored = repo.create(chunk("c1", "first")).await.unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(repo.get("c1").await.unwrap().version, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_write_releases_chunk_lock() {
        let repo = repo();
        repo.create(chunk("c1", "first")).await.unwrap();
        assert_eq!(repo.lock_count(), 0);

        let entry = repo.chunk_lock("c1");
        let held = entry.lock.lock().await;
        let waiting = tokio::time::timeout(
            std::time::Duration::from_millis(10),
            repo.put_if_version(chunk("c1", "second"), 1),
        )
        .await;
        assert!(waiting.is_err());
        assert_eq!(repo.lock_count(), 1);

        drop(held);
        drop(entry);
        assert_eq!(repo.lock_count(), 0);
        assert_eq!(repo.put_if_version(chunk("c1", "second"), 1).await.unwrap().version, 2);
        assert_eq!(repo.lock_count(), 0);
    }

    #[tokio::test]
    async fn test_create_twice_conflicts() {
        let repo = repo();
        repo.create(chunk("c1", "first")).await.unwrap();
        let err = repo.create(chunk("c1", "again")).await.unwrap_err();
        assert!(matches!(
            err,
            Error::VersionConflict {
                expected: 0,
                actual: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_stale_put_never_applies() {
        let repo = repo();
        repo.create(chunk("c1", "v1")).await.unwrap();
        repo.put_if_version(chunk("c1", "v2"), 1).await.unwrap();

        let err = repo.put_if_version(chunk("c1", "stale"), 1).await.unwrap_err();
        assert!(matches!(
            err,
            Error::VersionConflict {
                expected: 1,
                actual: 2,
                ..
            }
        ));
        let current = repo.get("c1").await.unwrap();
        assert_eq!(current.version, 2);
        assert_eq!(current.content, "v2");
    }

    #[tokio::test]
    async fn test_validation() {
        let repo = repo();
        let mut bad_dim = chunk("c1", "x");
        bad_dim.embedding = vec![1.0, 0.0, 0.0];
        assert!(matches!(repo.create(bad_dim).await, Err(Error::Validation(_))));

        let mut no_id = chunk("c1", "x");
        no_id.id = " ".to_string();
        assert!(matches!(repo.create(no_id).await, Err(Error::Validation(_))));

        let mut empty = chunk("c1", "x");
        empty.content.clear();
        assert!(matches!(repo.create(empty).await, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_delete_writes_tombstone() {
        let repo = repo();
        repo.create(chunk("c1", "doomed")).await.unwrap();
        let tomb = repo.delete("c1", 1, "peer-b").await.unwrap();
        assert!(tomb.deleted);
        assert_eq!(tomb.version, 2);

        assert!(matches!(repo.get("c1").await, Err(Error::NotFound(_))));
        let current = repo.get_current("c1").await.unwrap().unwrap();
        assert!(current.deleted);
        assert_eq!(current.origin, "peer-b");

        assert!(matches!(
            repo.delete("c1", 2, "peer-b").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let repo = repo();
        repo.create(chunk("c1", "v1")).await.unwrap();
        for (expected, content) in [(1, "v2"), (2, "v3"), (3, "v4")] {
            repo.put_if_version(chunk("c1", content), expected).await.unwrap();
        }
        assert!(repo.history("c1", 1).is_none());
        assert_eq!(repo.history("c1", 2).unwrap().content, "v2");
        assert_eq!(repo.history("c1", 3).unwrap().content, "v3");
    }

    #[tokio::test]
    async fn test_search_hides_tombstones() {
        let repo = repo();
        repo.create(chunk("live", "kept")).await.unwrap();
        repo.create(chunk("gone", "removed")).await.unwrap();
        repo.delete("gone", 1, "peer-a").await.unwrap();

        let hits = repo
            .search(&SearchQuery {
                vector: vec![1.0, 0.0],
                filter: SearchFilter::default(),
                top_k: 10,
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.id, "live");
    }

    #[tokio::test]
    async fn test_concurrent_writers_single_winner() {
        let repo = Arc::new(repo());
        repo.create(chunk("c1", "base")).await.unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let repo = repo.clone();
                tokio::spawn(async move {
                    repo.put_if_version(chunk("c1", &format!("writer {}", i)), 1)
                        .await
                })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(e) => assert!(matches!(e, Error::VersionConflict { .. })),
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(repo.get("c1").await.unwrap().version, 2);
        assert!(repo.locks.lock().unwrap().is_empty());
    }
}
