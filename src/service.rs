//! Memory API facade
//!
//! The surface other layers use: CRUD, search, conflict listing and
//! resolution, and stats. Every mutation is routed through the conflict
//! resolver as an event from the local `api` peer, so API writers and
//! connected peers follow the same rules and see each other's changes.

use crate::config::{MemSyncConfig, StoreBackend};
use crate::embedding::{Embedder, HashingEmbedder};
use crate::error::{Error, Result};
use crate::memory::{Chunk, ChunkRepository, ScoredChunk, SearchFilter, SearchQuery, StoreStats};
use crate::resilience::{BreakerRegistry, BreakerStats, PoolStats};
use crate::store::{MemoryStore, QdrantConnector, ResilientStore, StoragePort, StoreProbe};
use crate::sync::{
    ConflictCounts, ConflictDecision, ConflictRecord, ConflictResolver, ConflictStatus,
    ConflictStore, EventOutcome, Operation, RealtimeSyncManager, ResolvedConflict, SyncEvent,
};
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Peer id used for writes made through this API
pub const API_PEER: &str = "api";

/// Snapshot of the service's moving parts
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub store: StoreStats,
    pub conflicts: ConflictCounts,
    pub pool: Option<PoolStats>,
    pub breaker: Option<BreakerStats>,
    pub connected_peers: Vec<String>,
}

/// Memory service
pub struct MemoryService {
    resolver: Arc<ConflictResolver>,
    realtime: Arc<RealtimeSyncManager>,
    embedder: Arc<dyn Embedder>,
    probe: Option<Arc<dyn StoreProbe>>,
    sequence: AtomicU64,
}

impl MemoryService {
    /// Assemble the service over an already wrapped store
    pub fn new(
        store: Arc<dyn StoragePort>,
        probe: Option<Arc<dyn StoreProbe>>,
        conflicts: Arc<ConflictStore>,
        embedder: Arc<dyn Embedder>,
        config: &MemSyncConfig,
    ) -> Self {
        let repository = Arc::new(ChunkRepository::new(store, config.repository.clone()));
        let resolver = Arc::new(ConflictResolver::new(
            repository,
            conflicts,
            embedder.clone(),
            config.resolver.clone(),
        ));
        let realtime = Arc::new(RealtimeSyncManager::new(resolver.clone(), &config.sync));
        Self {
            resolver,
            realtime,
            embedder,
            probe,
            sequence: AtomicU64::new(0),
        }
    }

    /// Build the configured backend behind the resilience chain, open the
    /// conflict store and initialize the store.
    pub async fn from_config(config: &MemSyncConfig) -> Result<Self> {
        config.validate()?;
        let dimension = config.repository.embedding_dim;
        let breakers = BreakerRegistry::new(config.breaker.clone());

        let (store, probe): (Arc<dyn StoragePort>, Arc<dyn StoreProbe>) = match config.store.backend {
            StoreBackend::Memory => {
                let resilient = Arc::new(
                    ResilientStore::connect(
                        MemoryStore::with_dimension(dimension),
                        "memory",
                        config,
                        &breakers,
                    )
                    .await?,
                );
                (resilient.clone(), resilient)
            }
            StoreBackend::Qdrant => {
                let resilient = Arc::new(
                    ResilientStore::connect(
                        QdrantConnector::new(config.store.clone(), dimension),
                        &config.store.url,
                        config,
                        &breakers,
                    )
                    .await?,
                );
                (resilient.clone(), resilient)
            }
        };

        let conflicts = if config.conflicts.persist {
            ConflictStore::open(config.conflicts.dir.clone()).await?
        } else {
            ConflictStore::in_memory()
        };

        let service = Self::new(
            store,
            Some(probe),
            Arc::new(conflicts),
            Arc::new(HashingEmbedder::new(dimension)),
            config,
        );
        service.repository().initialize().await?;
        tracing::info!(
            backend = ?config.store.backend,
            embedding_dim = dimension,
            "Memory service ready"
        );
        Ok(service)
    }

    pub fn repository(&self) -> &Arc<ChunkRepository> {
        self.resolver.repository()
    }

    pub fn realtime(&self) -> &Arc<RealtimeSyncManager> {
        &self.realtime
    }

    // ========================================================================
    // Chunks
    // ========================================================================

    /// Store a new chunk. An empty embedding is computed from the content.
    pub async fn create(&self, chunk: Chunk) -> Result<Chunk> {
        self.submit(Operation::Create, chunk, 0).await
    }

    /// Update a chunk the caller last read at `expected_version`. Concurrent
    /// edits are reconciled; irreconcilable ones fail with
    /// `ConflictUnresolved` and leave the stored chunk as it was.
    pub async fn update(&self, chunk: Chunk, expected_version: u64) -> Result<Chunk> {
        if expected_version == 0 {
            return Err(Error::Validation(
                "update requires the version the caller last read".to_string(),
            ));
        }
        self.submit(Operation::Update, chunk, expected_version).await
    }

    /// Tombstone a chunk the caller last read at `expected_version`
    pub async fn delete(&self, id: &str, expected_version: u64) -> Result<Chunk> {
        let current = self.repository().get(id).await?;
        self.submit(Operation::Delete, current, expected_version)
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Chunk> {
        self.repository().get(id).await
    }

    /// Vector search
    pub async fn search(&self, query: &SearchQuery) -> Result<Vec<ScoredChunk>> {
        self.repository().search(query).await
    }

    /// Embed `text` and search with it
    pub async fn search_text(
        &self,
        text: &str,
        filter: SearchFilter,
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let vector = self.embedder.embed(text).await?;
        self.search(&SearchQuery {
            vector,
            filter,
            top_k,
        })
        .await
    }

    async fn submit(&self, operation: Operation, mut chunk: Chunk, base_version: u64) -> Result<Chunk> {
        chunk.origin = API_PEER.to_string();
        chunk.updated_at = Utc::now();
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let event = SyncEvent::new(API_PEER, sequence, operation, chunk, base_version);
        match self.realtime.publish(&event).await? {
            EventOutcome::Applied { chunk }
            | EventOutcome::Duplicate { chunk }
            | EventOutcome::Merged { chunk, .. } => Ok(chunk),
            EventOutcome::Conflict { conflict_id } => Err(Error::ConflictUnresolved {
                conflict_id,
                chunk_id: event.chunk.id,
            }),
            EventOutcome::Rejected { reason, .. } => Err(Error::Internal(reason)),
        }
    }

    // ========================================================================
    // Conflicts
    // ========================================================================

    pub async fn list_conflicts(&self, status: Option<ConflictStatus>) -> Vec<ConflictRecord> {
        self.resolver.conflicts().list(status).await
    }

    pub async fn get_conflict(&self, id: &str) -> Result<ConflictRecord> {
        self.resolver
            .conflicts()
            .get(id)
            .await
            .ok_or_else(|| Error::NotFound(format!("conflict {}", id)))
    }

    /// Apply an operator decision and broadcast the outcome
    pub async fn resolve_conflict(
        &self,
        id: &str,
        decision: ConflictDecision,
    ) -> Result<ResolvedConflict> {
        let resolved = self
            .resolver
            .resolve_conflict(id, decision, API_PEER)
            .await?;
        if resolved.written {
            self.realtime.announce(API_PEER, &resolved.chunk).await;
        }
        Ok(resolved)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub async fn stats(&self) -> Result<ServiceStats> {
        Ok(ServiceStats {
            store: self.repository().stats().await?,
            conflicts: self.resolver.conflicts().counts().await,
            pool: self.probe.as_ref().map(|p| p.pool_stats()),
            breaker: self.probe.as_ref().map(|p| p.breaker_stats()),
            connected_peers: self.realtime.connected_peers().await,
        })
    }

    pub async fn close(&self) -> Result<()> {
        self.repository().close().await
    }
}
