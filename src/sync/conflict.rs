//! Conflict records
//!
//! A record captures the chunk that was stored when divergent writes were
//! detected together with every incoming candidate, so that no losing
//! version is ever dropped. Manual records stay `pending` until a decision
//! is applied; last-writer-wins records are created already `resolved` and
//! kept for audit.
//!
//! Persistence layout (optional):
//! ```text
//! <dir>/
//! ├── conflict-<uuid>.json
//! └── ...
//! ```

use crate::error::{Error, Result};
use crate::memory::Chunk;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// How a conflict was, or is to be, settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Structural merge of non-overlapping edits
    AutoMerged,
    /// Near-duplicate edits; the later timestamp won
    LastWriterWins,
    /// Needs an operator decision
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Pending,
    Resolved,
}

/// Which version ended up current
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Winner {
    Stored,
    Candidate { index: usize },
    Replacement,
}

/// Operator decision for a pending conflict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ConflictDecision {
    /// Discard the candidates; the stored chunk stays current
    KeepStored,
    /// Make one candidate current
    Accept { candidate: usize },
    /// Write an operator-supplied chunk
    Replace { chunk: Chunk },
}

/// Two or more divergent versions of one chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: String,
    pub chunk_id: String,
    /// Chunk current at detection time
    pub stored: Chunk,
    /// Incoming versions that could not be applied as-is
    pub candidates: Vec<Chunk>,
    /// Version the candidates were based on
    pub base_version: u64,
    pub resolution: Resolution,
    pub status: ConflictStatus,
    /// Content similarity that drove the decision, when computed
    pub similarity: Option<f32>,
    pub reason: String,
    pub winner: Option<Winner>,
    pub resolved_version: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ConflictRecord {
    fn new(
        stored: Chunk,
        candidates: Vec<Chunk>,
        base_version: u64,
        resolution: Resolution,
        similarity: Option<f32>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            chunk_id: stored.id.clone(),
            stored,
            candidates,
            base_version,
            resolution,
            status: ConflictStatus::Pending,
            similarity,
            reason: reason.into(),
            winner: None,
            resolved_version: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    /// Whether any candidate has this content hash
    pub fn has_candidate(&self, hash: &str) -> bool {
        self.candidates.iter().any(|c| c.content_hash() == hash)
    }

    pub fn is_pending(&self) -> bool {
        self.status == ConflictStatus::Pending
    }
}

/// Pending/resolved totals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictCounts {
    pub pending: usize,
    pub resolved: usize,
}

/// Conflict records, optionally backed by JSON files
pub struct ConflictStore {
    records: RwLock<HashMap<String, ConflictRecord>>,
    dir: Option<PathBuf>,
}

impl ConflictStore {
    /// Create a store that keeps records in memory only
    pub fn in_memory() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            dir: None,
        }
    }

    /// Open a persistent store, loading existing records from `dir`
    pub async fn open(dir: PathBuf) -> Result<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        let records: HashMap<String, ConflictRecord> = load_records(&dir)
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();
        tracing::info!(dir = %dir.display(), records = records.len(), "Conflict store opened");
        Ok(Self {
            records: RwLock::new(records),
            dir: Some(dir),
        })
    }

    /// Open a manual conflict. A pending record for the same chunk that
    /// already holds one of these candidates is reused instead of opening a
    /// new one, so redelivered events never multiply records. Candidates the
    /// reused record does not hold yet are appended to it.
    pub async fn open_manual(
        &self,
        stored: Chunk,
        candidates: Vec<Chunk>,
        base_version: u64,
        similarity: Option<f32>,
        reason: &str,
    ) -> Result<ConflictRecord> {
        let hashes: Vec<String> = candidates.iter().map(Chunk::content_hash).collect();
        let mut records = self.records.write().await;
        let existing = records
            .values()
            .filter(|r| {
                r.is_pending()
                    && r.chunk_id == stored.id
                    && hashes.iter().any(|h| r.has_candidate(h))
            })
            .max_by_key(|r| r.created_at)
            .map(|r| r.id.clone());
        if let Some(id) = existing {
            if let Some(record) = records.get_mut(&id) {
                let missing: Vec<Chunk> = candidates
                    .into_iter()
                    .zip(&hashes)
                    .filter(|(_, h)| !record.has_candidate(h))
                    .map(|(c, _)| c)
                    .collect();
                if missing.is_empty() {
                    return Ok(record.clone());
                }

                let mut updated = record.clone();
                updated.candidates.extend(missing);
                self.persist(&updated).await?;
                *record = updated.clone();
                tracing::warn!(
                    conflict_id = %updated.id,
                    chunk_id = %updated.chunk_id,
                    candidates = updated.candidates.len(),
                    "Candidates added to pending conflict"
                );
                return Ok(updated);
            }
        }

        let record = ConflictRecord::new(
            stored,
            candidates,
            base_version,
            Resolution::Manual,
            similarity,
            reason,
        );
        self.persist(&record).await?;
        records.insert(record.id.clone(), record.clone());
        tracing::warn!(
            conflict_id = %record.id,
            chunk_id = %record.chunk_id,
            candidates = record.candidates.len(),
            "Manual conflict recorded: {}",
            record.reason
        );
        Ok(record)
    }

    /// Record an automatically settled conflict for audit
    pub async fn record_resolved(
        &self,
        stored: Chunk,
        candidates: Vec<Chunk>,
        base_version: u64,
        resolution: Resolution,
        similarity: Option<f32>,
        winner: Winner,
        resolved_version: u64,
    ) -> Result<ConflictRecord> {
        let mut record = ConflictRecord::new(
            stored,
            candidates,
            base_version,
            resolution,
            similarity,
            "near-duplicate concurrent edits",
        );
        record.status = ConflictStatus::Resolved;
        record.winner = Some(winner);
        record.resolved_version = Some(resolved_version);
        record.resolved_at = Some(Utc::now());

        self.persist(&record).await?;
        self.records
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        tracing::info!(
            conflict_id = %record.id,
            chunk_id = %record.chunk_id,
            winner = ?winner,
            "Conflict resolved automatically"
        );
        Ok(record)
    }

    /// Mark a pending record resolved
    pub async fn mark_resolved(
        &self,
        id: &str,
        winner: Winner,
        resolved_version: u64,
    ) -> Result<ConflictRecord> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("conflict {}", id)))?;
        if !record.is_pending() {
            return Err(Error::Validation(format!("conflict {} is already resolved", id)));
        }
        let mut updated = record.clone();
        updated.status = ConflictStatus::Resolved;
        updated.winner = Some(winner);
        updated.resolved_version = Some(resolved_version);
        updated.resolved_at = Some(Utc::now());

        self.persist(&updated).await?;
        *record = updated.clone();
        Ok(updated)
    }

    pub async fn get(&self, id: &str) -> Option<ConflictRecord> {
        self.records.read().await.get(id).cloned()
    }

    /// Most recent record for `chunk_id` holding a candidate with `hash`
    pub async fn find_by_candidate(&self, chunk_id: &str, hash: &str) -> Option<ConflictRecord> {
        self.records
            .read()
            .await
            .values()
            .filter(|r| r.chunk_id == chunk_id && r.has_candidate(hash))
            .max_by_key(|r| r.created_at)
            .cloned()
    }

    /// Records, oldest first, optionally filtered by status
    pub async fn list(&self, status: Option<ConflictStatus>) -> Vec<ConflictRecord> {
        let mut records: Vec<ConflictRecord> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        records
    }

    pub async fn counts(&self) -> ConflictCounts {
        let records = self.records.read().await;
        let pending = records.values().filter(|r| r.is_pending()).count();
        ConflictCounts {
            pending,
            resolved: records.len() - pending,
        }
    }

    async fn persist(&self, record: &ConflictRecord) -> Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let path = dir.join(format!("conflict-{}.json", record.id));
        let json = serde_json::to_string_pretty(record)?;
        tokio::fs::write(&path, json).await?;
        Ok(())
    }
}

impl Default for ConflictStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

fn load_records(dir: &Path) -> Vec<ConflictRecord> {
    let mut records = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to read directory {}: {}", dir.display(), e);
            }
            return records;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match std::fs::read_to_string(&path) {
            Ok(data) => match serde_json::from_str(&data) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!("Failed to parse {}: {}", path.display(), e),
            },
            Err(e) => tracing::warn!("Failed to read {}: {}", path.display(), e),
        }
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ChunkBuilder;
    use tempfile::TempDir;

    fn chunk(content: &str) -> Chunk {
        ChunkBuilder::new("repo", content)
            .id("c1")
            .embedding(vec![1.0, 0.0])
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_manual_records_are_deduplicated() {
        let store = ConflictStore::in_memory();
        let first = store
            .open_manual(chunk("stored"), vec![chunk("mine")], 3, Some(0.4), "diverged")
            .await
            .unwrap();
        let again = store
            .open_manual(chunk("stored"), vec![chunk("mine")], 3, Some(0.4), "diverged")
            .await
            .unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(store.counts().await.pending, 1);

        let other = store
            .open_manual(chunk("stored"), vec![chunk("theirs")], 3, None, "diverged")
            .await
            .unwrap();
        assert_ne!(first.id, other.id);
    }

    #[tokio::test]
    async fn test_reused_record_gains_new_candidates() {
        let dir = TempDir::new().unwrap();
        let store = ConflictStore::open(dir.path().to_path_buf()).await.unwrap();
        let first = store
            .open_manual(
                chunk("stored"),
                vec![chunk("mine"), chunk("theirs")],
                3,
                Some(0.4),
                "diverged",
            )
            .await
            .unwrap();

        let again = store
            .open_manual(
                chunk("stored"),
                vec![chunk("theirs"), chunk("third")],
                3,
                Some(0.3),
                "diverged",
            )
            .await
            .unwrap();
        assert_eq!(again.id, first.id);
        let contents: Vec<_> = again.candidates.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(contents, vec!["mine", "theirs", "third"]);
        assert_eq!(store.counts().await.pending, 1);

        let reopened = ConflictStore::open(dir.path().to_path_buf()).await.unwrap();
        assert_eq!(reopened.get(&first.id).await.unwrap().candidates.len(), 3);
    }

    #[tokio::test]
    async fn test_mark_resolved_once() {
        let store = ConflictStore::in_memory();
        let record = store
            .open_manual(chunk("stored"), vec![chunk("mine")], 3, None, "diverged")
            .await
            .unwrap();

        let resolved = store
            .mark_resolved(&record.id, Winner::Candidate { index: 0 }, 4)
            .await
            .unwrap();
        assert_eq!(resolved.status, ConflictStatus::Resolved);
        assert_eq!(resolved.resolved_version, Some(4));

        let err = store
            .mark_resolved(&record.id, Winner::Stored, 4)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(matches!(
            store.mark_resolved("missing", Winner::Stored, 1).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_and_find() {
        let store = ConflictStore::in_memory();
        store
            .record_resolved(
                chunk("stored"),
                vec![chunk("later")],
                3,
                Resolution::LastWriterWins,
                Some(0.93),
                Winner::Candidate { index: 0 },
                4,
            )
            .await
            .unwrap();
        store
            .open_manual(chunk("stored"), vec![chunk("far")], 3, Some(0.2), "diverged")
            .await
            .unwrap();

        assert_eq!(store.list(None).await.len(), 2);
        assert_eq!(store.list(Some(ConflictStatus::Pending)).await.len(), 1);
        let found = store
            .find_by_candidate("c1", &chunk("later").content_hash())
            .await
            .unwrap();
        assert_eq!(found.resolution, Resolution::LastWriterWins);
        assert!(store.find_by_candidate("c1", "nope").await.is_none());
    }

    #[tokio::test]
    async fn test_persistence_round_trip() {
        let dir = TempDir::new().unwrap();
        let id = {
            let store = ConflictStore::open(dir.path().to_path_buf()).await.unwrap();
            store
                .open_manual(chunk("stored"), vec![chunk("mine")], 3, None, "diverged")
                .await
                .unwrap()
                .id
        };

        let store = ConflictStore::open(dir.path().to_path_buf()).await.unwrap();
        let record = store.get(&id).await.unwrap();
        assert_eq!(record.candidates[0].content, "mine");
        assert!(record.is_pending());
    }

    #[tokio::test]
    async fn test_load_skips_corrupt_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("conflict-bad.json"), "not json").unwrap();
        let store = ConflictStore::open(dir.path().to_path_buf()).await.unwrap();
        assert!(store.list(None).await.is_empty());
    }
}
