//! Conflict resolver
//!
//! Every chunk mutation is applied through [`ConflictResolver::apply`]. When
//! the stored version no longer matches the version the writer started
//! from, the resolver reconciles, in order:
//!
//! 1. identical content: idempotent redelivery, nothing written
//! 2. non-overlapping edits: structural merge against the base version
//!    (tags as sets, scalar fields and extra keys field by field)
//! 3. overlapping content edits at or above the similarity threshold:
//!    last writer wins, the loser kept in a resolved conflict record
//! 4. anything else: a pending manual conflict record and
//!    `ConflictUnresolved`; the stored chunk is left as it was
//!
//! Writes use `put_if_version`, so a concurrent resolver racing on the same
//! chunk only causes a retry against fresh state. After `max_attempts`
//! races the event is escalated to manual resolution.

use crate::config::ResolverConfig;
use crate::embedding::{cosine_similarity, Embedder};
use crate::error::{Error, Result};
use crate::memory::{Chunk, ChunkMetadata, ChunkRepository};
use crate::sync::conflict::{ConflictDecision, ConflictRecord, ConflictStore, Resolution, Winner};
use crate::sync::event::{EventOutcome, Operation, SyncEvent};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Result of an operator decision
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConflict {
    pub record: ConflictRecord,
    /// Chunk current after the decision
    pub chunk: Chunk,
    /// Whether the decision wrote a new version
    pub written: bool,
}

enum Plan {
    Write {
        chunk: Chunk,
        expected: u64,
        settle: Settle,
    },
    Unchanged {
        stored: Chunk,
    },
    KeepStored {
        stored: Chunk,
        similarity: f32,
    },
    Manual {
        stored: Chunk,
        reason: String,
        similarity: Option<f32>,
    },
}

enum Settle {
    Applied,
    AutoMerged,
    LastWriterWins { stored: Chunk, similarity: f32 },
}

/// Applies sync events and operator decisions with optimistic concurrency
pub struct ConflictResolver {
    repository: Arc<ChunkRepository>,
    conflicts: Arc<ConflictStore>,
    embedder: Arc<dyn Embedder>,
    config: ResolverConfig,
}

impl ConflictResolver {
    pub fn new(
        repository: Arc<ChunkRepository>,
        conflicts: Arc<ConflictStore>,
        embedder: Arc<dyn Embedder>,
        config: ResolverConfig,
    ) -> Self {
        Self {
            repository,
            conflicts,
            embedder,
            config,
        }
    }

    pub fn repository(&self) -> &Arc<ChunkRepository> {
        &self.repository
    }

    pub fn conflicts(&self) -> &Arc<ConflictStore> {
        &self.conflicts
    }

    // ========================================================================
    // Single events
    // ========================================================================

    /// Apply one event. Manual conflicts surface as `ConflictUnresolved`.
    pub async fn apply(&self, event: &SyncEvent) -> Result<EventOutcome> {
        self.apply_after(event, None).await
    }

    /// Apply an event whose author last saw `local_base` rather than the
    /// stored chunk at `base_version`. Used when replaying a chain of
    /// offline edits: the author's previous payload is the merge base, and
    /// the event is only written directly if the store still holds exactly
    /// that payload.
    pub async fn apply_after(
        &self,
        event: &SyncEvent,
        local_base: Option<&Chunk>,
    ) -> Result<EventOutcome> {
        let chunk_id = event.chunk_id();
        if chunk_id.trim().is_empty() {
            return Err(Error::Validation("event chunk id is required".to_string()));
        }
        let prepared = match event.operation {
            Operation::Delete => None,
            Operation::Create | Operation::Update => Some(self.prepare(event).await?),
        };
        let expected = match event.operation {
            Operation::Create => 0,
            Operation::Update | Operation::Delete => event.base_version,
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let current = self.repository.get_current(chunk_id).await?;
            let incoming = match (&prepared, &current) {
                (Some(chunk), _) => chunk.clone(),
                (None, Some(stored)) => stored.tombstone(&event.peer_id, event.chunk.updated_at),
                (None, None) => return Err(Error::NotFound(format!("chunk {}", chunk_id))),
            };

            let plan = match &current {
                None => Plan::Write {
                    chunk: incoming.clone(),
                    expected: 0,
                    settle: Settle::Applied,
                },
                Some(stored) if stored.content_hash() == incoming.content_hash() => {
                    tracing::debug!(chunk_id, peer = %event.peer_id, "Duplicate event ignored");
                    Plan::Unchanged {
                        stored: stored.clone(),
                    }
                }
                Some(stored)
                    if stored.version == expected
                        && local_base.map_or(true, |b| b.content_hash() == stored.content_hash()) =>
                {
                    Plan::Write {
                        chunk: incoming.clone(),
                        expected,
                        settle: Settle::Applied,
                    }
                }
                Some(stored) => {
                    if let Some(outcome) = self.previously_settled(stored, &incoming).await? {
                        return Ok(outcome);
                    }
                    self.plan(stored, &incoming, event.base_version, local_base)
                        .await?
                }
            };

            match self.execute(plan, &incoming, event.base_version).await {
                Err(Error::VersionConflict { actual, .. })
                    if attempt < self.config.max_attempts =>
                {
                    tracing::debug!(chunk_id, attempt, actual, "Lost write race, retrying");
                }
                Err(Error::VersionConflict { .. }) => {
                    return self.escalate(chunk_id, incoming, event.base_version).await;
                }
                other => return other,
            }
        }
    }

    /// Apply events for one chunk that were produced concurrently by
    /// different peers against the same base version. They are reconciled
    /// with each other and written as a single version when possible;
    /// otherwise, or when the events are not all updates of one chunk at
    /// one base version, they are applied one by one.
    pub async fn apply_concurrent(&self, events: &[SyncEvent]) -> Vec<Result<EventOutcome>> {
        if events.len() > 1 && are_siblings(events) {
            match self.fold_siblings(events).await {
                Ok(Some(outcomes)) => return outcomes,
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!("Concurrent edits not folded, applying in order: {}", e);
                }
            }
        }

        let mut outcomes = Vec::with_capacity(events.len());
        for event in events {
            outcomes.push(self.apply(event).await);
        }
        outcomes
    }

    // ========================================================================
    // Operator decisions
    // ========================================================================

    /// Settle a pending conflict
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        decision: ConflictDecision,
        origin: &str,
    ) -> Result<ResolvedConflict> {
        let record = self
            .conflicts
            .get(conflict_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("conflict {}", conflict_id)))?;
        if !record.is_pending() {
            return Err(Error::Validation(format!(
                "conflict {} is already resolved",
                conflict_id
            )));
        }

        let (replacement, winner) = match decision {
            ConflictDecision::KeepStored => {
                let current = self
                    .repository
                    .get_current(&record.chunk_id)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("chunk {}", record.chunk_id)))?;
                let record = self
                    .conflicts
                    .mark_resolved(conflict_id, Winner::Stored, current.version)
                    .await?;
                tracing::info!(conflict_id, chunk_id = %record.chunk_id, "Conflict resolved: kept stored");
                return Ok(ResolvedConflict {
                    record,
                    chunk: current,
                    written: false,
                });
            }
            ConflictDecision::Accept { candidate } => {
                let chunk = record.candidates.get(candidate).cloned().ok_or_else(|| {
                    Error::Validation(format!(
                        "conflict {} has no candidate {}",
                        conflict_id, candidate
                    ))
                })?;
                (chunk, Winner::Candidate { index: candidate })
            }
            ConflictDecision::Replace { mut chunk } => {
                if chunk.id != record.chunk_id {
                    return Err(Error::Validation(format!(
                        "replacement chunk id {} does not match {}",
                        chunk.id, record.chunk_id
                    )));
                }
                if chunk.embedding.is_empty() && !chunk.deleted {
                    chunk.embedding = self.embed(&chunk.content).await?;
                }
                (chunk, Winner::Replacement)
            }
        };

        let mut replacement = replacement;
        replacement.origin = origin.to_string();
        replacement.updated_at = Utc::now();

        let mut attempt = 0;
        let written = loop {
            attempt += 1;
            let expected = self
                .repository
                .get_current(&record.chunk_id)
                .await?
                .map_or(0, |c| c.version);
            match self
                .repository
                .put_if_version(replacement.clone(), expected)
                .await
            {
                Ok(chunk) => break chunk,
                Err(Error::VersionConflict { .. }) if attempt < self.config.max_attempts => {}
                Err(e) => return Err(e),
            }
        };

        let record = self
            .conflicts
            .mark_resolved(conflict_id, winner, written.version)
            .await?;
        tracing::info!(
            conflict_id,
            chunk_id = %written.id,
            version = written.version,
            "Conflict resolved by decision"
        );
        Ok(ResolvedConflict {
            record,
            chunk: written,
            written: true,
        })
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn prepare(&self, event: &SyncEvent) -> Result<Chunk> {
        let mut chunk = event.chunk.clone();
        if chunk.origin.is_empty() {
            chunk.origin = event.peer_id.clone();
        }
        chunk.deleted = false;
        if chunk.embedding.is_empty() {
            chunk.embedding = self.embed(&chunk.content).await?;
        }
        Ok(chunk)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embedder.embed(text).await.map_err(|e| match e {
            Error::Embedding(_) => e,
            other => Error::Embedding(other.to_string()),
        })
    }

    async fn similarity(&self, a: &str, b: &str) -> Result<f32> {
        if a == b {
            return Ok(1.0);
        }
        let va = self.embed(a).await?;
        let vb = self.embed(b).await?;
        Ok(cosine_similarity(&va, &vb))
    }

    /// An earlier delivery of this candidate was already adjudicated
    async fn previously_settled(
        &self,
        stored: &Chunk,
        incoming: &Chunk,
    ) -> Result<Option<EventOutcome>> {
        match self
            .conflicts
            .find_by_candidate(&stored.id, &incoming.content_hash())
            .await
        {
            Some(record) if record.is_pending() => Err(Error::ConflictUnresolved {
                conflict_id: record.id,
                chunk_id: record.chunk_id,
            }),
            Some(record) => Ok(Some(EventOutcome::Merged {
                chunk: stored.clone(),
                resolution: record.resolution,
                conflict_id: Some(record.id),
                written: false,
            })),
            None => Ok(None),
        }
    }

    async fn plan(
        &self,
        stored: &Chunk,
        incoming: &Chunk,
        base_version: u64,
        local_base: Option<&Chunk>,
    ) -> Result<Plan> {
        if stored.deleted || incoming.deleted {
            let reason = if stored.deleted {
                "update of a chunk deleted concurrently"
            } else {
                "delete of a chunk updated concurrently"
            };
            return Ok(Plan::Manual {
                stored: stored.clone(),
                reason: reason.to_string(),
                similarity: None,
            });
        }

        let base = match local_base {
            Some(base) => Some(base.clone()),
            None if base_version > 0 => self.repository.history(&stored.id, base_version),
            None => None,
        };
        if let Some(merged) = structural_merge(base.as_ref(), stored, incoming) {
            if merged.content_hash() == stored.content_hash() {
                return Ok(Plan::Unchanged {
                    stored: stored.clone(),
                });
            }
            return Ok(Plan::Write {
                chunk: merged,
                expected: stored.version,
                settle: Settle::AutoMerged,
            });
        }

        let similarity = self.similarity(&stored.content, &incoming.content).await?;
        if similarity >= self.config.auto_merge_threshold {
            if is_later(incoming, stored) {
                Ok(Plan::Write {
                    chunk: incoming.clone(),
                    expected: stored.version,
                    settle: Settle::LastWriterWins {
                        stored: stored.clone(),
                        similarity,
                    },
                })
            } else {
                Ok(Plan::KeepStored {
                    stored: stored.clone(),
                    similarity,
                })
            }
        } else {
            Ok(Plan::Manual {
                stored: stored.clone(),
                reason: format!(
                    "overlapping edits with similarity {:.2} below threshold {:.2}",
                    similarity, self.config.auto_merge_threshold
                ),
                similarity: Some(similarity),
            })
        }
    }

    async fn execute(&self, plan: Plan, incoming: &Chunk, base_version: u64) -> Result<EventOutcome> {
        match plan {
            Plan::Write {
                chunk,
                expected,
                settle,
            } => {
                let written = self.repository.put_if_version(chunk, expected).await?;
                match settle {
                    Settle::Applied => Ok(EventOutcome::Applied { chunk: written }),
                    Settle::AutoMerged => {
                        tracing::info!(chunk_id = %written.id, version = written.version, "Concurrent edits merged");
                        Ok(EventOutcome::Merged {
                            chunk: written,
                            resolution: Resolution::AutoMerged,
                            conflict_id: None,
                            written: true,
                        })
                    }
                    Settle::LastWriterWins { stored, similarity } => {
                        let record = self
                            .conflicts
                            .record_resolved(
                                stored,
                                vec![incoming.clone()],
                                base_version,
                                Resolution::LastWriterWins,
                                Some(similarity),
                                Winner::Candidate { index: 0 },
                                written.version,
                            )
                            .await?;
                        Ok(EventOutcome::Merged {
                            chunk: written,
                            resolution: Resolution::LastWriterWins,
                            conflict_id: Some(record.id),
                            written: true,
                        })
                    }
                }
            }
            Plan::Unchanged { stored } => Ok(EventOutcome::Duplicate { chunk: stored }),
            Plan::KeepStored { stored, similarity } => {
                let record = self
                    .conflicts
                    .record_resolved(
                        stored.clone(),
                        vec![incoming.clone()],
                        base_version,
                        Resolution::LastWriterWins,
                        Some(similarity),
                        Winner::Stored,
                        stored.version,
                    )
                    .await?;
                Ok(EventOutcome::Merged {
                    chunk: stored,
                    resolution: Resolution::LastWriterWins,
                    conflict_id: Some(record.id),
                    written: false,
                })
            }
            Plan::Manual {
                stored,
                reason,
                similarity,
            } => {
                let record = self
                    .conflicts
                    .open_manual(stored, vec![incoming.clone()], base_version, similarity, &reason)
                    .await?;
                Err(Error::ConflictUnresolved {
                    conflict_id: record.id,
                    chunk_id: record.chunk_id,
                })
            }
        }
    }

    async fn escalate(&self, chunk_id: &str, incoming: Chunk, base_version: u64) -> Result<EventOutcome> {
        let stored = self
            .repository
            .get_current(chunk_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("chunk {}", chunk_id)))?;
        let reason = format!(
            "concurrent writers exceeded {} resolution attempts",
            self.config.max_attempts
        );
        let plan = Plan::Manual {
            stored,
            reason,
            similarity: None,
        };
        self.execute(plan, &incoming, base_version).await
    }

    async fn fold_siblings(&self, events: &[SyncEvent]) -> Result<Option<Vec<Result<EventOutcome>>>> {
        let chunk_id = events[0].chunk_id();
        let base_version = events[0].base_version;
        let Some(stored) = self.repository.get_current(chunk_id).await? else {
            return Ok(None);
        };
        if stored.deleted || stored.version != base_version {
            return Ok(None);
        }

        let mut candidates = Vec::with_capacity(events.len());
        for event in events {
            candidates.push(self.prepare(event).await?);
        }
        let stored_hash = stored.content_hash();
        if candidates.iter().any(|c| c.content_hash() == stored_hash) {
            return Ok(None);
        }

        let merged = candidates[1..]
            .iter()
            .try_fold(candidates[0].clone(), |acc, next| {
                structural_merge(Some(&stored), &acc, next)
            });
        if let Some(merged) = merged {
            let written = match self.repository.put_if_version(merged, stored.version).await {
                Ok(chunk) => chunk,
                Err(Error::VersionConflict { .. }) => return Ok(None),
                Err(e) => return Err(e),
            };
            tracing::info!(
                chunk_id,
                siblings = events.len(),
                version = written.version,
                "Concurrent edits merged"
            );
            return Ok(Some(
                (0..events.len())
                    .map(|i| {
                        Ok(EventOutcome::Merged {
                            chunk: written.clone(),
                            resolution: Resolution::AutoMerged,
                            conflict_id: None,
                            written: i == 0,
                        })
                    })
                    .collect(),
            ));
        }

        let mut similarity = 1.0f32;
        for (i, a) in candidates.iter().enumerate() {
            for b in &candidates[i + 1..] {
                similarity = similarity.min(self.similarity(&a.content, &b.content).await?);
            }
        }

        if similarity >= self.config.auto_merge_threshold {
            let winner = (0..candidates.len())
                .max_by(|&a, &b| {
                    (candidates[a].updated_at, &candidates[a].origin)
                        .cmp(&(candidates[b].updated_at, &candidates[b].origin))
                })
                .unwrap_or(0);
            let written = match self
                .repository
                .put_if_version(candidates[winner].clone(), stored.version)
                .await
            {
                Ok(chunk) => chunk,
                Err(Error::VersionConflict { .. }) => return Ok(None),
                Err(e) => return Err(e),
            };
            let record = self
                .conflicts
                .record_resolved(
                    stored,
                    candidates,
                    base_version,
                    Resolution::LastWriterWins,
                    Some(similarity),
                    Winner::Candidate { index: winner },
                    written.version,
                )
                .await?;
            return Ok(Some(
                (0..events.len())
                    .map(|i| {
                        Ok(EventOutcome::Merged {
                            chunk: written.clone(),
                            resolution: Resolution::LastWriterWins,
                            conflict_id: Some(record.id.clone()),
                            written: i == winner,
                        })
                    })
                    .collect(),
            ));
        }

        let reason = format!(
            "{} concurrent edits with similarity {:.2} below threshold {:.2}",
            candidates.len(),
            similarity,
            self.config.auto_merge_threshold
        );
        let record = self
            .conflicts
            .open_manual(stored, candidates, base_version, Some(similarity), &reason)
            .await?;
        Ok(Some(
            (0..events.len())
                .map(|_| {
                    Err(Error::ConflictUnresolved {
                        conflict_id: record.id.clone(),
                        chunk_id: record.chunk_id.clone(),
                    })
                })
                .collect(),
        ))
    }
}

/// Updates of one chunk, all against the same base version
fn are_siblings(events: &[SyncEvent]) -> bool {
    let first = &events[0];
    events.iter().all(|e| {
        e.operation == Operation::Update
            && e.chunk_id() == first.chunk_id()
            && e.base_version == first.base_version
    })
}

/// Incoming beats stored on timestamp, then origin
fn is_later(incoming: &Chunk, stored: &Chunk) -> bool {
    (incoming.updated_at, &incoming.origin) > (stored.updated_at, &stored.origin)
}

// ============================================================================
// Structural merge
// ============================================================================

/// Merge two versions that descend from `base`. Without a base, fields
/// are merged two-way: content must be equal and unset metadata is treated
/// as unchanged. Returns `None` when any field was edited on both sides.
pub fn structural_merge(base: Option<&Chunk>, current: &Chunk, incoming: &Chunk) -> Option<Chunk> {
    let content = match base {
        Some(base) => merge_value(&base.content, &current.content, &incoming.content)?,
        None => (current.content == incoming.content).then(|| current.content.clone())?,
    };
    let scope = match base {
        Some(base) => merge_value(&base.scope, &current.scope, &incoming.scope)?,
        None => (current.scope == incoming.scope).then(|| current.scope.clone())?,
    };

    let unset = ChunkMetadata::default();
    let base_metadata = base.map_or(&unset, |b| &b.metadata);
    let metadata = merge_metadata(base_metadata, &current.metadata, &incoming.metadata)?;

    let embedding = if content != current.content {
        incoming.embedding.clone()
    } else {
        current.embedding.clone()
    };

    Some(Chunk {
        id: current.id.clone(),
        scope,
        content,
        embedding,
        metadata,
        version: current.version,
        updated_at: current.updated_at.max(incoming.updated_at),
        origin: incoming.origin.clone(),
        deleted: false,
    })
}

/// Field-by-field three-way merge of chunk metadata
pub fn merge_metadata(
    base: &ChunkMetadata,
    current: &ChunkMetadata,
    incoming: &ChunkMetadata,
) -> Option<ChunkMetadata> {
    Some(ChunkMetadata {
        tags: merge_set(&base.tags, &current.tags, &incoming.tags),
        session_id: merge_value(&base.session_id, &current.session_id, &incoming.session_id)?,
        files: merge_list(&base.files, &current.files, &incoming.files),
        outcome: merge_value(&base.outcome, &current.outcome, &incoming.outcome)?,
        extra: merge_map(&base.extra, &current.extra, &incoming.extra)?,
    })
}

fn merge_value<T: PartialEq + Clone>(base: &T, current: &T, incoming: &T) -> Option<T> {
    if current == incoming || incoming == base {
        Some(current.clone())
    } else if current == base {
        Some(incoming.clone())
    } else {
        None
    }
}

fn merge_set(
    base: &BTreeSet<String>,
    current: &BTreeSet<String>,
    incoming: &BTreeSet<String>,
) -> BTreeSet<String> {
    let removed: BTreeSet<&String> = base.difference(incoming).collect();
    current
        .iter()
        .chain(incoming.difference(base))
        .filter(|t| !removed.contains(t))
        .cloned()
        .collect()
}

fn merge_list(base: &[String], current: &[String], incoming: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = current
        .iter()
        .filter(|f| !base.contains(f) || incoming.contains(f))
        .cloned()
        .collect();
    for file in incoming {
        if !base.contains(file) && !merged.contains(file) {
            merged.push(file.clone());
        }
    }
    merged
}

fn merge_map(
    base: &BTreeMap<String, Value>,
    current: &BTreeMap<String, Value>,
    incoming: &BTreeMap<String, Value>,
) -> Option<BTreeMap<String, Value>> {
    let keys: BTreeSet<&String> = base.keys().chain(current.keys()).chain(incoming.keys()).collect();
    let mut merged = BTreeMap::new();
    for key in keys {
        if let Some(value) = merge_value(&base.get(key), &current.get(key), &incoming.get(key))? {
            merged.insert(key.clone(), value.clone());
        }
    }
    Some(merged)
}
