//! Batch sync manager
//!
//! Drains a list of sync events, typically everything a peer produced while
//! offline. Events are grouped by chunk; within a group each peer's events
//! keep their sequence order, and groups are spread over a fixed set of
//! workers. A failing event never stops the rest of the batch.

use crate::config::SyncConfig;
use crate::memory::Chunk;
use crate::sync::event::{EventOutcome, Operation, SyncEvent};
use crate::sync::resolver::ConflictResolver;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;

/// Outcome of one event in a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventReport {
    pub peer_id: String,
    pub sequence: u64,
    pub chunk_id: String,
    pub outcome: EventOutcome,
}

/// Per-batch tallies and reports, in input order of chunk groups
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub applied: usize,
    pub duplicates: usize,
    pub merged: usize,
    pub conflicts: usize,
    pub rejected: usize,
    pub reports: Vec<EventReport>,
}

impl BatchSummary {
    fn record(&mut self, report: EventReport) {
        self.total += 1;
        match report.outcome {
            EventOutcome::Applied { .. } => self.applied += 1,
            EventOutcome::Duplicate { .. } => self.duplicates += 1,
            EventOutcome::Merged { .. } => self.merged += 1,
            EventOutcome::Conflict { .. } => self.conflicts += 1,
            EventOutcome::Rejected { .. } => self.rejected += 1,
        }
        self.reports.push(report);
    }

    /// Chunks this batch made current, with the peer that caused each
    pub fn changed(&self) -> impl Iterator<Item = (&str, &Chunk)> {
        self.reports.iter().filter_map(|r| {
            r.outcome
                .changed_chunk()
                .map(|chunk| (r.peer_id.as_str(), chunk))
        })
    }

    /// Highest sequence seen per peer
    pub fn last_sequences(&self) -> HashMap<&str, u64> {
        let mut last = HashMap::new();
        for report in &self.reports {
            let seq = last.entry(report.peer_id.as_str()).or_insert(0);
            *seq = (*seq).max(report.sequence);
        }
        last
    }
}

/// Applies batches of events with bounded concurrency
#[derive(Clone)]
pub struct BatchSyncManager {
    resolver: Arc<ConflictResolver>,
    workers: usize,
}

impl BatchSyncManager {
    pub fn new(resolver: Arc<ConflictResolver>, config: &SyncConfig) -> Self {
        Self {
            resolver,
            workers: config.batch_workers.max(1),
        }
    }

    pub fn resolver(&self) -> &Arc<ConflictResolver> {
        &self.resolver
    }

    /// Apply every event and report what happened to each
    pub async fn apply(&self, events: Vec<SyncEvent>) -> BatchSummary {
        if events.is_empty() {
            return BatchSummary::default();
        }
        let total = events.len();
        let groups = group_by_chunk(events);
        let group_count = groups.len();
        let queue: Arc<Mutex<VecDeque<(usize, Vec<SyncEvent>)>>> =
            Arc::new(Mutex::new(groups.into_iter().enumerate().collect()));

        let mut workers = JoinSet::new();
        for _ in 0..self.workers.min(group_count) {
            let queue = queue.clone();
            let resolver = self.resolver.clone();
            workers.spawn(async move {
                let mut done = Vec::new();
                while let Some((index, group)) = next_group(&queue) {
                    done.push((index, apply_group(&resolver, group).await));
                }
                done
            });
        }

        let mut finished: Vec<(usize, Vec<EventReport>)> = Vec::with_capacity(group_count);
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(done) => finished.extend(done),
                Err(e) => tracing::error!("Batch worker failed: {}", e),
            }
        }
        finished.sort_by_key(|(index, _)| *index);

        let mut summary = BatchSummary::default();
        for report in finished.into_iter().flat_map(|(_, reports)| reports) {
            summary.record(report);
        }
        if summary.total != total {
            tracing::error!(
                expected = total,
                reported = summary.total,
                "Batch lost events to a failed worker"
            );
        }
        tracing::info!(
            total = summary.total,
            applied = summary.applied,
            duplicates = summary.duplicates,
            merged = summary.merged,
            conflicts = summary.conflicts,
            rejected = summary.rejected,
            "Batch applied"
        );
        summary
    }
}

fn next_group(
    queue: &Mutex<VecDeque<(usize, Vec<SyncEvent>)>>,
) -> Option<(usize, Vec<SyncEvent>)> {
    queue
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .pop_front()
}

/// Split events by chunk id, keeping first-seen order of chunks. Inside a
/// group, each peer's events are put in sequence order in the slots that
/// peer occupied, so interleaving between peers is preserved.
fn group_by_chunk(events: Vec<SyncEvent>) -> Vec<Vec<SyncEvent>> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<SyncEvent>> = HashMap::new();
    for event in events {
        let id = event.chunk_id().to_string();
        if !groups.contains_key(&id) {
            order.push(id.clone());
        }
        groups.entry(id).or_default().push(event);
    }

    order
        .into_iter()
        .filter_map(|id| groups.remove(&id))
        .map(order_within_peers)
        .collect()
}

fn order_within_peers(group: Vec<SyncEvent>) -> Vec<SyncEvent> {
    let mut per_peer: HashMap<String, Vec<SyncEvent>> = HashMap::new();
    let slots: Vec<String> = group.iter().map(|e| e.peer_id.clone()).collect();
    for event in group {
        per_peer.entry(event.peer_id.clone()).or_default().push(event);
    }
    for events in per_peer.values_mut() {
        // Reversed so pop() yields the lowest sequence
        events.sort_by(|a, b| b.sequence.cmp(&a.sequence));
    }
    slots
        .into_iter()
        .filter_map(|peer| per_peer.get_mut(&peer).and_then(Vec::pop))
        .collect()
}

/// Version a peer believes its last event produced, the version it actually
/// produced here, and the chunk as that peer saw it
struct Rebase {
    claimed: u64,
    actual: u64,
    seen: Chunk,
}

async fn apply_group(resolver: &ConflictResolver, group: Vec<SyncEvent>) -> Vec<EventReport> {
    let mut reports = Vec::with_capacity(group.len());
    let mut rebases: HashMap<String, Rebase> = HashMap::new();
    let mut pending: VecDeque<SyncEvent> = group.into();

    while let Some(mut event) = pending.pop_front() {
        let original_base = event.base_version;
        let mut local_base = None;
        if let Some(rebase) = rebases.get(&event.peer_id) {
            if event.base_version == rebase.claimed {
                event.base_version = rebase.actual;
                local_base = Some(rebase.seen.clone());
            }
        }

        // Updates from different peers against the same base, none of them
        // having written here yet, are reconciled together
        let mut run = vec![(event, original_base)];
        if run[0].0.operation == Operation::Update && !rebases.contains_key(&run[0].0.peer_id) {
            let mut peers: HashSet<String> = HashSet::from([run[0].0.peer_id.clone()]);
            while let Some(next) = pending.front() {
                let sibling = next.operation == Operation::Update
                    && next.base_version == run[0].0.base_version
                    && !rebases.contains_key(&next.peer_id)
                    && !peers.contains(&next.peer_id);
                if !sibling {
                    break;
                }
                peers.insert(next.peer_id.clone());
                if let Some(next) = pending.pop_front() {
                    let base = next.base_version;
                    run.push((next, base));
                }
            }
        }

        let outcomes = if run.len() > 1 {
            let events: Vec<SyncEvent> = run.iter().map(|(e, _)| e.clone()).collect();
            resolver.apply_concurrent(&events).await
        } else {
            vec![resolver.apply_after(&run[0].0, local_base.as_ref()).await]
        };

        for ((event, original_base), result) in run.into_iter().zip(outcomes) {
            let outcome = result.unwrap_or_else(EventOutcome::from_error);
            if let EventOutcome::Rejected { reason, retryable } = &outcome {
                tracing::warn!(
                    peer_id = %event.peer_id,
                    sequence = event.sequence,
                    chunk_id = %event.chunk_id(),
                    retryable,
                    "Event rejected: {}",
                    reason
                );
            }
            if let Some(version) = resulting_version(&outcome) {
                let mut seen = event.chunk.clone();
                seen.deleted = event.operation == Operation::Delete;
                rebases.insert(
                    event.peer_id.clone(),
                    Rebase {
                        claimed: original_base + 1,
                        actual: version,
                        seen,
                    },
                );
            }
            reports.push(EventReport {
                chunk_id: event.chunk.id,
                peer_id: event.peer_id,
                sequence: event.sequence,
                outcome,
            });
        }
    }
    reports
}

fn resulting_version(outcome: &EventOutcome) -> Option<u64> {
    match outcome {
        EventOutcome::Applied { chunk }
        | EventOutcome::Duplicate { chunk }
        | EventOutcome::Merged { chunk, .. } => Some(chunk.version),
        EventOutcome::Conflict { .. } | EventOutcome::Rejected { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RepositoryConfig, ResolverConfig};
    use crate::embedding::HashingEmbedder;
    use crate::memory::{ChunkBuilder, ChunkRepository};
    use crate::store::testing::{Fault, FaultyStore};
    use crate::store::MemoryStore;
    use crate::store::StoragePort;
    use crate::sync::conflict::ConflictStore;

    fn resolver(store: Arc<dyn StoragePort>) -> Arc<ConflictResolver> {
        let repository = Arc::new(ChunkRepository::new(
            store,
            RepositoryConfig {
                embedding_dim: 16,
                history_depth: 8,
                max_top_k: 10,
            },
        ));
        Arc::new(ConflictResolver::new(
            repository,
            Arc::new(ConflictStore::in_memory()),
            Arc::new(HashingEmbedder::new(16)),
            ResolverConfig::default(),
        ))
    }

    fn manager(store: Arc<dyn StoragePort>) -> BatchSyncManager {
        BatchSyncManager::new(
            resolver(store),
            &SyncConfig {
                batch_workers: 2,
                ..SyncConfig::default()
            },
        )
    }

    fn event(peer: &str, seq: u64, op: Operation, id: &str, content: &str, tags: &[&str], base: u64) -> SyncEvent {
        let mut builder = ChunkBuilder::new("repo", content).id(id).origin(peer);
        for tag in tags {
            builder = builder.tag(*tag);
        }
        SyncEvent::new(peer, seq, op, builder.build().unwrap(), base)
    }

    #[test]
    fn test_grouping_orders_each_peer_by_sequence() {
        let groups = group_by_chunk(vec![
            event("a", 2, Operation::Update, "c1", "x", &[], 1),
            event("b", 1, Operation::Update, "c2", "x", &[], 1),
            event("a", 1, Operation::Create, "c1", "x", &[], 0),
            event("b", 5, Operation::Update, "c1", "x", &[], 1),
        ]);

        assert_eq!(groups.len(), 2);
        let first: Vec<(&str, u64)> = groups[0]
            .iter()
            .map(|e| (e.peer_id.as_str(), e.sequence))
            .collect();
        assert_eq!(first, vec![("a", 1), ("a", 2), ("b", 5)]);
        assert_eq!(groups[1][0].chunk_id(), "c2");
    }

    #[tokio::test]
    async fn test_offline_peer_replays_its_own_history() {
        let manager = manager(Arc::new(MemoryStore::new()));

        let summary = manager
            .apply(vec![
                event("laptop", 1, Operation::Create, "c1", "draft notes", &[], 0),
                event("laptop", 2, Operation::Update, "c1", "final notes", &[], 1),
                event("laptop", 3, Operation::Create, "c2", "other notes", &[], 0),
                event("laptop", 4, Operation::Delete, "c2", "other notes", &[], 1),
            ])
            .await;

        assert_eq!(summary.total, 4);
        assert_eq!(summary.applied, 4);
        let repo = manager.resolver().repository();
        assert_eq!(repo.get("c1").await.unwrap().content, "final notes");
        assert!(repo.get("c2").await.is_err());
        assert_eq!(summary.last_sequences()["laptop"], 4);
    }

    #[tokio::test]
    async fn test_stale_local_versions_are_rebased() {
        let manager = manager(Arc::new(MemoryStore::new()));
        let repo = manager.resolver().repository().clone();
        manager
            .apply(vec![event("server", 1, Operation::Create, "c1", "shared", &["a"], 0)])
            .await;
        // Someone else moves c1 to version 2 while the laptop is offline
        manager
            .apply(vec![event("desk", 1, Operation::Update, "c1", "shared", &["a", "desk"], 1)])
            .await;

        // The laptop numbered its local edits 2 and 3 from base 1
        let summary = manager
            .apply(vec![
                event("laptop", 1, Operation::Update, "c1", "shared", &["a", "laptop"], 1),
                event("laptop", 2, Operation::Update, "c1", "shared", &["a", "laptop", "more"], 2),
            ])
            .await;

        assert_eq!(summary.conflicts, 0, "{:?}", summary.reports);
        let current = repo.get("c1").await.unwrap();
        assert_eq!(current.version, 4);
        assert!(current.metadata.tags.contains("desk"));
        assert!(current.metadata.tags.contains("more"));
    }

    #[tokio::test]
    async fn test_sibling_updates_fold_into_one_version() {
        let manager = manager(Arc::new(MemoryStore::new()));
        manager
            .apply(vec![event("server", 1, Operation::Create, "c1", "shared", &[], 0)])
            .await;

        let summary = manager
            .apply(vec![
                event("a", 7, Operation::Update, "c1", "shared", &["x"], 1),
                event("b", 3, Operation::Update, "c1", "shared", &["y"], 1),
            ])
            .await;

        assert_eq!(summary.merged, 2);
        assert_eq!(summary.changed().count(), 1);
        let current = manager.resolver().repository().get("c1").await.unwrap();
        assert_eq!(current.version, 2);
        assert_eq!(current.metadata.tags.len(), 2);
    }

    #[tokio::test]
    async fn test_failures_do_not_abort_other_chunks() {
        let store = FaultyStore::new();
        let manager = manager(Arc::new(store.clone()));
        store.fail_next(1, Fault::Validation);

        let summary = manager
            .apply(vec![
                event("a", 1, Operation::Create, "c1", "first", &[], 0),
                event("a", 2, Operation::Create, "c2", "second", &[], 0),
                event("a", 3, Operation::Update, "missing", "third", &[], 4),
                event("a", 4, Operation::Create, "", "no id", &[], 0),
            ])
            .await;

        assert_eq!(summary.total, 4);
        assert_eq!(summary.rejected, 2);
        // Update of an unknown chunk creates it
        assert_eq!(summary.applied, 2);
        assert!(summary
            .reports
            .iter()
            .any(|r| matches!(r.outcome, EventOutcome::Rejected { retryable: false, .. })));
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let manager = manager(Arc::new(MemoryStore::new()));
        assert_eq!(manager.apply(Vec::new()).await, BatchSummary::default());
    }
}
