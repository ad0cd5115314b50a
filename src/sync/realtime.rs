//! Realtime sync manager
//!
//! One logical subscription per peer. Inbound events are applied through the
//! conflict resolver; confirmed changes are broadcast to every other known
//! peer and journaled per peer until acknowledged, so a peer that drops off
//! receives what it missed when it reconnects. Manual conflicts are only
//! reported to the peer that caused them.

use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::memory::Chunk;
use crate::sync::batch::{BatchSummary, BatchSyncManager};
use crate::sync::event::{EventOutcome, SyncEvent};
use crate::sync::resolver::ConflictResolver;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;

/// Messages delivered to a connected peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
    /// A chunk changed because of another peer. `sequence` is this peer's
    /// outbound sequence, to be acknowledged.
    ChunkChanged { sequence: u64, chunk: Chunk },
    /// Result of one of this peer's events
    Ack { sequence: u64, outcome: EventOutcome },
    /// One of this peer's events needs manual resolution
    Conflict {
        sequence: u64,
        conflict_id: String,
        chunk_id: String,
    },
}

/// Handed to a peer when it connects
#[derive(Debug)]
pub struct PeerSession {
    pub peer_id: String,
    /// Outcome of the events the peer produced while offline
    pub summary: BatchSummary,
    /// Changes after `last_acked` the peer has not acknowledged yet
    pub backlog: Vec<PeerMessage>,
    /// Part of the backlog was dropped; the peer must resync from scratch
    pub resync_required: bool,
    /// Live messages after the backlog
    pub receiver: mpsc::UnboundedReceiver<PeerMessage>,
    generation: u64,
}

#[derive(Default)]
struct PeerState {
    sender: Option<mpsc::UnboundedSender<PeerMessage>>,
    /// Bumped on every connect so a stale session cannot detach a newer one
    generation: u64,
    /// Highest inbound sequence applied
    last_inbound: u64,
    /// Last outbound sequence assigned
    last_outbound: u64,
    /// Highest outbound sequence evicted without acknowledgement
    dropped_through: u64,
    journal: VecDeque<(u64, Chunk)>,
    disconnected_at: Option<Instant>,
}

impl PeerState {
    fn prune(&mut self, acked: u64) {
        while self.journal.front().is_some_and(|(seq, _)| *seq <= acked) {
            self.journal.pop_front();
        }
    }
}

/// Peer states plus the newest version fanned out per chunk
#[derive(Default)]
struct Fanout {
    peers: HashMap<String, PeerState>,
    announced: HashMap<String, u64>,
}

impl Fanout {
    /// Journal and send `chunk` to every peer but `origin`. A version older
    /// than one already fanned out is skipped: the newer one supersedes it,
    /// and peers must never see a chunk go backwards.
    fn broadcast(&mut self, origin: &str, chunk: &Chunk, capacity: usize) {
        let newest = self.announced.entry(chunk.id.clone()).or_insert(0);
        if chunk.version <= *newest {
            tracing::debug!(
                chunk_id = %chunk.id,
                version = chunk.version,
                newest = *newest,
                "Superseded change not broadcast"
            );
            return;
        }
        *newest = chunk.version;

        for (peer_id, state) in self.peers.iter_mut() {
            if peer_id == origin {
                continue;
            }
            state.last_outbound += 1;
            let sequence = state.last_outbound;
            state.journal.push_back((sequence, chunk.clone()));
            while state.journal.len() > capacity {
                if let Some((dropped, _)) = state.journal.pop_front() {
                    state.dropped_through = dropped;
                    tracing::warn!(peer_id = %peer_id, sequence = dropped, "Peer backlog full, dropping change");
                }
            }

            let delivered = state.sender.as_ref().map(|sender| {
                sender
                    .send(PeerMessage::ChunkChanged {
                        sequence,
                        chunk: chunk.clone(),
                    })
                    .is_ok()
            });
            if delivered == Some(false) {
                tracing::debug!(peer_id = %peer_id, "Peer channel closed, marking disconnected");
                state.sender = None;
                state.disconnected_at = Some(Instant::now());
            }
        }
    }

    /// Forget peers disconnected for longer than `ttl`
    fn evict_idle(&mut self, ttl: Option<Duration>) -> usize {
        let Some(ttl) = ttl else {
            return 0;
        };
        let before = self.peers.len();
        self.peers.retain(|peer_id, state| {
            let idle = state.sender.is_none()
                && state.disconnected_at.is_some_and(|at| at.elapsed() >= ttl);
            if idle {
                tracing::info!(
                    peer_id = %peer_id,
                    pending = state.journal.len(),
                    "Evicting idle peer"
                );
            }
            !idle
        });
        before - self.peers.len()
    }
}

/// Live fan-out of changes between connected peers
pub struct RealtimeSyncManager {
    resolver: Arc<ConflictResolver>,
    batch: BatchSyncManager,
    fanout: RwLock<Fanout>,
    backlog_capacity: usize,
    idle_ttl: Option<Duration>,
}

impl RealtimeSyncManager {
    pub fn new(resolver: Arc<ConflictResolver>, config: &SyncConfig) -> Self {
        Self {
            batch: BatchSyncManager::new(resolver.clone(), config),
            resolver,
            fanout: RwLock::new(Fanout::default()),
            backlog_capacity: config.peer_backlog_capacity.max(1),
            idle_ttl: config.peer_idle_ttl(),
        }
    }

    pub fn batch(&self) -> &BatchSyncManager {
        &self.batch
    }

    /// Attach a peer. Events it produced while offline are applied as a
    /// batch; changes it missed after `last_acked` are returned as the
    /// backlog. A second connect for the same peer replaces the first.
    /// A peer that acknowledged changes before but is no longer known
    /// (evicted after going idle) is told to resync.
    pub async fn connect(
        &self,
        peer_id: &str,
        last_acked: u64,
        offline_events: Vec<SyncEvent>,
    ) -> Result<PeerSession> {
        if peer_id.trim().is_empty() {
            return Err(Error::Validation("peer id is required".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();

        let (backlog, resync_required, last_inbound, generation) = {
            let mut fanout = self.fanout.write().await;
            fanout.evict_idle(self.idle_ttl);
            let known = fanout.peers.contains_key(peer_id);
            let state = fanout.peers.entry(peer_id.to_string()).or_default();
            if !known && last_acked > 0 {
                state.last_outbound = last_acked;
                state.dropped_through = last_acked + 1;
            }
            state.prune(last_acked);
            let resync_required = last_acked < state.dropped_through;
            let backlog = state
                .journal
                .iter()
                .map(|(sequence, chunk)| PeerMessage::ChunkChanged {
                    sequence: *sequence,
                    chunk: chunk.clone(),
                })
                .collect::<Vec<_>>();
            state.sender = Some(tx);
            state.disconnected_at = None;
            state.generation += 1;
            (backlog, resync_required, state.last_inbound, state.generation)
        };

        let fresh: Vec<SyncEvent> = offline_events
            .into_iter()
            .filter(|e| e.sequence > last_inbound)
            .map(|mut e| {
                e.peer_id = peer_id.to_string();
                e
            })
            .collect();
        let summary = self.batch.apply(fresh).await;

        {
            let mut fanout = self.fanout.write().await;
            let last = summary.last_sequences().get(peer_id).copied().unwrap_or(0);
            if let Some(state) = fanout.peers.get_mut(peer_id) {
                state.last_inbound = state.last_inbound.max(last);
            }
            for (_, chunk) in summary.changed() {
                fanout.broadcast(peer_id, chunk, self.backlog_capacity);
            }
        }

        tracing::info!(
            peer_id,
            last_acked,
            backlog = backlog.len(),
            offline_events = summary.total,
            resync_required,
            "Peer connected"
        );
        Ok(PeerSession {
            peer_id: peer_id.to_string(),
            summary,
            backlog,
            resync_required,
            receiver: rx,
            generation,
        })
    }

    /// End a session. The peer's journal keeps accumulating until it
    /// reconnects or stays away longer than the idle TTL. Ending a session
    /// that was superseded by a newer connect leaves the newer one attached.
    pub async fn disconnect(&self, session: PeerSession) {
        let PeerSession {
            peer_id,
            generation,
            receiver,
            ..
        } = session;
        drop(receiver);
        let mut fanout = self.fanout.write().await;
        if let Some(state) = fanout.peers.get_mut(&peer_id) {
            if state.generation == generation {
                state.sender = None;
                state.disconnected_at = Some(Instant::now());
                tracing::info!(peer_id = %peer_id, pending = state.journal.len(), "Peer disconnected");
            }
        }
        fanout.evict_idle(self.idle_ttl);
    }

    /// Forget peers that have been disconnected longer than the idle TTL.
    /// Returns how many were evicted.
    pub async fn evict_idle(&self) -> usize {
        self.fanout.write().await.evict_idle(self.idle_ttl)
    }

    /// Drop journaled changes up to and including `sequence`
    pub async fn ack(&self, peer_id: &str, sequence: u64) {
        if let Some(state) = self.fanout.write().await.peers.get_mut(peer_id) {
            state.prune(sequence);
        }
    }

    /// Apply one live event from a connected peer. The outcome is also sent
    /// to the peer as an `Ack` or `Conflict` message.
    pub async fn handle_event(&self, peer_id: &str, mut event: SyncEvent) -> Result<EventOutcome> {
        event.peer_id = peer_id.to_string();
        let last_inbound = match self.fanout.read().await.peers.get(peer_id) {
            Some(state) if state.sender.is_some() => state.last_inbound,
            _ => return Err(Error::Validation(format!("peer {} is not connected", peer_id))),
        };

        let sequence = event.sequence;
        let outcome = if sequence <= last_inbound {
            tracing::debug!(peer_id, sequence, last_inbound, "Replayed event ignored");
            self.replayed(&event).await?
        } else {
            self.resolver
                .apply(&event)
                .await
                .unwrap_or_else(EventOutcome::from_error)
        };

        let mut fanout = self.fanout.write().await;
        let advance = !matches!(outcome, EventOutcome::Rejected { retryable: true, .. });
        if let Some(state) = fanout.peers.get_mut(peer_id) {
            if advance {
                state.last_inbound = state.last_inbound.max(sequence);
            }
            let reply = match &outcome {
                EventOutcome::Conflict { conflict_id } => PeerMessage::Conflict {
                    sequence,
                    conflict_id: conflict_id.clone(),
                    chunk_id: event.chunk.id.clone(),
                },
                other => PeerMessage::Ack {
                    sequence,
                    outcome: other.clone(),
                },
            };
            if let Some(sender) = &state.sender {
                let _ = sender.send(reply);
            }
        }
        if let Some(chunk) = outcome.changed_chunk() {
            fanout.broadcast(peer_id, chunk, self.backlog_capacity);
        }
        Ok(outcome)
    }

    /// Apply an event from a local writer and fan out the result. Manual
    /// conflicts are returned as `ConflictUnresolved`.
    pub async fn publish(&self, event: &SyncEvent) -> Result<EventOutcome> {
        let outcome = self.resolver.apply(event).await?;
        if let Some(chunk) = outcome.changed_chunk() {
            self.announce(&event.peer_id, chunk).await;
        }
        Ok(outcome)
    }

    /// Broadcast a change made outside the event path
    pub async fn announce(&self, origin: &str, chunk: &Chunk) {
        self.fanout
            .write()
            .await
            .broadcast(origin, chunk, self.backlog_capacity);
    }

    /// Peers with a live subscription
    pub async fn connected_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self
            .fanout
            .read()
            .await
            .peers
            .iter()
            .filter(|(_, s)| s.sender.is_some())
            .map(|(id, _)| id.clone())
            .collect();
        peers.sort();
        peers
    }

    /// Peers with state retained, connected or not
    pub async fn known_peers(&self) -> usize {
        self.fanout.read().await.peers.len()
    }

    /// Unacknowledged changes journaled for a peer
    pub async fn pending_for(&self, peer_id: &str) -> usize {
        self.fanout
            .read()
            .await
            .peers
            .get(peer_id)
            .map_or(0, |s| s.journal.len())
    }

    async fn replayed(&self, event: &SyncEvent) -> Result<EventOutcome> {
        Ok(
            match self.resolver.repository().get_current(event.chunk_id()).await? {
                Some(chunk) => EventOutcome::Duplicate { chunk },
                None => EventOutcome::Rejected {
                    reason: format!("sequence {} already processed", event.sequence),
                    retryable: false,
                },
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RepositoryConfig, ResolverConfig};
    use crate::embedding::HashingEmbedder;
    use crate::memory::{ChunkBuilder, ChunkRepository};
    use crate::store::MemoryStore;
    use crate::sync::conflict::ConflictStore;
    use crate::sync::event::Operation;

    fn manager(capacity: usize) -> RealtimeSyncManager {
        let repository = Arc::new(ChunkRepository::new(
            Arc::new(MemoryStore::new()),
            RepositoryConfig {
                embedding_dim: 32,
                history_depth: 4,
                max_top_k: 10,
            },
        ));
        let resolver = Arc::new(ConflictResolver::new(
            repository,
            Arc::new(ConflictStore::in_memory()),
            Arc::new(HashingEmbedder::new(32)),
            ResolverConfig::default(),
        ));
        RealtimeSyncManager::new(
            resolver,
            &SyncConfig {
                batch_workers: 2,
                peer_backlog_capacity: capacity,
                peer_idle_ttl_secs: 60,
            },
        )
    }

    fn create(peer: &str, seq: u64, id: &str, content: &str) -> SyncEvent {
        let chunk = ChunkBuilder::new("repo", content).id(id).build().unwrap();
        SyncEvent::new(peer, seq, Operation::Create, chunk, 0)
    }

    fn update(peer: &str, seq: u64, id: &str, content: &str, base: u64) -> SyncEvent {
        let chunk = ChunkBuilder::new("repo", content).id(id).build().unwrap();
        SyncEvent::new(peer, seq, Operation::Update, chunk, base)
    }

    #[tokio::test]
    async fn test_change_fans_out_to_other_peers() {
        let manager = manager(16);
        let mut a = manager.connect("a", 0, Vec::new()).await.unwrap();
        let mut b = manager.connect("b", 0, Vec::new()).await.unwrap();

        let outcome = manager
            .handle_event("a", create("a", 1, "c1", "build uses cargo workspaces"))
            .await
            .unwrap();
        assert!(matches!(outcome, EventOutcome::Applied { .. }));

        match a.receiver.try_recv().unwrap() {
            PeerMessage::Ack { sequence, .. } => assert_eq!(sequence, 1),
            other => panic!("unexpected message {:?}", other),
        }
        assert!(a.receiver.try_recv().is_err());

        match b.receiver.try_recv().unwrap() {
            PeerMessage::ChunkChanged { sequence, chunk } => {
                assert_eq!(sequence, 1);
                assert_eq!(chunk.id, "c1");
                assert_eq!(chunk.version, 1);
            }
            other => panic!("unexpected message {:?}", other),
        }
        assert_eq!(manager.pending_for("b").await, 1);
        manager.ack("b", 1).await;
        assert_eq!(manager.pending_for("b").await, 0);
    }

    #[tokio::test]
    async fn test_disconnected_peer_receives_backlog_on_reconnect() {
        let manager = manager(16);
        let _a = manager.connect("a", 0, Vec::new()).await.unwrap();
        let b = manager.connect("b", 0, Vec::new()).await.unwrap();
        manager.disconnect(b).await;

        manager.handle_event("a", create("a", 1, "c1", "one")).await.unwrap();
        manager.handle_event("a", create("a", 2, "c2", "two")).await.unwrap();
        manager.handle_event("a", create("a", 3, "c3", "three")).await.unwrap();

        let b = manager.connect("b", 1, Vec::new()).await.unwrap();
        assert!(!b.resync_required);
        let sequences: Vec<u64> = b
            .backlog
            .iter()
            .map(|m| match m {
                PeerMessage::ChunkChanged { sequence, .. } => *sequence,
                other => panic!("unexpected message {:?}", other),
            })
            .collect();
        assert_eq!(sequences, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_backlog_overflow_requires_resync() {
        let manager = manager(2);
        let _a = manager.connect("a", 0, Vec::new()).await.unwrap();
        let b = manager.connect("b", 0, Vec::new()).await.unwrap();
        manager.disconnect(b).await;

        for seq in 1..=4 {
            manager
                .handle_event("a", create("a", seq, &format!("c{}", seq), "note"))
                .await
                .unwrap();
        }

        let b = manager.connect("b", 0, Vec::new()).await.unwrap();
        assert!(b.resync_required);
        assert_eq!(b.backlog.len(), 2);
    }

    #[tokio::test]
    async fn test_offline_events_apply_as_batch_and_fan_out() {
        let manager = manager(16);
        let mut a = manager.connect("a", 0, Vec::new()).await.unwrap();

        let b = manager
            .connect(
                "b",
                0,
                vec![
                    create("b", 1, "c1", "offline draft"),
                    update("b", 2, "c1", "offline final", 1),
                ],
            )
            .await
            .unwrap();
        assert_eq!(b.summary.applied, 2);

        let mut versions = Vec::new();
        while let Ok(PeerMessage::ChunkChanged { chunk, .. }) = a.receiver.try_recv() {
            versions.push(chunk.version);
        }
        assert_eq!(versions, vec![1, 2]);

        // Replaying the same offline events is a no-op
        let again = manager
            .connect("b", 0, vec![create("b", 1, "c1", "offline draft")])
            .await
            .unwrap();
        assert_eq!(again.summary.total, 0);
    }

    #[tokio::test]
    async fn test_replayed_sequence_is_not_reapplied() {
        let manager = manager(16);
        let _a = manager.connect("a", 0, Vec::new()).await.unwrap();
        manager.handle_event("a", create("a", 1, "c1", "first")).await.unwrap();

        let outcome = manager
            .handle_event("a", update("a", 1, "c1", "sneaky rewrite", 1))
            .await
            .unwrap();
        assert!(matches!(outcome, EventOutcome::Duplicate { chunk } if chunk.content == "first"));
    }

    #[tokio::test]
    async fn test_manual_conflict_only_notifies_origin() {
        let manager = manager(16);
        let mut a = manager.connect("a", 0, Vec::new()).await.unwrap();
        let mut b = manager.connect("b", 0, Vec::new()).await.unwrap();

        manager
            .handle_event("a", create("a", 1, "c1", "deploy with blue green rollout"))
            .await
            .unwrap();
        manager
            .handle_event("a", update("a", 2, "c1", "deploy with canary rollout", 1))
            .await
            .unwrap();
        while a.receiver.try_recv().is_ok() {}
        while b.receiver.try_recv().is_ok() {}

        // b still thinks version 1 is current and rewrites it entirely
        let outcome = manager
            .handle_event("b", update("b", 1, "c1", "database migrations need review", 1))
            .await
            .unwrap();
        let EventOutcome::Conflict { conflict_id } = outcome else {
            panic!("expected a conflict, got {:?}", outcome);
        };

        match b.receiver.try_recv().unwrap() {
            PeerMessage::Conflict {
                conflict_id: id,
                chunk_id,
                ..
            } => {
                assert_eq!(id, conflict_id);
                assert_eq!(chunk_id, "c1");
            }
            other => panic!("unexpected message {:?}", other),
        }
        assert!(a.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stale_session_does_not_detach_newer_one() {
        let manager = manager(16);
        let old = manager.connect("a", 0, Vec::new()).await.unwrap();
        let _new = manager.connect("a", 0, Vec::new()).await.unwrap();
        manager.disconnect(old).await;
        assert_eq!(manager.connected_peers().await, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_superseded_version_is_not_broadcast() {
        let manager = manager(16);
        let _a = manager.connect("a", 0, Vec::new()).await.unwrap();
        let _b = manager.connect("b", 0, Vec::new()).await.unwrap();
        let mut c = manager.connect("c", 0, Vec::new()).await.unwrap();
        manager.handle_event("a", create("a", 1, "c1", "first")).await.unwrap();
        while c.receiver.try_recv().is_ok() {}

        // a's write lands first, but b's newer write is fanned out before it
        let late = manager
            .resolver
            .apply(&update("a", 2, "c1", "second", 1))
            .await
            .unwrap();
        let late = late.changed_chunk().unwrap().clone();
        assert_eq!(late.version, 2);
        let newer = manager
            .handle_event("b", update("b", 1, "c1", "third", 2))
            .await
            .unwrap();
        assert!(matches!(newer, EventOutcome::Applied { chunk } if chunk.version == 3));
        manager.announce("a", &late).await;

        let mut versions = Vec::new();
        while let Ok(PeerMessage::ChunkChanged { chunk, .. }) = c.receiver.try_recv() {
            versions.push(chunk.version);
        }
        assert_eq!(versions, vec![3]);
        assert_eq!(manager.pending_for("c").await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_peers_are_evicted_and_resync() {
        let manager = manager(16);
        let _a = manager.connect("a", 0, Vec::new()).await.unwrap();
        let b = manager.connect("b", 0, Vec::new()).await.unwrap();
        manager.handle_event("a", create("a", 1, "c1", "one")).await.unwrap();
        manager.ack("b", 1).await;
        manager.disconnect(b).await;
        manager.handle_event("a", create("a", 2, "c2", "two")).await.unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(manager.evict_idle().await, 0);
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(manager.evict_idle().await, 1);
        assert_eq!(manager.known_peers().await, 1);
        assert_eq!(manager.pending_for("b").await, 0);

        // b missed c2 and its journal is gone
        let mut b = manager.connect("b", 1, Vec::new()).await.unwrap();
        assert!(b.resync_required);
        assert!(b.backlog.is_empty());

        manager.handle_event("a", create("a", 3, "c3", "three")).await.unwrap();
        match b.receiver.try_recv().unwrap() {
            PeerMessage::ChunkChanged { sequence, chunk } => {
                assert_eq!(sequence, 2);
                assert_eq!(chunk.id, "c3");
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connected_peers_are_never_evicted() {
        let manager = manager(16);
        let _a = manager.connect("a", 0, Vec::new()).await.unwrap();
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(manager.evict_idle().await, 0);
        assert_eq!(manager.connected_peers().await, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_events_from_unknown_peer_are_rejected() {
        let manager = manager(16);
        let err = manager
            .handle_event("ghost", create("ghost", 1, "c1", "boo"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
