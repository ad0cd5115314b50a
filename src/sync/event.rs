//! Sync event envelope and per-event outcomes

use crate::error::Error;
use crate::memory::Chunk;
use crate::sync::conflict::Resolution;
use serde::{Deserialize, Serialize};

/// Mutation intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

/// A chunk mutation produced by a peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    /// Originating peer
    pub peer_id: String,
    /// Per-peer, strictly increasing sequence number
    pub sequence: u64,
    pub operation: Operation,
    /// Chunk payload; for deletes only the id is significant
    pub chunk: Chunk,
    /// Version the peer last saw for this chunk (0 for creates)
    #[serde(default)]
    pub base_version: u64,
}

impl SyncEvent {
    pub fn new(
        peer_id: impl Into<String>,
        sequence: u64,
        operation: Operation,
        chunk: Chunk,
        base_version: u64,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            sequence,
            operation,
            chunk,
            base_version,
        }
    }

    pub fn chunk_id(&self) -> &str {
        &self.chunk.id
    }
}

/// What happened to one event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EventOutcome {
    /// Written as-is
    Applied { chunk: Chunk },
    /// Identical to the stored chunk; nothing written
    Duplicate { chunk: Chunk },
    /// Reconciled with a concurrent edit
    Merged {
        chunk: Chunk,
        resolution: Resolution,
        /// Audit record, when the losing side was retained
        conflict_id: Option<String>,
        /// Whether this event produced a new stored version
        written: bool,
    },
    /// Needs manual resolution; stored chunk untouched
    Conflict { conflict_id: String },
    /// Not applied
    Rejected { reason: String, retryable: bool },
}

impl EventOutcome {
    /// Chunk now current because of this event, if it changed the store
    pub fn changed_chunk(&self) -> Option<&Chunk> {
        match self {
            EventOutcome::Applied { chunk } => Some(chunk),
            EventOutcome::Merged {
                chunk,
                written: true,
                ..
            } => Some(chunk),
            _ => None,
        }
    }

    /// Outcome for a failed application. Unresolved conflicts are not
    /// failures of the event; everything else is a rejection, retryable when
    /// the store was unavailable.
    pub fn from_error(error: Error) -> Self {
        match error {
            Error::ConflictUnresolved { conflict_id, .. } => EventOutcome::Conflict { conflict_id },
            other => EventOutcome::Rejected {
                retryable: other.is_retry_later(),
                reason: other.to_string(),
            },
        }
    }

    /// Short label for logs and summaries
    pub fn label(&self) -> &'static str {
        match self {
            EventOutcome::Applied { .. } => "applied",
            EventOutcome::Duplicate { .. } => "duplicate",
            EventOutcome::Merged { .. } => "merged",
            EventOutcome::Conflict { .. } => "conflict",
            EventOutcome::Rejected { .. } => "rejected",
        }
    }
}
