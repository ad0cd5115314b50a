//! Synchronization engine
//!
//! ```text
//! peer event ──► RealtimeSyncManager ──┐
//!                                       ├──► ConflictResolver ──► ChunkRepository
//! offline diff ─► BatchSyncManager ─────┘            │
//!                                                    └──► ConflictStore
//! ```

pub mod batch;
pub mod conflict;
pub mod event;
pub mod realtime;
pub mod resolver;

pub use batch::{BatchSummary, BatchSyncManager, EventReport};
pub use conflict::{
    ConflictCounts, ConflictDecision, ConflictRecord, ConflictStatus, ConflictStore, Resolution,
    Winner,
};
pub use event::{EventOutcome, Operation, SyncEvent};
pub use realtime::{PeerMessage, PeerSession, RealtimeSyncManager};
pub use resolver::{ConflictResolver, ResolvedConflict};
