//! MemSync - Resilient memory store and realtime sync for AI conversation context
//!
//! MemSync persists conversation context as versioned, vector-embedded
//! chunks and keeps that memory consistent across concurrent writers:
//! interactive sessions, batch imports and offline clients reconnecting.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       Peer transport (TCP)                        │
//! │        hello / welcome / event / ack / chunk_changed frames        │
//! └───────────────┬──────────────────────────────────┬───────────────┘
//!                 │ live events                      │ offline diff
//! ┌───────────────▼──────────────┐   ┌───────────────▼───────────────┐
//! │    Realtime Sync Manager     │──►│      Batch Sync Manager        │
//! │  - per-peer subscriptions    │   │  - per-chunk ordering          │
//! │  - fan-out + ack journal     │   │  - bounded worker pool         │
//! └───────────────┬──────────────┘   └───────────────┬───────────────┘
//!                 └────────────────┬─────────────────┘
//! ┌────────────────────────────────▼─────────────────────────────────┐
//! │                       Conflict Resolver                           │
//! │  duplicate → structural merge → last-writer-wins → manual record  │
//! └────────────────────────────────┬─────────────────────────────────┘
//! ┌────────────────────────────────▼─────────────────────────────────┐
//! │            Chunk Repository (validation, PutIfVersion)            │
//! └────────────────────────────────┬─────────────────────────────────┘
//! ┌────────────────────────────────▼─────────────────────────────────┐
//! │        Resilient Store: retry ─► circuit breaker ─► pool          │
//! └────────────────────────────────┬─────────────────────────────────┘
//!                                  ▼
//!                    Vector database (memory | Qdrant)
//! ```
//!
//! ## Modules
//!
//! - [`resilience`]: Backoff, circuit breakers and the connection pool
//! - [`store`]: Storage port, raw drivers and the resilient wrapper chain
//! - [`memory`]: Chunks and the versioned repository
//! - [`embedding`]: Embedding port and a local feature-hashing embedder
//! - [`sync`]: Conflict resolution, batch and realtime sync
//! - [`service`]: Memory API facade
//! - [`server`]: Newline-delimited JSON peer transport
//! - [`config`]: Configuration management

pub mod config;
pub mod embedding;
pub mod error;
pub mod memory;
pub mod resilience;
pub mod server;
pub mod service;
pub mod store;
pub mod sync;

pub use config::MemSyncConfig;
pub use error::{Error, Result};
pub use service::MemoryService;
