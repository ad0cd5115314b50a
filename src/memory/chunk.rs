//! Chunk data types
//!
//! A chunk is the unit of conversation memory: free text, its embedding, a
//! metadata bag, and the versioning fields used by optimistic concurrency.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// A versioned, embedded unit of stored memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Unique chunk identifier
    pub id: String,
    /// Owning repository or project
    pub scope: String,
    /// Free-text content
    pub content: String,
    /// Dense vector embedding
    #[serde(default)]
    pub embedding: Vec<f32>,
    /// Structured metadata
    #[serde(default)]
    pub metadata: ChunkMetadata,
    /// Logical clock, incremented on every accepted mutation
    #[serde(default)]
    pub version: u64,
    /// Last modification time as reported by the writer
    pub updated_at: DateTime<Utc>,
    /// Peer that produced this version
    #[serde(default)]
    pub origin: String,
    /// Tombstone marker; deleted chunks keep their history
    #[serde(default)]
    pub deleted: bool,
}

/// Outcome classification of the work a chunk describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    InProgress,
    Failed,
    Abandoned,
}

/// Structured metadata carried by a chunk
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkMetadata {
    /// Free-form tags
    pub tags: BTreeSet<String>,
    /// Session that produced the chunk
    pub session_id: Option<String>,
    /// Files referenced by the conversation
    pub files: Vec<String>,
    /// Outcome classification
    pub outcome: Option<Outcome>,
    /// Additional fields, merged key by key
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Chunk {
    /// Hash of everything a writer can change: content, metadata and the
    /// tombstone flag. Versioning fields are excluded so that redelivered
    /// writes hash identically.
    pub fn content_hash(&self) -> String {
        #[derive(Serialize)]
        struct Hashed<'a> {
            content: &'a str,
            metadata: &'a ChunkMetadata,
            deleted: bool,
        }

        let payload = serde_json::to_vec(&Hashed {
            content: &self.content,
            metadata: &self.metadata,
            deleted: self.deleted,
        })
        .unwrap_or_default();
        format!("{:x}", Sha256::digest(&payload))
    }

    /// Build the tombstone that supersedes this chunk
    pub fn tombstone(&self, origin: &str, at: DateTime<Utc>) -> Chunk {
        Chunk {
            deleted: true,
            origin: origin.to_string(),
            updated_at: at,
            ..self.clone()
        }
    }
}

/// A chunk returned from a similarity search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

/// Metadata filter applied to searches
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchFilter {
    /// Restrict to one scope
    pub scope: Option<String>,
    /// Every listed tag must be present
    pub tags: Vec<String>,
    /// Restrict to one session
    pub session_id: Option<String>,
    /// Restrict to one outcome
    pub outcome: Option<Outcome>,
    /// Include tombstoned chunks
    pub include_deleted: bool,
}

impl SearchFilter {
    /// Scope-only filter
    pub fn scope(scope: impl Into<String>) -> Self {
        Self {
            scope: Some(scope.into()),
            ..Default::default()
        }
    }

    /// Whether a chunk passes this filter
    pub fn matches(&self, chunk: &Chunk) -> bool {
        if chunk.deleted && !self.include_deleted {
            return false;
        }
        if let Some(scope) = &self.scope {
            if &chunk.scope != scope {
                return false;
            }
        }
        if !self.tags.iter().all(|t| chunk.metadata.tags.contains(t)) {
            return false;
        }
        if let Some(session) = &self.session_id {
            if chunk.metadata.session_id.as_ref() != Some(session) {
                return false;
            }
        }
        if let Some(outcome) = self.outcome {
            if chunk.metadata.outcome != Some(outcome) {
                return false;
            }
        }
        true
    }
}

/// A vector search request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub vector: Vec<f32>,
    #[serde(default)]
    pub filter: SearchFilter,
    pub top_k: usize,
}

/// Store-level statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Backend name
    pub backend: String,
    /// Stored chunks, tombstones included
    pub total_chunks: u64,
    /// Tombstoned chunks, when the backend can count them cheaply
    pub deleted_chunks: Option<u64>,
    /// Configured vector dimensionality, when known
    pub dimension: Option<usize>,
}

/// Builder for constructing `Chunk` instances
pub struct ChunkBuilder {
    id: Option<String>,
    scope: String,
    content: String,
    embedding: Vec<f32>,
    metadata: ChunkMetadata,
    origin: String,
    updated_at: Option<DateTime<Utc>>,
}

impl ChunkBuilder {
    /// Create a new builder with the required scope and content
    pub fn new(scope: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: None,
            scope: scope.into(),
            content: content.into(),
            embedding: Vec::new(),
            metadata: ChunkMetadata::default(),
            origin: String::new(),
            updated_at: None,
        }
    }

    /// Use an explicit identifier instead of a fresh UUID
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = embedding;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.metadata.tags.insert(tag.into());
        self
    }

    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.metadata.session_id = Some(session_id.into());
        self
    }

    pub fn file(mut self, path: impl Into<String>) -> Self {
        self.metadata.files.push(path.into());
        self
    }

    pub fn outcome(mut self, outcome: Outcome) -> Self {
        self.metadata.outcome = Some(outcome);
        self
    }

    pub fn extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.extra.insert(key.into(), value);
        self
    }

    pub fn metadata(mut self, metadata: ChunkMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    pub fn updated_at(mut self, at: DateTime<Utc>) -> Self {
        self.updated_at = Some(at);
        self
    }

    /// Build the chunk. The version is left at 0; the repository assigns it.
    pub fn build(self) -> Result<Chunk> {
        if self.scope.trim().is_empty() {
            return Err(Error::Validation("scope is required".to_string()));
        }
        if self.content.trim().is_empty() {
            return Err(Error::Validation("content is required".to_string()));
        }
        Ok(Chunk {
            id: self.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            scope: self.scope,
            content: self.content,
            embedding: self.embedding,
            metadata: self.metadata,
            version: 0,
            updated_at: self.updated_at.unwrap_or_else(Utc::now),
            origin: self.origin,
            deleted: false,
        })
    }
}
