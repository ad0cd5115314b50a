//! Wire frames for the peer transport
//!
//! One JSON object per line, tagged by `type`.

use crate::error::Result;
use crate::memory::Chunk;
use crate::sync::{BatchSummary, EventOutcome, PeerMessage, SyncEvent};
use serde::{Deserialize, Serialize};

/// Frames sent by a peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// First frame on every connection
    Hello {
        peer_id: String,
        /// Last outbound sequence this peer processed
        #[serde(default)]
        last_acked: u64,
        /// Events produced while disconnected
        #[serde(default)]
        offline_events: Vec<SyncEvent>,
    },
    /// A live mutation
    Event { event: SyncEvent },
    /// Changes up to `sequence` were processed
    Ack { sequence: u64 },
}

/// Frames sent to a peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Welcome {
        peer_id: String,
        summary: BatchSummary,
        backlog: Vec<PeerMessage>,
        resync_required: bool,
    },
    ChunkChanged {
        sequence: u64,
        chunk: Chunk,
    },
    Ack {
        sequence: u64,
        outcome: EventOutcome,
    },
    Conflict {
        sequence: u64,
        conflict_id: String,
        chunk_id: String,
    },
    Error {
        message: String,
    },
}

impl From<PeerMessage> for ServerFrame {
    fn from(message: PeerMessage) -> Self {
        match message {
            PeerMessage::ChunkChanged { sequence, chunk } => {
                ServerFrame::ChunkChanged { sequence, chunk }
            }
            PeerMessage::Ack { sequence, outcome } => ServerFrame::Ack { sequence, outcome },
            PeerMessage::Conflict {
                sequence,
                conflict_id,
                chunk_id,
            } => ServerFrame::Conflict {
                sequence,
                conflict_id,
                chunk_id,
            },
        }
    }
}

impl ServerFrame {
    pub fn error(message: impl Into<String>) -> Self {
        ServerFrame::Error {
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl ClientFrame {
    pub fn decode(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line)?)
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_defaults() {
        let frame = ClientFrame::decode(r#"{"type":"hello","peer_id":"laptop"}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Hello {
                peer_id: "laptop".into(),
                last_acked: 0,
                offline_events: Vec::new(),
            }
        );
    }

    #[test]
    fn test_unknown_frame_is_rejected() {
        assert!(ClientFrame::decode(r#"{"type":"subscribe"}"#).is_err());
        assert!(ClientFrame::decode("not json").is_err());
    }

    #[test]
    fn test_conflict_frame_shape() {
        let frame = ServerFrame::from(PeerMessage::Conflict {
            sequence: 4,
            conflict_id: "k1".into(),
            chunk_id: "c1".into(),
        });
        let json: serde_json::Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "conflict");
        assert_eq!(json["sequence"], 4);
        assert_eq!(json["conflict_id"], "k1");
    }
}
