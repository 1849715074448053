//! JSON wire protocol for the collaboration channel.
//!
//! Every frame is a JSON object tagged by event name:
//! ```text
//! {"event":"send-op","docId":"…","delta":[{"insert":"hi"}],"baseVersion":3}
//! {"event":"op-ack","version":4}
//! ```
//!
//! Deltas travel in their canonical JSON shape (see `scribe-ot`). The
//! protocol is intentionally at-least-once: acknowledgements are idempotent
//! and redelivered ops are skipped by version on the client.

use scribe_ot::Delta;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Cursor/selection range in document units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRange {
    pub index: u64,
    pub length: u64,
}

/// One log entry as replayed to a reconnecting client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedDelta {
    pub delta: Delta,
    pub version: u64,
}

/// Client → server events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    /// Open a document: subscribe and fetch state. With `from_version`,
    /// asks for a catch-up replay instead of a full snapshot.
    JoinDoc {
        doc_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        from_version: Option<u64>,
    },
    /// Submit one local edit based on `base_version`.
    SendOp {
        doc_id: Uuid,
        delta: Delta,
        base_version: u64,
    },
    /// Share the local cursor; `None` clears it.
    CursorUpdate {
        doc_id: Uuid,
        range: Option<CursorRange>,
    },
    /// Close a document view.
    LeaveDoc { doc_id: Uuid },
}

/// Server → client events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// Full authoritative state.
    DocSnapshot { content: Delta, version: u64 },
    /// Replay of log entries the client missed, ascending by version.
    CatchupOps {
        ops: Vec<VersionedDelta>,
        current_version: u64,
    },
    /// A peer's committed op, already transformed into the given version.
    ReceiveOp {
        delta: Delta,
        version: u64,
        user_id: String,
    },
    /// The sender's own op committed at `version`.
    OpAck { version: u64 },
    /// The sender's op was rejected; nothing was broadcast.
    OpError { message: String, base_version: u64 },
    /// A peer's cursor moved.
    RemoteCursor {
        user_id: String,
        range: Option<CursorRange>,
    },
    /// A peer closed the document or disconnected.
    UserLeft { user_id: String },
    /// Session-level failure (missing document, denied join, bad frame).
    Error { message: String },
}

impl ClientEvent {
    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Parse a JSON text frame. Deltas are re-normalized so downstream
    /// equality and iteration see canonical ops.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let mut event: ClientEvent = serde_json::from_str(text)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        if let ClientEvent::SendOp { delta, .. } = &mut event {
            delta.normalize();
        }
        Ok(event)
    }

    /// Document this event addresses.
    pub fn doc_id(&self) -> Uuid {
        match self {
            ClientEvent::JoinDoc { doc_id, .. }
            | ClientEvent::SendOp { doc_id, .. }
            | ClientEvent::CursorUpdate { doc_id, .. }
            | ClientEvent::LeaveDoc { doc_id } => *doc_id,
        }
    }
}

impl ServerEvent {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    /// Peer sent a frame kind the protocol does not use (e.g. binary).
    InvalidFrame,
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidFrame => write!(f, "Invalid frame"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
