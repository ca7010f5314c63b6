//! Session id and tracing span management
//!
//! Every run of the client gets a session id so log lines from setup, the
//! initial sync and streaming can be tied back to one process lifetime.

use crate::core::config::TransportMode;
use tracing::Span;
use uuid::Uuid;

/// Identifies one replication session
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn new() -> Self {
        SessionId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session id plus the span it is recorded on
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: SessionId,
    pub span: Span,
}

impl SessionContext {
    /// The slot name is recorded once setup has resolved it
    pub fn new(transport: TransportMode) -> Self {
        let session_id = SessionId::new();
        let span = tracing::info_span!(
            "replication_context",
            session_id = %session_id,
            slot = tracing::field::Empty,
            transport = %transport,
            component = "wal2sink"
        );

        Self { session_id, span }
    }

    pub fn record_slot(&self, slot: &str) {
        self.span.record("slot", slot);
    }

    /// Span for one phase of the session (setup, sync, streaming)
    pub fn child_context(&self, operation: &str) -> Self {
        let span = tracing::info_span!(
            parent: &self.span,
            "replication_operation",
            session_id = %self.session_id,
            operation = operation
        );

        Self {
            session_id: self.session_id.clone(),
            span,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ids_are_unique() {
        let id1 = SessionId::new();
        let id2 = SessionId::new();

        assert_ne!(id1, id2);
        assert_eq!(id1.as_str().len(), 36);
    }

    #[test]
    fn test_child_context_keeps_session_id() {
        let context = SessionContext::new(TransportMode::Streaming);
        let child = context.child_context("initial_sync");

        assert_eq!(context.session_id, child.session_id);
    }

    #[test]
    fn test_slot_recorded_after_creation() {
        let context = SessionContext::new(TransportMode::Peek);
        context.record_slot("wal2sink_school_students");
        assert!(context.span.field("slot").is_some());

        let child = context.child_context("peek");
        assert_eq!(context.session_id, child.session_id);
    }
}
