//! STDOUT event sink implementation
//!
//! Writes each row change as one JSON line. Useful for debugging, piping into
//! other tools, or when no other sink is configured.

use crate::core::errors::{ReplicationError, ReplicationResult};
use crate::events::{EventSink, RowChange};
use async_trait::async_trait;
use std::io::{self, Write};
use tracing::debug;

/// Event sink that writes events to standard output
pub struct StdoutEventSink {}

impl StdoutEventSink {
    pub fn new() -> Self {
        Self {}
    }

    fn render(change: &RowChange) -> ReplicationResult<String> {
        serde_json::to_string(change)
            .map_err(|e| ReplicationError::sink("stdout", format!("Failed to serialize change: {}", e)))
    }
}

impl Default for StdoutEventSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventSink for StdoutEventSink {
    async fn apply(&self, change: &RowChange) -> ReplicationResult<()> {
        debug!(table = change.table(), op = change.kind(), "Writing change to stdout");
        let line = Self::render(change)?;

        let mut stdout = io::stdout().lock();
        writeln!(stdout, "{}", line)?;
        Ok(())
    }

    fn sink_type(&self) -> &'static str {
        "stdout"
    }

    async fn shutdown(&self) -> ReplicationResult<()> {
        io::stdout().flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{MatchExpression, Row};
    use serde_json::json;

    #[test]
    fn test_render_is_single_line() {
        let change = RowChange::Delete {
            table: "public.students".to_string(),
            matcher: MatchExpression::new().with("id", json!(7)),
        };
        let line = StdoutEventSink::render(&change).unwrap();
        assert!(!line.contains('\n'));
        assert_eq!(
            line,
            r#"{"op":"delete","table":"public.students","matcher":{"id":7}}"#
        );
    }

    #[tokio::test]
    async fn test_stdout_sink_apply() {
        let sink = StdoutEventSink::new();
        let mut row = Row::new();
        row.insert("id".to_string(), json!(1));
        let change = RowChange::Insert {
            table: "public.students".to_string(),
            row,
        };

        assert!(sink.apply(&change).await.is_ok());
        assert_eq!(sink.sink_type(), "stdout");
        assert!(sink.shutdown().await.is_ok());
    }
}
