//! Event processing module for PostgreSQL logical replication
//!
//! Row changes as handed to downstream sinks, and the sink trait itself.

use crate::core::errors::ReplicationResult;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;

pub mod sink;

// Re-export for convenience
pub use sink::EventSinkRegistry;

/// Column name to typed value, in table column order
pub type Row = Map<String, Value>;

/// Conjunction of `column = value` equalities identifying a row
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct MatchExpression(Row);

impl MatchExpression {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: impl Into<String>, value: Value) -> Self {
        self.push(column, value);
        self
    }

    pub fn push(&mut self, column: impl Into<String>, value: Value) {
        self.0.insert(column.into(), value);
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for MatchExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (column, value)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " AND ")?;
            }
            write!(f, "{} = {}", column, value)?;
        }
        Ok(())
    }
}

/// A change ready to be applied downstream
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum RowChange {
    Insert {
        table: String,
        row: Row,
    },
    Update {
        table: String,
        matcher: MatchExpression,
        row: Row,
    },
    Delete {
        table: String,
        matcher: MatchExpression,
    },
}

impl RowChange {
    pub fn table(&self) -> &str {
        match self {
            RowChange::Insert { table, .. }
            | RowChange::Update { table, .. }
            | RowChange::Delete { table, .. } => table,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RowChange::Insert { .. } => "insert",
            RowChange::Update { .. } => "update",
            RowChange::Delete { .. } => "delete",
        }
    }
}

/// Downstream store that row changes are applied to
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Apply one change. Delivery is at-least-once, so applies should be
    /// idempotent.
    async fn apply(&self, change: &RowChange) -> ReplicationResult<()>;

    fn sink_type(&self) -> &'static str;

    /// Flush and release resources; called once when replication stops
    async fn shutdown(&self) -> ReplicationResult<()> {
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_row_change_serialization() {
        let mut row = Row::new();
        row.insert("id".to_string(), json!(1));
        row.insert("name".to_string(), json!("John"));

        let change = RowChange::Update {
            table: "public.students".to_string(),
            matcher: MatchExpression::new().with("id", json!(1)),
            row,
        };

        assert_eq!(
            serde_json::to_string(&change).unwrap(),
            r#"{"op":"update","table":"public.students","matcher":{"id":1},"row":{"id":1,"name":"John"}}"#
        );
        assert_eq!(change.table(), "public.students");
        assert_eq!(change.kind(), "update");
    }

    #[test]
    fn test_match_expression_display() {
        let matcher = MatchExpression::new()
            .with("id", json!(1))
            .with("name", json!("x"));
        assert_eq!(matcher.to_string(), r#"id = 1 AND name = "x""#);
        assert_eq!(matcher.columns().collect::<Vec<_>>(), ["id", "name"]);
    }
}
