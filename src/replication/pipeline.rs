//! Decoded change to sink write mapping
//!
//! Shared by the streaming and peek transports: decode one pgoutput message,
//! resolve how the affected row is identified, and apply the resulting
//! [`RowChange`] to the sink.

use crate::core::errors::{ReplicationError, ReplicationResult};
use crate::events::sink::pg_type_conversion::column_to_json;
use crate::events::{EventSink, MatchExpression, Row, RowChange};
use crate::protocol::cursor::{ByteSource, Cursor};
use crate::protocol::decoder::MessageDecoder;
use crate::protocol::messages::{ColumnValue, DecodedChange};
use crate::replication::relation_cache::{PrimaryKeyLookup, RelationCache, RelationDescriptor};
use crate::replication::state::ReplicationState;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct ChangePipeline {
    relations: RelationCache,
    key_lookup: Box<dyn PrimaryKeyLookup>,
    sink: Arc<dyn EventSink>,
}

impl ChangePipeline {
    pub fn new(sink: Arc<dyn EventSink>, key_lookup: Box<dyn PrimaryKeyLookup>) -> Self {
        Self {
            relations: RelationCache::new(),
            key_lookup,
            sink,
        }
    }

    pub fn relations(&self) -> &RelationCache {
        &self.relations
    }

    pub fn sink(&self) -> &Arc<dyn EventSink> {
        &self.sink
    }

    /// Forget all relations; the server resends them on a new stream
    pub fn reset(&mut self) {
        self.relations.reset();
    }

    /// Decode one message and apply it. Returns whether a row change was
    /// handed to the sink. Any error from the sink comes back as
    /// [`ReplicationError::Sink`], so callers can tell it apart from a
    /// message that failed to decode.
    pub async fn process<S: ByteSource>(
        &mut self,
        message: &[u8],
        state: &mut ReplicationState,
    ) -> ReplicationResult<bool> {
        let mut cursor = Cursor::<S>::new(message);
        let Some(decoded) = MessageDecoder::decode(&mut cursor, &mut self.relations, state)? else {
            return Ok(false);
        };

        let Some(change) = self.to_row_change(decoded) else {
            return Ok(false);
        };

        debug!(table = change.table(), op = change.kind(), "Applying change");
        self.sink.apply(&change).await.map_err(|e| {
            if e.is_sink_failure() {
                e
            } else {
                ReplicationError::sink(self.sink.sink_type(), e.to_string())
            }
        })?;
        Ok(true)
    }

    /// Map a decoded message to a sink write; control messages map to nothing
    pub fn to_row_change(&mut self, decoded: DecodedChange) -> Option<RowChange> {
        match decoded {
            DecodedChange::Insert { table_id, values } => {
                let relation = self.relations.get(table_id)?;
                Some(RowChange::Insert {
                    table: relation.name.clone(),
                    row: build_row(relation, &values),
                })
            }
            DecodedChange::Update {
                table_id,
                new_values,
                old_key_values,
            } => {
                let matcher = if old_key_values.is_empty() {
                    self.key_matcher(table_id, &new_values)
                } else {
                    let relation = self.relations.get(table_id)?;
                    old_key_matcher(relation, &old_key_values)
                };
                let relation = self.relations.get(table_id)?;
                Some(RowChange::Update {
                    table: relation.name.clone(),
                    matcher,
                    row: build_row(relation, &new_values),
                })
            }
            DecodedChange::Delete {
                table_id,
                key_values,
            } => {
                let matcher = self.key_matcher(table_id, &key_values);
                let relation = self.relations.get(table_id)?;
                Some(RowChange::Delete {
                    table: relation.name.clone(),
                    matcher,
                })
            }
            DecodedChange::Control(_) => None,
        }
    }

    /// Match on the primary key columns, or on every present value when the
    /// table has no usable key
    fn key_matcher(&mut self, table_id: i32, values: &[ColumnValue]) -> MatchExpression {
        let key_indices = self
            .relations
            .primary_key_indices(table_id, self.key_lookup.as_mut())
            .unwrap_or_default();

        let Some(relation) = self.relations.get(table_id) else {
            return MatchExpression::new();
        };

        let mut matcher = MatchExpression::new();
        for index in key_indices {
            if let (Some(column), Some(value)) = (relation.columns.get(index), values.get(index)) {
                if value.is_present() {
                    if let Some(json) = column_to_json(column.type_oid, value) {
                        matcher.push(column.name.clone(), json);
                    }
                }
            }
        }

        if matcher.is_empty() {
            warn!(table = %relation.name, "No primary key values, matching on all present columns");
            matcher = best_effort_matcher(relation, values);
        }
        matcher
    }
}

/// Every column except unchanged TOAST values
fn build_row(relation: &RelationDescriptor, values: &[ColumnValue]) -> Row {
    if values.len() != relation.columns.len() {
        warn!(
            table = %relation.name,
            values = values.len(),
            columns = relation.columns.len(),
            "Tuple width does not match relation"
        );
    }

    relation
        .columns
        .iter()
        .zip(values)
        .filter_map(|(column, value)| {
            column_to_json(column.type_oid, value).map(|json| (column.name.clone(), json))
        })
        .collect()
}

fn old_key_matcher(
    relation: &RelationDescriptor,
    old_key_values: &BTreeMap<usize, ColumnValue>,
) -> MatchExpression {
    let mut matcher = MatchExpression::new();
    for (index, value) in old_key_values {
        if let Some(column) = relation.columns.get(*index) {
            if let Some(json) = column_to_json(column.type_oid, value) {
                matcher.push(column.name.clone(), json);
            }
        }
    }
    matcher
}

fn best_effort_matcher(relation: &RelationDescriptor, values: &[ColumnValue]) -> MatchExpression {
    let mut matcher = MatchExpression::new();
    for (column, value) in relation.columns.iter().zip(values) {
        if value.is_present() {
            if let Some(json) = column_to_json(column.type_oid, value) {
                matcher.push(column.name.clone(), json);
            }
        }
    }
    matcher
}
