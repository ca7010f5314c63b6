//! pgoutput message decoder
//!
//! Interprets one logical replication message (protocol version 1) read
//! through a [`Cursor`], keeping the relation cache and the LSN state of the
//! consumer up to date.

use super::cursor::{ByteSource, Cursor};
use super::messages::{ColumnValue, ControlEvent, DecodedChange};
use crate::core::errors::{ReplicationError, ReplicationResult};
use crate::replication::relation_cache::{ColumnDescriptor, RelationCache};
use crate::replication::state::ReplicationState;
use std::collections::BTreeMap;
use tracing::{debug, warn};

pub const BEGIN: u8 = b'B';
pub const COMMIT: u8 = b'C';
pub const ORIGIN: u8 = b'O';
pub const RELATION: u8 = b'R';
pub const TYPE: u8 = b'Y';
pub const INSERT: u8 = b'I';
pub const UPDATE: u8 = b'U';
pub const DELETE: u8 = b'D';
pub const TRUNCATE: u8 = b'T';

const TUPLE_NULL: u8 = b'n';
const TUPLE_TEXT: u8 = b't';
const TUPLE_UNCHANGED: u8 = b'u';
const TUPLE_BINARY: u8 = b'b';

const IDENTITY_DEFAULT: u8 = b'd';
const IDENTITY_INDEX: u8 = b'i';

/// Final LSN + commit timestamp
const BEGIN_SKIP: usize = 8 + 8;
/// Flags + commit LSN + end LSN + commit timestamp
const COMMIT_SKIP: usize = 1 + 8 + 8 + 8;

/// How absent column kinds are recorded while decoding a tuple
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TupleMode {
    /// New row image: every column gets a value
    New,
    /// Old row or key image: null and unchanged columns are left out
    Old,
}

pub struct MessageDecoder;

impl MessageDecoder {
    /// Decode one message. `Ok(None)` means there is nothing to emit.
    pub fn decode<S: ByteSource>(
        cursor: &mut Cursor<'_, S>,
        relations: &mut RelationCache,
        state: &mut ReplicationState,
    ) -> ReplicationResult<Option<DecodedChange>> {
        let tag = cursor.read_u8()?;
        debug!("Decoding message type: {}", tag as char);

        match tag {
            BEGIN => {
                cursor.skip(BEGIN_SKIP)?;
                Ok(Some(DecodedChange::Control(ControlEvent::Begin)))
            }
            RELATION => Self::decode_relation(cursor, relations).map(Some),
            INSERT => Self::decode_insert(cursor, relations),
            UPDATE => Self::decode_update(cursor, relations),
            DELETE => Self::decode_delete(cursor, relations),
            COMMIT => {
                cursor.skip(COMMIT_SKIP)?;
                state.commit();
                Ok(Some(DecodedChange::Control(ControlEvent::Commit)))
            }
            ORIGIN | TYPE | TRUNCATE => {
                Ok(Some(DecodedChange::Control(ControlEvent::NotProcessed)))
            }
            other => Err(ReplicationError::protocol_with_context(
                format!("unexpected message tag '{}'", other as char),
                format!("position {}", cursor.position()),
            )),
        }
    }

    fn decode_relation<S: ByteSource>(
        cursor: &mut Cursor<'_, S>,
        relations: &mut RelationCache,
    ) -> ReplicationResult<DecodedChange> {
        let id = cursor.read_i32()?;
        let namespace = cursor.read_cstring()?;
        let relation_name = cursor.read_cstring()?;
        let name = if namespace.is_empty() {
            relation_name
        } else {
            format!("{}.{}", namespace, relation_name)
        };

        let identity = cursor.read_u8()?;
        if identity != IDENTITY_DEFAULT && identity != IDENTITY_INDEX {
            warn!(
                table = %name,
                identity = %(identity as char),
                "Unsupported replica identity, changes for this table will be skipped"
            );
            relations.mark_skipped(id);
            return Ok(DecodedChange::Control(ControlEvent::Relation(id)));
        }

        let column_count = cursor.read_i16()?.max(0) as usize;
        let mut columns = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            let _flags = cursor.read_u8()?;
            let column_name = cursor.read_cstring()?;
            let type_oid = cursor.read_u32()?;
            let _type_modifier = cursor.read_i32()?;
            columns.push(ColumnDescriptor::new(column_name, type_oid));
        }

        debug!(table = %name, id, columns = columns.len(), "Relation defined");
        relations.define(id, name, columns);
        Ok(DecodedChange::Control(ControlEvent::Relation(id)))
    }

    /// Whether changes for `id` can be emitted
    fn is_known(relations: &RelationCache, id: i32) -> bool {
        if relations.is_skipped(id) {
            debug!(id, "Skipping change for table with unsupported replica identity");
            return false;
        }
        match relations.get(id) {
            Some(relation) if !relation.name.is_empty() => true,
            _ => {
                warn!(id, "Change for unknown relation, skipping");
                false
            }
        }
    }

    fn decode_insert<S: ByteSource>(
        cursor: &mut Cursor<'_, S>,
        relations: &RelationCache,
    ) -> ReplicationResult<Option<DecodedChange>> {
        let table_id = cursor.read_i32()?;
        if !Self::is_known(relations, table_id) {
            return Ok(None);
        }

        if cursor.read_u8()? == 0 {
            return Ok(None);
        }

        let values = Self::decode_new_tuple(cursor)?;
        Ok(Some(DecodedChange::Insert { table_id, values }))
    }

    fn decode_update<S: ByteSource>(
        cursor: &mut Cursor<'_, S>,
        relations: &RelationCache,
    ) -> ReplicationResult<Option<DecodedChange>> {
        let table_id = cursor.read_i32()?;
        if !Self::is_known(relations, table_id) {
            return Ok(None);
        }

        let mut old_key_values = BTreeMap::new();
        let mut identifier = cursor.read_u8()?;
        if identifier == b'K' || identifier == b'O' {
            old_key_values = Self::decode_old_tuple(cursor)?;
            identifier = cursor.read_u8()?;
            if identifier != b'N' {
                return Err(ReplicationError::protocol(format!(
                    "expected new tuple after old tuple in update, got '{}'",
                    identifier as char
                )));
            }
        }

        if identifier != b'N' {
            return Err(ReplicationError::protocol(format!(
                "unexpected tuple identifier '{}' in update",
                identifier as char
            )));
        }

        let new_values = Self::decode_new_tuple(cursor)?;
        Ok(Some(DecodedChange::Update {
            table_id,
            new_values,
            old_key_values,
        }))
    }

    fn decode_delete<S: ByteSource>(
        cursor: &mut Cursor<'_, S>,
        relations: &RelationCache,
    ) -> ReplicationResult<Option<DecodedChange>> {
        let table_id = cursor.read_i32()?;
        if !Self::is_known(relations, table_id) {
            return Ok(None);
        }

        cursor.skip(1)?;
        let (count, old) = Self::decode_tuple(cursor, TupleMode::Old)?;
        let key_values = (0..count)
            .map(|index| old.get(&index).cloned().unwrap_or(ColumnValue::Null))
            .collect();
        Ok(Some(DecodedChange::Delete {
            table_id,
            key_values,
        }))
    }

    fn decode_new_tuple<S: ByteSource>(
        cursor: &mut Cursor<'_, S>,
    ) -> ReplicationResult<Vec<ColumnValue>> {
        let (_, values) = Self::decode_tuple(cursor, TupleMode::New)?;
        // New mode fills every position
        Ok(values.into_values().collect())
    }

    fn decode_old_tuple<S: ByteSource>(
        cursor: &mut Cursor<'_, S>,
    ) -> ReplicationResult<BTreeMap<usize, ColumnValue>> {
        Self::decode_tuple(cursor, TupleMode::Old).map(|(_, values)| values)
    }

    /// Decode tuple data into column index to value.
    ///
    /// A column that fails to decode is logged and defaulted, and decoding
    /// moves on to the next column. Only a missing column count fails the
    /// whole tuple.
    fn decode_tuple<S: ByteSource>(
        cursor: &mut Cursor<'_, S>,
        mode: TupleMode,
    ) -> ReplicationResult<(usize, BTreeMap<usize, ColumnValue>)> {
        let count = cursor.read_i16()?.max(0) as usize;
        let mut values = BTreeMap::new();

        for index in 0..count {
            match Self::decode_column(cursor, mode) {
                Ok(Some(value)) => {
                    values.insert(index, value);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(column = index, error = %e, "Failed to decode column, using default");
                    if mode == TupleMode::New {
                        values.insert(index, ColumnValue::Null);
                    }
                }
            }
        }

        Ok((count, values))
    }

    fn decode_column<S: ByteSource>(
        cursor: &mut Cursor<'_, S>,
        mode: TupleMode,
    ) -> ReplicationResult<Option<ColumnValue>> {
        let kind = cursor.read_u8()?;
        let value = match kind {
            TUPLE_NULL => ColumnValue::Null,
            TUPLE_UNCHANGED => ColumnValue::Unchanged,
            TUPLE_TEXT => ColumnValue::Text(cursor.read_length_prefixed_bytes()?),
            TUPLE_BINARY => ColumnValue::Binary(cursor.read_length_prefixed_bytes()?),
            other => {
                warn!(kind = %(other as char), "Unknown tuple column kind");
                ColumnValue::Null
            }
        };

        Ok(match (mode, value) {
            (TupleMode::Old, ColumnValue::Null | ColumnValue::Unchanged) => None,
            (_, value) => Some(value),
        })
    }
}
