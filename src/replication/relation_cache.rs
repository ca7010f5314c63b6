//! Cache for PostgreSQL relation metadata.
//!
//! The server sends a Relation message before the first change on each table
//! in a stream. Changes only carry the relation id, so we keep the table name
//! and column layout here, along with the primary key once it is looked up.

use crate::core::errors::{ReplicationError, ReplicationResult};
use crate::utils::binary::Oid;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Resolves the primary key columns of a table
pub trait PrimaryKeyLookup {
    /// Column names of the primary key of `table` (`schema.name` or `name`)
    fn primary_key_columns(&mut self, table: &str) -> ReplicationResult<Vec<String>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub name: String,
    pub type_oid: Oid,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, type_oid: Oid) -> Self {
        Self {
            name: name.into(),
            type_oid,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RelationDescriptor {
    /// `namespace.name`, or just `name` for an empty namespace
    pub name: String,
    pub columns: Vec<ColumnDescriptor>,
    primary_key: Option<Vec<usize>>,
}

impl RelationDescriptor {
    /// Replace the definition; any memoized primary key is dropped
    pub fn redefine(&mut self, name: String, columns: Vec<ColumnDescriptor>) {
        self.name = name;
        self.columns = columns;
        self.primary_key = None;
    }

    pub fn column_name(&self, index: usize) -> Option<&str> {
        self.columns.get(index).map(|c| c.name.as_str())
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    fn key_indices(&self, key_columns: &[String]) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, column)| key_columns.iter().any(|k| k == &column.name))
            .map(|(index, _)| index)
            .collect()
    }
}

/// Relation id to table metadata for one streaming session
#[derive(Debug, Default)]
pub struct RelationCache {
    relations: HashMap<i32, RelationDescriptor>,
    skipped: HashSet<i32>,
}

impl RelationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&mut self, id: i32) -> &mut RelationDescriptor {
        self.relations.entry(id).or_default()
    }

    pub fn get(&self, id: i32) -> Option<&RelationDescriptor> {
        self.relations.get(&id)
    }

    /// Store a Relation message, clearing any earlier skip mark
    pub fn define(&mut self, id: i32, name: String, columns: Vec<ColumnDescriptor>) {
        self.skipped.remove(&id);
        self.get_or_create(id).redefine(name, columns);
    }

    pub fn is_skipped(&self, id: i32) -> bool {
        self.skipped.contains(&id)
    }

    pub fn mark_skipped(&mut self, id: i32) {
        self.skipped.insert(id);
    }

    /// Primary key column positions for a table, looked up on first use.
    ///
    /// A failed lookup is memoized as "no key" so it is not retried for every
    /// change; the error is still returned the first time.
    pub fn primary_key_indices(
        &mut self,
        id: i32,
        lookup: &mut dyn PrimaryKeyLookup,
    ) -> ReplicationResult<Vec<usize>> {
        let Some(relation) = self.relations.get_mut(&id) else {
            return Ok(Vec::new());
        };

        if let Some(indices) = &relation.primary_key {
            return Ok(indices.clone());
        }

        match lookup.primary_key_columns(&relation.name) {
            Ok(key_columns) => {
                let indices = relation.key_indices(&key_columns);
                debug!(table = %relation.name, key = ?key_columns, "Resolved primary key");
                relation.primary_key = Some(indices.clone());
                Ok(indices)
            }
            Err(e) => {
                warn!(table = %relation.name, error = %e, "Primary key lookup failed");
                relation.primary_key = Some(Vec::new());
                Err(match e {
                    ReplicationError::MetadataLookupFailed { .. } => e,
                    other => ReplicationError::metadata(relation.name.clone(), other.to_string()),
                })
            }
        }
    }

    pub fn reset(&mut self) {
        self.relations.clear();
        self.skipped.clear();
    }

    pub fn len(&self) -> usize {
        self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }
}
