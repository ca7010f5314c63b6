//! Primary key lookups against the system catalog

use crate::core::errors::{ReplicationError, ReplicationResult};
use crate::replication::relation_cache::PrimaryKeyLookup;
use crate::utils::connection::{SqlExecutor, quote_literal};

/// Looks primary keys up in `information_schema` over its own connection
pub struct CatalogPrimaryKeyLookup<E: SqlExecutor> {
    executor: E,
}

impl<E: SqlExecutor> CatalogPrimaryKeyLookup<E> {
    pub fn new(executor: E) -> Self {
        Self { executor }
    }

    pub fn primary_key_query(table: &str) -> String {
        let mut sql = String::from(
            "SELECT kcu.column_name \
             FROM information_schema.table_constraints tco \
             JOIN information_schema.key_column_usage kcu \
             ON kcu.constraint_name = tco.constraint_name \
             AND kcu.table_schema = tco.table_schema \
             AND kcu.table_name = tco.table_name \
             WHERE tco.constraint_type = 'PRIMARY KEY'",
        );

        match table.split_once('.') {
            Some((schema, name)) => {
                sql.push_str(&format!(
                    " AND tco.table_schema = {} AND tco.table_name = {}",
                    quote_literal(schema),
                    quote_literal(name)
                ));
            }
            None => {
                sql.push_str(&format!(" AND tco.table_name = {}", quote_literal(table)));
            }
        }

        sql.push_str(" ORDER BY kcu.ordinal_position");
        sql
    }
}

impl<E: SqlExecutor> PrimaryKeyLookup for CatalogPrimaryKeyLookup<E> {
    fn primary_key_columns(&mut self, table: &str) -> ReplicationResult<Vec<String>> {
        let rows = self
            .executor
            .query(&Self::primary_key_query(table))
            .map_err(|e| ReplicationError::metadata(table, e.to_string()))?;

        Ok(rows
            .rows
            .into_iter()
            .filter_map(|row| row.into_iter().next().flatten())
            .collect())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;

    /// Fixed table to key column mapping
    #[derive(Default)]
    pub struct StaticKeys(pub HashMap<String, Vec<String>>);

    impl StaticKeys {
        pub fn with(mut self, table: &str, columns: &[&str]) -> Self {
            self.0.insert(
                table.to_string(),
                columns.iter().map(|c| c.to_string()).collect(),
            );
            self
        }
    }

    impl PrimaryKeyLookup for StaticKeys {
        fn primary_key_columns(&mut self, table: &str) -> ReplicationResult<Vec<String>> {
            Ok(self.0.get(table).cloned().unwrap_or_default())
        }
    }
}
