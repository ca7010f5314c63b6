//! Publication and replication slot setup, plus the initial table sync
//!
//! Runs once before streaming starts:
//! 1. Resolve slot and publication names
//! 2. Create the publication if missing
//! 3. Create, recreate or adopt the replication slot
//! 4. Copy every table under the exported snapshot into the sink
//!
//! The replication-mode setup connection stays open until the sync is done,
//! otherwise the exported snapshot is released.

use crate::core::config::ReplicationConfig;
use crate::core::errors::{ReplicationError, ReplicationResult};
use crate::events::sink::pg_type_conversion::text_to_json;
use crate::events::{EventSink, Row, RowChange};
use crate::replication::lsn::{format_lsn, parse_lsn};
use crate::utils::binary::XLogRecPtr;
use crate::utils::connection::{
    ConnectionFactory, SqlExecutor, quote_identifier, quote_literal, quote_qualified,
};
use serde_json::Value;
use tracing::{debug, error, info, warn};

pub const MAX_SLOT_NAME_LEN: usize = 64;

/// Slot names are limited to lowercase letters, digits and underscores
pub fn validate_slot_name(name: &str) -> ReplicationResult<()> {
    if name.is_empty() {
        return Err(ReplicationError::invalid_argument("Replication slot name cannot be empty"));
    }

    if name.len() > MAX_SLOT_NAME_LEN {
        return Err(ReplicationError::invalid_argument(format!(
            "Replication slot name '{}' is longer than {} characters",
            name, MAX_SLOT_NAME_LEN
        )));
    }

    if !name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
    {
        return Err(ReplicationError::invalid_argument(format!(
            "Replication slot name '{}' may only contain lower case letters, numbers and underscores",
            name
        )));
    }

    Ok(())
}

fn normalize_name(name: &str) -> String {
    name.to_lowercase().replace('-', "_")
}

pub fn derive_slot_name(database: &str, name: &str) -> String {
    normalize_name(&format!("{}_{}_wal2sink_slot", database, name))
}

pub fn derive_publication_name(database: &str, name: &str) -> String {
    normalize_name(&format!("{}_{}_wal2sink_pub", database, name))
}

/// Unqualified tables are taken to live in `public`
pub fn qualified_table_name(table: &str) -> String {
    if table.contains('.') {
        table.to_string()
    } else {
        format!("public.{}", table)
    }
}

/// Where streaming should begin once setup is complete
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handoff {
    pub start_lsn: XLogRecPtr,
    pub slot_name: String,
    pub publication_name: String,
    pub snapshot_name: Option<String>,
    /// The slot was dropped and created again; relation state must start empty
    pub recreated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub start_lsn: XLogRecPtr,
    pub snapshot_name: Option<String>,
    pub recreated: bool,
}

pub struct SlotLifecycle<F: ConnectionFactory> {
    factory: F,
    config: ReplicationConfig,
}

impl<F: ConnectionFactory> SlotLifecycle<F> {
    pub fn new(factory: F, config: ReplicationConfig) -> Self {
        Self { factory, config }
    }

    /// Configuration with resolved slot and publication names
    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    pub fn into_factory(self) -> F {
        self.factory
    }

    /// Prepare publication and slot, sync the tables, and hand off
    pub async fn run(&mut self, sink: &dyn EventSink) -> ReplicationResult<Handoff> {
        let mut setup = self.factory.connect_replication()?;

        self.resolve_names(&mut setup)?;
        validate_slot_name(&self.config.slot_name)?;
        self.ensure_publication(&mut setup)?;
        let slot = self.ensure_slot(&mut setup)?;

        match slot.snapshot_name.as_deref() {
            Some(_) if self.config.skip_initial_sync => info!("Skipping initial sync"),
            Some(snapshot) => {
                let rows = self.initial_sync(snapshot, sink).await?;
                info!(rows, "Initial sync complete");
            }
            None => debug!("No snapshot to sync from"),
        }

        // Releases the exported snapshot
        drop(setup);

        Ok(Handoff {
            start_lsn: slot.start_lsn,
            slot_name: self.config.slot_name.clone(),
            publication_name: self.config.publication_name.clone(),
            snapshot_name: slot.snapshot_name,
            recreated: slot.recreated,
        })
    }

    /// Derive names from the current database when a replication name is set
    pub fn resolve_names(&mut self, conn: &mut F::Connection) -> ReplicationResult<()> {
        let Some(name) = self.config.replication_name.clone() else {
            return Ok(());
        };

        let rows = conn.query("SELECT current_database()")?;
        let database = rows
            .rows
            .first()
            .and_then(|row| row.first().cloned().flatten())
            .ok_or_else(|| ReplicationError::query("current_database() returned no rows"))?;

        self.config.slot_name = derive_slot_name(&database, &name);
        self.config.publication_name = derive_publication_name(&database, &name);
        info!(
            slot = %self.config.slot_name,
            publication = %self.config.publication_name,
            "Derived replication names"
        );
        Ok(())
    }

    /// Create the publication unless it exists. Returns whether it was created.
    pub fn ensure_publication(&mut self, conn: &mut F::Connection) -> ReplicationResult<bool> {
        let publication = &self.config.publication_name;
        let rows = conn.query(&format!(
            "SELECT exists (SELECT 1 FROM pg_publication WHERE pubname = {})",
            quote_literal(publication)
        ))?;

        if rows.rows.first().and_then(|row| row.first().cloned().flatten()).as_deref() == Some("t") {
            info!(publication = %publication, "Using existing publication");
            return Ok(false);
        }

        if self.config.tables.is_empty() {
            return Err(ReplicationError::invalid_argument("No table found for replication"));
        }

        let tables = self
            .config
            .tables
            .iter()
            .map(|t| format!("ONLY {}", quote_qualified(t)))
            .collect::<Vec<_>>()
            .join(", ");
        conn.execute(&format!(
            "CREATE PUBLICATION {} FOR TABLE {}",
            quote_identifier(publication),
            tables
        ))?;

        info!(publication = %publication, tables = ?self.config.tables, "Created publication");
        Ok(true)
    }

    pub fn ensure_slot(&mut self, conn: &mut F::Connection) -> ReplicationResult<SlotInfo> {
        let slot = self.config.slot_name.clone();
        let rows = conn.query(&format!(
            "SELECT active, restart_lsn, confirmed_flush_lsn FROM pg_replication_slots WHERE slot_name = {}",
            quote_literal(&slot)
        ))?;
        let exists = !rows.is_empty();

        if self.config.user_managed_slot {
            let snapshot = self.config.user_snapshot.clone().ok_or_else(|| {
                ReplicationError::invalid_argument("A user managed slot requires a snapshot name")
            })?;
            if !exists {
                return Err(ReplicationError::invalid_argument(format!(
                    "User managed replication slot '{}' does not exist",
                    slot
                )));
            }

            let lsn_text = rows
                .value(0, "confirmed_flush_lsn")
                .or_else(|| rows.value(0, "restart_lsn"))
                .ok_or_else(|| {
                    ReplicationError::invalid_argument(format!(
                        "Replication slot '{}' has no confirmed position",
                        slot
                    ))
                })?;
            let start_lsn = parse_lsn(lsn_text)?;

            info!(slot = %slot, lsn = %format_lsn(start_lsn), "Using user managed replication slot");
            return Ok(SlotInfo {
                start_lsn,
                snapshot_name: Some(snapshot),
                recreated: false,
            });
        }

        if exists {
            if rows.value(0, "active") == Some("t") {
                warn!(slot = %slot, "Dropping replication slot that is still active");
            }
            conn.query(&format!("SELECT pg_drop_replication_slot({})", quote_literal(&slot)))?;
            info!(slot = %slot, "Dropped replication slot");
        }

        let created = conn.query(&format!(
            "CREATE_REPLICATION_SLOT {} LOGICAL pgoutput EXPORT_SNAPSHOT",
            quote_identifier(&slot)
        ))?;
        let consistent_point = created.value(0, "consistent_point").ok_or_else(|| {
            ReplicationError::protocol("CREATE_REPLICATION_SLOT returned no consistent point")
        })?;
        let start_lsn = parse_lsn(consistent_point)?;
        let snapshot_name = created.value(0, "snapshot_name").map(str::to_string);

        info!(
            slot = %slot,
            lsn = %format_lsn(start_lsn),
            snapshot = snapshot_name.as_deref().unwrap_or(""),
            "Created replication slot"
        );
        Ok(SlotInfo {
            start_lsn,
            snapshot_name,
            recreated: exists,
        })
    }

    /// Copy every configured table into the sink. Returns the rows applied.
    pub async fn initial_sync(
        &mut self,
        snapshot: &str,
        sink: &dyn EventSink,
    ) -> ReplicationResult<usize> {
        let mut total = 0;

        for table in self.config.tables.clone() {
            match self.sync_table(&table, snapshot, sink).await {
                Ok(rows) => {
                    info!(table = %table, rows, "Loaded table from snapshot");
                    total += rows;
                }
                Err(e) if self.config.fatal_sync_errors => return Err(e),
                Err(e) => error!(table = %table, error = %e, "Initial sync failed, skipping table"),
            }
        }

        Ok(total)
    }

    async fn sync_table(
        &mut self,
        table: &str,
        snapshot: &str,
        sink: &dyn EventSink,
    ) -> ReplicationResult<usize> {
        let mut conn = self.factory.connect()?;
        conn.execute("BEGIN ISOLATION LEVEL REPEATABLE READ")?;
        conn.execute(&format!("SET TRANSACTION SNAPSHOT {}", quote_literal(snapshot)))?;

        debug!(table, "Loading table");
        let result = conn.query(&format!("SELECT * FROM ONLY {}", quote_qualified(table)))?;
        let name = qualified_table_name(table);

        for values in &result.rows {
            let row: Row = result
                .columns
                .iter()
                .zip(&result.type_oids)
                .zip(values)
                .map(|((column, oid), value)| {
                    let json = match value {
                        Some(text) => text_to_json(*oid, text),
                        None => Value::Null,
                    };
                    (column.clone(), json)
                })
                .collect();

            sink.apply(&RowChange::Insert {
                table: name.clone(),
                row,
            })
            .await?;
        }

        conn.execute("COMMIT")?;
        Ok(result.len())
    }
}
