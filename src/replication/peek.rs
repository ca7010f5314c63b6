//! Poll-based consumer over `pg_logical_slot_peek_binary_changes`
//!
//! Peeks a batch of changes, applies them through the same pipeline as the
//! streaming session, and advances the slot explicitly once a commit has
//! been handled. Changes are only consumed server-side by the advance.

use crate::core::config::ReplicationConfig;
use crate::core::errors::{ReplicationError, ReplicationResult};
use crate::protocol::cursor::HexText;
use crate::replication::lsn::{format_lsn, parse_lsn};
use crate::replication::pipeline::ChangePipeline;
use crate::replication::state::ReplicationState;
use crate::utils::binary::XLogRecPtr;
use crate::utils::connection::{ConnectionFactory, SqlExecutor, quote_literal};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

pub fn peek_sql(slot: &str, publication: &str, batch_size: usize) -> String {
    format!(
        "SELECT lsn, data FROM pg_logical_slot_peek_binary_changes({}, NULL, {}, \
         'publication_names', {}, 'proto_version', '1')",
        quote_literal(slot),
        batch_size,
        quote_literal(publication)
    )
}

pub fn advance_sql(slot: &str, lsn: XLogRecPtr) -> String {
    format!(
        "SELECT end_lsn FROM pg_replication_slot_advance({}, {})",
        quote_literal(slot),
        quote_literal(&format_lsn(lsn))
    )
}

pub struct PeekConsumer<F: ConnectionFactory> {
    factory: F,
    config: ReplicationConfig,
    pipeline: ChangePipeline,
    state: ReplicationState,
    connection: Option<F::Connection>,
    shutdown_signal: Arc<AtomicBool>,
}

impl<F: ConnectionFactory> PeekConsumer<F> {
    pub fn new(
        factory: F,
        config: ReplicationConfig,
        pipeline: ChangePipeline,
        shutdown_signal: Arc<AtomicBool>,
    ) -> Self {
        Self {
            factory,
            config,
            pipeline,
            state: ReplicationState::new(),
            connection: None,
            shutdown_signal,
        }
    }

    pub fn state(&self) -> &ReplicationState {
        &self.state
    }

    fn connection_mut(&mut self) -> ReplicationResult<&mut F::Connection> {
        if self.connection.is_none() {
            debug!("Opening peek connection");
            self.connection = Some(self.factory.connect()?);
        }
        self.connection
            .as_mut()
            .ok_or_else(|| ReplicationError::connection("Peek connection unavailable"))
    }

    /// Fetch and apply one batch. Returns `false` when the slot had nothing.
    ///
    /// A refused apply stops the batch. The slot is advanced only through
    /// the last commit before it, so the refused change is peeked again.
    pub async fn consume(&mut self) -> ReplicationResult<bool> {
        let sql = peek_sql(
            &self.config.slot_name,
            &self.config.publication_name,
            self.config.batch_size,
        );
        let rows = self.connection_mut()?.query(&sql)?;
        if rows.is_empty() {
            return Ok(false);
        }

        let (Some(lsn_index), Some(data_index)) =
            (rows.column_index("lsn"), rows.column_index("data"))
        else {
            return Err(ReplicationError::protocol_with_context(
                "Peek result is missing the lsn or data column",
                rows.columns.join(", "),
            ));
        };

        debug!(changes = rows.len(), "Peeked changes");

        let mut failure = None;
        for row in &rows.rows {
            let lsn_text = row.get(lsn_index).and_then(|v| v.as_deref());
            let data = row.get(data_index).and_then(|v| v.as_deref());
            let (Some(lsn_text), Some(data)) = (lsn_text, data) else {
                warn!("Skipping peeked row with NULL lsn or data");
                continue;
            };

            let lsn = match parse_lsn(lsn_text) {
                Ok(lsn) => lsn,
                Err(e) => {
                    warn!(lsn = lsn_text, error = %e, "Skipping peeked row with invalid LSN");
                    continue;
                }
            };
            self.state.current_lsn = lsn;
            self.state.update_received_lsn(lsn);

            match self
                .pipeline
                .process::<HexText>(data.as_bytes(), &mut self.state)
                .await
            {
                Ok(_) => {}
                Err(e) if e.is_decode_error() => {
                    warn!(lsn = %format_lsn(lsn), error = %e, "Failed to decode peeked change, skipping");
                }
                Err(e) => {
                    error!(lsn = %format_lsn(lsn), error = %e, "Failed to apply peeked change");
                    failure = Some(e);
                    break;
                }
            }
            self.state.mark_processed();
        }

        // Only commits seen before a failed apply are confirmed
        if self.state.take_committed() {
            let sql = advance_sql(&self.config.slot_name, self.state.confirmed_lsn);
            self.connection_mut()?.query(&sql)?;
            debug!(lsn = %format_lsn(self.state.confirmed_lsn), "Advanced slot");
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(true),
        }
    }

    /// Poll until shutdown, reconnecting on a broken connection
    pub async fn run(&mut self) -> ReplicationResult<()> {
        info!(slot = %self.config.slot_name, "Starting peek consumer");
        let mut attempts = 0u32;

        loop {
            if self.shutdown_signal.load(Ordering::SeqCst) {
                info!("Shutdown signal received, stopping peek consumer");
                return Ok(());
            }

            match self.consume().await {
                Ok(true) => attempts = 0,
                Ok(false) => {
                    attempts = 0;
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                Err(e) if e.is_sink_failure() => {
                    attempts += 1;
                    if attempts > self.config.max_retries {
                        error!(
                            retries = self.config.max_retries,
                            "Giving up on refused change"
                        );
                        return Err(e);
                    }

                    warn!(
                        attempt = attempts,
                        max_retries = self.config.max_retries,
                        error = %e,
                        "Sink refused a change, peeking the batch again"
                    );
                    self.pipeline.reset();
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Err(e) if e.is_connection_broken() || (attempts > 0 && self.connection.is_none()) => {
                    attempts += 1;
                    if attempts > self.config.max_retries {
                        error!(
                            retries = self.config.max_retries,
                            "Giving up on peek connection"
                        );
                        return Err(e);
                    }

                    warn!(
                        attempt = attempts,
                        max_retries = self.config.max_retries,
                        error = %e,
                        "Peek connection lost, reconnecting"
                    );
                    self.connection = None;
                    self.pipeline.reset();
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
