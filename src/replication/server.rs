//! Streaming replication session
//!
//! Owns the COPY-both replication connection:
//! - START_REPLICATION from a given LSN
//! - Keepalive and XLogData frame handling
//! - Periodic standby status updates
//! - Reconnect with a fixed delay, resuming at the last confirmed commit

use crate::core::config::ReplicationConfig;
use crate::core::errors::{ReplicationError, ReplicationResult};
use crate::protocol::cursor::RawBytes;
use crate::protocol::messages::{
    KEEPALIVE_TAG, KeepaliveMessage, StandbyStatusUpdate, XLOG_DATA_TAG, XLogDataMessage,
};
use crate::replication::lsn::format_lsn;
use crate::replication::pipeline::ChangePipeline;
use crate::replication::state::ReplicationState;
use crate::utils::binary::XLogRecPtr;
use crate::utils::connection::{
    CopyData, ReplicationTransport, TransportConnector, quote_identifier, quote_literal,
};
use crate::utils::timestamp::{format_timestamp_from_pg, system_time_to_postgres_timestamp};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;
use tracing::{debug, error, info, warn};

pub fn start_replication_sql(slot: &str, publication: &str, lsn: XLogRecPtr) -> String {
    format!(
        "START_REPLICATION SLOT {} LOGICAL {} (proto_version '1', publication_names {})",
        quote_identifier(slot),
        format_lsn(lsn),
        quote_literal(publication)
    )
}

pub struct StreamingSession<C: TransportConnector> {
    connector: C,
    config: ReplicationConfig,
    pipeline: ChangePipeline,
    state: ReplicationState,
    transport: Option<C::Transport>,
    start_lsn: XLogRecPtr,
    frames_received: u64,
    shutdown_signal: Arc<AtomicBool>,
}

impl<C: TransportConnector> StreamingSession<C> {
    pub fn new(
        connector: C,
        config: ReplicationConfig,
        pipeline: ChangePipeline,
        shutdown_signal: Arc<AtomicBool>,
    ) -> Self {
        Self {
            connector,
            config,
            pipeline,
            state: ReplicationState::new(),
            transport: None,
            start_lsn: 0,
            frames_received: 0,
            shutdown_signal,
        }
    }

    pub fn state(&self) -> &ReplicationState {
        &self.state
    }

    pub fn pipeline(&self) -> &ChangePipeline {
        &self.pipeline
    }

    /// Open the replication connection and start streaming from `start_lsn`
    pub fn start(&mut self, start_lsn: XLogRecPtr) -> ReplicationResult<()> {
        if self.start_lsn == 0 {
            self.start_lsn = start_lsn;
        }

        let sql = start_replication_sql(
            &self.config.slot_name,
            &self.config.publication_name,
            start_lsn,
        );
        info!(lsn = %format_lsn(start_lsn), slot = %self.config.slot_name, "Starting replication");

        let mut transport = self.connector.connect_transport()?;
        transport.start_copy_both(&sql)?;

        // Relation messages are resent on every new stream
        self.pipeline.reset();
        self.state = ReplicationState::starting_at(start_lsn);
        self.transport = Some(transport);

        info!("Started receiving data from database server");
        Ok(())
    }

    /// Stream until the server ends the COPY, shutdown is requested, or a
    /// fatal error occurs. The connection is torn down on every exit path.
    pub async fn run(&mut self) -> ReplicationResult<()> {
        let result = self.run_with_reconnect().await;
        self.teardown();
        result
    }

    async fn run_with_reconnect(&mut self) -> ReplicationResult<()> {
        let mut attempts = 0u32;

        loop {
            let frames_before = self.frames_received;
            let confirmed_before = self.state.confirmed_lsn;
            let err = match self.replication_loop().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_connection_broken() || e.is_sink_failure() => e,
                Err(e) => return Err(e),
            };

            // A refused change is replayed from the last commit, so only a
            // newly confirmed commit counts as progress
            let progressed = if err.is_sink_failure() {
                self.state.confirmed_lsn > confirmed_before
            } else {
                self.frames_received > frames_before
            };
            if progressed {
                attempts = 0;
            }
            if err.is_sink_failure() {
                warn!(error = %err, "Sink refused a change, restarting from last commit");
            } else {
                warn!(error = %err, "Replication connection lost");
            }
            self.transport = None;

            loop {
                attempts += 1;
                if attempts > self.config.max_retries {
                    error!(
                        retries = self.config.max_retries,
                        "Giving up on replication connection"
                    );
                    return Err(err);
                }

                tokio::time::sleep(self.config.retry_delay).await;
                let restart_lsn = self.state.restart_lsn(self.start_lsn);
                info!(
                    attempt = attempts,
                    max_retries = self.config.max_retries,
                    lsn = %format_lsn(restart_lsn),
                    "Reconnecting"
                );

                // The old walsender may still hold the slot, so a server
                // refusing START_REPLICATION is a failed attempt too
                match self.start(restart_lsn) {
                    Ok(()) => break,
                    Err(e @ (ReplicationError::ConnectionBroken { .. }
                    | ReplicationError::Connection { .. }
                    | ReplicationError::Protocol { .. }
                    | ReplicationError::NetworkIO(_))) => {
                        warn!(error = %e, "Reconnect attempt failed");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }

    fn transport_mut(&mut self) -> ReplicationResult<&mut C::Transport> {
        self.transport
            .as_mut()
            .ok_or_else(|| ReplicationError::protocol("Replication has not been started"))
    }

    async fn replication_loop(&mut self) -> ReplicationResult<()> {
        loop {
            if self.shutdown_signal.load(Ordering::SeqCst) {
                info!("Shutdown signal received, stopping replication");
                return Ok(());
            }

            let data = self.transport_mut()?.get_copy_data()?;
            match data {
                CopyData::WouldBlock => {
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                CopyData::Done => {
                    info!("Server ended the replication stream");
                    return Ok(());
                }
                CopyData::Frame(data) => {
                    self.frames_received += 1;
                    match data.first().copied() {
                        Some(KEEPALIVE_TAG) => self.process_keepalive_message(&data)?,
                        Some(XLOG_DATA_TAG) => self.process_wal_message(&data).await?,
                        Some(tag) => warn!("Received unknown message type: {}", tag as char),
                        None => debug!("Received empty frame"),
                    }
                }
            }

            self.check_and_send_feedback()?;
        }
    }

    fn process_keepalive_message(&mut self, data: &[u8]) -> ReplicationResult<()> {
        let keepalive = match KeepaliveMessage::try_from(data) {
            Ok(keepalive) => keepalive,
            Err(e) => {
                warn!(error = %e, "Malformed keepalive message");
                return Ok(());
            }
        };

        self.state.update_received_lsn(keepalive.wal_end);

        if keepalive.reply_requested {
            debug!(
                server_time = %format_timestamp_from_pg(keepalive.server_time),
                "Server requested feedback in keepalive"
            );
            self.send_feedback()?;
        }
        Ok(())
    }

    /// Decode and apply one WAL message. A message that does not decode is
    /// skipped; a refused apply is returned without marking it processed.
    async fn process_wal_message(&mut self, data: &[u8]) -> ReplicationResult<()> {
        let xlog = match XLogDataMessage::try_from(data) {
            Ok(xlog) => xlog,
            Err(e) => {
                warn!(error = %e, "Malformed XLogData message");
                return Ok(());
            }
        };

        self.state.update_received_lsn(xlog.data_start);
        self.state.current_lsn = xlog.data_start;

        match self
            .pipeline
            .process::<RawBytes>(xlog.payload, &mut self.state)
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_decode_error() => {
                warn!(
                    lsn = %format_lsn(xlog.data_start),
                    error = %e,
                    "Failed to decode replication message, skipping"
                );
            }
            Err(e) => {
                error!(
                    lsn = %format_lsn(xlog.data_start),
                    error = %e,
                    "Failed to apply replication message"
                );
                return Err(e);
            }
        }

        self.state.mark_processed();
        Ok(())
    }

    fn send_feedback(&mut self) -> ReplicationResult<()> {
        let update = StandbyStatusUpdate {
            received_lsn: self.state.last_received_lsn,
            flushed_lsn: self.state.last_processed_lsn,
            applied_lsn: self.state.last_processed_lsn,
            client_time: system_time_to_postgres_timestamp(SystemTime::now()),
            reply_requested: false,
        };
        let buf = update.encode()?;

        let transport = self.transport_mut()?;
        transport.put_copy_data(&buf)?;
        transport.flush()?;

        self.state.update_feedback_time();
        debug!(
            received = %format_lsn(update.received_lsn),
            processed = %format_lsn(update.flushed_lsn),
            "Sent standby status update"
        );
        Ok(())
    }

    fn check_and_send_feedback(&mut self) -> ReplicationResult<()> {
        if self.state.should_send_feedback(self.config.feedback_interval) {
            self.send_feedback()?;
        }
        Ok(())
    }

    /// Final feedback attempt, then close the connection
    fn teardown(&mut self) {
        if self.transport.is_none() {
            return;
        }

        match self.send_feedback() {
            Ok(()) => info!(
                lsn = %format_lsn(self.state.last_processed_lsn),
                "Sent final feedback"
            ),
            Err(e) => warn!(error = %e, "Failed to send final feedback"),
        }
        self.transport = None;
    }
}
