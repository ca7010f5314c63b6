//! wal2sink - PostgreSQL logical replication client
//!
//! Sets up a publication and replication slot, copies the configured tables
//! from the exported snapshot, then follows the change feed into a sink.

use anyhow::{Context, Result};
use clap::Parser;
use std::env;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{Instrument, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use wal2sink::core::{ReplicationConfig, TransportMode};
use wal2sink::events::EventSinkRegistry;
use wal2sink::replication::{
    CatalogPrimaryKeyLookup, ChangePipeline, PeekConsumer, SlotLifecycle, StreamingSession,
};
use wal2sink::replication::lsn::format_lsn;
use wal2sink::tracing_context::SessionContext;
use wal2sink::utils::{ConnectionFactory, LibpqConnector};

/// Flags override the environment variable named in each description
#[derive(Parser, Debug)]
#[command(
    name = "wal2sink",
    about = "PostgreSQL logical replication into pluggable sinks",
    version
)]
struct Args {
    /// Connection string (DATABASE_URL)
    #[arg(long)]
    database_url: Option<String>,

    /// Comma separated tables to replicate (TABLES)
    #[arg(long)]
    tables: Option<String>,

    /// Replication slot name (SLOT_NAME)
    #[arg(long)]
    slot: Option<String>,

    /// Publication name (PUB_NAME)
    #[arg(long)]
    publication: Option<String>,

    /// Derive slot and publication names from the database and this name (REPLICATION_NAME)
    #[arg(long)]
    replication_name: Option<String>,

    /// `streaming` or `peek` (TRANSPORT)
    #[arg(long)]
    transport: Option<String>,

    /// Sink type (SINK)
    #[arg(long)]
    sink: Option<String>,

    /// Changes fetched per peek (BATCH_SIZE)
    #[arg(long)]
    batch_size: Option<usize>,

    /// Start streaming without copying existing rows (SKIP_INITIAL_SYNC)
    #[arg(long)]
    skip_initial_sync: bool,

    /// Abort when a table fails to sync (FATAL_SYNC_ERRORS)
    #[arg(long)]
    fatal_sync_errors: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

impl Args {
    fn lookup(&self, key: &str) -> Option<String> {
        let flag = match key {
            "DATABASE_URL" => self.database_url.clone(),
            "TABLES" => self.tables.clone(),
            "SLOT_NAME" => self.slot.clone(),
            "PUB_NAME" => self.publication.clone(),
            "REPLICATION_NAME" => self.replication_name.clone(),
            "TRANSPORT" => self.transport.clone(),
            "SINK" => self.sink.clone(),
            "BATCH_SIZE" => self.batch_size.map(|n| n.to_string()),
            "SKIP_INITIAL_SYNC" => self.skip_initial_sync.then(|| "true".to_string()),
            "FATAL_SYNC_ERRORS" => self.fatal_sync_errors.then(|| "true".to_string()),
            _ => None,
        };
        flag.or_else(|| env::var(key).ok())
    }
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        fmt().json().with_env_filter(filter).with_target(false).init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.json_logs);

    match run(args).await {
        Ok(()) => {
            info!("wal2sink stopped");
            Ok(())
        }
        Err(e) => {
            error!("wal2sink failed: {:#}", e);
            Err(e)
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let config = ReplicationConfig::from_lookup(|key| args.lookup(key))?;
    config.validate().context("Invalid configuration")?;

    let context = SessionContext::new(config.transport);
    info!(
        session_id = %context.session_id,
        tables = ?config.tables,
        transport = %config.transport,
        "Starting wal2sink"
    );

    let sink = EventSinkRegistry::create_sink(&config.sink_type, &config)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down");
            flag.store(true, Ordering::SeqCst);
        }
    });

    let mut lifecycle = SlotLifecycle::new(
        LibpqConnector::new(config.connection_string.clone()),
        config,
    );
    let handoff = lifecycle
        .run(sink.as_ref())
        .instrument(context.child_context("setup").span)
        .await
        .context("Replication setup failed")?;
    context.record_slot(&handoff.slot_name);
    info!(
        slot = %handoff.slot_name,
        publication = %handoff.publication_name,
        lsn = %format_lsn(handoff.start_lsn),
        recreated = handoff.recreated,
        "Setup complete"
    );

    let config = lifecycle.config().clone();
    let mut connector = lifecycle.into_factory();

    let metadata_connection = connector
        .connect()
        .context("Failed to open metadata connection")?;
    let pipeline = ChangePipeline::new(
        sink.clone(),
        Box::new(CatalogPrimaryKeyLookup::new(metadata_connection)),
    );

    let result = match config.transport {
        TransportMode::Streaming => {
            let mut session = StreamingSession::new(connector, config, pipeline, shutdown);
            match session.start(handoff.start_lsn) {
                Ok(()) => {
                    session
                        .run()
                        .instrument(context.child_context("streaming").span)
                        .await
                }
                Err(e) => Err(e),
            }
        }
        TransportMode::Peek => {
            let mut consumer = PeekConsumer::new(connector, config, pipeline, shutdown);
            consumer
                .run()
                .instrument(context.child_context("peek").span)
                .await
        }
    };

    if let Err(e) = sink.shutdown().await {
        warn!(error = %e, "Sink shutdown failed");
    }

    result.context("Replication stopped")?;
    Ok(())
}
