//! wal2sink: PostgreSQL logical replication into pluggable sinks
//!
//! Decodes the pgoutput protocol from a replication slot, either streamed
//! over COPY-both or polled with the peek/advance SQL functions, and hands
//! typed row changes to an [`events::EventSink`].

pub mod core;
pub mod events;
pub mod protocol;
pub mod replication;
pub mod tracing_context;
pub mod utils;
