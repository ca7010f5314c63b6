//! Replication module for PostgreSQL logical replication
//!
//! Slot and publication setup, the two change transports (COPY-both
//! streaming and peek/advance polling), and the pipeline they share.

pub mod lifecycle;
pub mod lsn;
pub mod metadata;
pub mod peek;
pub mod pipeline;
pub mod relation_cache;
pub mod server;
pub mod state;

// Re-export for convenience
pub use lifecycle::{Handoff, SlotLifecycle};
pub use metadata::CatalogPrimaryKeyLookup;
pub use peek::PeekConsumer;
pub use pipeline::ChangePipeline;
pub use relation_cache::{PrimaryKeyLookup, RelationCache};
pub use server::StreamingSession;
pub use state::ReplicationState;
