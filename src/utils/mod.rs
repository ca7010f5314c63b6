//! Utility functions for PostgreSQL replication
//!
//! This module provides utility functions organized by category:
//! - Binary data manipulation
//! - Timestamp conversion
//! - PostgreSQL connection handling

pub mod binary;
pub mod connection;
pub mod timestamp;

// Re-export for convenience
pub use connection::{
    ConnectionFactory, CopyData, LibpqConnector, PGConnection, QueryRows, ReplicationTransport,
    SqlExecutor, TransportConnector,
};
