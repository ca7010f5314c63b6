//! Core module containing fundamental types and configurations
//!
//! Configuration management and error handling shared by every other module.

pub mod config;
pub mod errors;

// Re-export for convenience
pub use config::{ReplicationConfig, TransportMode};
pub use errors::{ReplicationError, ReplicationResult};
