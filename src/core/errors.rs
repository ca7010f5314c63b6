//! Error types for the replication client
//! Structured error handling using thiserror, with constructor helpers per kind

use thiserror::Error;

/// Main error type for wal2sink
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Buffer shorter than the field being read requires
    #[error("Truncated message: needed {needed} byte(s) at position {position}, {available} available")]
    TruncatedMessage {
        needed: usize,
        position: usize,
        available: usize,
    },

    /// Unrecognized message tag or malformed message
    #[error("Protocol error: {message}")]
    Protocol {
        message: String,
        context: Option<String>,
    },

    /// Invalid setup argument (slot name, table list, snapshot)
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Connection lost mid-stream; eligible for reconnect
    #[error("Connection broken: {message}")]
    ConnectionBroken { message: String },

    /// Connection could not be established
    #[error("Database connection error: {message}")]
    Connection { message: String },

    /// Primary key lookup failed for a table
    #[error("Metadata lookup failed for {table}: {message}")]
    MetadataLookupFailed { table: String, message: String },

    /// Query returned a non-success status
    #[error("Query failed: {message}")]
    Query { message: String },

    /// Configuration related errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Sink error ({sink}): {message}")]
    Sink { message: String, sink: String },

    #[error("Network IO error")]
    NetworkIO(#[from] std::io::Error),

    #[error("String conversion error")]
    StringConversion(#[from] std::string::FromUtf8Error),

    #[error("C string conversion error")]
    CStringConversion(#[from] std::ffi::NulError),

    #[error("Task execution error")]
    TaskExecution(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for convenience
pub type ReplicationResult<T> = std::result::Result<T, ReplicationError>;

impl ReplicationError {
    pub fn truncated(needed: usize, position: usize, available: usize) -> Self {
        Self::TruncatedMessage {
            needed,
            position,
            available,
        }
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
            context: None,
        }
    }

    pub fn protocol_with_context<S: Into<String>, C: Into<String>>(message: S, context: C) -> Self {
        Self::Protocol {
            message: message.into(),
            context: Some(context.into()),
        }
    }

    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn connection_broken<S: Into<String>>(message: S) -> Self {
        Self::ConnectionBroken {
            message: message.into(),
        }
    }

    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn metadata<T: Into<String>, S: Into<String>>(table: T, message: S) -> Self {
        Self::MetadataLookupFailed {
            table: table.into(),
            message: message.into(),
        }
    }

    pub fn query<S: Into<String>>(message: S) -> Self {
        Self::Query {
            message: message.into(),
        }
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn sink<S: Into<String>, K: Into<String>>(sink: K, message: S) -> Self {
        Self::Sink {
            message: message.into(),
            sink: sink.into(),
        }
    }

    /// Whether the error should be handled by the reconnect policy
    pub fn is_connection_broken(&self) -> bool {
        matches!(self, Self::ConnectionBroken { .. } | Self::NetworkIO(_))
    }

    /// A message that could not be decoded; it is skipped, not retried
    pub fn is_decode_error(&self) -> bool {
        matches!(self, Self::TruncatedMessage { .. } | Self::Protocol { .. })
    }

    /// The sink refused a change; nothing past it may be confirmed
    pub fn is_sink_failure(&self) -> bool {
        matches!(self, Self::Sink { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_broken_classification() {
        assert!(ReplicationError::connection_broken("server closed the connection").is_connection_broken());
        assert!(!ReplicationError::protocol("unexpected message tag").is_connection_broken());
        assert!(!ReplicationError::connection("refused").is_connection_broken());
    }

    #[test]
    fn test_decode_and_sink_classification() {
        assert!(ReplicationError::truncated(4, 0, 1).is_decode_error());
        assert!(ReplicationError::protocol("unknown tag").is_decode_error());
        assert!(!ReplicationError::sink("stdout", "closed").is_decode_error());
        assert!(ReplicationError::sink("stdout", "closed").is_sink_failure());
        assert!(!ReplicationError::query("timeout").is_sink_failure());
    }

    #[test]
    fn test_truncated_message_display() {
        let err = ReplicationError::truncated(4, 10, 2);
        assert_eq!(
            err.to_string(),
            "Truncated message: needed 4 byte(s) at position 10, 2 available"
        );
    }
}
