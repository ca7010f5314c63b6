//! Event sink implementations for PostgreSQL logical replication

use crate::core::config::ReplicationConfig;
use crate::core::errors::ReplicationResult;
use crate::events::EventSink;
use std::sync::Arc;
use tracing::{info, warn};

pub mod pg_type_conversion;
pub mod queue;
pub mod stdout;

/// Registry for managing and creating event sinks
pub struct EventSinkRegistry;

impl EventSinkRegistry {
    /// Create an event sink based on configuration.
    ///
    /// A non-zero `sink_queue_capacity` puts the sink behind a bounded queue,
    /// which needs a running tokio runtime.
    pub fn create_sink(
        sink_type: &str,
        config: &ReplicationConfig,
    ) -> ReplicationResult<Arc<dyn EventSink>> {
        let sink: Arc<dyn EventSink> = match sink_type.to_lowercase().as_str() {
            "stdout" | "" => Arc::new(stdout::StdoutEventSink::new()),
            other => {
                warn!(sink_type = other, "Unknown sink type, falling back to stdout");
                Arc::new(stdout::StdoutEventSink::new())
            }
        };

        if config.sink_queue_capacity > 0 {
            info!(
                sink = sink.sink_type(),
                capacity = config.sink_queue_capacity,
                "Queueing sink writes"
            );
            return Ok(Arc::new(queue::QueuedEventSink::new(
                sink,
                config.sink_queue_capacity,
            )));
        }

        Ok(sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_sink() {
        let mut config = ReplicationConfig::default();
        let sink = EventSinkRegistry::create_sink("stdout", &config).unwrap();
        assert_eq!(sink.sink_type(), "stdout");

        let sink = EventSinkRegistry::create_sink("nope", &config).unwrap();
        assert_eq!(sink.sink_type(), "stdout");

        config.sink_queue_capacity = 16;
        let sink = EventSinkRegistry::create_sink("stdout", &config).unwrap();
        assert_eq!(sink.sink_type(), "queue");
        sink.shutdown().await.unwrap();
    }
}
