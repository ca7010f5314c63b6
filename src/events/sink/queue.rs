//! Bounded queue in front of another sink
//!
//! Changes are handed to a worker task through a bounded channel so a slow
//! sink does not stall the replication loop. When the queue is full the
//! change is rejected rather than waited on.

use crate::core::errors::{ReplicationError, ReplicationResult};
use crate::events::{EventSink, RowChange};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

pub struct QueuedEventSink {
    inner_type: &'static str,
    sender: Mutex<Option<mpsc::Sender<RowChange>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl QueuedEventSink {
    /// Wrap `inner`, spawning the worker on the current runtime
    pub fn new(inner: Arc<dyn EventSink>, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let inner_type = inner.sink_type();
        let worker = tokio::spawn(Self::run_worker(receiver, inner));

        Self {
            inner_type,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        }
    }

    async fn run_worker(mut receiver: mpsc::Receiver<RowChange>, inner: Arc<dyn EventSink>) {
        while let Some(change) = receiver.recv().await {
            if let Err(e) = inner.apply(&change).await {
                error!(
                    sink = inner.sink_type(),
                    table = change.table(),
                    error = %e,
                    "Queued change failed to apply"
                );
            }
        }

        debug!(sink = inner.sink_type(), "Queue drained, shutting down inner sink");
        if let Err(e) = inner.shutdown().await {
            error!(sink = inner.sink_type(), error = %e, "Inner sink shutdown failed");
        }
    }
}

#[async_trait]
impl EventSink for QueuedEventSink {
    async fn apply(&self, change: &RowChange) -> ReplicationResult<()> {
        let guard = self
            .sender
            .lock()
            .map_err(|_| ReplicationError::sink(self.sink_type(), "sender lock poisoned"))?;
        let Some(sender) = guard.as_ref() else {
            return Err(ReplicationError::sink(self.sink_type(), "queue is closed"));
        };

        match sender.try_send(change.clone()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(rejected)) => {
                warn!(
                    sink = self.inner_type,
                    table = rejected.table(),
                    "Sink queue full, rejecting change"
                );
                Err(ReplicationError::sink(self.sink_type(), "queue is full"))
            }
            Err(TrySendError::Closed(_)) => {
                Err(ReplicationError::sink(self.sink_type(), "queue worker stopped"))
            }
        }
    }

    fn sink_type(&self) -> &'static str {
        "queue"
    }

    /// Close the queue and wait for queued changes to be applied
    async fn shutdown(&self) -> ReplicationResult<()> {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }

        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(worker) = worker {
            worker.await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Row;
    use crate::events::testing::RecordingSink;
    use serde_json::json;

    fn insert(id: i64) -> RowChange {
        let mut row = Row::new();
        row.insert("id".to_string(), json!(id));
        RowChange::Insert {
            table: "public.students".to_string(),
            row,
        }
    }

    #[tokio::test]
    async fn test_queue_delivers_in_order() {
        let inner = Arc::new(RecordingSink::default());
        let queue = QueuedEventSink::new(inner.clone(), 8);

        for id in 1..=3 {
            queue.apply(&insert(id)).await.unwrap();
        }
        queue.shutdown().await.unwrap();

        assert_eq!(inner.recorded(), vec![insert(1), insert(2), insert(3)]);
    }

    #[tokio::test]
    async fn test_full_queue_rejects() {
        let inner = Arc::new(RecordingSink::default());
        let queue = QueuedEventSink::new(inner.clone(), 1);

        // The worker has not run yet on this single-threaded runtime
        queue.apply(&insert(1)).await.unwrap();
        let err = queue.apply(&insert(2)).await.unwrap_err();
        assert!(matches!(err, ReplicationError::Sink { .. }));

        queue.shutdown().await.unwrap();
        assert_eq!(inner.recorded(), vec![insert(1)]);
    }

    #[tokio::test]
    async fn test_apply_after_shutdown_fails() {
        let queue = QueuedEventSink::new(Arc::new(RecordingSink::default()), 4);
        queue.shutdown().await.unwrap();
        assert!(queue.apply(&insert(1)).await.is_err());
    }
}
