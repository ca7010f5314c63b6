//! Replication state management
//!
//! LSN positions, commit tracking and feedback timing for one consumer.

use crate::utils::binary::{INVALID_XLOG_REC_PTR, XLogRecPtr};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct ReplicationState {
    /// LSN of the message currently being decoded
    pub current_lsn: XLogRecPtr,
    /// LSN of the last commit seen; safe restart point
    pub confirmed_lsn: XLogRecPtr,
    /// Set by a Commit message, cleared by the consumer once acted on
    pub committed: bool,
    /// Highest LSN received from the server
    pub last_received_lsn: XLogRecPtr,
    /// Highest LSN whose message has been handled
    pub last_processed_lsn: XLogRecPtr,
    /// When we last sent feedback to the server
    pub last_feedback_time: Instant,
}

impl ReplicationState {
    pub fn new() -> Self {
        Self::starting_at(INVALID_XLOG_REC_PTR)
    }

    /// State for a stream resuming at `lsn`
    pub fn starting_at(lsn: XLogRecPtr) -> Self {
        Self {
            current_lsn: lsn,
            confirmed_lsn: lsn,
            committed: false,
            last_received_lsn: lsn,
            last_processed_lsn: lsn,
            last_feedback_time: Instant::now(),
        }
    }

    /// Updates the received LSN if the new value is higher
    pub fn update_received_lsn(&mut self, lsn: XLogRecPtr) {
        if lsn > INVALID_XLOG_REC_PTR {
            self.last_received_lsn = self.last_received_lsn.max(lsn);
        }
    }

    /// Everything received so far has been handled
    pub fn mark_processed(&mut self) {
        self.last_processed_lsn = self.last_processed_lsn.max(self.last_received_lsn);
    }

    /// Record a commit at the current position
    pub fn commit(&mut self) {
        self.confirmed_lsn = self.current_lsn;
        self.committed = true;
    }

    /// Returns and clears the committed flag
    pub fn take_committed(&mut self) -> bool {
        std::mem::take(&mut self.committed)
    }

    /// Where a new stream should resume
    pub fn restart_lsn(&self, fallback: XLogRecPtr) -> XLogRecPtr {
        if self.confirmed_lsn > INVALID_XLOG_REC_PTR {
            self.confirmed_lsn
        } else {
            fallback
        }
    }

    pub fn should_send_feedback(&self, interval: Duration) -> bool {
        self.last_feedback_time.elapsed() >= interval
    }

    pub fn update_feedback_time(&mut self) {
        self.last_feedback_time = Instant::now();
    }
}

impl Default for ReplicationState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_received_lsn_is_monotonic() {
        let mut state = ReplicationState::new();
        state.update_received_lsn(100);
        state.update_received_lsn(50);
        state.update_received_lsn(0);
        assert_eq!(state.last_received_lsn, 100);

        state.mark_processed();
        assert_eq!(state.last_processed_lsn, 100);
    }

    #[test]
    fn test_commit_confirms_current_lsn() {
        let mut state = ReplicationState::starting_at(10);
        assert_eq!(state.restart_lsn(7), 10);

        state.current_lsn = 42;
        state.commit();
        state.commit();
        assert_eq!(state.confirmed_lsn, 42);
        assert!(state.take_committed());
        assert!(!state.take_committed());
        assert_eq!(state.restart_lsn(7), 42);
    }

    #[test]
    fn test_restart_falls_back_before_any_commit() {
        let state = ReplicationState::new();
        assert_eq!(state.restart_lsn(0x500), 0x500);
    }

    #[test]
    fn test_feedback_timing() {
        let mut state = ReplicationState::new();
        assert!(!state.should_send_feedback(Duration::from_secs(60)));
        assert!(state.should_send_feedback(Duration::ZERO));
        state.update_feedback_time();
        assert!(!state.should_send_feedback(Duration::from_secs(60)));
    }
}
