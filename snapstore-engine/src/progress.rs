//! Structured progress reporting and cooperative cancellation (§6, §5).
//!
//! Mirrors how the teacher passes a `WorkerTaskContext` trait object down
//! into long-running operations for logging/cancellation: here a
//! `ProgressSink` is supplied at construction and consulted between files
//! and between chunks, never held across blocking I/O.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::backup::BackupState;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub state: BackupState,
    pub files_processed: u64,
    pub total_files: u64,
    pub bytes_processed: u64,
    pub total_bytes: u64,
    pub current_file: String,
}

pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, update: &ProgressUpdate);
}

/// A sink that does nothing; the default when no caller supplies one.
#[derive(Default)]
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn on_progress(&self, _update: &ProgressUpdate) {}
}

/// Forwards every update over an unbounded channel. A slow or absent
/// receiver never blocks the run it's observing.
pub struct ChannelProgressSink {
    sender: crossbeam_channel::Sender<ProgressUpdate>,
}

impl ChannelProgressSink {
    pub fn new() -> (Self, crossbeam_channel::Receiver<ProgressUpdate>) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        (Self { sender }, receiver)
    }
}

impl ProgressSink for ChannelProgressSink {
    fn on_progress(&self, update: &ProgressUpdate) {
        let _ = self.sender.send(update.clone());
    }
}

/// Shared cooperative-cancellation flag, checked between files and
/// between chunks. Cheap to clone; every clone shares the same flag.
#[derive(Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cancellation_token_is_observed_across_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn channel_sink_forwards_updates() {
        let (sink, receiver) = ChannelProgressSink::new();
        sink.on_progress(&ProgressUpdate {
            state: BackupState::Chunking,
            files_processed: 1,
            total_files: 2,
            bytes_processed: 100,
            total_bytes: 200,
            current_file: "a.txt".into(),
        });
        let update = receiver.try_recv().unwrap();
        assert_eq!(update.current_file, "a.txt");
    }
}
