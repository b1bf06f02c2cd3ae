//! Orchestration layer: backup, restore and retention on top of
//! `snapstore-datastore` and `snapstore-tracker`.
//!
//! Nothing here owns storage directly — each engine borrows an
//! `Arc<Datastore>` (process-scoped, opened once by the embedder) and a
//! `CancellationToken`/`ProgressSink` pair supplied at construction.

pub mod backup;
pub mod progress;
pub mod restore;
pub mod retention;
pub mod scanner;

pub use backup::{BackupEngine, BackupResult, BackupState};
pub use progress::{CancellationToken, ChannelProgressSink, NullProgressSink, ProgressSink, ProgressUpdate};
pub use restore::{RestoreEngine, RestoreOptions, RestoreResult};
pub use retention::{RetentionEngine, RetentionPolicyConfig, RetentionResult};
pub use scanner::{scan, BackupOptions, ScannedFile};
