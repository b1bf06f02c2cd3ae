//! Deduplicating, content-addressed backup engine.
//!
//! This crate is a thin facade over the workspace's subcrates:
//! [`snapstore_datastore`] (chunking, content-addressable storage, snapshot
//! metadata, Merkle diff), [`snapstore_tracker`] (change tracking for
//! incremental backups) and [`snapstore_engine`] (backup/restore/retention
//! orchestration). Most embedders only need the re-exports below.

pub use snapstore_api_types as api_types;
pub use snapstore_datastore as datastore;
pub use snapstore_engine as engine;
pub use snapstore_tracker as tracker;

pub use snapstore_datastore::{ChunkerConfig, ContentStore, Datastore, FileRecord, MetadataStore, Snapshot};
pub use snapstore_engine::{
    BackupEngine, BackupOptions, BackupResult, BackupState, CancellationToken, ProgressSink,
    ProgressUpdate, RestoreEngine, RestoreOptions, RestoreResult, RetentionEngine,
    RetentionPolicyConfig, RetentionResult,
};
pub use snapstore_tracker::{BlockBitmap, ModificationJournal, WatchConfig, WatchService};

/// Initializes `env_logger` from `RUST_LOG`, falling back to `info` level.
/// Mirrors how the teacher's binaries wire logging at the process edge
/// while every library crate only calls through the `log` facade.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).try_init();
}

#[cfg(test)]
mod test {
    use super::*;
    use snapstore_api_types::DatastoreFSyncLevel;
    use std::sync::Arc;

    #[test]
    fn facade_reexports_resolve_to_a_usable_datastore() {
        let dir = tempfile::tempdir().unwrap();
        let store = Datastore::open(dir.path(), DatastoreFSyncLevel::None).unwrap();
        let store = Arc::new(store);
        let engine = BackupEngine::new(store);
        let _ = engine.cancellation_token();
    }
}
