//! Change tracking for incremental backups (§4.7): an append-only
//! modification journal, a per-file dirty-block bitmap, and a debounced
//! filesystem watch service that feeds both.
//!
//! All three are process-local caches in the sense that losing them only
//! ever degrades an incremental backup to a full one — `BackupEngine`
//! falls back to `mtime > parent.created_at` comparison whenever the
//! journal doesn't cover a file.

pub mod bitmap;
pub mod journal;
pub mod watch;

pub use bitmap::BlockBitmap;
pub use journal::{JournalEvent, ModificationJournal};
pub use watch::{FileChangeEvent, WatchConfig, WatchService};
