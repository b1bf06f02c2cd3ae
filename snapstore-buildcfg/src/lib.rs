//! Exports configuration data from the build system, and the handful of
//! well-known paths/constants the rest of the engine uses as defaults.

pub const SNAPSTORE_PKG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION_MAJOR"),
    ".",
    env!("CARGO_PKG_VERSION_MINOR"),
);
pub const SNAPSTORE_PKG_RELEASE: &str = env!("CARGO_PKG_VERSION_PATCH");
pub const SNAPSTORE_PKG_REPOID: &str = env!("REPOID");

/// Default chunk-size bounds for content-defined chunking (§4.2).
pub const CDC_MIN_SIZE: usize = 16 * 1024;
pub const CDC_AVG_SIZE: usize = 64 * 1024;
pub const CDC_MAX_SIZE: usize = 256 * 1024;

/// Block size used by the dirty bitmap (§3 BlockBitmap).
pub const DIRTY_BLOCK_SIZE: u64 = 4096;

/// Default debounce window for the filesystem watch service (§4.7).
pub const WATCH_DEBOUNCE_MS: u64 = 500;

/// Default per-operation timeout for blob writes and index commits (§5).
pub const IO_TIMEOUT_SECS: u64 = 30;

/// Grace period before a reaper removes an orphaned `BUILDING` snapshot (§4.8)
/// or an orphaned chunk blob with no index entry (§4.4).
pub const ORPHAN_GRACE_SECS: i64 = 3600;

/// Bounded retry policy for storage writes (§4.8): attempt count and base backoff.
pub const STORAGE_WRITE_RETRIES: u32 = 3;
pub const STORAGE_WRITE_BACKOFF_MS: u64 = 100;

#[macro_export]
macro_rules! SNAPSTORE_RUN_DIR_M {
    () => {
        "/run/snapstore"
    };
}

#[macro_export]
macro_rules! SNAPSTORE_STATE_DIR_M {
    () => {
        "/var/lib/snapstore"
    };
}

/// namespaced directory for in-memory (tmpfs) run state
pub const SNAPSTORE_RUN_DIR: &str = SNAPSTORE_RUN_DIR_M!();

/// namespaced directory for persistent state
pub const SNAPSTORE_STATE_DIR: &str = SNAPSTORE_STATE_DIR_M!();
