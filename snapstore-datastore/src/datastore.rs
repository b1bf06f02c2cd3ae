//! Process-scoped handle bundling a [`ContentStore`] and [`MetadataStore`]
//! rooted at the same storage directory (§9 design note).
//!
//! Neither service is a singleton: callers open a `Datastore`, pass it
//! around as `Arc<Datastore>`, and it is torn down with the process (or the
//! scope) that opened it.

use std::path::Path;

use anyhow::Error;

use snapstore_api_types::DatastoreFSyncLevel;
use snapstore_buildcfg::ORPHAN_GRACE_SECS;

use crate::content_store::ContentStore;
use crate::metadata_store::MetadataStore;

pub struct Datastore {
    pub content: ContentStore,
    pub metadata: MetadataStore,
}

impl Datastore {
    /// Opens (creating if needed) a datastore rooted at `base`: chunk blobs
    /// and the chunk index live directly under `base` (see
    /// [`ContentStore::open`]), snapshot/file metadata in
    /// `base/metadata.db`.
    ///
    /// Also reaps any `building` snapshot left behind by a process that
    /// crashed mid-backup, same grace window as the chunk store's orphan
    /// blob sweep.
    pub fn open<P: AsRef<Path>>(base: P, sync_level: DatastoreFSyncLevel) -> Result<Self, Error> {
        let base = base.as_ref();
        let content = ContentStore::open(base, sync_level)?;
        let metadata = MetadataStore::open(base.join("metadata.db"))?;
        metadata.reap_stale_building_snapshots(&content, proxmox_time::epoch_i64(), ORPHAN_GRACE_SECS)?;
        Ok(Self { content, metadata })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn open_creates_both_backing_stores() {
        let dir = tempfile::tempdir().unwrap();
        let store = Datastore::open(dir.path(), DatastoreFSyncLevel::None).unwrap();

        let (hash, _) = store.content.put(b"hello").unwrap();
        assert!(store.content.exists(&hash));

        let snapshot_id = store.metadata.create_snapshot("s", "", 0, None).unwrap();
        assert!(store.metadata.get_snapshot(snapshot_id).unwrap().is_some());
    }
}
