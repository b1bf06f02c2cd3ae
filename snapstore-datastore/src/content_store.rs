//! Content-addressable storage layered on [`crate::chunk_store`] and
//! [`crate::chunk_index`] (§4.4).
//!
//! `put` is the one place in the stack that enforces the content-address
//! invariant: bytes always live at the location their own hash names.
//! Concurrent `put`s of the same hash are coalesced — a striped lock keyed
//! on the hash's first byte ensures only one of them writes the blob,
//! while the rest observe `AlreadyPresent` and just bump the refcount.

use std::path::Path;
use std::sync::Mutex;

use anyhow::Error;

use snapstore_api_types::{digest_to_hex, DatastoreFSyncLevel, Digest, EngineError};
use snapstore_buildcfg::ORPHAN_GRACE_SECS;

use crate::chunk_index::{ChunkIndex, PutOutcome};
use crate::chunk_store::ChunkStore;
use crate::hasher::hash_buffer;

const STRIPE_COUNT: usize = 256;

pub struct ContentStore {
    store: ChunkStore,
    index: ChunkIndex,
    stripes: Vec<Mutex<()>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutResult {
    /// This call wrote the blob; the chunk's refcount is now 1.
    Stored,
    /// The blob already existed; an existing reference's refcount was
    /// incremented instead of writing new bytes.
    Deduplicated,
}

impl ContentStore {
    pub fn open<P: AsRef<Path>>(base: P, sync_level: DatastoreFSyncLevel) -> Result<Self, Error> {
        let base = base.as_ref();
        let store = ChunkStore::open(base.join("chunks"), sync_level)?;
        let index = ChunkIndex::open(base.join("index.db"))?;
        let stripes = (0..STRIPE_COUNT).map(|_| Mutex::new(())).collect();
        let content_store = Self {
            store,
            index,
            stripes,
        };
        content_store.sweep_orphan_blobs(ORPHAN_GRACE_SECS)?;
        Ok(content_store)
    }

    /// Removes blobs on disk with no chunk-index entry, older than
    /// `grace_secs`. These are left behind by a crash between a blob write
    /// and its index commit (or, conversely — see [`Self::delete`] — are
    /// never created in the first place once that ordering holds), or by a
    /// `compact` that dropped a zero-refcount entry out from under a blob
    /// that `ChunkStore::remove` itself then failed to delete. The grace
    /// window protects a blob whose index commit is merely in flight, not
    /// yet orphaned.
    pub fn sweep_orphan_blobs(&self, grace_secs: i64) -> Result<usize, Error> {
        let now = proxmox_time::epoch_i64();
        let mut removed = 0;
        for (hash, mtime) in self.store.iter_blobs()? {
            if self.index.contains(&hash) {
                continue;
            }
            if now - mtime >= grace_secs {
                self.store.remove(&hash)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn stripe(&self, hash: &Digest) -> &Mutex<()> {
        &self.stripes[hash[0] as usize % STRIPE_COUNT]
    }

    /// Stores `data`, returning its digest and whether this call actually
    /// wrote new bytes or deduplicated against an existing chunk.
    pub fn put(&self, data: &[u8]) -> Result<(Digest, PutResult), Error> {
        let hash = hash_buffer(data);
        let _guard = self.stripe(&hash).lock().unwrap();

        match self.index.put_if_absent(&hash, data.len() as u64, &[])? {
            PutOutcome::Inserted => {
                self.store.write(&hash, data)?;
                Ok((hash, PutResult::Stored))
            }
            PutOutcome::AlreadyPresent => {
                self.index.incref(&hash)?;
                Ok((hash, PutResult::Deduplicated))
            }
        }
    }

    /// Reads a chunk back, verifying its bytes still hash to `hash`.
    pub fn get(&self, hash: &Digest) -> Result<Vec<u8>, EngineError> {
        if !self.index.contains(hash) {
            return Err(EngineError::not_found(format!(
                "chunk {} not found",
                digest_to_hex(hash)
            )));
        }
        let data = self
            .store
            .read(hash)
            .map_err(|err| EngineError::io(err.to_string()))?;
        if hash_buffer(&data) != *hash {
            return Err(EngineError::corrupted_chunk(format!(
                "chunk {} failed integrity check",
                digest_to_hex(hash)
            )));
        }
        Ok(data)
    }

    pub fn exists(&self, hash: &Digest) -> bool {
        self.index.contains(hash)
    }

    pub fn incref(&self, hash: &Digest) -> Result<u32, Error> {
        self.index.incref(hash)
    }

    /// Decrements the reference count, removing the blob once it reaches
    /// zero. The blob is removed first, the index entry second: if the
    /// process crashes between the two, at worst a dangling-but-unreferenced
    /// blob survives (cleaned up later by [`Self::sweep_orphan_blobs`]),
    /// never a referenced chunk with missing bytes. The stripe lock already
    /// held for this hash means the refcount this call observes cannot
    /// change under it, so it's safe to decide the blob removal before the
    /// index commit makes it durable.
    pub fn delete(&self, hash: &Digest) -> Result<(), Error> {
        let _guard = self.stripe(hash).lock().unwrap();
        if self.index.lookup(hash).refcount == 1 {
            self.store.remove(hash)?;
        }
        self.index.decref(hash)?;
        Ok(())
    }

    pub fn chunk_count(&self) -> usize {
        self.index.len()
    }

    /// Current refcount for `hash`, or 0 if it isn't tracked.
    pub fn refcount(&self, hash: &Digest) -> u32 {
        self.index.lookup(hash).refcount
    }

    pub fn compact(&self) -> Result<(), Error> {
        self.index.compact()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn put_dedups_identical_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path(), DatastoreFSyncLevel::None).unwrap();

        let data = b"same content, twice".to_vec();
        let (hash1, result1) = store.put(&data).unwrap();
        let (hash2, result2) = store.put(&data).unwrap();

        assert_eq!(hash1, hash2);
        assert_eq!(result1, PutResult::Stored);
        assert_eq!(result2, PutResult::Deduplicated);
        assert_eq!(store.index.lookup(&hash1).refcount, 2);
    }

    #[test]
    fn get_returns_stored_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path(), DatastoreFSyncLevel::None).unwrap();

        let data = b"round trip me".to_vec();
        let (hash, _) = store.put(&data).unwrap();
        assert_eq!(store.get(&hash).unwrap(), data);
    }

    #[test]
    fn get_missing_chunk_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path(), DatastoreFSyncLevel::None).unwrap();
        let err = store.get(&[1u8; 32]).unwrap_err();
        assert!(err.to_string().contains("NOT_FOUND"));
    }

    #[test]
    fn get_detects_corrupted_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path(), DatastoreFSyncLevel::None).unwrap();

        let data = b"not yet corrupted".to_vec();
        let (hash, _) = store.put(&data).unwrap();

        let path = dir
            .path()
            .join("chunks")
            .join(format!("{:02x}", hash[0]))
            .join(format!("{:02x}", hash[1]))
            .join(digest_to_hex(&hash));
        std::fs::write(&path, b"corrupted bytes").unwrap();

        let err = store.get(&hash).unwrap_err();
        assert!(err.to_string().contains("CORRUPTED_CHUNK"));
    }

    #[test]
    fn delete_removes_blob_only_at_zero_refcount() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path(), DatastoreFSyncLevel::None).unwrap();

        let data = b"shared by two files".to_vec();
        let (hash, _) = store.put(&data).unwrap();
        store.incref(&hash).unwrap();
        assert_eq!(store.index.lookup(&hash).refcount, 2);

        store.delete(&hash).unwrap();
        assert!(store.exists(&hash));
        assert_eq!(store.get(&hash).unwrap(), data);

        store.delete(&hash).unwrap();
        assert!(!store.exists(&hash));
    }
}
