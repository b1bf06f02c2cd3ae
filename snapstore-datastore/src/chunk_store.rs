//! Sharded, write-once blob storage for chunk bytes.
//!
//! Chunks live at `chunks/xx/yy/{hex(hash)}`, sharded by the first two
//! bytes of the digest (§6) so that no directory ever holds more than a
//! few hundred entries even with a populated store. Refcounting and
//! dedup bookkeeping live one layer up, in [`crate::chunk_index`]; this
//! module only knows how to get bytes onto and off of disk.

use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, format_err, Error};

use proxmox_sys::fs::{create_path, replace_file, CreateOptions};

use snapstore_api_types::{digest_to_hex, DatastoreFSyncLevel, Digest};
use snapstore_buildcfg::IO_TIMEOUT_SECS;

pub struct ChunkStore {
    base: PathBuf,
    sync_level: DatastoreFSyncLevel,
}

impl ChunkStore {
    /// Opens (creating if needed) the blob store rooted at `base`.
    pub fn open<P: Into<PathBuf>>(base: P, sync_level: DatastoreFSyncLevel) -> Result<Self, Error> {
        let base: PathBuf = base.into();

        if !base.is_absolute() {
            bail!("expected absolute path - got {base:?}");
        }

        create_path(&base, Some(CreateOptions::new()), Some(CreateOptions::new()))
            .map_err(|err| format_err!("unable to create chunk store at {base:?} - {err}"))?;

        Ok(Self { base, sync_level })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn shard_dir(&self, hash: &Digest) -> PathBuf {
        let mut dir = self.base.clone();
        dir.push(format!("{:02x}", hash[0]));
        dir.push(format!("{:02x}", hash[1]));
        dir
    }

    fn blob_path(&self, hash: &Digest) -> PathBuf {
        let mut path = self.shard_dir(hash);
        path.push(digest_to_hex(hash));
        path
    }

    pub fn exists(&self, hash: &Digest) -> Result<bool, Error> {
        match std::fs::metadata(self.blob_path(hash)) {
            Ok(meta) => Ok(meta.is_file()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    pub fn blob_len(&self, hash: &Digest) -> Result<Option<u64>, Error> {
        match std::fs::metadata(self.blob_path(hash)) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn read(&self, hash: &Digest) -> Result<Vec<u8>, Error> {
        let path = self.blob_path(hash);
        std::fs::read(&path)
            .map_err(|err| format_err!("reading chunk {} failed - {err}", digest_to_hex(hash)))
    }

    /// Writes `data` under `hash`. Write-once: if a blob is already present
    /// this is a no-op (the caller is expected to have verified the digest
    /// elsewhere before ever calling `write` with mismatched bytes).
    ///
    /// A write that takes longer than [`IO_TIMEOUT_SECS`] to complete is
    /// surfaced as an error even though it succeeded, so the caller's retry
    /// policy (§5) treats a stalled backing device as a transient failure
    /// rather than silently absorbing the latency.
    pub fn write(&self, hash: &Digest, data: &[u8]) -> Result<(), Error> {
        if self.exists(hash)? {
            return Ok(());
        }

        let started = Instant::now();

        let shard_dir = self.shard_dir(hash);
        create_path(&shard_dir, Some(CreateOptions::new()), Some(CreateOptions::new()))
            .map_err(|err| format_err!("unable to create chunk shard {shard_dir:?} - {err}"))?;

        let path = self.blob_path(hash);
        replace_file(
            &path,
            data,
            CreateOptions::new(),
            self.sync_level == DatastoreFSyncLevel::File,
        )
        .map_err(|err| format_err!("writing chunk {} failed - {err}", digest_to_hex(hash)))?;

        if self.sync_level == DatastoreFSyncLevel::File {
            let dir = std::fs::File::open(&shard_dir)?;
            nix::unistd::fsync(dir.as_raw_fd())
                .map_err(|err| format_err!("fsync of chunk shard failed: {err}"))?;
        }

        if started.elapsed() > Duration::from_secs(IO_TIMEOUT_SECS) {
            bail!(
                "[IO_ERROR] writing chunk {} exceeded the {IO_TIMEOUT_SECS}s I/O timeout",
                digest_to_hex(hash)
            );
        }

        Ok(())
    }

    /// Removes the blob for `hash`. Not an error if already absent, since
    /// delete races with another decref-to-zero are resolved at the index
    /// layer, not here.
    pub fn remove(&self, hash: &Digest) -> Result<(), Error> {
        let path = self.blob_path(hash);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Lists every blob currently on disk with its modification time (as a
    /// Unix epoch timestamp), for orphan reconciliation. Shard directories
    /// that aren't themselves valid hex, or entries whose filename doesn't
    /// decode to a 32-byte digest, are skipped rather than treated as an
    /// error — both are always either this store's own output or leftovers
    /// from something else entirely, never a corruption to report.
    pub fn iter_blobs(&self) -> Result<Vec<(Digest, i64)>, Error> {
        let mut out = Vec::new();
        if !self.base.is_dir() {
            return Ok(out);
        }

        for shard1 in std::fs::read_dir(&self.base)? {
            let shard1 = shard1?;
            if !shard1.file_type()?.is_dir() {
                continue;
            }
            for shard2 in std::fs::read_dir(shard1.path())? {
                let shard2 = shard2?;
                if !shard2.file_type()?.is_dir() {
                    continue;
                }
                for entry in std::fs::read_dir(shard2.path())? {
                    let entry = entry?;
                    if !entry.file_type()?.is_file() {
                        continue;
                    }
                    let name = entry.file_name();
                    let hash: Digest = match hex::decode(name.to_string_lossy().as_ref()) {
                        Ok(bytes) if bytes.len() == 32 => bytes.try_into().unwrap(),
                        _ => continue,
                    };
                    let mtime = entry
                        .metadata()?
                        .modified()?
                        .duration_since(std::time::UNIX_EPOCH)
                        .map(|d| d.as_secs() as i64)
                        .unwrap_or(0);
                    out.push((hash, mtime));
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn hash_of(data: &[u8]) -> Digest {
        crate::hasher::hash_buffer(data)
    }

    #[test]
    fn write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::open(dir.path().join("store"), DatastoreFSyncLevel::None).unwrap();

        let data = b"hello chunk store".to_vec();
        let hash = hash_of(&data);

        assert!(!store.exists(&hash).unwrap());
        store.write(&hash, &data).unwrap();
        assert!(store.exists(&hash).unwrap());
        assert_eq!(store.read(&hash).unwrap(), data);
        assert_eq!(store.blob_len(&hash).unwrap(), Some(data.len() as u64));
    }

    #[test]
    fn write_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::open(dir.path().join("store"), DatastoreFSyncLevel::None).unwrap();

        let data = b"same bytes twice".to_vec();
        let hash = hash_of(&data);

        store.write(&hash, &data).unwrap();
        store.write(&hash, &data).unwrap();
        assert_eq!(store.read(&hash).unwrap(), data);
    }

    #[test]
    fn remove_then_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::open(dir.path().join("store"), DatastoreFSyncLevel::None).unwrap();

        let data = b"goes away".to_vec();
        let hash = hash_of(&data);
        store.write(&hash, &data).unwrap();
        store.remove(&hash).unwrap();
        assert!(!store.exists(&hash).unwrap());
        // removing twice is not an error
        store.remove(&hash).unwrap();
    }

    #[test]
    fn shards_by_first_two_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::open(dir.path().join("store"), DatastoreFSyncLevel::None).unwrap();

        let data = b"shard me".to_vec();
        let hash = hash_of(&data);
        store.write(&hash, &data).unwrap();

        let expected = dir
            .path()
            .join("store")
            .join(format!("{:02x}", hash[0]))
            .join(format!("{:02x}", hash[1]))
            .join(digest_to_hex(&hash));
        assert!(expected.is_file());
    }
}
