//! Reverse of `BackupEngine`: reconstruct files on disk from a finalized
//! snapshot's records and the shared content store (§4.9).

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, format_err, Error};
use serde::{Deserialize, Serialize};

use snapstore_api_types::{Digest, EngineError, SnapshotState};
use snapstore_datastore::{hasher, Datastore};

use crate::backup::BackupState;
use crate::progress::{CancellationToken, NullProgressSink, ProgressSink, ProgressUpdate};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RestoreOptions {
    #[serde(default = "default_true")]
    pub verify_integrity: bool,
    #[serde(default)]
    pub preserve_attributes: bool,
    #[serde(default)]
    pub overwrite_existing: bool,
}

fn default_true() -> bool {
    true
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            verify_integrity: true,
            preserve_attributes: false,
            overwrite_existing: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestoreResult {
    pub snapshot_id: i64,
    pub files_restored: u64,
    pub files_failed: Vec<(String, String)>,
    pub bytes_restored: u64,
}

pub struct RestoreEngine {
    datastore: Arc<Datastore>,
    cancel: CancellationToken,
    progress: Arc<dyn ProgressSink>,
}

impl RestoreEngine {
    pub fn new(datastore: Arc<Datastore>) -> Self {
        Self {
            datastore,
            cancel: CancellationToken::new(),
            progress: Arc::new(NullProgressSink),
        }
    }

    pub fn with_progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = sink;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn restore(
        &self,
        snapshot_id: i64,
        target_dir: &Path,
        options: &RestoreOptions,
    ) -> Result<RestoreResult, EngineError> {
        self.restore_inner(snapshot_id, target_dir, options)
            .map_err(EngineError::from)
    }

    fn restore_inner(
        &self,
        snapshot_id: i64,
        target_dir: &Path,
        options: &RestoreOptions,
    ) -> Result<RestoreResult, Error> {
        let snapshot = self
            .datastore
            .metadata
            .get_snapshot(snapshot_id)?
            .ok_or_else(|| format_err!("[NOT_FOUND] snapshot {snapshot_id} not found"))?;
        if snapshot.state != SnapshotState::Finalized {
            bail!("[INVALID_ARGUMENT] snapshot {snapshot_id} is not finalized, refusing to restore from it");
        }

        let mut files = self.datastore.metadata.list_files(snapshot_id)?;
        files.sort_by(|a, b| a.path.cmp(&b.path));

        let total_files = files.len() as u64;
        let total_bytes: u64 = files.iter().map(|f| f.size).sum();

        let mut files_restored = 0u64;
        let mut bytes_restored = 0u64;
        let mut files_failed = Vec::new();

        for file in &files {
            if self.cancel.is_cancelled() {
                break;
            }

            match self.restore_one(
                target_dir,
                file.path.as_str(),
                &file.chunk_hashes,
                file.content_hash,
                file.mtime,
                file.symlink_target.as_deref(),
                options,
            ) {
                Ok(bytes) => {
                    files_restored += 1;
                    bytes_restored += bytes;
                    self.progress.on_progress(&ProgressUpdate {
                        state: BackupState::Idle,
                        files_processed: files_restored,
                        total_files,
                        bytes_processed: bytes_restored,
                        total_bytes,
                        current_file: file.path.clone(),
                    });
                }
                Err(err) => {
                    log::warn!("restore of {} failed - {err}", file.path);
                    files_failed.push((file.path.clone(), err.to_string()));
                }
            }
        }

        Ok(RestoreResult {
            snapshot_id,
            files_restored,
            files_failed,
            bytes_restored,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn restore_one(
        &self,
        target_dir: &Path,
        rel_path: &str,
        chunk_hashes: &[Digest],
        content_hash: Digest,
        mtime: i64,
        symlink_target: Option<&str>,
        options: &RestoreOptions,
    ) -> Result<u64, Error> {
        let target_path = resolve_target(target_dir, rel_path)?;

        if target_path.exists() && !options.overwrite_existing {
            bail!("[INVALID_ARGUMENT] refusing to overwrite existing file {target_path:?}");
        }

        if let Some(parent) = target_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| format_err!("creating {parent:?} failed - {err}"))?;
        }

        if let Some(target) = symlink_target {
            if target_path.exists() || target_path.symlink_metadata().is_ok() {
                fs::remove_file(&target_path).ok();
            }
            std::os::unix::fs::symlink(target, &target_path)
                .map_err(|err| format_err!("creating symlink {target_path:?} -> {target} failed - {err}"))?;
            return Ok(0);
        }

        // Each chunk's own bytes are verified against its digest inside
        // `ContentStore::get` regardless of `verify_integrity`. This flag
        // additionally confirms the file's recorded chunk sequence itself
        // still hashes to its `content_hash`, catching metadata corruption
        // that individual chunk checks can't see.
        if options.verify_integrity {
            let recomputed = hasher::hash_digest_sequence(chunk_hashes.iter());
            if recomputed != content_hash {
                bail!("[CORRUPTED_CHUNK] content_hash mismatch for {rel_path}: metadata does not match its chunk sequence");
            }
        }

        let mut out = fs::File::create(&target_path)
            .map_err(|err| format_err!("creating {target_path:?} failed - {err}"))?;

        let mut bytes = 0u64;

        for (position, hash) in chunk_hashes.iter().enumerate() {
            if self.cancel.is_cancelled() {
                bail!("[CANCELLED] restore cancelled while writing {rel_path} at chunk {position}");
            }

            let data = self.datastore.content.get(hash)?;
            out.write_all(&data)
                .map_err(|err| format_err!("writing {target_path:?} failed - {err}"))?;
            bytes += data.len() as u64;
        }
        drop(out);

        if options.preserve_attributes {
            let mtime_spec = nix::sys::time::TimeSpec::new(mtime, 0);
            nix::sys::stat::utimensat(
                None,
                &target_path,
                &mtime_spec,
                &mtime_spec,
                nix::sys::stat::UtimensatFlags::FollowSymlink,
            )
            .map_err(|err| format_err!("setting mtime on {target_path:?} failed - {err}"))?;
        }

        Ok(bytes)
    }
}

fn resolve_target(target_dir: &Path, rel_path: &str) -> Result<PathBuf, Error> {
    let mut path = target_dir.to_path_buf();
    for component in rel_path.split('/') {
        if component.is_empty() || component == ".." {
            bail!("[INVALID_ARGUMENT] restore path {rel_path:?} escapes target directory");
        }
        path.push(component);
    }
    Ok(path)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backup::BackupEngine;
    use crate::scanner::BackupOptions;
    use snapstore_api_types::DatastoreFSyncLevel;
    use snapstore_datastore::ChunkerConfig;
    use std::fs;

    fn build_snapshot(dir: &Path) -> (Arc<Datastore>, i64) {
        let source = dir.join("source");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("a.txt"), b"hello world").unwrap();
        fs::create_dir_all(source.join("sub")).unwrap();
        fs::write(source.join("sub/b.txt"), b"nested file contents").unwrap();

        let datastore = Arc::new(Datastore::open(dir.join("store"), DatastoreFSyncLevel::None).unwrap());
        let engine = BackupEngine::new(datastore.clone());
        let result = engine
            .backup(
                &source,
                "s",
                None,
                &ChunkerConfig::Fixed { size: 4096 },
                &BackupOptions::default(),
                None,
            )
            .unwrap();
        (datastore, result.snapshot_id)
    }

    #[test]
    fn restore_reconstructs_files_byte_for_byte() {
        let dir = tempfile::tempdir().unwrap();
        let (datastore, snapshot_id) = build_snapshot(dir.path());

        let target = dir.path().join("restored");
        let engine = RestoreEngine::new(datastore);
        let result = engine
            .restore(snapshot_id, &target, &RestoreOptions::default())
            .unwrap();

        assert_eq!(result.files_restored, 2);
        assert!(result.files_failed.is_empty());
        assert_eq!(fs::read(target.join("a.txt")).unwrap(), b"hello world");
        assert_eq!(fs::read(target.join("sub/b.txt")).unwrap(), b"nested file contents");
    }

    #[test]
    fn restore_refuses_to_clobber_without_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let (datastore, snapshot_id) = build_snapshot(dir.path());

        let target = dir.path().join("restored");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("a.txt"), b"already here").unwrap();

        let engine = RestoreEngine::new(datastore);
        let result = engine
            .restore(snapshot_id, &target, &RestoreOptions::default())
            .unwrap();

        assert_eq!(result.files_restored, 1);
        assert_eq!(result.files_failed.len(), 1);
        assert_eq!(result.files_failed[0].0, "a.txt");
        assert_eq!(fs::read(target.join("a.txt")).unwrap(), b"already here");
    }

    #[test]
    fn restore_of_non_finalized_snapshot_fails() {
        let dir = tempfile::tempdir().unwrap();
        let datastore = Arc::new(Datastore::open(dir.path().join("store"), DatastoreFSyncLevel::None).unwrap());
        let snapshot_id = datastore.metadata.create_snapshot("building", "", 0, None).unwrap();

        let engine = RestoreEngine::new(datastore);
        let result = engine.restore(snapshot_id, &dir.path().join("out"), &RestoreOptions::default());
        assert!(result.is_err());
    }

    #[test]
    fn path_traversal_is_rejected() {
        let target = PathBuf::from("/tmp/restore-target");
        assert!(resolve_target(&target, "../escape.txt").is_err());
        assert!(resolve_target(&target, "ok/file.txt").is_ok());
    }
}
