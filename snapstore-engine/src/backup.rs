//! Orchestrates scan → chunk → store → snapshot (§4.8).
//!
//! Full backups chunk and store every scanned file. Incremental backups
//! (`parent_id.is_some()`) rechunk only the candidate set derived from the
//! change tracker and copy every other file's record forward by reference,
//! bumping chunk refcounts instead of rewriting bytes already on disk.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{format_err, Error};
use serde::{Deserialize, Serialize};

use snapstore_api_types::EngineError;
use snapstore_buildcfg::{STORAGE_WRITE_BACKOFF_MS, STORAGE_WRITE_RETRIES};
use snapstore_datastore::{hasher::hash_buffer, ChunkReader, ChunkerConfig, Datastore, FileRecord};
use snapstore_tools::retry::retry_with_backoff;
use snapstore_tracker::ModificationJournal;

use crate::progress::{CancellationToken, NullProgressSink, ProgressSink, ProgressUpdate};
use crate::scanner::{self, BackupOptions, ScannedFile};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BackupState {
    #[default]
    Idle,
    Scanning,
    Chunking,
    Finalizing,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct BackupResult {
    pub snapshot_id: i64,
    pub state: BackupState,
    pub files_processed: u64,
    pub files_failed: Vec<(String, String)>,
    pub bytes_processed: u64,
}

/// A step's outcome for one file: `Skip` records a per-file failure and
/// moves on, `Fatal` aborts the whole run, `Cancelled` stops without
/// recording a failure.
enum StepError {
    Skip(Error),
    Fatal(Error),
    Cancelled,
}

pub struct BackupEngine {
    datastore: Arc<Datastore>,
    cancel: CancellationToken,
    progress: Arc<dyn ProgressSink>,
}

impl BackupEngine {
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

    /// Runs a backup of `source_dir` into a new snapshot named `name`.
    /// `parent_id` selects incremental mode: only the candidate set (per
    /// `journal` and mtime comparison against the parent) is rechunked;
    /// every other file present in both the parent and the current scan is
    /// carried forward by reference.
    pub fn backup(
        &self,
        source_dir: &Path,
        name: &str,
        parent_id: Option<i64>,
        chunker_config: &ChunkerConfig,
        options: &BackupOptions,
        journal: Option<&ModificationJournal>,
    ) -> Result<BackupResult, EngineError> {
        self.backup_inner(source_dir, name, parent_id, chunker_config, options, journal)
            .map_err(EngineError::from)
    }

    fn backup_inner(
        &self,
        source_dir: &Path,
        name: &str,
        parent_id: Option<i64>,
        chunker_config: &ChunkerConfig,
        options: &BackupOptions,
        journal: Option<&ModificationJournal>,
    ) -> Result<BackupResult, Error> {
        chunker_config.validate()?;

        self.report(BackupState::Scanning, 0, 0, 0, 0, "");
        let scanned = scanner::scan(source_dir, options)?;
        let total_files = scanned.len() as u64;
        let total_bytes: u64 = scanned.iter().map(|f| f.size).sum();

        let parent = match parent_id {
            Some(id) => Some(
                self.datastore
                    .metadata
                    .get_snapshot(id)?
                    .ok_or_else(|| format_err!("[NOT_FOUND] parent snapshot {id} not found"))?,
            ),
            None => None,
        };

        let parent_files: HashMap<String, FileRecord> = match &parent {
            Some(p) => self
                .datastore
                .metadata
                .list_files(p.id)?
                .into_iter()
                .map(|f| (f.path.clone(), f))
                .collect(),
            None => HashMap::new(),
        };

        let candidates: Option<HashSet<String>> = match &parent {
            Some(p) => Some(incremental_candidates(p.created_at, journal, &scanned)?),
            None => None,
        };

        let snapshot_id = self.datastore.metadata.create_snapshot(
            name,
            "",
            proxmox_time::epoch_i64(),
            parent_id,
        )?;

        let mut files_processed = 0u64;
        let mut bytes_processed = 0u64;
        let mut files_failed = Vec::new();

        for scanned_file in &scanned {
            if self.cancel.is_cancelled() {
                return Ok(BackupResult {
                    snapshot_id,
                    state: BackupState::Cancelled,
                    files_processed,
                    files_failed,
                    bytes_processed,
                });
            }

            let reference = candidates
                .as_ref()
                .map(|cands| !cands.contains(&scanned_file.rel_path))
                .unwrap_or(false)
                && parent_files.contains_key(&scanned_file.rel_path);

            let step = if let Some(target) = &scanned_file.symlink_target {
                self.store_symlink(snapshot_id, scanned_file, target)
            } else if reference {
                self.copy_by_reference(snapshot_id, &parent_files[&scanned_file.rel_path], scanned_file)
            } else {
                self.chunk_and_store(snapshot_id, scanned_file, chunker_config)
            };

            match step {
                Ok(bytes) => {
                    files_processed += 1;
                    bytes_processed += bytes;
                    self.report(
                        BackupState::Chunking,
                        files_processed,
                        total_files,
                        bytes_processed,
                        total_bytes,
                        &scanned_file.rel_path,
                    );
                }
                Err(StepError::Skip(err)) => {
                    log::warn!("skipping {} - {err}", scanned_file.rel_path);
                    files_failed.push((scanned_file.rel_path.clone(), err.to_string()));
                }
                Err(StepError::Cancelled) => {
                    return Ok(BackupResult {
                        snapshot_id,
                        state: BackupState::Cancelled,
                        files_processed,
                        files_failed,
                        bytes_processed,
                    });
                }
                Err(StepError::Fatal(err)) => {
                    log::error!("backup aborted on {} - {err}", scanned_file.rel_path);
                    return Ok(BackupResult {
                        snapshot_id,
                        state: BackupState::Failed,
                        files_processed,
                        files_failed,
                        bytes_processed,
                    });
                }
            }
        }

        self.report(
            BackupState::Finalizing,
            files_processed,
            total_files,
            bytes_processed,
            total_bytes,
            "",
        );
        let files = self.datastore.metadata.list_files(snapshot_id)?;
        let merkle_root = *snapstore_datastore::merkle::build(&files).hash();
        self.datastore
            .metadata
            .finalize_snapshot(snapshot_id, merkle_root, files.len() as u64, bytes_processed)?;

        Ok(BackupResult {
            snapshot_id,
            state: BackupState::Completed,
            files_processed,
            files_failed,
            bytes_processed,
        })
    }

    fn chunk_and_store(
        &self,
        snapshot_id: i64,
        scanned_file: &ScannedFile,
        chunker_config: &ChunkerConfig,
    ) -> Result<u64, StepError> {
        let file = File::open(&scanned_file.abs_path)
            .map_err(|err| StepError::Skip(format_err!("opening {:?} - {err}", scanned_file.abs_path)))?;
        let mut reader =
            ChunkReader::new(file, chunker_config).map_err(StepError::Skip)?;

        let mut chunk_hashes = Vec::new();
        let mut bytes = 0u64;

        loop {
            if self.cancel.is_cancelled() {
                return Err(StepError::Cancelled);
            }

            let chunk = match reader.next_chunk() {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(err) => return Err(StepError::Skip(err)),
            };

            retry_with_backoff(
                STORAGE_WRITE_RETRIES,
                Duration::from_millis(STORAGE_WRITE_BACKOFF_MS),
                |_| self.datastore.content.put(&chunk.data).map(|_| ()),
            )
            .map_err(StepError::Fatal)?;

            chunk_hashes.push(chunk.hash);
            bytes += chunk.data.len() as u64;
        }

        let content_hash = snapstore_datastore::hasher::hash_digest_sequence(chunk_hashes.iter());

        self.datastore
            .metadata
            .add_file(&FileRecord {
                file_id: 0,
                snapshot_id,
                path: scanned_file.rel_path.clone(),
                size: bytes,
                mtime: scanned_file.mtime,
                content_hash,
                chunk_hashes,
                symlink_target: None,
            })
            .map_err(StepError::Fatal)?;

        Ok(bytes)
    }

    /// Records a symlink's target verbatim, with no chunked content: `size`
    /// is 0, `chunk_hashes` is empty, and `content_hash` covers the target
    /// string itself so the record still has a stable integrity anchor.
    fn store_symlink(
        &self,
        snapshot_id: i64,
        scanned_file: &ScannedFile,
        target: &str,
    ) -> Result<u64, StepError> {
        self.datastore
            .metadata
            .add_file(&FileRecord {
                file_id: 0,
                snapshot_id,
                path: scanned_file.rel_path.clone(),
                size: 0,
                mtime: scanned_file.mtime,
                content_hash: hash_buffer(target.as_bytes()),
                chunk_hashes: Vec::new(),
                symlink_target: Some(target.to_string()),
            })
            .map_err(StepError::Fatal)?;

        Ok(0)
    }

    fn copy_by_reference(
        &self,
        snapshot_id: i64,
        parent_record: &FileRecord,
        scanned_file: &ScannedFile,
    ) -> Result<u64, StepError> {
        for hash in &parent_record.chunk_hashes {
            self.datastore.content.incref(hash).map_err(StepError::Fatal)?;
        }

        self.datastore
            .metadata
            .add_file(&FileRecord {
                file_id: 0,
                snapshot_id,
                path: scanned_file.rel_path.clone(),
                size: parent_record.size,
                mtime: scanned_file.mtime,
                content_hash: parent_record.content_hash,
                chunk_hashes: parent_record.chunk_hashes.clone(),
                symlink_target: parent_record.symlink_target.clone(),
            })
            .map_err(StepError::Fatal)?;

        Ok(parent_record.size)
    }

    fn report(
        &self,
        state: BackupState,
        files_processed: u64,
        total_files: u64,
        bytes_processed: u64,
        total_bytes: u64,
        current_file: &str,
    ) {
        self.progress.on_progress(&ProgressUpdate {
            state,
            files_processed,
            total_files,
            bytes_processed,
            total_bytes,
            current_file: current_file.to_string(),
        });
    }
}

/// Union of journal events recorded after `parent_created_at` and scanned
/// files whose mtime is newer than the parent snapshot. A missing or
/// unavailable journal just leaves the mtime half of the union in effect —
/// the tracker degrades an incremental run towards a fuller one, never the
/// other way round.
fn incremental_candidates(
    parent_created_at: i64,
    journal: Option<&ModificationJournal>,
    scanned: &[ScannedFile],
) -> Result<HashSet<String>, Error> {
    let mut candidates = HashSet::new();

    if let Some(journal) = journal {
        for event in journal.replay()? {
            if event.timestamp > parent_created_at {
                candidates.insert(event.path);
            }
        }
    }

    for file in scanned {
        if file.mtime > parent_created_at {
            candidates.insert(file.rel_path.clone());
        }
    }

    Ok(candidates)
}

#[cfg(test)]
mod test {
    use super::*;
    use snapstore_api_types::DatastoreFSyncLevel;
    use std::fs;

    fn open_datastore(dir: &Path) -> Arc<Datastore> {
        Arc::new(Datastore::open(dir.join("store"), DatastoreFSyncLevel::None).unwrap())
    }

    #[test]
    fn full_backup_chunks_and_finalizes() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("a.txt"), b"hello world").unwrap();
        fs::write(source.join("b.txt"), b"goodbye world").unwrap();

        let datastore = open_datastore(dir.path());
        let engine = BackupEngine::new(datastore.clone());

        let result = engine
            .backup(
                &source,
                "full",
                None,
                &ChunkerConfig::Fixed { size: 4096 },
                &BackupOptions::default(),
                None,
            )
            .unwrap();

        assert_eq!(result.state, BackupState::Completed);
        assert_eq!(result.files_processed, 2);
        assert!(result.files_failed.is_empty());

        let snapshot = datastore.metadata.get_snapshot(result.snapshot_id).unwrap().unwrap();
        assert!(snapshot.merkle_root.is_some());
        assert_eq!(snapshot.file_count, 2);
    }

    #[test]
    fn incremental_backup_rechunks_only_modified_files() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("stable.txt"), b"never changes").unwrap();
        fs::write(source.join("changed.txt"), b"version one").unwrap();

        let datastore = open_datastore(dir.path());
        let engine = BackupEngine::new(datastore.clone());
        let config = ChunkerConfig::Fixed { size: 4096 };

        let full = engine
            .backup(&source, "full", None, &config, &BackupOptions::default(), None)
            .unwrap();
        assert_eq!(full.state, BackupState::Completed);

        let parent = datastore.metadata.get_snapshot(full.snapshot_id).unwrap().unwrap();

        // ensure the modified file's mtime is observed as newer than the parent
        std::thread::sleep(Duration::from_millis(1100));
        fs::write(source.join("changed.txt"), b"version two, much longer content").unwrap();

        let incremental = engine
            .backup(
                &source,
                "incr",
                Some(full.snapshot_id),
                &config,
                &BackupOptions::default(),
                None,
            )
            .unwrap();

        assert_eq!(incremental.state, BackupState::Completed);
        assert_eq!(incremental.files_processed, 2);

        let files = datastore.metadata.list_files(incremental.snapshot_id).unwrap();
        let changed = files.iter().find(|f| f.path == "changed.txt").unwrap();
        let stable = files.iter().find(|f| f.path == "stable.txt").unwrap();

        assert_eq!(changed.size, b"version two, much longer content".len() as u64);
        let parent_stable = datastore
            .metadata
            .list_files(parent.id)
            .unwrap()
            .into_iter()
            .find(|f| f.path == "stable.txt")
            .unwrap();
        assert_eq!(stable.chunk_hashes, parent_stable.chunk_hashes);
    }

    #[test]
    fn unreadable_file_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("ok.txt"), b"fine").unwrap();

        let datastore = open_datastore(dir.path());
        let engine = BackupEngine::new(datastore);

        // simulate an unreadable file by pointing a ScannedFile at a path
        // that disappears between scan and chunk: scan the dir, then delete
        // the file before running backup's internal chunk step by removing
        // it right after the scan would have seen it. We approximate this
        // by exercising chunk_and_store directly against a vanished path.
        let scanned = ScannedFile {
            rel_path: "gone.txt".to_string(),
            abs_path: source.join("gone.txt"),
            size: 4,
            mtime: 0,
            symlink_target: None,
        };
        let result = engine.chunk_and_store(1, &scanned, &ChunkerConfig::Fixed { size: 4096 });
        assert!(matches!(result, Err(StepError::Skip(_))));
    }

    #[test]
    fn cancellation_is_observed_mid_run() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("a.txt"), b"a").unwrap();
        fs::write(source.join("b.txt"), b"b").unwrap();

        let datastore = open_datastore(dir.path());
        let engine = BackupEngine::new(datastore);
        engine.cancellation_token().cancel();

        let result = engine
            .backup(
                &source,
                "cancelled",
                None,
                &ChunkerConfig::Fixed { size: 4096 },
                &BackupOptions::default(),
                None,
            )
            .unwrap();

        assert_eq!(result.state, BackupState::Cancelled);
    }
}
