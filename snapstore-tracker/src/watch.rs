//! Filesystem watch service (§4.7): subscribes to OS-level notifications,
//! debounces bursts of events and normalizes them to [`FileChangeEvent`].

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Error;
use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};
use serde::{Deserialize, Serialize};

use snapstore_api_types::ChangeKind;
use snapstore_buildcfg::WATCH_DEBOUNCE_MS;

use crate::bitmap::BlockBitmap;
use crate::journal::{JournalEvent, ModificationJournal};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WatchConfig {
    pub debounce: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(WATCH_DEBOUNCE_MS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub ts: i64,
    pub is_dir: bool,
    /// Always `None`: OS-level filesystem notifications carry no byte-range
    /// granularity, only "this path changed".
    pub range: Option<(u64, u64)>,
}

/// Debounced, normalized filesystem watch over a directory tree.
///
/// Subscribers receive events on [`WatchService::events`]; the dispatcher
/// runs on `notify-debouncer-mini`'s own background thread, so a slow
/// subscriber only backs up its own channel, never the watcher itself.
pub struct WatchService {
    _debouncer: Debouncer<notify::RecommendedWatcher>,
    receiver: crossbeam_channel::Receiver<FileChangeEvent>,
}

impl WatchService {
    /// `journal`, when given, receives one [`JournalEvent`] per normalized
    /// change, feeding [`crate::backup::incremental_candidates`]-style
    /// incremental-backup candidate selection. `bitmaps`, when given, has
    /// the whole file marked dirty for every non-directory create/modify —
    /// filesystem notifications carry no sub-file range, so this is the
    /// coarsest-but-correct choice rather than a sub-range guess.
    pub fn new(
        root: impl AsRef<Path>,
        config: WatchConfig,
        journal: Option<Arc<ModificationJournal>>,
        bitmaps: Option<Arc<Mutex<HashMap<PathBuf, BlockBitmap>>>>,
    ) -> Result<Self, Error> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut seen: HashSet<PathBuf> = HashSet::new();

        let mut debouncer = new_debouncer(config.debounce, move |result: DebounceEventResult| {
            match result {
                Ok(events) => {
                    for event in events {
                        let path = event.path;
                        let is_dir = path.is_dir();
                        let exists = path.exists();
                        let kind = if !exists {
                            seen.remove(&path);
                            ChangeKind::Delete
                        } else if seen.insert(path.clone()) {
                            ChangeKind::Create
                        } else {
                            ChangeKind::Modify
                        };
                        let ts = proxmox_time::epoch_i64();

                        if let Some(journal) = &journal {
                            let record = JournalEvent {
                                event_kind: kind,
                                path: path.to_string_lossy().into_owned(),
                                timestamp: ts,
                                is_dir,
                                range: None,
                            };
                            if let Err(err) = journal.record(&record) {
                                log::warn!("failed to record watch event to journal: {err}");
                            }
                        }

                        if let Some(bitmaps) = &bitmaps {
                            if !is_dir && matches!(kind, ChangeKind::Create | ChangeKind::Modify) {
                                if let Ok(len) = std::fs::metadata(&path).map(|m| m.len()) {
                                    let mut bitmaps = bitmaps.lock().unwrap();
                                    bitmaps
                                        .entry(path.clone())
                                        .or_insert_with(|| BlockBitmap::new(len))
                                        .mark_range(0, len);
                                }
                            }
                        }

                        if tx
                            .send(FileChangeEvent {
                                path,
                                kind,
                                ts,
                                is_dir,
                                range: None,
                            })
                            .is_err()
                        {
                            // no subscribers left; nothing to do
                        }
                    }
                }
                Err(errors) => {
                    for err in errors {
                        log::warn!("filesystem watch error: {err}");
                    }
                }
            }
        })?;

        debouncer
            .watcher()
            .watch(root.as_ref(), RecursiveMode::Recursive)?;

        Ok(Self {
            _debouncer: debouncer,
            receiver: rx,
        })
    }

    pub fn events(&self) -> &crossbeam_channel::Receiver<FileChangeEvent> {
        &self.receiver
    }
}
