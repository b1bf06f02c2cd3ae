//! Append-only modification journal (§4.7, §3).
//!
//! Every recorded event is fsync'd before `record` returns. `replay` reads
//! the whole log back in order; `compact` rewrites it keeping only events
//! at or after a cutoff timestamp, same atomic-replace discipline as the
//! rest of the on-disk state in this engine.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{bail, format_err, Error};

use proxmox_sys::fs::{replace_file, CreateOptions};
use snapstore_api_types::ChangeKind;

const MAGIC: &[u8; 4] = b"JRNL";
const VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEvent {
    pub event_kind: ChangeKind,
    pub path: String,
    pub timestamp: i64,
    pub is_dir: bool,
    pub range: Option<(u64, u64)>,
}

pub struct ModificationJournal {
    path: PathBuf,
    log: Mutex<File>,
}

impl ModificationJournal {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();

        if !path.exists() {
            let mut header = Vec::with_capacity(8);
            header.extend_from_slice(MAGIC);
            header.extend_from_slice(&VERSION.to_le_bytes());
            replace_file(&path, &header, CreateOptions::new(), false)
                .map_err(|err| format_err!("creating journal {path:?} failed - {err}"))?;
        }

        let log = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|err| format_err!("opening journal {path:?} failed - {err}"))?;

        Ok(Self {
            path,
            log: Mutex::new(log),
        })
    }

    pub fn record(&self, event: &JournalEvent) -> Result<(), Error> {
        let mut log = self.log.lock().unwrap();
        let bytes = encode_event(event);
        log.write_all(&bytes)?;
        log.flush()?;
        log.sync_data()
            .map_err(|err| format_err!("fsync of journal {:?} failed - {err}", self.path))?;
        Ok(())
    }

    /// Reads every well-formed event back in append order. A truncated
    /// trailing record (crash mid-write) is dropped silently, same as
    /// `ChunkIndex::replay`.
    pub fn replay(&self) -> Result<Vec<JournalEvent>, Error> {
        let file = File::open(&self.path)
            .map_err(|err| format_err!("opening journal {:?} failed - {err}", self.path))?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        if reader.read_exact(&mut magic).is_err() || &magic != MAGIC {
            bail!("journal {:?} has bad or missing magic", self.path);
        }
        let mut version_buf = [0u8; 4];
        reader.read_exact(&mut version_buf)?;
        if u32::from_le_bytes(version_buf) != VERSION {
            bail!("journal {:?} has unsupported version", self.path);
        }

        let mut events = Vec::new();
        loop {
            match read_event(&mut reader) {
                Ok(Some(event)) => events.push(event),
                Ok(None) => break,
                Err(_) => break,
            }
        }
        Ok(events)
    }

    /// Rewrites the journal keeping only events with `timestamp >=
    /// before_ts` removed — i.e. drops everything strictly older than
    /// `before_ts`.
    pub fn compact(&self, before_ts: i64) -> Result<(), Error> {
        let events = self.replay()?;
        let kept: Vec<_> = events.into_iter().filter(|e| e.timestamp >= before_ts).collect();

        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&VERSION.to_le_bytes());
        for event in &kept {
            out.extend_from_slice(&encode_event(event));
        }

        replace_file(&self.path, &out, CreateOptions::new(), true)
            .map_err(|err| format_err!("compacting journal {:?} failed - {err}", self.path))?;

        let mut log = self.log.lock().unwrap();
        *log = OpenOptions::new().append(true).open(&self.path)?;
        Ok(())
    }
}

fn encode_event(event: &JournalEvent) -> Vec<u8> {
    let path_bytes = event.path.as_bytes();
    let mut buf = Vec::with_capacity(1 + 8 + 1 + 1 + 16 + 2 + path_bytes.len());
    buf.push(event.event_kind.as_u8());
    buf.extend_from_slice(&event.timestamp.to_le_bytes());
    buf.push(event.is_dir as u8);
    match event.range {
        Some((offset, len)) => {
            buf.push(1);
            buf.extend_from_slice(&offset.to_le_bytes());
            buf.extend_from_slice(&len.to_le_bytes());
        }
        None => {
            buf.push(0);
            buf.extend_from_slice(&0u64.to_le_bytes());
            buf.extend_from_slice(&0u64.to_le_bytes());
        }
    }
    buf.extend_from_slice(&(path_bytes.len() as u16).to_le_bytes());
    buf.extend_from_slice(path_bytes);
    buf
}

fn read_event(reader: &mut impl Read) -> Result<Option<JournalEvent>, Error> {
    let mut kind_buf = [0u8; 1];
    if reader.read(&mut kind_buf)? == 0 {
        return Ok(None);
    }
    let event_kind = ChangeKind::from_u8(kind_buf[0])?;

    let mut timestamp_buf = [0u8; 8];
    reader.read_exact(&mut timestamp_buf)?;
    let timestamp = i64::from_le_bytes(timestamp_buf);

    let mut is_dir_buf = [0u8; 1];
    reader.read_exact(&mut is_dir_buf)?;
    let is_dir = is_dir_buf[0] != 0;

    let mut has_range_buf = [0u8; 1];
    reader.read_exact(&mut has_range_buf)?;
    let mut offset_buf = [0u8; 8];
    reader.read_exact(&mut offset_buf)?;
    let mut len_buf = [0u8; 8];
    reader.read_exact(&mut len_buf)?;
    let range = if has_range_buf[0] != 0 {
        Some((u64::from_le_bytes(offset_buf), u64::from_le_bytes(len_buf)))
    } else {
        None
    };

    let mut path_len_buf = [0u8; 2];
    reader.read_exact(&mut path_len_buf)?;
    let path_len = u16::from_le_bytes(path_len_buf) as usize;
    let mut path_bytes = vec![0u8; path_len];
    reader.read_exact(&mut path_bytes)?;
    let path = String::from_utf8(path_bytes)
        .map_err(|err| format_err!("journal entry has non-utf8 path - {err}"))?;

    Ok(Some(JournalEvent {
        event_kind,
        path,
        timestamp,
        is_dir,
        range,
    }))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn record_and_replay_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let journal = ModificationJournal::open(dir.path().join("journal.db")).unwrap();

        journal
            .record(&JournalEvent {
                event_kind: ChangeKind::Create,
                path: "a.txt".into(),
                timestamp: 100,
                is_dir: false,
                range: None,
            })
            .unwrap();
        journal
            .record(&JournalEvent {
                event_kind: ChangeKind::Modify,
                path: "b.txt".into(),
                timestamp: 200,
                is_dir: false,
                range: Some((4096, 8192)),
            })
            .unwrap();

        let events = journal.replay().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_kind, ChangeKind::Create);
        assert_eq!(events[1].range, Some((4096, 8192)));
    }

    #[test]
    fn compact_drops_events_older_than_cutoff() {
        let dir = tempfile::tempdir().unwrap();
        let journal = ModificationJournal::open(dir.path().join("journal.db")).unwrap();

        for (ts, path) in [(10, "old"), (50, "mid"), (100, "new")] {
            journal
                .record(&JournalEvent {
                    event_kind: ChangeKind::Modify,
                    path: path.into(),
                    timestamp: ts,
                    is_dir: false,
                    range: None,
                })
                .unwrap();
        }

        journal.compact(50).unwrap();
        let events = journal.replay().unwrap();
        let paths: Vec<_> = events.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["mid", "new"]);
    }

    #[test]
    fn replay_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.db");
        {
            let journal = ModificationJournal::open(&path).unwrap();
            journal
                .record(&JournalEvent {
                    event_kind: ChangeKind::Delete,
                    path: "gone".into(),
                    timestamp: 1,
                    is_dir: false,
                    range: None,
                })
                .unwrap();
        }
        let reopened = ModificationJournal::open(&path).unwrap();
        assert_eq!(reopened.replay().unwrap().len(), 1);
    }
}
