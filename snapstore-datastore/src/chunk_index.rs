//! Persistent, refcounted hash → location map (§4.3).
//!
//! Backed by an append-only log (`index.db`, magic `CIDX`) rather than the
//! teacher's mmap'd fixed-array index files: entries carry a
//! variable-length locator, which doesn't fit a fixed-stride array, and an
//! append log gives the "flush before ack" durability contract for free —
//! each mutation is one record, fsync'd before the call returns. The
//! in-memory `BTreeMap` is the fast path; the log is only replayed on
//! open and rewritten by `compact`.
//!
//! Garbage collection is refcount-driven, not atime-driven: a chunk is
//! live for as long as its refcount is nonzero, full stop. Dropping a
//! refcount below zero is a corrupted-bookkeeping bug, not a normal
//! condition, so it is treated as fatal rather than clamped.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use anyhow::{bail, format_err, Error};

use proxmox_sys::fs::{replace_file, CreateOptions};

use snapstore_api_types::Digest;
use snapstore_buildcfg::IO_TIMEOUT_SECS;

const MAGIC: &[u8; 4] = b"CIDX";
const VERSION: u32 = 1;

const OP_PUT: u8 = 1;
const OP_INCREF: u8 = 2;
const OP_DECREF: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkIndexEntry {
    pub length: u64,
    pub refcount: u32,
    pub locator: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    AlreadyPresent,
}

pub struct ChunkIndex {
    path: PathBuf,
    state: RwLock<BTreeMap<Digest, ChunkIndexEntry>>,
    log: std::sync::Mutex<File>,
}

impl ChunkIndex {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();

        let state = if path.exists() {
            Self::replay(&path)?
        } else {
            Self::write_header(&path)?;
            BTreeMap::new()
        };

        let log = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|err| format_err!("opening chunk index log {path:?} failed - {err}"))?;

        Ok(Self {
            path,
            state: RwLock::new(state),
            log: std::sync::Mutex::new(log),
        })
    }

    fn write_header(path: &Path) -> Result<(), Error> {
        let mut header = Vec::with_capacity(8);
        header.extend_from_slice(MAGIC);
        header.extend_from_slice(&VERSION.to_le_bytes());
        replace_file(path, &header, CreateOptions::new(), false)
            .map_err(|err| format_err!("creating chunk index {path:?} failed - {err}"))
    }

    /// Reads the header and replays every well-formed record. A partial
    /// trailing record (truncated by a crash before fsync completed) is
    /// dropped silently: it was never acknowledged, so its loss is not a
    /// durability violation.
    fn replay(path: &Path) -> Result<BTreeMap<Digest, ChunkIndexEntry>, Error> {
        let file = File::open(path)
            .map_err(|err| format_err!("opening chunk index {path:?} failed - {err}"))?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        if reader.read_exact(&mut magic).is_err() || &magic != MAGIC {
            bail!("chunk index {path:?} has bad or missing magic");
        }
        let mut version_buf = [0u8; 4];
        reader.read_exact(&mut version_buf)?;
        let version = u32::from_le_bytes(version_buf);
        if version != VERSION {
            bail!("chunk index {path:?} has unsupported version {version}");
        }

        let mut state = BTreeMap::new();
        loop {
            match read_record(&mut reader) {
                Ok(Some(record)) => apply_record(&mut state, record)?,
                Ok(None) => break,
                Err(_) => break, // truncated tail record: drop and stop
            }
        }
        Ok(state)
    }

    fn append(&self, record: &Record) -> Result<(), Error> {
        let started = Instant::now();
        let mut log = self.log.lock().unwrap();
        let bytes = encode_record(record);
        log.write_all(&bytes)?;
        log.flush()?;
        log.sync_data()
            .map_err(|err| format_err!("fsync of chunk index {:?} failed - {err}", self.path))?;
        drop(log);

        if started.elapsed() > Duration::from_secs(IO_TIMEOUT_SECS) {
            bail!(
                "[IO_ERROR] chunk index commit to {:?} exceeded the {IO_TIMEOUT_SECS}s I/O timeout",
                self.path
            );
        }
        Ok(())
    }

    pub fn put_if_absent(
        &self,
        hash: &Digest,
        length: u64,
        locator: &[u8],
    ) -> Result<PutOutcome, Error> {
        {
            let state = self.state.read().unwrap();
            if state.contains_key(hash) {
                return Ok(PutOutcome::AlreadyPresent);
            }
        }

        let record = Record {
            op: OP_PUT,
            hash: *hash,
            length,
            locator: locator.to_vec(),
        };

        let mut state = self.state.write().unwrap();
        if state.contains_key(hash) {
            return Ok(PutOutcome::AlreadyPresent);
        }
        self.append(&record)?;
        state.insert(
            *hash,
            ChunkIndexEntry {
                length,
                refcount: 1,
                locator: locator.to_vec(),
            },
        );
        Ok(PutOutcome::Inserted)
    }

    pub fn lookup(&self, hash: &Digest) -> ChunkIndexEntry {
        self.state
            .read()
            .unwrap()
            .get(hash)
            .cloned()
            .unwrap_or(ChunkIndexEntry {
                length: 0,
                refcount: 0,
                locator: Vec::new(),
            })
    }

    pub fn contains(&self, hash: &Digest) -> bool {
        self.state.read().unwrap().contains_key(hash)
    }

    pub fn incref(&self, hash: &Digest) -> Result<u32, Error> {
        let mut state = self.state.write().unwrap();
        let entry = state
            .get_mut(hash)
            .ok_or_else(|| format_err!("incref of unknown chunk {}", hex::encode(hash)))?;
        self.append(&Record {
            op: OP_INCREF,
            hash: *hash,
            length: 0,
            locator: Vec::new(),
        })?;
        entry.refcount += 1;
        Ok(entry.refcount)
    }

    /// Decrements the refcount, returning the new value. A refcount that
    /// would drop below zero is a fatal bookkeeping error: the chunk was
    /// already at zero references, so something decref'd it twice.
    pub fn decref(&self, hash: &Digest) -> Result<u32, Error> {
        let mut state = self.state.write().unwrap();
        let entry = state
            .get_mut(hash)
            .ok_or_else(|| format_err!("decref of unknown chunk {}", hex::encode(hash)))?;
        if entry.refcount == 0 {
            bail!(
                "refcount underflow for chunk {}: already at zero",
                hex::encode(hash)
            );
        }
        self.append(&Record {
            op: OP_DECREF,
            hash: *hash,
            length: 0,
            locator: Vec::new(),
        })?;
        entry.refcount -= 1;
        Ok(entry.refcount)
    }

    /// Snapshot-consistent iteration: takes a point-in-time copy under the
    /// read lock, then hands back a lazy iterator over it so the lock is
    /// never held across caller-controlled work.
    pub fn iter(&self) -> impl Iterator<Item = (Digest, ChunkIndexEntry)> {
        let snapshot: Vec<_> = self
            .state
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        snapshot.into_iter()
    }

    pub fn len(&self) -> usize {
        self.state.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewrites the log with one `PUT` record per live (refcount > 0)
    /// entry at its current refcount, dropping entries that reached zero.
    /// Atomic via rename, same as every other on-disk artifact here.
    pub fn compact(&self) -> Result<(), Error> {
        let state = self.state.write().unwrap();

        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&VERSION.to_le_bytes());
        for (hash, entry) in state.iter() {
            if entry.refcount == 0 {
                continue;
            }
            out.extend_from_slice(&encode_record(&Record {
                op: OP_PUT,
                hash: *hash,
                length: entry.length,
                locator: entry.locator.clone(),
            }));
            for _ in 1..entry.refcount {
                out.extend_from_slice(&encode_record(&Record {
                    op: OP_INCREF,
                    hash: *hash,
                    length: 0,
                    locator: Vec::new(),
                }));
            }
        }

        replace_file(&self.path, &out, CreateOptions::new(), true)
            .map_err(|err| format_err!("compacting chunk index {:?} failed - {err}", self.path))?;

        let mut log = self.log.lock().unwrap();
        *log = OpenOptions::new().append(true).open(&self.path)?;
        Ok(())
    }
}

struct Record {
    op: u8,
    hash: Digest,
    length: u64,
    locator: Vec<u8>,
}

fn encode_record(record: &Record) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + 32 + 8 + 2 + record.locator.len());
    buf.push(record.op);
    buf.extend_from_slice(&record.hash);
    buf.extend_from_slice(&record.length.to_le_bytes());
    buf.extend_from_slice(&(record.locator.len() as u16).to_le_bytes());
    buf.extend_from_slice(&record.locator);
    buf
}

fn read_record(reader: &mut impl Read) -> Result<Option<Record>, Error> {
    let mut op_buf = [0u8; 1];
    if reader.read(&mut op_buf)? == 0 {
        return Ok(None);
    }

    let mut hash = [0u8; 32];
    reader.read_exact(&mut hash)?;
    let mut length_buf = [0u8; 8];
    reader.read_exact(&mut length_buf)?;
    let mut locator_len_buf = [0u8; 2];
    reader.read_exact(&mut locator_len_buf)?;
    let locator_len = u16::from_le_bytes(locator_len_buf) as usize;
    let mut locator = vec![0u8; locator_len];
    reader.read_exact(&mut locator)?;

    Ok(Some(Record {
        op: op_buf[0],
        hash,
        length: u64::from_le_bytes(length_buf),
        locator,
    }))
}

fn apply_record(state: &mut BTreeMap<Digest, ChunkIndexEntry>, record: Record) -> Result<(), Error> {
    match record.op {
        OP_PUT => {
            state.entry(record.hash).or_insert(ChunkIndexEntry {
                length: record.length,
                refcount: 1,
                locator: record.locator,
            });
        }
        OP_INCREF => {
            if let Some(entry) = state.get_mut(&record.hash) {
                entry.refcount += 1;
            }
        }
        OP_DECREF => {
            if let Some(entry) = state.get_mut(&record.hash) {
                entry.refcount = entry.refcount.saturating_sub(1);
            }
        }
        other => bail!("unknown chunk index record op {other}"),
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn put_lookup_and_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let index = ChunkIndex::open(dir.path().join("index.db")).unwrap();

        let hash = [7u8; 32];
        assert_eq!(
            index.put_if_absent(&hash, 1024, b"loc").unwrap(),
            PutOutcome::Inserted
        );
        assert_eq!(
            index.put_if_absent(&hash, 1024, b"loc").unwrap(),
            PutOutcome::AlreadyPresent
        );

        let entry = index.lookup(&hash);
        assert_eq!(entry.refcount, 1);
        assert_eq!(entry.length, 1024);
    }

    #[test]
    fn incref_decref_tracks_refcount() {
        let dir = tempfile::tempdir().unwrap();
        let index = ChunkIndex::open(dir.path().join("index.db")).unwrap();
        let hash = [3u8; 32];
        index.put_if_absent(&hash, 10, b"").unwrap();

        assert_eq!(index.incref(&hash).unwrap(), 2);
        assert_eq!(index.incref(&hash).unwrap(), 3);
        assert_eq!(index.decref(&hash).unwrap(), 2);
        assert_eq!(index.decref(&hash).unwrap(), 1);
        assert_eq!(index.decref(&hash).unwrap(), 0);
        assert!(index.decref(&hash).is_err());
    }

    #[test]
    fn decref_of_unknown_chunk_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let index = ChunkIndex::open(dir.path().join("index.db")).unwrap();
        assert!(index.decref(&[9u8; 32]).is_err());
    }

    #[test]
    fn replay_after_reopen_matches_prior_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");

        {
            let index = ChunkIndex::open(&path).unwrap();
            let hash = [1u8; 32];
            index.put_if_absent(&hash, 42, b"shard").unwrap();
            index.incref(&hash).unwrap();
        }

        let reopened = ChunkIndex::open(&path).unwrap();
        let entry = reopened.lookup(&[1u8; 32]);
        assert_eq!(entry.refcount, 2);
        assert_eq!(entry.length, 42);
        assert_eq!(entry.locator, b"shard".to_vec());
    }

    #[test]
    fn compact_drops_zero_refcount_entries_and_preserves_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");
        let index = ChunkIndex::open(&path).unwrap();

        let gone = [4u8; 32];
        let kept = [5u8; 32];
        index.put_if_absent(&gone, 1, b"").unwrap();
        index.decref(&gone).unwrap();
        index.put_if_absent(&kept, 2, b"").unwrap();
        index.incref(&kept).unwrap();

        index.compact().unwrap();

        assert!(!index.contains(&gone));
        assert_eq!(index.lookup(&kept).refcount, 2);

        let reopened = ChunkIndex::open(&path).unwrap();
        assert!(!reopened.contains(&gone));
        assert_eq!(reopened.lookup(&kept).refcount, 2);
    }
}
