//! Snapshot and file metadata, persisted in `metadata.db` (§4.5, §6).
//!
//! Tables: `snapshots`, `files`, `file_chunks` (file_id, position,
//! chunk_hash). Unlike the rest of the datastore this is backed by
//! `rusqlite` rather than a hand-rolled binary format — the external
//! interface explicitly describes named tables and columns, which SQL
//! expresses directly instead of through a reimplemented index.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{bail, format_err, Error};
use rusqlite::{params, Connection, OptionalExtension, Transaction};

use snapstore_api_types::{digest_from_hex, digest_to_hex, Digest, EngineError, SnapshotState};

use crate::content_store::ContentStore;
use crate::model::{FileRecord, Snapshot};

pub struct MetadataStore {
    conn: Mutex<Connection>,
}

impl MetadataStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let conn = Connection::open(path.as_ref())
            .map_err(|err| format_err!("opening metadata store {:?} - {err}", path.as_ref()))?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS snapshots (
                id            INTEGER PRIMARY KEY,
                name          TEXT NOT NULL,
                description   TEXT NOT NULL DEFAULT '',
                created_at    INTEGER NOT NULL,
                file_count    INTEGER NOT NULL DEFAULT 0,
                total_bytes   INTEGER NOT NULL DEFAULT 0,
                merkle_root   TEXT,
                parent_id     INTEGER REFERENCES snapshots(id),
                state         TEXT NOT NULL DEFAULT 'building'
            );

            CREATE TABLE IF NOT EXISTS files (
                file_id         INTEGER PRIMARY KEY,
                snapshot_id     INTEGER NOT NULL REFERENCES snapshots(id),
                path            TEXT NOT NULL,
                size            INTEGER NOT NULL,
                mtime           INTEGER NOT NULL,
                content_hash    TEXT NOT NULL,
                symlink_target  TEXT,
                UNIQUE(snapshot_id, path)
            );

            CREATE TABLE IF NOT EXISTS file_chunks (
                file_id     INTEGER NOT NULL REFERENCES files(file_id),
                position    INTEGER NOT NULL,
                chunk_hash  TEXT NOT NULL,
                PRIMARY KEY (file_id, position)
            );
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn create_snapshot(
        &self,
        name: &str,
        description: &str,
        created_at: i64,
        parent_id: Option<i64>,
    ) -> Result<i64, Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO snapshots (name, description, created_at, parent_id, state)
             VALUES (?1, ?2, ?3, ?4, 'building')",
            params![name, description, created_at, parent_id],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Inserts (or, if already present for this `(snapshot_id, path)`,
    /// leaves untouched) a file's record and its ordered chunk sequence.
    pub fn add_file(&self, record: &FileRecord) -> Result<i64, Error> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT file_id FROM files WHERE snapshot_id = ?1 AND path = ?2",
                params![record.snapshot_id, record.path],
                |row| row.get(0),
            )
            .optional()?;

        let file_id = if let Some(id) = existing {
            id
        } else {
            tx.execute(
                "INSERT INTO files (snapshot_id, path, size, mtime, content_hash, symlink_target)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.snapshot_id,
                    record.path,
                    record.size as i64,
                    record.mtime,
                    digest_to_hex(&record.content_hash),
                    record.symlink_target,
                ],
            )?;
            let file_id = tx.last_insert_rowid();
            for (position, hash) in record.chunk_hashes.iter().enumerate() {
                tx.execute(
                    "INSERT INTO file_chunks (file_id, position, chunk_hash) VALUES (?1, ?2, ?3)",
                    params![file_id, position as i64, digest_to_hex(hash)],
                )?;
            }
            file_id
        };

        tx.commit()?;
        Ok(file_id)
    }

    pub fn finalize_snapshot(
        &self,
        snapshot_id: i64,
        merkle_root: Digest,
        file_count: u64,
        total_bytes: u64,
    ) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        let state: String = conn.query_row(
            "SELECT state FROM snapshots WHERE id = ?1",
            params![snapshot_id],
            |row| row.get(0),
        )?;
        if state != "building" {
            bail!("[ALREADY_FINALIZED] snapshot {snapshot_id} is already finalized");
        }
        conn.execute(
            "UPDATE snapshots SET state = 'finalized', merkle_root = ?2,
             file_count = ?3, total_bytes = ?4 WHERE id = ?1",
            params![
                snapshot_id,
                digest_to_hex(&merkle_root),
                file_count as i64,
                total_bytes as i64,
            ],
        )?;
        Ok(())
    }

    pub fn get_snapshot(&self, snapshot_id: i64) -> Result<Option<Snapshot>, Error> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, name, description, created_at, file_count, total_bytes,
                    merkle_root, parent_id, state
             FROM snapshots WHERE id = ?1",
            params![snapshot_id],
            row_to_snapshot,
        )
        .optional()
        .map_err(Error::from)
    }

    pub fn list_snapshots(&self) -> Result<Vec<Snapshot>, Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, description, created_at, file_count, total_bytes,
                    merkle_root, parent_id, state
             FROM snapshots ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], row_to_snapshot)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Error::from)
    }

    pub fn list_files(&self, snapshot_id: i64) -> Result<Vec<FileRecord>, Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT file_id, snapshot_id, path, size, mtime, content_hash, symlink_target
             FROM files WHERE snapshot_id = ?1 ORDER BY path ASC",
        )?;
        let rows = stmt.query_map(params![snapshot_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Option<String>>(6)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (file_id, snapshot_id, path, size, mtime, content_hash, symlink_target) = row?;
            let mut chunk_stmt = conn.prepare(
                "SELECT chunk_hash FROM file_chunks WHERE file_id = ?1 ORDER BY position ASC",
            )?;
            let chunk_hashes = chunk_stmt
                .query_map(params![file_id], |row| row.get::<_, String>(0))?
                .map(|hex| {
                    let hex = hex?;
                    digest_from_hex(&hex).map_err(|err| format_err!("bad chunk hash: {err}"))
                })
                .collect::<Result<Vec<Digest>, Error>>()?;

            out.push(FileRecord {
                file_id,
                snapshot_id,
                path,
                size: size as u64,
                mtime,
                content_hash: digest_from_hex(&content_hash)
                    .map_err(|err| format_err!("bad content hash: {err}"))?,
                chunk_hashes,
                symlink_target,
            });
        }
        Ok(out)
    }

    /// Deletes a finalized snapshot and every FileRecord it owns.
    ///
    /// The sqlite rows and the chunk-index refcounts live in two different
    /// storage engines that can't share one transaction, so this can't be
    /// atomic end to end. The metadata deletion is committed first; chunk
    /// refcounts are then decremented as a best-effort follow-up. A failure
    /// partway through the follow-up loop leaves over-retained chunks, not
    /// under-retained ones — the snapshot is already gone from the catalog,
    /// so the worst case is disk the orphan sweep never reclaims, never a
    /// live snapshot with missing bytes.
    pub fn delete_snapshot(&self, snapshot_id: i64, content_store: &ContentStore) -> Result<(), EngineError> {
        self.delete_snapshot_inner(snapshot_id, content_store)
            .map_err(EngineError::from)
    }

    fn delete_snapshot_inner(&self, snapshot_id: i64, content_store: &ContentStore) -> Result<(), Error> {
        let mut conn = self.conn.lock().unwrap();

        let state: String = conn.query_row(
            "SELECT state FROM snapshots WHERE id = ?1",
            params![snapshot_id],
            |row| row.get(0),
        )?;
        if state != "finalized" {
            bail!("[INVALID_ARGUMENT] cannot delete snapshot {snapshot_id}: not finalized");
        }

        let tx = conn.transaction()?;
        let hashes = delete_snapshot_rows(&tx, snapshot_id)?;
        tx.commit()?;

        for hash in hashes {
            if let Err(err) = content_store.delete(&hash) {
                log::error!(
                    "failed to decref chunk {} after deleting snapshot {snapshot_id}: {err}",
                    digest_to_hex(&hash)
                );
            }
        }
        Ok(())
    }

    /// Deletes every `building` snapshot older than `grace_secs`, as seen
    /// from `now`. These are left behind by a process that crashed or was
    /// killed mid-backup: the snapshot row exists, some files may be
    /// attached, but `finalize_snapshot` never ran, so nothing else will
    /// ever reference it. Reuses the same row-deletion and decref sequence
    /// as [`Self::delete_snapshot`].
    pub fn reap_stale_building_snapshots(
        &self,
        content_store: &ContentStore,
        now: i64,
        grace_secs: i64,
    ) -> Result<usize, EngineError> {
        self.reap_stale_building_snapshots_inner(content_store, now, grace_secs)
            .map_err(EngineError::from)
    }

    fn reap_stale_building_snapshots_inner(
        &self,
        content_store: &ContentStore,
        now: i64,
        grace_secs: i64,
    ) -> Result<usize, Error> {
        let mut conn = self.conn.lock().unwrap();

        let stale_ids: Vec<i64> = {
            let mut stmt = conn.prepare(
                "SELECT id FROM snapshots WHERE state = 'building' AND created_at <= ?1",
            )?;
            stmt.query_map(params![now - grace_secs], |row| row.get(0))?
                .collect::<Result<_, _>>()?
        };

        let mut reaped = 0;
        for snapshot_id in stale_ids {
            let tx = conn.transaction()?;
            let hashes = delete_snapshot_rows(&tx, snapshot_id)?;
            tx.commit()?;

            for hash in hashes {
                if let Err(err) = content_store.delete(&hash) {
                    log::error!(
                        "failed to decref chunk {} while reaping stale snapshot {snapshot_id}: {err}",
                        digest_to_hex(&hash)
                    );
                }
            }
            reaped += 1;
        }
        Ok(reaped)
    }
}

/// Deletes a snapshot's `file_chunks`/`files`/`snapshots` rows within `tx`,
/// returning every chunk hash that was referenced so the caller can decref
/// them once the transaction is durable.
fn delete_snapshot_rows(tx: &Transaction, snapshot_id: i64) -> Result<Vec<Digest>, Error> {
    let file_ids: Vec<i64> = {
        let mut stmt = tx.prepare("SELECT file_id FROM files WHERE snapshot_id = ?1")?;
        stmt.query_map(params![snapshot_id], |row| row.get(0))?
            .collect::<Result<_, _>>()?
    };

    let mut hashes = Vec::new();
    for file_id in &file_ids {
        let chunk_hex: Vec<String> = {
            let mut stmt = tx.prepare("SELECT chunk_hash FROM file_chunks WHERE file_id = ?1")?;
            stmt.query_map(params![file_id], |row| row.get(0))?
                .collect::<Result<_, _>>()?
        };
        for hex in chunk_hex {
            hashes.push(digest_from_hex(&hex).map_err(|err| format_err!("bad chunk hash: {err}"))?);
        }
        tx.execute("DELETE FROM file_chunks WHERE file_id = ?1", params![file_id])?;
    }
    tx.execute("DELETE FROM files WHERE snapshot_id = ?1", params![snapshot_id])?;
    tx.execute("DELETE FROM snapshots WHERE id = ?1", params![snapshot_id])?;

    Ok(hashes)
}

fn row_to_snapshot(row: &rusqlite::Row) -> rusqlite::Result<Snapshot> {
    let merkle_root_hex: Option<String> = row.get(6)?;
    let merkle_root = merkle_root_hex
        .map(|hex| digest_from_hex(&hex))
        .transpose()
        .map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(
                6,
                rusqlite::types::Type::Text,
                Box::new(err),
            )
        })?;

    let state_str: String = row.get(8)?;
    let state = match state_str.as_str() {
        "finalized" => SnapshotState::Finalized,
        _ => SnapshotState::Building,
    };

    Ok(Snapshot {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        created_at: row.get(3)?,
        file_count: row.get::<_, i64>(4)? as u64,
        total_bytes: row.get::<_, i64>(5)? as u64,
        merkle_root,
        parent_id: row.get(7)?,
        state,
    })
}
