//! Plain data types shared by the metadata store and the Merkle layer
//! (§3): `FileRecord`, `Snapshot`, `MerkleNode`.

use serde::{Deserialize, Serialize};

use snapstore_api_types::{Digest, SnapshotState};

/// One file's record within a snapshot.
///
/// `content_hash` is `H(concat(chunk_hashes))` — derived from the file's
/// own chunk sequence, never stored independently of it. Invariant:
/// `chunk_hashes` sums to `size` once all chunks are resolved through the
/// `ContentStore`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub file_id: i64,
    pub snapshot_id: i64,
    /// Forward-slash-normalized, relative to the backup source root.
    pub path: String,
    pub size: u64,
    pub mtime: i64,
    pub content_hash: Digest,
    pub chunk_hashes: Vec<Digest>,
    /// `Some(target)` if this record is a symlink recorded verbatim rather
    /// than followed (§3 `SymlinkStrategy::Record`). `size` is 0 and
    /// `chunk_hashes` is empty for such a record; `content_hash` is the hash
    /// of the target string itself, not of any file content.
    pub symlink_target: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub created_at: i64,
    pub file_count: u64,
    pub total_bytes: u64,
    pub merkle_root: Option<Digest>,
    pub parent_id: Option<i64>,
    pub state: SnapshotState,
}

/// A node of the Merkle tree built over one snapshot's files (§4.6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MerkleNode {
    File {
        name: String,
        size: u64,
        file_id: i64,
        hash: Digest,
    },
    Directory {
        name: String,
        size: u64,
        children: Vec<MerkleNode>,
        hash: Digest,
    },
}

impl MerkleNode {
    pub fn name(&self) -> &str {
        match self {
            MerkleNode::File { name, .. } => name,
            MerkleNode::Directory { name, .. } => name,
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            MerkleNode::File { size, .. } => *size,
            MerkleNode::Directory { size, .. } => *size,
        }
    }

    pub fn hash(&self) -> &Digest {
        match self {
            MerkleNode::File { hash, .. } => hash,
            MerkleNode::Directory { hash, .. } => hash,
        }
    }
}
