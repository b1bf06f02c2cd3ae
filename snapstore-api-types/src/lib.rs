//! Basic, dependency-light types shared by every snapstore crate.
//!
//! This intentionally does not pull in a schema/validation framework: the
//! core engine has no HTTP API surface of its own (see the top-level
//! design notes), so these are plain serde-friendly structs and enums
//! rather than API-described ones.

use std::fmt;

use serde::{Deserialize, Serialize};

mod error;
pub use error::{EngineError, ErrorCode};

/// 256-bit content digest, stored and displayed as lowercase hex.
pub type Digest = [u8; 32];

pub fn digest_to_hex(digest: &Digest) -> String {
    hex::encode(digest)
}

pub fn digest_from_hex(s: &str) -> Result<Digest, EngineError> {
    let bytes = hex::decode(s)
        .map_err(|err| EngineError::invalid_argument(format!("invalid hex digest: {err}")))?;
    bytes
        .try_into()
        .map_err(|_| EngineError::invalid_argument("digest must be 32 bytes"))
}

/// Whether a chunk/index write must be fsync'd before being acknowledged.
///
/// Mirrors the teacher's own `DatastoreFSyncLevel` knob: an ambient
/// durability setting, not a feature under any of the spec's Non-goals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DatastoreFSyncLevel {
    /// Rely on the OS page cache; fastest, least durable.
    #[default]
    None,
    /// fsync the chunk file and its containing directory on every write.
    File,
}

/// How the directory walker should treat symbolic links (§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SymlinkStrategy {
    /// Record the link target as metadata, do not follow it.
    #[default]
    Record,
    /// Follow the link and back up the target's contents.
    Follow,
    /// Ignore symlinks entirely.
    Skip,
}

/// Kind of filesystem change recorded in the modification journal (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Create,
    Modify,
    Delete,
}

impl ChangeKind {
    pub fn as_u8(self) -> u8 {
        match self {
            ChangeKind::Create => 0,
            ChangeKind::Modify => 1,
            ChangeKind::Delete => 2,
        }
    }

    pub fn from_u8(v: u8) -> Result<Self, EngineError> {
        match v {
            0 => Ok(ChangeKind::Create),
            1 => Ok(ChangeKind::Modify),
            2 => Ok(ChangeKind::Delete),
            other => Err(EngineError::invalid_argument(format!(
                "unknown journal event kind {other}"
            ))),
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChangeKind::Create => "CREATE",
            ChangeKind::Modify => "MODIFY",
            ChangeKind::Delete => "DELETE",
        })
    }
}

/// Lifecycle state of a snapshot row in the metadata store (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SnapshotState {
    Building,
    Finalized,
}

/// One entry of a Merkle diff between two snapshots (§4.6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiffKind {
    Added,
    Deleted,
    Modified,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub path: String,
    pub kind: DiffKind,
}
