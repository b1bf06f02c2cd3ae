//! Content-defined chunking, content-addressable storage and snapshot
//! metadata.
//!
//! # Data formats
//!
//! Source files are split into content-defined chunks and stored
//! deduplicated in a content-addressable blob store, keyed by the
//! BLAKE3 digest of their bytes ([`chunker`], [`content_store`]).
//! [`chunk_index`] is the persistent hash → location map underneath the
//! blob store, tracking a reference count per chunk.
//!
//! A backup run produces a [`model::Snapshot`] and one [`model::FileRecord`]
//! per file, held in [`metadata_store`]. [`merkle`] builds a hash tree over
//! a snapshot's files so two snapshots can be diffed without touching
//! unchanged subtrees.
//!
//! # Garbage collection
//!
//! Unlike the mark-and-sweep, atime-based collector this module's
//! ancestor used, chunk lifetime here is refcount-driven: `ContentStore`
//! increments on every `put`/reference and decrements on delete, removing
//! the blob exactly when the count reaches zero. There is no separate GC
//! pass and no `atime`/`relatime` interaction to reason about.
//!
//! # Locking
//!
//! `ChunkIndex` serializes writes behind an internal lock and allows
//! concurrent reads; `ContentStore` additionally stripes a lock over the
//! first byte of the digest so concurrent `put`s of the *same* chunk
//! collapse into one blob write instead of racing. `MetadataStore`
//! transactions bound `delete_snapshot`'s refcount decrements to a single
//! unit of work.

pub mod chunk_index;
pub mod chunk_store;
pub mod chunker;
pub mod content_store;
pub mod datastore;
pub mod hasher;
pub mod merkle;
pub mod metadata_store;
pub mod model;

pub use chunk_index::{ChunkIndex, ChunkIndexEntry};
pub use chunk_store::ChunkStore;
pub use chunker::{ChunkReader, ChunkSlice, ChunkerConfig};
pub use content_store::{ContentStore, PutResult};
pub use datastore::Datastore;
pub use hasher::Hasher;
pub use metadata_store::MetadataStore;
pub use model::{FileRecord, MerkleNode, Snapshot};
