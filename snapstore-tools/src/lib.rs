//! Common tools used throughout the snapstore engine.
//!
//! This must not depend on any subcrates more closely related to the
//! engine's own business logic (mirrors the same rule in the teacher's
//! `pbs-tools`).

pub mod format;
pub mod lru_cache;
pub mod ops;
pub mod process_locker;
pub mod str;

pub mod retry;
