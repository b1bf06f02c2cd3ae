//! Cryptographic digest over buffers, streams and incremental updates (§4.1).
//!
//! The store addresses chunks by a 256-bit BLAKE3 digest. Textual form is
//! lowercase hex, produced by [`snapstore_api_types::digest_to_hex`].

use std::io::Read;

use anyhow::Error;

use snapstore_api_types::Digest;

/// One-shot digest over an in-memory buffer.
pub fn hash_buffer(data: &[u8]) -> Digest {
    *blake3::hash(data).as_bytes()
}

/// Digest over a streaming reader, reading to EOF.
///
/// Only failure mode is an I/O error from `reader`; the hash itself cannot
/// fail (§4.1).
pub fn hash_stream<R: Read>(mut reader: R) -> Result<Digest, Error> {
    let mut hasher = Hasher::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finish())
}

/// Incremental hasher. Not reentrant: `update` must not be called
/// concurrently on the same instance, though independent instances are
/// freely usable across threads.
pub struct Hasher {
    inner: blake3::Hasher,
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Hasher {
    pub fn new() -> Self {
        Self {
            inner: blake3::Hasher::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        self.inner.update(data);
        self
    }

    pub fn finish(&self) -> Digest {
        *self.inner.finalize().as_bytes()
    }
}

/// Digest over the concatenation of an ordered sequence of chunk digests,
/// used to derive `FileRecord::content_hash` (§3).
pub fn hash_digest_sequence<'a>(digests: impl Iterator<Item = &'a Digest>) -> Digest {
    let mut hasher = Hasher::new();
    for digest in digests {
        hasher.update(digest);
    }
    hasher.finish()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn buffer_and_stream_agree() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let buffer_digest = hash_buffer(data);
        let stream_digest = hash_stream(&data[..]).unwrap();
        assert_eq!(buffer_digest, stream_digest);
    }

    #[test]
    fn incremental_matches_one_shot() {
        let data = b"0123456789abcdef";
        let mut hasher = Hasher::new();
        hasher.update(&data[..8]);
        hasher.update(&data[8..]);
        assert_eq!(hasher.finish(), hash_buffer(data));
    }

    #[test]
    fn distinct_inputs_differ() {
        assert_ne!(hash_buffer(b"a"), hash_buffer(b"b"));
    }
}
