//! Single-pass sha256 hashing for bytes written to disk.

use std::io::{self, Write};

use kra_core::ContentId;
use sha2::{Digest, Sha256};

/// Writer adapter that hashes and counts every byte passed to the inner writer.
///
/// Only bytes the inner writer accepted are hashed, so a short write never
/// desynchronizes the digest from the persisted content.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flush and return the inner writer, the content id and the byte count.
    pub fn finish(mut self) -> io::Result<(W, ContentId, u64)> {
        self.inner.flush()?;
        let id = ContentId::from_sha256(&self.hasher.finalize());
        Ok((self.inner, id, self.written))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Hash an in-memory buffer.
pub fn sha256_of(data: &[u8]) -> ContentId {
    ContentId::from_sha256(&Sha256::digest(data))
}
