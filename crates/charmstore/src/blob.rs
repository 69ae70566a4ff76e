//! Streaming blob capture: size and SHA-256 accounting over a [`BlobSink`].
//!
//! The publish engine never buffers a bundle in memory. Bytes stream through
//! a [`BlobWriter`] into staged storage while the writer accumulates the
//! total length and a running SHA-256; on [`BlobWriter::finish`] the blob is
//! committed under its digest and the caller gets back exactly what was
//! written.

use std::io::Write;

use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::storage::BlobSink;

/// Identity of a committed blob: its digest, size, and storage handle.
///
/// The handle is the hex SHA-256, which makes blob storage content-addressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobRef {
    pub sha256: String,
    pub size: u64,
    pub handle: String,
}

/// Write-stream sink that hashes and counts everything flowing through it.
pub struct BlobWriter {
    sink: Box<dyn BlobSink>,
    hasher: Sha256,
    size: u64,
}

impl BlobWriter {
    pub fn new(sink: Box<dyn BlobSink>) -> Self {
        Self {
            sink,
            hasher: Sha256::new(),
            size: 0,
        }
    }

    /// Commit the blob under its digest and report what was written.
    pub fn finish(mut self) -> Result<BlobRef> {
        self.sink.flush()?;
        let sha256 = hex::encode(self.hasher.finalize());
        self.sink.commit(&sha256)?;
        Ok(BlobRef {
            handle: sha256.clone(),
            sha256,
            size: self.size,
        })
    }

    /// Drop the partially-written blob.
    pub fn discard(self) -> Result<()> {
        self.sink.discard()
    }
}

impl Write for BlobWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.sink.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.sink.flush()
    }
}
