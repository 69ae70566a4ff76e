//! Blob storage backends with a pluggable [`BlobStorage`] trait.
//!
//! Blobs are immutable and content-addressed: the publish engine commits
//! each bundle under its hex SHA-256, so identical content lands on the same
//! name and republishing a byte-identical bundle is a no-op at the storage
//! layer. A blob is staged through a [`BlobSink`] and only becomes visible
//! once committed; discarded sinks leave nothing behind.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Cursor, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tempfile::NamedTempFile;

/// A staged blob write. Bytes are not visible until [`BlobSink::commit`].
pub trait BlobSink: Write + Send {
    /// Publish the staged bytes under `name`, atomically replacing any
    /// existing blob with that name.
    fn commit(self: Box<Self>, name: &str) -> Result<()>;

    /// Drop the staged bytes.
    fn discard(self: Box<Self>) -> Result<()>;
}

/// Storage for immutable, named blob streams.
pub trait BlobStorage: Send + Sync {
    /// Stage a new blob write.
    fn create(&self) -> Result<Box<dyn BlobSink>>;

    /// Open a committed blob for reading, or `None` if no such blob exists.
    fn open(&self, name: &str) -> Result<Option<Box<dyn Read + Send>>>;

    /// Remove a committed blob. Removing a missing blob is not an error.
    fn remove(&self, name: &str) -> Result<()>;
}

/// Filesystem-backed blob storage.
///
/// Writes stage into a temp file in the target directory and commit via
/// atomic rename, so readers never observe a partial blob.
pub struct FileBlobStorage {
    dir: PathBuf,
}

impl FileBlobStorage {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

struct FileSink {
    file: NamedTempFile,
    dir: PathBuf,
}

impl Write for FileSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

impl BlobSink for FileSink {
    fn commit(self: Box<Self>, name: &str) -> Result<()> {
        let target = self.dir.join(name);
        self.file
            .persist(&target)
            .with_context(|| format!("failed to commit blob {}", target.display()))?;
        Ok(())
    }

    fn discard(self: Box<Self>) -> Result<()> {
        self.file.close().context("failed to discard staged blob")
    }
}

impl BlobStorage for FileBlobStorage {
    fn create(&self) -> Result<Box<dyn BlobSink>> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create blob dir {}", self.dir.display()))?;
        let file = NamedTempFile::new_in(&self.dir)
            .with_context(|| format!("failed to stage blob in {}", self.dir.display()))?;
        Ok(Box::new(FileSink {
            file,
            dir: self.dir.clone(),
        }))
    }

    fn open(&self, name: &str) -> Result<Option<Box<dyn Read + Send>>> {
        let path = self.dir.join(name);
        match File::open(&path) {
            Ok(file) => Ok(Some(Box::new(file))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("failed to open blob {}", path.display()))
            }
        }
    }

    fn remove(&self, name: &str) -> Result<()> {
        let path = self.dir.join(name);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("failed to remove blob {}", path.display()))
            }
        }
    }
}

/// In-memory blob storage for tests and embedded use.
#[derive(Default, Clone)]
pub struct MemoryBlobStorage {
    blobs: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryBlobStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

struct MemorySink {
    buf: Vec<u8>,
    blobs: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl Write for MemorySink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl BlobSink for MemorySink {
    fn commit(self: Box<Self>, name: &str) -> Result<()> {
        self.blobs.lock().insert(name.to_string(), self.buf);
        Ok(())
    }

    fn discard(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

impl BlobStorage for MemoryBlobStorage {
    fn create(&self) -> Result<Box<dyn BlobSink>> {
        Ok(Box::new(MemorySink {
            buf: Vec::new(),
            blobs: Arc::clone(&self.blobs),
        }))
    }

    fn open(&self, name: &str) -> Result<Option<Box<dyn Read + Send>>> {
        let blobs = self.blobs.lock();
        Ok(blobs
            .get(name)
            .cloned()
            .map(|bytes| Box::new(Cursor::new(bytes)) as Box<dyn Read + Send>))
    }

    fn remove(&self, name: &str) -> Result<()> {
        self.blobs.lock().remove(name);
        Ok(())
    }
}
