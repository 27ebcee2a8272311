//! FileSystem trait for abstracting the store's backing file.
//!
//! The block store only ever talks to one file, always in whole aligned
//! blocks. This trait lets it run against:
//! - A real file on disk (`StdFs`)
//! - In-memory storage (`InMemoryFs`, for testing)
//!
//! # Security Notes
//!
//! - The FileSystem trait itself has no security logic - all encryption
//!   happens at higher layers (chain, entry types)
//! - `InMemoryFs` is for testing only

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

/// Abstract single-file operations
pub trait FileSystem: Send {
    /// Read exactly `len` bytes at the given offset
    fn read_bytes(&mut self, offset: u64, len: usize) -> io::Result<Vec<u8>>;

    /// Write bytes at the given offset, extending the file if needed
    fn write_bytes(&mut self, offset: u64, data: &[u8]) -> io::Result<()>;

    /// Get the current size of the file
    fn get_size(&self) -> io::Result<u64>;

    /// Flush pending writes to disk
    fn flush(&mut self) -> io::Result<()>;
}

/// File on the local filesystem
pub struct StdFs {
    path: PathBuf,
    file: File,
}

impl StdFs {
    /// Open (or create) the store file at `path`
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        Ok(Self { path, file })
    }

    /// Path of the backing file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FileSystem for StdFs {
    fn read_bytes(&mut self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn write_bytes(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)
    }

    fn get_size(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.sync_data()
    }
}

/// In-memory filesystem for testing
/// Uses Arc<Mutex<...>> so clones share the same underlying storage
#[derive(Default, Clone)]
pub struct InMemoryFs {
    data: Arc<Mutex<Vec<u8>>>,
    /// Write counter (for testing whole-block I/O)
    writes: Arc<Mutex<HashMap<u64, usize>>>,
}

impl InMemoryFs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a copy of file contents (for testing)
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// Overwrite raw file contents (for corruption tests)
    pub fn set_contents(&self, bytes: Vec<u8>) {
        *self.data.lock() = bytes;
    }

    /// Number of writes that started at `offset`
    #[must_use]
    pub fn write_count(&self, offset: u64) -> usize {
        self.writes.lock().get(&offset).copied().unwrap_or(0)
    }
}

impl FileSystem for InMemoryFs {
    fn read_bytes(&mut self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let data = self.data.lock();
        let start = usize::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset overflow"))?;
        let end = start
            .checked_add(len)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "length overflow"))?;
        if end > data.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read beyond end of file",
            ));
        }
        Ok(data[start..end].to_vec())
    }

    fn write_bytes(&mut self, offset: u64, bytes: &[u8]) -> io::Result<()> {
        let mut data = self.data.lock();
        let start = usize::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset overflow"))?;
        let end = start
            .checked_add(bytes.len())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "length overflow"))?;
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(bytes);
        *self.writes.lock().entry(offset).or_insert(0) += 1;
        Ok(())
    }

    fn get_size(&self) -> io::Result<u64> {
        Ok(self.data.lock().len() as u64)
    }

    fn flush(&mut self) -> io::Result<()> {
        // No-op for in-memory
        Ok(())
    }
}
