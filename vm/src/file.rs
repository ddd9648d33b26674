//! Byte-range access to the files that back memory mappings.

use crate::sync::mutex::Mutex;
use alloc::vec::Vec;
use core::cmp::min;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FileError {
    #[error("file is not writable")]
    ReadOnly,
    #[error("i/o error")]
    Io,
}

/// An open file as seen by the pager. Implemented by the filesystem layer; the
/// pager only ever reads whole pages in and writes dirty pages back.
///
/// Holding an `Arc<dyn MappedFile>` is holding an open reference to the file,
/// dropping it closes that reference.
pub trait MappedFile: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`. Returns the number of bytes
    /// read, which is short only at end of file.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, FileError>;
    /// Write `buf` at `offset`, growing the file if needed.
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize, FileError>;
    /// Length of the file in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A file held entirely in memory.
#[derive(Default)]
pub struct MemoryFile {
    data: Mutex<Vec<u8>>,
    read_only: bool,
}

impl MemoryFile {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(data),
            read_only: false,
        }
    }

    pub fn read_only(data: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(data),
            read_only: true,
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl MappedFile for MemoryFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, FileError> {
        let data = self.data.lock();
        let Ok(start) = usize::try_from(offset) else {
            return Ok(0);
        };
        if start >= data.len() {
            return Ok(0);
        }
        let n = min(buf.len(), data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize, FileError> {
        if self.read_only {
            return Err(FileError::ReadOnly);
        }
        let start = usize::try_from(offset).map_err(|_| FileError::Io)?;
        let mut data = self.data.lock();
        if data.len() < start + buf.len() {
            data.resize(start + buf.len(), 0);
        }
        data[start..start + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn len(&self) -> u64 {
        self.data.lock().len() as u64
    }
}
