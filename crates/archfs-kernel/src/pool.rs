// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Pooled I/O buffers for staging entry contents
//!
//! Memory buffers keep their bytes in an `Arc<Vec<u8>>`. Readers bind to a
//! snapshot of that allocation without copying; a write after a reader was
//! handed out copies on write. Temp-file buffers stage bytes on disk and hand
//! out independent file handles to readers.

use std::fmt;
use std::io::{self, Cursor, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::NamedTempFile;

use crate::error::{FsError, FsResult};

/// Allocations larger than this are not kept on the free list.
const MAX_RECYCLED_CAPACITY: usize = 4 * 1024 * 1024;
const MAX_FREE_BUFFERS: usize = 32;

/// Counters reported by a pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers handed out since the pool was created.
    pub allocated: u64,
    /// Allocations served from the free list.
    pub reused: u64,
    /// Buffers currently alive.
    pub live: u64,
}

pub trait IoBufferPool: Send + Sync + fmt::Debug {
    /// Fails only when the backing resource is exhausted.
    fn allocate(&self) -> FsResult<IoBuffer>;

    fn stats(&self) -> PoolStats;
}

#[derive(Debug, Default)]
struct PoolShared {
    free: Mutex<Vec<Vec<u8>>>,
    stats: Mutex<PoolStats>,
}

impl PoolShared {
    fn record_allocation(&self, reused: bool) {
        let mut stats = self.stats.lock();
        stats.allocated += 1;
        stats.live += 1;
        if reused {
            stats.reused += 1;
        }
    }

    fn recycle(&self, mut bytes: Vec<u8>) {
        if bytes.capacity() > MAX_RECYCLED_CAPACITY {
            return;
        }
        bytes.clear();
        let mut free = self.free.lock();
        if free.len() < MAX_FREE_BUFFERS {
            free.push(bytes);
        }
    }
}

/// Newtype so a shared allocation can back a `Cursor`.
#[derive(Clone)]
struct SharedBytes(Arc<Vec<u8>>);

impl AsRef<[u8]> for SharedBytes {
    fn as_ref(&self) -> &[u8] {
        self.0.as_slice()
    }
}

enum Backing {
    Memory(Arc<Vec<u8>>),
    TempFile(NamedTempFile),
}

/// Scratch buffer owned by the operation that allocated it.
///
/// Released back to its pool by [`IoBuffer::release`] or on drop, exactly once.
pub struct IoBuffer {
    backing: Backing,
    len: u64,
    pool: Arc<PoolShared>,
}

impl IoBuffer {
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Independent reader positioned at the start of the buffer.
    pub fn reader(&self) -> FsResult<Box<dyn Read + Send>> {
        match &self.backing {
            Backing::Memory(bytes) => Ok(Box::new(Cursor::new(SharedBytes(Arc::clone(bytes))))),
            Backing::TempFile(file) => Ok(Box::new(file.reopen()?)),
        }
    }

    /// Copies the whole buffer into `sink`.
    pub fn copy_to(&self, sink: &mut dyn Write) -> FsResult<u64> {
        let mut reader = self.reader()?;
        Ok(io::copy(&mut reader, sink)?)
    }

    /// Reads everything from `source` into the buffer.
    pub fn fill_from(&mut self, source: &mut dyn Read) -> FsResult<u64> {
        Ok(io::copy(source, self)?)
    }

    pub fn release(self) {
        drop(self);
    }
}

impl Write for IoBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = match &mut self.backing {
            Backing::Memory(bytes) => {
                Arc::make_mut(bytes).extend_from_slice(buf);
                buf.len()
            }
            Backing::TempFile(file) => file.write(buf)?,
        };
        self.len += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.backing {
            Backing::Memory(_) => Ok(()),
            Backing::TempFile(file) => file.flush(),
        }
    }
}

impl Drop for IoBuffer {
    fn drop(&mut self) {
        self.pool.stats.lock().live -= 1;
        if let Backing::Memory(bytes) = &mut self.backing {
            // Still shared with a reader: the reader keeps the allocation.
            if let Some(bytes) = Arc::get_mut(bytes) {
                self.pool.recycle(std::mem::take(bytes));
            }
        }
    }
}

impl fmt::Debug for IoBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.backing {
            Backing::Memory(_) => "memory",
            Backing::TempFile(_) => "temp-file",
        };
        f.debug_struct("IoBuffer").field("kind", &kind).field("len", &self.len).finish()
    }
}

/// Heap backed pool that reuses released allocations.
#[derive(Debug, Default)]
pub struct MemoryBufferPool {
    shared: Arc<PoolShared>,
}

impl MemoryBufferPool {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IoBufferPool for MemoryBufferPool {
    fn allocate(&self) -> FsResult<IoBuffer> {
        let recycled = self.shared.free.lock().pop();
        let reused = recycled.is_some();
        self.shared.record_allocation(reused);
        Ok(IoBuffer {
            backing: Backing::Memory(Arc::new(recycled.unwrap_or_default())),
            len: 0,
            pool: Arc::clone(&self.shared),
        })
    }

    fn stats(&self) -> PoolStats {
        *self.shared.stats.lock()
    }
}

/// Pool staging every buffer in its own temp file.
#[derive(Debug, Default)]
pub struct TempFileBufferPool {
    dir: Option<PathBuf>,
    shared: Arc<PoolShared>,
}

impl TempFileBufferPool {
    /// Temp files go to `dir`, or the system temp directory.
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self {
            dir,
            shared: Arc::default(),
        }
    }
}

impl IoBufferPool for TempFileBufferPool {
    fn allocate(&self) -> FsResult<IoBuffer> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("archfs-");
        let file = match &self.dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
        .map_err(FsError::Io)?;
        self.shared.record_allocation(false);
        Ok(IoBuffer {
            backing: Backing::TempFile(file),
            len: 0,
            pool: Arc::clone(&self.shared),
        })
    }

    fn stats(&self) -> PoolStats {
        *self.shared.stats.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(buffer: &IoBuffer) -> Vec<u8> {
        let mut out = Vec::new();
        buffer.reader().unwrap().read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn memory_buffer_reader_is_bound_to_snapshot() {
        let pool = MemoryBufferPool::new();
        let mut buffer = pool.allocate().unwrap();
        buffer.write_all(b"hello").unwrap();
        let mut early = buffer.reader().unwrap();
        buffer.write_all(b" world").unwrap();

        let mut seen = String::new();
        early.read_to_string(&mut seen).unwrap();
        assert_eq!(seen, "hello");
        assert_eq!(read_all(&buffer), b"hello world");
        assert_eq!(buffer.len(), 11);
    }

    #[test]
    fn released_memory_is_reused() {
        let pool = MemoryBufferPool::new();
        let mut buffer = pool.allocate().unwrap();
        buffer.write_all(&[7u8; 64]).unwrap();
        buffer.release();
        assert_eq!(pool.stats().live, 0);

        let again = pool.allocate().unwrap();
        assert!(again.is_empty());
        let stats = pool.stats();
        assert_eq!(stats.allocated, 2);
        assert_eq!(stats.reused, 1);
        assert_eq!(stats.live, 1);
    }

    #[test]
    fn temp_file_buffer_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let pool = TempFileBufferPool::new(Some(dir.path().to_path_buf()));
        let mut buffer = pool.allocate().unwrap();
        buffer.write_all(b"staged on disk").unwrap();
        buffer.flush().unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
        assert_eq!(read_all(&buffer), b"staged on disk");

        let mut copy = Vec::new();
        assert_eq!(buffer.copy_to(&mut copy).unwrap(), 14);
        drop(buffer);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        assert_eq!(pool.stats().live, 0);
    }
}
