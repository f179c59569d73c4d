// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Core types shared by controllers, drivers and the manager

use std::io::{Read, Write};
use std::time::{Duration, SystemTime};

use crate::address::NodeName;
use crate::error::FsResult;

/// Entry type; a missing entry is `None` at the API level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntryType {
    File,
    Directory,
    Special,
}

/// Metadata of one node in a mounted filesystem.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub name: NodeName,
    pub kind: EntryType,
    pub size: Option<u64>,
    pub modified: Option<SystemTime>,
}

impl Entry {
    pub fn file(name: NodeName, size: Option<u64>) -> Self {
        Self {
            name,
            kind: EntryType::File,
            size,
            modified: None,
        }
    }

    pub fn directory(name: NodeName) -> Self {
        Self {
            name,
            kind: EntryType::Directory,
            size: None,
            modified: None,
        }
    }

    pub fn with_modified(mut self, modified: Option<SystemTime>) -> Self {
        self.modified = modified;
        self
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryType::File
    }

    pub fn is_directory(&self) -> bool {
        self.kind == EntryType::Directory
    }
}

/// Options for node access and creation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccessOptions {
    /// Create missing parent directories and, for archives, the archive file itself.
    pub create_parents: bool,
    /// Fail with `AlreadyExists` instead of replacing an existing entry.
    pub exclusive: bool,
}

impl Default for AccessOptions {
    fn default() -> Self {
        Self {
            create_parents: true,
            exclusive: false,
        }
    }
}

impl AccessOptions {
    pub fn read_only() -> Self {
        Self {
            create_parents: false,
            exclusive: false,
        }
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }
}

/// Options controlling a sync pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncOptions {
    /// Wait up to this long for streams opened by other threads.
    pub wait_close_io: Option<Duration>,
    /// Close streams that are still open after waiting.
    pub force_close_io: bool,
    /// Release cached entry contents.
    pub clear_cache: bool,
}

impl SyncOptions {
    /// Flush without waiting; fails if streams from other threads are open.
    pub fn sync() -> Self {
        Self {
            wait_close_io: None,
            force_close_io: false,
            clear_cache: false,
        }
    }

    /// Flush after waiting up to `wait` for streams of other threads; fails if
    /// any are still open.
    pub fn waiting(wait: Duration) -> Self {
        Self {
            wait_close_io: Some(wait),
            force_close_io: false,
            clear_cache: false,
        }
    }

    /// Flush everything, forcibly closing streams after `wait`, and drop caches.
    pub fn umount(wait: Duration) -> Self {
        Self {
            wait_close_io: Some(wait),
            force_close_io: true,
            clear_cache: true,
        }
    }

    pub fn with_clear_cache(mut self, clear_cache: bool) -> Self {
        self.clear_cache = clear_cache;
        self
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::sync()
    }
}

/// Readable entry contents.
pub type InputStream = Box<dyn Read + Send>;

/// Writable entry contents with an explicit, fallible close.
///
/// Dropping a stream without closing it abandons whatever it wrote.
pub trait OutputStream: Write + Send {
    fn close(&mut self) -> FsResult<()>;
}

impl OutputStream for Box<dyn OutputStream> {
    fn close(&mut self) -> FsResult<()> {
        (**self).close()
    }
}
