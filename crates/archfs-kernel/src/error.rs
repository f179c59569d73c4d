// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for the archive filesystem kernel

use std::fmt;
use std::io;

use crate::address::AddressError;
use crate::keys::KeyError;

/// Core filesystem error type
#[derive(thiserror::Error, Debug)]
pub enum FsError {
    /// The filesystem must be synced before the operation can proceed.
    /// Handled by the sync layer, never returned to applications.
    #[error("filesystem needs sync")]
    NeedsSync,
    /// The operation must be retried while holding the write lock.
    /// Handled by the lock layer, never returned to applications.
    #[error("operation needs the write lock")]
    NeedsWriteLock,
    #[error("current thread does not hold the write lock")]
    NotWriteLocked,
    #[error("current thread holds a read lock: {cause}")]
    ReadLocked { cause: Box<FsError> },
    #[error("cannot upgrade a read lock to a write lock")]
    LockUpgrade,
    #[error("inconsistent filesystem state: {0}")]
    Consistency(String),
    #[error("sync warning for {mount_point}: {message}")]
    SyncWarning { mount_point: String, message: String },
    #[error("sync failed for {mount_point}: {source}")]
    SyncFailed {
        mount_point: String,
        #[source]
        source: Box<FsError>,
    },
    #[error("{0}")]
    SyncAggregate(SyncAggregate),
    #[error("key unavailable: {0}")]
    Key(#[from] KeyError),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("read-only filesystem: {0}")]
    ReadOnlyFileSystem(String),
    #[error("malformed address: {0}")]
    Address(#[from] AddressError),
    #[error("no driver registered for scheme {0}")]
    UnknownScheme(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("is a directory: {0}")]
    IsADirectory(String),
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),
    #[error("not a valid archive: {0}")]
    NotAnArchive(String),
    #[error("busy: {0}")]
    Busy(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type FsResult<T> = Result<T, FsError>;

impl FsError {
    /// Whether this is a control-flow signal rather than a failure.
    pub fn is_signal(&self) -> bool {
        matches!(self, FsError::NeedsSync | FsError::NeedsWriteLock)
    }

    /// Whether this error only reports a recoverable anomaly.
    pub fn is_warning(&self) -> bool {
        match self {
            FsError::SyncWarning { .. } => true,
            FsError::SyncAggregate(aggregate) => aggregate.is_warning_only(),
            _ => false,
        }
    }

    /// Converts the error into an `io::Error` for `Read`/`Write` implementations.
    pub fn into_io(self) -> io::Error {
        match self {
            FsError::Io(err) => err,
            FsError::NotFound(what) => io::Error::new(io::ErrorKind::NotFound, what),
            FsError::AlreadyExists(what) => io::Error::new(io::ErrorKind::AlreadyExists, what),
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}

/// One failed mount point within a global sync.
#[derive(Debug)]
pub struct SyncFailure {
    pub mount_point: String,
    pub error: FsError,
}

/// Every failure collected by a global sync pass.
#[derive(Debug, Default)]
pub struct SyncAggregate {
    failures: Vec<SyncFailure>,
}

impl SyncAggregate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, mount_point: impl Into<String>, error: FsError) {
        self.failures.push(SyncFailure {
            mount_point: mount_point.into(),
            error,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failures(&self) -> &[SyncFailure] {
        &self.failures
    }

    /// True if the caller may ignore the whole aggregate.
    pub fn is_warning_only(&self) -> bool {
        self.failures.iter().all(|failure| failure.error.is_warning())
    }

    /// Returns `Ok(())` when nothing failed, the aggregate error otherwise.
    pub fn into_result(self) -> FsResult<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(FsError::SyncAggregate(self))
        }
    }
}

impl fmt::Display for SyncAggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_warning_only() { "warnings" } else { "errors" };
        write!(f, "sync reported {} {}", self.failures.len(), kind)?;
        for failure in &self.failures {
            write!(f, "; {}: {}", failure.mount_point, failure.error)?;
        }
        Ok(())
    }
}
