// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Lock layer: reads under the read lock, writes under the write lock

use std::io::{self, Write};
use std::sync::Arc;
use std::time::SystemTime;

use super::Controller;
use crate::address::NodeName;
use crate::error::{FsError, FsResult};
use crate::lock::LockModel;
use crate::model::FsModel;
use crate::types::{AccessOptions, Entry, EntryType, InputStream, OutputStream, SyncOptions};

pub struct LockController {
    delegate: Arc<dyn Controller>,
    lock_model: Arc<LockModel>,
}

impl LockController {
    pub fn new(delegate: Arc<dyn Controller>, lock_model: Arc<LockModel>) -> Self {
        Self { delegate, lock_model }
    }

    /// Runs `op` under the read lock, escalating to the write lock when the
    /// delegate asks for it.
    fn read_locked<T>(&self, op: impl Fn(&dyn Controller) -> FsResult<T>) -> FsResult<T> {
        let result = {
            let _guard = self.lock_model.read_lock();
            op(self.delegate.as_ref())
        };
        match result {
            Err(FsError::NeedsWriteLock) => self.write_locked(op),
            other => other,
        }
    }

    fn write_locked<T>(&self, op: impl Fn(&dyn Controller) -> FsResult<T>) -> FsResult<T> {
        let _guard = self.lock_model.write_lock()?;
        match op(self.delegate.as_ref()) {
            Err(FsError::NeedsWriteLock) => Err(FsError::Consistency(format!(
                "{} asked for the write lock while holding it",
                self.mount_point()
            ))),
            other => other,
        }
    }
}

impl Controller for LockController {
    fn model(&self) -> &Arc<FsModel> {
        self.delegate.model()
    }

    fn parent(&self) -> Option<&Arc<dyn Controller>> {
        self.delegate.parent()
    }

    fn node(&self, options: AccessOptions, name: &NodeName) -> FsResult<Option<Entry>> {
        self.read_locked(|c| c.node(options, name))
    }

    fn list(&self, options: AccessOptions, name: &NodeName) -> FsResult<Vec<Entry>> {
        self.read_locked(|c| c.list(options, name))
    }

    fn input(&self, options: AccessOptions, name: &NodeName) -> FsResult<InputStream> {
        self.read_locked(|c| c.input(options, name))
    }

    fn output(
        &self,
        options: AccessOptions,
        name: &NodeName,
        template: Option<&Entry>,
    ) -> FsResult<Box<dyn OutputStream>> {
        let inner = self.write_locked(|c| c.output(options, name, template))?;
        Ok(Box::new(LockedOutput {
            inner: Some(inner),
            lock_model: Arc::clone(&self.lock_model),
        }))
    }

    fn make(
        &self,
        options: AccessOptions,
        name: &NodeName,
        kind: EntryType,
        template: Option<&Entry>,
    ) -> FsResult<()> {
        self.write_locked(|c| c.make(options, name, kind, template))
    }

    fn unlink(&self, options: AccessOptions, name: &NodeName) -> FsResult<()> {
        self.write_locked(|c| c.unlink(options, name))
    }

    fn set_time(&self, options: AccessOptions, name: &NodeName, modified: SystemTime) -> FsResult<()> {
        self.write_locked(|c| c.set_time(options, name, modified))
    }

    fn sync(&self, options: SyncOptions) -> FsResult<()> {
        self.write_locked(|c| c.sync(options))
    }
}

/// Closes or drops the wrapped stream under the write lock.
struct LockedOutput {
    inner: Option<Box<dyn OutputStream>>,
    lock_model: Arc<LockModel>,
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "output closed")
}

impl Write for LockedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.as_mut().ok_or_else(closed)?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.inner.as_mut() {
            Some(inner) => inner.flush(),
            None => Ok(()),
        }
    }
}

impl OutputStream for LockedOutput {
    fn close(&mut self) -> FsResult<()> {
        let _guard = self.lock_model.write_lock()?;
        match self.inner.as_mut() {
            Some(inner) => inner.close(),
            None => Ok(()),
        }
    }
}

impl Drop for LockedOutput {
    fn drop(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        // A reader of this mount point cannot take the write lock; drop unlocked then.
        let guard = match self.lock_model.write_lock() {
            Ok(guard) => Some(guard),
            Err(err) => {
                tracing::debug!(mount_point = %self.lock_model.model().mount_point(), error = %err, "dropping output without the write lock");
                None
            }
        };
        drop(inner);
        drop(guard);
    }
}
