// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Sync layer: turns `NeedsSync` into a sync followed by a single retry
//!
//! The sync waits a bounded time for other threads to close their streams and
//! never closes them by force.

use std::sync::Arc;
use std::time::SystemTime;

use super::Controller;
use crate::address::NodeName;
use crate::config::SyncConfig;
use crate::error::{FsError, FsResult};
use crate::lock::LockModel;
use crate::model::FsModel;
use crate::types::{AccessOptions, Entry, EntryType, InputStream, OutputStream, SyncOptions};

pub struct SyncController {
    delegate: Arc<dyn Controller>,
    lock_model: Option<Arc<LockModel>>,
    retry: SyncOptions,
}

impl SyncController {
    pub fn new(delegate: Arc<dyn Controller>, lock_model: Option<Arc<LockModel>>) -> Self {
        Self {
            delegate,
            lock_model,
            retry: SyncConfig::default().retry_options(),
        }
    }

    pub fn with_retry_options(mut self, retry: SyncOptions) -> Self {
        self.retry = retry;
        self
    }

    fn with_retry<T>(&self, op: impl Fn(&dyn Controller) -> FsResult<T>) -> FsResult<T> {
        match op(self.delegate.as_ref()) {
            Err(FsError::NeedsSync) => {}
            other => return other,
        }
        if let Some(lock_model) = &self.lock_model {
            // Syncing needs the write lock, which a reader cannot get.
            lock_model.assert_not_read_locked_by_current_thread(FsError::NeedsSync)?;
        }
        tracing::debug!(mount_point = %self.mount_point(), "syncing before retry");
        match self.delegate.sync(self.retry) {
            Err(err) if err.is_warning() => {
                tracing::warn!(mount_point = %self.mount_point(), warning = %err, "sync before retry");
            }
            Err(err) => return Err(err),
            Ok(()) => {}
        }
        match op(self.delegate.as_ref()) {
            Err(FsError::NeedsSync) => Err(FsError::Consistency(format!(
                "{} still needs a sync right after being synced",
                self.mount_point()
            ))),
            other => other,
        }
    }
}

impl Controller for SyncController {
    fn model(&self) -> &Arc<FsModel> {
        self.delegate.model()
    }

    fn parent(&self) -> Option<&Arc<dyn Controller>> {
        self.delegate.parent()
    }

    fn node(&self, options: AccessOptions, name: &NodeName) -> FsResult<Option<Entry>> {
        self.with_retry(|c| c.node(options, name))
    }

    fn list(&self, options: AccessOptions, name: &NodeName) -> FsResult<Vec<Entry>> {
        self.with_retry(|c| c.list(options, name))
    }

    fn input(&self, options: AccessOptions, name: &NodeName) -> FsResult<InputStream> {
        self.with_retry(|c| c.input(options, name))
    }

    fn output(
        &self,
        options: AccessOptions,
        name: &NodeName,
        template: Option<&Entry>,
    ) -> FsResult<Box<dyn OutputStream>> {
        self.with_retry(|c| c.output(options, name, template))
    }

    fn make(
        &self,
        options: AccessOptions,
        name: &NodeName,
        kind: EntryType,
        template: Option<&Entry>,
    ) -> FsResult<()> {
        self.with_retry(|c| c.make(options, name, kind, template))
    }

    fn unlink(&self, options: AccessOptions, name: &NodeName) -> FsResult<()> {
        self.with_retry(|c| c.unlink(options, name))
    }

    fn set_time(&self, options: AccessOptions, name: &NodeName, modified: SystemTime) -> FsResult<()> {
        self.with_retry(|c| c.set_time(options, name, modified))
    }

    fn sync(&self, options: SyncOptions) -> FsResult<()> {
        self.delegate.sync(options)
    }
}
