// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Test helpers shared by the kernel, the drivers and the CLI
//!
//! [`RecordDriver`] is a small self-describing archive format that exercises
//! the driver boundary without a real codec. [`CountingController`] records
//! every call passing through a chain into a [`CallLog`].

use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::address::NodeName;
use crate::controller::Controller;
use crate::error::FsResult;
use crate::model::FsModel;
use crate::types::{AccessOptions, Entry, EntryType, InputStream, OutputStream, SyncOptions};

mod record_driver;

pub use record_driver::RecordDriver;

/// Shared, ordered log of controller calls as `"<op> <mount point>"`.
#[derive(Clone, Debug, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    pub fn record(&self, op: &str, controller: &dyn Controller) {
        self.calls.lock().push(format!("{} {}", op, controller.mount_point()));
    }

    /// Number of calls of `op` on any mount point.
    pub fn count(&self, op: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.split(' ').next() == Some(op))
            .count()
    }

    pub fn entries(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Mount points `op` was called on, in call order.
    pub fn mount_points(&self, op: &str) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| call.split_once(' '))
            .filter(|(call_op, _)| *call_op == op)
            .map(|(_, mount_point)| mount_point.to_string())
            .collect()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

/// Pass-through controller that logs each call before delegating.
pub struct CountingController {
    delegate: Arc<dyn Controller>,
    log: CallLog,
}

impl CountingController {
    pub fn new(delegate: Arc<dyn Controller>, log: CallLog) -> Self {
        Self { delegate, log }
    }

    fn record(&self, op: &str) {
        self.log.record(op, self.delegate.as_ref());
    }
}

impl Controller for CountingController {
    fn model(&self) -> &Arc<FsModel> {
        self.delegate.model()
    }

    fn parent(&self) -> Option<&Arc<dyn Controller>> {
        self.delegate.parent()
    }

    fn node(&self, options: AccessOptions, name: &NodeName) -> FsResult<Option<Entry>> {
        self.record("node");
        self.delegate.node(options, name)
    }

    fn list(&self, options: AccessOptions, name: &NodeName) -> FsResult<Vec<Entry>> {
        self.record("list");
        self.delegate.list(options, name)
    }

    fn input(&self, options: AccessOptions, name: &NodeName) -> FsResult<InputStream> {
        self.record("input");
        self.delegate.input(options, name)
    }

    fn output(
        &self,
        options: AccessOptions,
        name: &NodeName,
        template: Option<&Entry>,
    ) -> FsResult<Box<dyn OutputStream>> {
        self.record("output");
        self.delegate.output(options, name, template)
    }

    fn make(
        &self,
        options: AccessOptions,
        name: &NodeName,
        kind: EntryType,
        template: Option<&Entry>,
    ) -> FsResult<()> {
        self.record("make");
        self.delegate.make(options, name, kind, template)
    }

    fn unlink(&self, options: AccessOptions, name: &NodeName) -> FsResult<()> {
        self.record("unlink");
        self.delegate.unlink(options, name)
    }

    fn set_time(&self, options: AccessOptions, name: &NodeName, modified: SystemTime) -> FsResult<()> {
        self.record("set_time");
        self.delegate.set_time(options, name, modified)
    }

    fn sync(&self, options: SyncOptions) -> FsResult<()> {
        self.record("sync");
        self.delegate.sync(options)
    }
}
