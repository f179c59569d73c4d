// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Controller chain
//!
//! Every mount point is served by a chain of decorating controllers. For an
//! archive mount point the chain is, outermost first:
//!
//! ```text
//! SyncController -> LockController -> ResourceController -> CacheController -> TargetArchiveController
//! ```
//!
//! Streams are registered and counted inside the lock layer, so a sync sees
//! every stream that was opened or closed under the mount point's locks.
//!
//! Platform mount points use a single [`FileController`].

use std::sync::Arc;
use std::time::SystemTime;

use crate::address::{MountPoint, NodeName};
use crate::config::FsContext;
use crate::error::FsResult;
use crate::lock::LockModel;
use crate::model::FsModel;
use crate::types::{AccessOptions, Entry, EntryType, InputStream, OutputStream, SyncOptions};

mod cache;
mod file;
mod lock;
mod resource;
mod sync;
mod target;

pub use cache::CacheController;
pub use file::FileController;
pub use lock::LockController;
pub use resource::ResourceController;
pub use sync::SyncController;
pub use target::TargetArchiveController;

/// Filesystem operations of one mount point.
pub trait Controller: Send + Sync {
    fn model(&self) -> &Arc<FsModel>;

    /// Controller chain of the enclosing mount point.
    fn parent(&self) -> Option<&Arc<dyn Controller>>;

    fn node(&self, options: AccessOptions, name: &NodeName) -> FsResult<Option<Entry>>;

    fn list(&self, options: AccessOptions, name: &NodeName) -> FsResult<Vec<Entry>>;

    fn input(&self, options: AccessOptions, name: &NodeName) -> FsResult<InputStream>;

    fn output(
        &self,
        options: AccessOptions,
        name: &NodeName,
        template: Option<&Entry>,
    ) -> FsResult<Box<dyn OutputStream>>;

    fn make(
        &self,
        options: AccessOptions,
        name: &NodeName,
        kind: EntryType,
        template: Option<&Entry>,
    ) -> FsResult<()>;

    fn unlink(&self, options: AccessOptions, name: &NodeName) -> FsResult<()>;

    fn set_time(&self, options: AccessOptions, name: &NodeName, modified: SystemTime) -> FsResult<()>;

    fn sync(&self, options: SyncOptions) -> FsResult<()>;

    fn mount_point(&self) -> &Arc<MountPoint> {
        self.model().mount_point()
    }
}

/// Builds the standard decorator chain around an archive target.
pub fn decorate(target: TargetArchiveController, lock_model: Arc<LockModel>, context: &FsContext) -> Arc<dyn Controller> {
    let cache = CacheController::new(Arc::new(target), Arc::clone(&context.pool));
    let resources = ResourceController::new(Arc::new(cache), Some(Arc::clone(&lock_model)));
    let locked = LockController::new(Arc::new(resources), Arc::clone(&lock_model));
    Arc::new(
        SyncController::new(Arc::new(locked), Some(lock_model))
            .with_retry_options(context.config.sync.retry_options()),
    )
}
