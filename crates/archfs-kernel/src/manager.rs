// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Federation of all live controller chains

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::address::{MountPoint, NodePath};
use crate::config::FsContext;
use crate::controller::{Controller, FileController, TargetArchiveController};
use crate::error::{FsResult, SyncAggregate};
use crate::lock::LockModel;
use crate::model::FsModel;
use crate::scanner::PathScanner;
use crate::types::{AccessOptions, Entry, EntryType, InputStream, SyncOptions};

/// Process-wide registry of controller chains, keyed by canonical mount point.
pub struct FsManager {
    context: FsContext,
    controllers: Mutex<HashMap<String, Arc<dyn Controller>>>,
}

impl FsManager {
    pub fn new(context: FsContext) -> Self {
        Self {
            context,
            controllers: Mutex::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &FsContext {
        &self.context
    }

    /// Returns the live chain for `mount_point`, creating it and its ancestors
    /// as needed. Equal mount points always yield the same instance.
    pub fn controller(&self, mount_point: &MountPoint) -> FsResult<Arc<dyn Controller>> {
        let mount_point = MountPoint::parse(mount_point.as_str())?;
        let mut controllers = self.controllers.lock();
        self.get_or_create(&mut controllers, &mount_point)
    }

    fn get_or_create(
        &self,
        controllers: &mut HashMap<String, Arc<dyn Controller>>,
        mount_point: &MountPoint,
    ) -> FsResult<Arc<dyn Controller>> {
        if let Some(controller) = controllers.get(mount_point.as_str()) {
            return Ok(Arc::clone(controller));
        }
        let controller: Arc<dyn Controller> = match mount_point.parent() {
            None => {
                let model = Arc::new(FsModel::new(Arc::new(mount_point.clone()), None));
                Arc::new(FileController::new(model))
            }
            Some(parent_mount_point) => {
                let parent = self.get_or_create(controllers, parent_mount_point)?;
                let driver = self.context.drivers.driver(mount_point.scheme())?;
                let model = Arc::new(FsModel::new(
                    Arc::new(mount_point.clone()),
                    Some(Arc::clone(parent.model())),
                ));
                let lock_model = Arc::new(LockModel::new(model));
                let target = TargetArchiveController::new(
                    Arc::clone(&lock_model),
                    parent,
                    Arc::clone(&driver),
                    Arc::clone(&self.context.pool),
                );
                driver.new_controller(target, lock_model, &self.context)
            }
        };
        tracing::debug!(mount_point = %mount_point, "created controller chain");
        controllers.insert(mount_point.as_str().to_string(), Arc::clone(&controller));
        Ok(controller)
    }

    /// Live controllers in sync order: children strictly before their parents.
    pub fn sync_order(&self) -> Vec<Arc<dyn Controller>> {
        let mut controllers: Vec<Arc<dyn Controller>> = self.controllers.lock().values().cloned().collect();
        controllers.sort_by(|a, b| {
            b.mount_point()
                .depth()
                .cmp(&a.mount_point().depth())
                .then_with(|| a.mount_point().as_str().cmp(b.mount_point().as_str()))
        });
        controllers
    }

    /// Syncs every live controller deepest first. Keeps going after failures
    /// and reports all of them together.
    pub fn sync_all(&self, options: SyncOptions) -> FsResult<()> {
        let mut aggregate = SyncAggregate::new();
        let controllers = self.sync_order();
        let total = controllers.len();
        for controller in controllers {
            if let Err(err) = controller.sync(options) {
                tracing::warn!(mount_point = %controller.mount_point(), error = %err, "sync reported a problem");
                aggregate.push(controller.mount_point().to_string(), err);
            }
        }
        let evicted = self.evict_idle();
        tracing::info!(
            controllers = total,
            failures = aggregate.failures().len(),
            evicted,
            "synced all mount points"
        );
        aggregate.into_result()
    }

    /// Drops unmounted chains nobody else references. Returns how many went.
    fn evict_idle(&self) -> usize {
        let mut controllers = self.controllers.lock();
        let before = controllers.len();
        loop {
            let idle: Vec<String> = controllers
                .iter()
                .filter(|(_, controller)| Arc::strong_count(controller) == 1)
                .filter(|(_, controller)| {
                    let mount_point = controller.mount_point();
                    mount_point.is_platform() || !controller.model().is_mounted()
                })
                .map(|(key, _)| key.clone())
                .collect();
            if idle.is_empty() {
                break;
            }
            for key in idle {
                tracing::trace!(mount_point = %key, "evicting controller chain");
                controllers.remove(&key);
            }
        }
        before - controllers.len()
    }

    /// Number of live controller chains.
    pub fn len(&self) -> usize {
        self.controllers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn mount_points(&self) -> Vec<Arc<MountPoint>> {
        let mut mount_points: Vec<Arc<MountPoint>> = self
            .controllers
            .lock()
            .values()
            .map(|controller| Arc::clone(controller.mount_point()))
            .collect();
        mount_points.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        mount_points
    }

    /// Scans a user path and returns its controller and node path.
    pub fn resolve(&self, path: &str) -> FsResult<(Arc<dyn Controller>, NodePath)> {
        let node_path = PathScanner::new(&self.context.drivers).scan(path)?;
        let controller = self.controller(&node_path.mount_point)?;
        Ok((controller, node_path))
    }

    pub fn stat(&self, path: &str) -> FsResult<Option<Entry>> {
        let (controller, node_path) = self.resolve(path)?;
        controller.node(AccessOptions::read_only(), &node_path.name)
    }

    pub fn list(&self, path: &str) -> FsResult<Vec<Entry>> {
        let (controller, node_path) = self.resolve(path)?;
        controller.list(AccessOptions::read_only(), &node_path.name)
    }

    pub fn open(&self, path: &str) -> FsResult<InputStream> {
        let (controller, node_path) = self.resolve(path)?;
        controller.input(AccessOptions::read_only(), &node_path.name)
    }

    pub fn read(&self, path: &str) -> FsResult<Vec<u8>> {
        let mut data = Vec::new();
        self.open(path)?.read_to_end(&mut data)?;
        Ok(data)
    }

    pub fn write(&self, path: &str, data: &[u8]) -> FsResult<()> {
        let (controller, node_path) = self.resolve(path)?;
        let mut out = controller.output(AccessOptions::default(), &node_path.name, None)?;
        out.write_all(data)?;
        out.close()
    }

    pub fn mkdir(&self, path: &str) -> FsResult<()> {
        let (controller, node_path) = self.resolve(path)?;
        controller.make(AccessOptions::default(), &node_path.name, EntryType::Directory, None)
    }

    pub fn remove(&self, path: &str) -> FsResult<()> {
        let (controller, node_path) = self.resolve(path)?;
        controller.unlink(AccessOptions::read_only(), &node_path.name)
    }

    /// Syncs and unmounts everything, forcing streams closed after the
    /// configured wait.
    pub fn umount_all(&self) -> FsResult<()> {
        self.sync_all(self.context.config.sync.umount_options())
    }
}

impl Drop for FsManager {
    fn drop(&mut self) {
        if self.controllers.get_mut().is_empty() {
            return;
        }
        match self.umount_all() {
            Ok(()) => {}
            Err(err) if err.is_warning() => tracing::warn!(warning = %err, "unmount on shutdown"),
            Err(err) => tracing::error!(error = %err, "unmount on shutdown failed, changes may be lost"),
        }
    }
}

impl std::fmt::Debug for FsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsManager")
            .field("mount_points", &self.mount_points())
            .finish()
    }
}
